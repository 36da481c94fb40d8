// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT
#![doc = include_str!("../README.md")]
//! # Sample Config
//! ```yaml
#![doc = include_str!("../../../sample_config.yaml")]
//! ```

use std::{collections::HashMap, path::PathBuf, time::Duration};

use serde::Deserialize;
use tracing_subscriber::filter::LevelFilter;

#[derive(Debug, Deserialize, Clone)]
pub struct VmigrateConfig {
    pub provider: ProviderConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
    #[serde(default)]
    pub migration: MigrationConfig,
    #[serde(default)]
    pub destination: DestinationConfig,
    #[serde(default)]
    pub conversion: ConversionConfig,
    #[serde(default)]
    pub mover: MoverConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, Default)]
pub enum LoggingLevel {
    ERROR,
    WARN,
    #[default]
    INFO,
    DEBUG,
    TRACE,
    OFF,
}

impl<'de> Deserialize<'de> for LoggingLevel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let v = String::deserialize(deserializer)?;

        Ok(match v.as_str() {
            "ERROR" => Self::ERROR,
            "WARN" => Self::WARN,
            "INFO" => Self::INFO,
            "DEBUG" => Self::DEBUG,
            "TRACE" => Self::TRACE,
            "OFF" => Self::OFF,
            other => Err(serde::de::Error::custom(format!(
                "Bad logging level specifier {other}"
            )))?,
        })
    }
}

impl From<LoggingLevel> for LevelFilter {
    fn from(value: LoggingLevel) -> Self {
        match value {
            LoggingLevel::ERROR => LevelFilter::ERROR,
            LoggingLevel::WARN => LevelFilter::WARN,
            LoggingLevel::INFO => LevelFilter::INFO,
            LoggingLevel::DEBUG => LevelFilter::DEBUG,
            LoggingLevel::TRACE => LevelFilter::TRACE,
            LoggingLevel::OFF => LevelFilter::OFF,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub log_file: Option<String>,

    #[serde(default)]
    pub max_level: LoggingLevel,
}

/// Which kind of SDK endpoint the provider URL points at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SdkEndpoint {
    #[default]
    VCenter,
    Esxi,
}

impl<'de> Deserialize<'de> for SdkEndpoint {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let v = String::deserialize(deserializer)?;

        Ok(match v.to_ascii_lowercase().as_str() {
            "vcenter" => Self::VCenter,
            "esxi" => Self::Esxi,
            other => Err(serde::de::Error::custom(format!(
                "Bad sdk endpoint specifier {other}"
            )))?,
        })
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    pub name: String,
    pub url: String,

    #[serde(default)]
    pub sdk_endpoint: SdkEndpoint,

    /// YAML map holding `user`, `password` and optionally `thumbprint`,
    /// `insecureSkipVerify` and `cacert`
    pub secret_file: PathBuf,

    #[serde(default)]
    pub vddk_image: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CollectorConfig {
    /// First reconnect delay, doubled after each consecutive failure
    pub retry_delay_secs: u64,
    pub max_retry_delay_secs: u64,
    pub max_object_updates: u32,
    /// Consecutive failed update sets before the collector reports itself degraded
    pub apply_failure_threshold: u32,
    /// Optional JSON dump written after every clean pass
    pub snapshot_file: Option<PathBuf>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            retry_delay_secs: 5,
            max_retry_delay_secs: 300,
            max_object_updates: 10_000,
            apply_failure_threshold: 3,
            snapshot_file: None,
        }
    }
}

impl CollectorConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_secs(self.max_retry_delay_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MigrationConfig {
    /// Upper bound of VMs migrated concurrently within one plan
    pub max_in_flight: usize,
    pub precopy_interval_mins: u64,
    pub task_poll_secs: u64,
    pub sdk_timeout_mins: u64,
    pub test_connect_secs: u64,
    pub power_off_timeout_secs: u64,
    pub mover_poll_secs: u64,
    pub retry_count: usize,
    pub recent_error_limit: usize,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 20,
            precopy_interval_mins: 60,
            task_poll_secs: 1,
            sdk_timeout_mins: 30,
            test_connect_secs: 10,
            power_off_timeout_secs: 600,
            mover_poll_secs: 5,
            retry_count: 3,
            recent_error_limit: 5,
        }
    }
}

impl MigrationConfig {
    pub fn precopy_interval(&self) -> Duration {
        Duration::from_secs(self.precopy_interval_mins * 60)
    }

    pub fn task_poll(&self) -> Duration {
        Duration::from_secs(self.task_poll_secs)
    }

    pub fn sdk_timeout(&self) -> Duration {
        Duration::from_secs(self.sdk_timeout_mins * 60)
    }

    pub fn test_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.test_connect_secs)
    }

    pub fn power_off_timeout(&self) -> Duration {
        Duration::from_secs(self.power_off_timeout_secs)
    }

    pub fn mover_poll(&self) -> Duration {
        Duration::from_secs(self.mover_poll_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DestinationConfig {
    /// Where created resources and migration records are mirrored; in-memory only when unset
    pub state_dir: Option<PathBuf>,
    pub namespace: String,
    /// `true` when the destination cluster is the one this process runs against
    pub local: bool,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            state_dir: None,
            namespace: "default".to_owned(),
            local: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ConversionConfig {
    /// Program and arguments of the guest converter; conversion is unavailable when empty
    pub command: Vec<String>,
    pub extra_args: Vec<String>,
    pub virtio_win_image: Option<String>,
    /// Overrides for the osinfo id to instance preference table
    pub os_preferences: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct MoverConfig {
    /// Program and arguments launched once per disk transfer
    pub command: Vec<String>,
}

/// Loads a config file, overlaying `VMIGRATE__*` environment variables
pub fn load_from(path: &str) -> Result<VmigrateConfig, config_rs::ConfigError> {
    config_rs::Config::builder()
        .add_source(config_rs::File::with_name(path))
        .add_source(config_rs::Environment::with_prefix("VMIGRATE").separator("__"))
        .build()?
        .try_deserialize()
}

static CONFIG: once_cell::sync::Lazy<VmigrateConfig> = once_cell::sync::Lazy::new(|| {
    let path =
        std::env::var("VMIGRATE_CONFIG").unwrap_or_else(|_| "config_data/config.yaml".to_owned());

    load_from(&path).expect("couldn't load config file, invalid format")
});

pub fn settings() -> &'static VmigrateConfig {
    &CONFIG
}
