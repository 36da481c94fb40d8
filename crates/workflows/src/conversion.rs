// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

//! Guest conversion: the converter rewrites the copied disks in place so the
//! guest boots on virtio devices, then reports what it found inside.

use std::{collections::BTreeMap, process::Stdio};

use async_trait::async_trait;
use client::soap::xml;
use config::ConversionConfig;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::builder::DataVolume;

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("no guest converter is configured")]
    NotConfigured,

    #[error("could not run the guest converter: {0}")]
    Launch(#[from] std::io::Error),

    #[error("guest conversion failed ({status}): {stderr}")]
    Failed { status: String, stderr: String },

    #[error("guest conversion was cancelled")]
    Cancelled,
}

#[async_trait]
pub trait GuestConverter: Send + Sync {
    /// Converts the guest on `volumes`, returning the inspection document
    async fn convert(
        &self,
        env: &BTreeMap<String, String>,
        volumes: &[DataVolume],
        cancel: CancellationToken,
    ) -> Result<String, ConversionError>;
}

/// Runs the configured converter with the conversion environment and the
/// volume names as arguments; its standard output is the inspection XML.
pub struct CommandConverter {
    command: Vec<String>,
}

impl CommandConverter {
    pub fn new(cfg: &ConversionConfig) -> Self {
        Self {
            command: cfg.command.clone(),
        }
    }
}

#[async_trait]
impl GuestConverter for CommandConverter {
    async fn convert(
        &self,
        env: &BTreeMap<String, String>,
        volumes: &[DataVolume],
        cancel: CancellationToken,
    ) -> Result<String, ConversionError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or(ConversionError::NotConfigured)?;

        let child = Command::new(program)
            .args(args)
            .args(volumes.iter().map(|v| format!("{}/{}", v.namespace, v.name)))
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        info!("Converting guest on {} volumes with {program}", volumes.len());

        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(ConversionError::Cancelled),
            out = child.wait_with_output() => out?,
        };

        if !output.status.success() {
            return Err(ConversionError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// The osinfo id from a converter inspection document, e.g. `rhel8.1`
pub fn operating_system(inspection: &str) -> Option<String> {
    let doc = match xml::parse(inspection) {
        Ok(doc) => doc,
        Err(e) => {
            warn!("Unreadable inspection document: {e}");
            return None;
        }
    };

    let os = doc.path(&["operatingsystem", "osinfo"])?;

    let id = os.text.trim();
    (!id.is_empty()).then(|| id.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    const INSPECTION: &str = r#"<?xml version='1.0' encoding='utf-8'?>
<v2v-inspection>
  <program>virt-v2v</program>
  <operatingsystem>
    <name>linux</name>
    <distro>rhel</distro>
    <osinfo>rhel8.1</osinfo>
    <arch>x86_64</arch>
  </operatingsystem>
</v2v-inspection>"#;

    #[test]
    fn osinfo_is_read_from_the_inspection() {
        assert_eq!(operating_system(INSPECTION).as_deref(), Some("rhel8.1"));
        assert_eq!(operating_system("<v2v-inspection/>"), None);
        assert_eq!(operating_system("not xml <"), None);
    }

    #[tokio::test]
    async fn converter_output_is_the_inspection() {
        let converter = CommandConverter::new(&ConversionConfig {
            command: vec!["sh".into(), "-c".into(), "echo \"<osinfo>$V2V_vmName</osinfo>\"".into()],
            ..Default::default()
        });
        let env = BTreeMap::from([("V2V_vmName".to_owned(), "web".to_owned())]);

        let out = converter
            .convert(&env, &[], CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.trim(), "<osinfo>web</osinfo>");
    }

    #[tokio::test]
    async fn failures_carry_stderr() {
        let converter = CommandConverter::new(&ConversionConfig {
            command: vec!["sh".into(), "-c".into(), "echo broken disk >&2; exit 3".into()],
            ..Default::default()
        });

        match converter.convert(&BTreeMap::new(), &[], CancellationToken::new()).await {
            Err(ConversionError::Failed { stderr, .. }) => assert_eq!(stderr, "broken disk"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_command_is_reported() {
        let converter = CommandConverter::new(&ConversionConfig::default());
        let err = converter
            .convert(&BTreeMap::new(), &[], CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ConversionError::NotConfigured));
    }
}
