// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

//! The destination platform as the orchestrator sees it: namespaces,
//! secrets, data volumes, virtual machines and migration records.

mod local;

pub use local::LocalDestination;

use std::collections::BTreeMap;

use async_trait::async_trait;
use models::migration::VmMigrationStatus;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::builder::{DataVolume, VmSpec};

/// A VM already present on the destination, as far as MAC checks care
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TargetVm {
    pub namespace: String,
    pub name: String,
    pub macs: Vec<String>,
}

impl TargetVm {
    pub fn path(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

impl From<&VmSpec> for TargetVm {
    fn from(spec: &VmSpec) -> Self {
        Self {
            namespace: spec.namespace.clone(),
            name: spec.name.clone(),
            macs: spec.macs(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DestinationError {
    #[error("{kind} {name} not found on the destination")]
    NotFound { kind: &'static str, name: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("destination state i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("destination record encoding: {0}")]
    Serialization(String),
}

impl DestinationError {
    /// Objects this process created can lag behind their creation, so a
    /// missing object is worth another look.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::Io(_))
    }

    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }
}

impl From<serde_json::Error> for DestinationError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value.to_string())
    }
}

impl From<serde_yaml::Error> for DestinationError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Serialization(value.to_string())
    }
}

/// Resource lifecycle on the destination.
///
/// Every `ensure_*` and `apply_*` call is idempotent: repeating it with the
/// same input leaves the destination as the first call did. Deleting
/// something that is already gone succeeds.
#[async_trait]
pub trait Destination: Send + Sync {
    async fn ensure_namespace(&self, name: &str) -> Result<(), DestinationError>;

    async fn ensure_secret(
        &self,
        namespace: &str,
        name: &str,
        data: &BTreeMap<String, String>,
    ) -> Result<(), DestinationError>;

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), DestinationError>;

    /// Every VM on the destination with its MAC addresses
    async fn target_vms(&self) -> Result<Vec<TargetVm>, DestinationError>;

    /// Creates the volume, or brings an existing one up to `volume`
    async fn ensure_volume(&self, volume: &DataVolume) -> Result<(), DestinationError>;

    async fn get_volume(&self, namespace: &str, name: &str) -> Result<DataVolume, DestinationError>;

    async fn delete_volume(&self, namespace: &str, name: &str) -> Result<(), DestinationError>;

    async fn apply_vm(&self, spec: &VmSpec) -> Result<(), DestinationError>;

    async fn delete_vm(&self, namespace: &str, name: &str) -> Result<(), DestinationError>;

    async fn save_status(&self, status: &VmMigrationStatus) -> Result<(), DestinationError>;

    async fn load_status(
        &self,
        plan: &str,
        vm: &str,
    ) -> Result<Option<VmMigrationStatus>, DestinationError>;
}
