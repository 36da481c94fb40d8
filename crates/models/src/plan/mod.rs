// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

mod mapping;

pub use mapping::{
    DestinationNetwork, NetworkPair, SourceRef, StorageDestination, StoragePair,
};

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::inventory::{Datastore, Network};

/// One VM selected for migration, by id or by name.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PlanVm {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    /// Destination name, derived from the source name when unset
    #[serde(default)]
    pub target_name: Option<String>,
    /// Index into the builder's disk order of the disk to boot from
    #[serde(default)]
    pub root_disk: Option<usize>,
}

/// A host reached directly instead of through vCenter for disk transfers.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct HostOverride {
    /// Host id in the inventory
    pub host: String,
    pub ip_address: String,
    /// Same keys as the provider secret
    #[serde(default)]
    pub credentials: BTreeMap<String, String>,
    /// Port group carrying transfer traffic, when selected explicitly
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default = "yes")]
    pub ready: bool,
}

fn yes() -> bool {
    true
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TargetPowerState {
    On,
    Off,
    /// Match the source VM's power state before migration
    #[default]
    Auto,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub id: String,
    pub name: String,
    pub target_namespace: String,
    pub vms: Vec<PlanVm>,
    #[serde(default)]
    pub network_map: Vec<NetworkPair>,
    #[serde(default)]
    pub storage_map: Vec<StoragePair>,
    #[serde(default)]
    pub warm: bool,
    #[serde(default)]
    pub preserve_static_ips: bool,
    #[serde(default)]
    pub skip_guest_conversion: bool,
    #[serde(default = "yes")]
    pub migrate_shared_disks: bool,
    #[serde(default)]
    pub install_legacy_drivers: Option<bool>,
    #[serde(default)]
    pub pvc_name_template: Option<String>,
    #[serde(default)]
    pub host_overrides: Vec<HostOverride>,
    #[serde(default)]
    pub target_power_state: TargetPowerState,
    /// Warm plans cut over at this time; unset means wait for an explicit request
    #[serde(default)]
    pub cutover: Option<DateTime<Utc>>,
}

impl Plan {
    pub fn host_override(&self, host_id: &str) -> Option<&HostOverride> {
        self.host_overrides
            .iter()
            .find(|h| h.host == host_id && h.ready)
    }

    pub fn network_pair(&self, network: &Network) -> Option<&NetworkPair> {
        self.network_map
            .iter()
            .find(|p| p.source.matches_network(network))
    }

    pub fn storage_pair(&self, datastore: &Datastore) -> Option<&StoragePair> {
        self.storage_map
            .iter()
            .find(|p| p.source.matches(&datastore.id, &datastore.name))
    }
}
