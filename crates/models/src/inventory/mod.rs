// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

mod analysis;
mod cluster;
mod datacenter;
mod datastore;
mod folder;
mod host;
mod network;
pub mod query;
mod vm;

pub use analysis::{Concern, Severity, VmAnalysis};
pub use cluster::{Cluster, ClusterVariant};
pub use datacenter::Datacenter;
pub use datastore::Datastore;
pub use folder::Folder;
pub use host::{Host, HostNetwork, PortGroup, Pnic, Switch, Vnic};
pub use network::{DvsHost, Network, NetworkVariant};
pub use query::{Inventory, Page, QueryError, Workload};
pub use vm::{
    Bus, Controller, Disk, Firmware, GuestDisk, GuestIpStack, GuestNetwork, Nic, Vm,
};

use dal::DBTable;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// The kinds of inventory object that are replicated locally.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Kind {
    Folder,
    Datacenter,
    Cluster,
    Host,
    Network,
    Datastore,
    Vm,
    /// SDK types outside the replicated set (resource pools, vApps, ...)
    #[default]
    Unknown,
}

impl Kind {
    /// Maps a vSphere managed object type name to its inventory kind
    pub fn from_sdk_type(sdk_type: &str) -> Self {
        match sdk_type {
            "Folder" => Self::Folder,
            "Datacenter" => Self::Datacenter,
            "ClusterComputeResource" | "ComputeResource" => Self::Cluster,
            "HostSystem" => Self::Host,
            "Network"
            | "OpaqueNetwork"
            | "DistributedVirtualPortgroup"
            | "VmwareDistributedVirtualSwitch"
            | "DistributedVirtualSwitch" => Self::Network,
            "Datastore" => Self::Datastore,
            "VirtualMachine" => Self::Vm,
            _ => Self::Unknown,
        }
    }
}

/// A back-edge to another inventory object.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Ref {
    pub kind: Kind,
    pub id: String,
}

impl Ref {
    pub fn new(kind: Kind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn from_sdk(sdk_type: &str, id: impl Into<String>) -> Self {
        Self::new(Kind::from_sdk_type(sdk_type), id)
    }
}

impl std::fmt::Display for Ref {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Shared surface of every replicated inventory record
pub trait Model: DBTable {
    const KIND: Kind;

    fn name(&self) -> &str;

    fn parent(&self) -> Option<&Ref>;

    fn reference(&self) -> Ref {
        Ref::new(Self::KIND, self.id())
    }

    fn into_record(self) -> Record;
}

macro_rules! inventory_model {
    ($model:ident, $kind:expr, $table:literal) => {
        impl dal::DBTable for $model {
            fn table_name() -> &'static str {
                $table
            }

            fn id(&self) -> String {
                self.id.clone()
            }

            fn revision(&self) -> u64 {
                self.revision
            }

            fn set_revision(&mut self, revision: u64) {
                self.revision = revision;
            }
        }

        impl $crate::inventory::Model for $model {
            const KIND: $crate::inventory::Kind = $kind;

            fn name(&self) -> &str {
                &self.name
            }

            fn parent(&self) -> Option<&$crate::inventory::Ref> {
                self.parent.as_ref()
            }

            fn into_record(self) -> $crate::inventory::Record {
                $crate::inventory::Record::$model(self)
            }
        }
    };
}

pub(crate) use inventory_model;

/// Any inventory record, for lookups where the kind is only known at runtime.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Record {
    Folder(Folder),
    Datacenter(Datacenter),
    Cluster(Cluster),
    Host(Host),
    Network(Network),
    Datastore(Datastore),
    Vm(Vm),
}

impl Record {
    pub fn name(&self) -> &str {
        match self {
            Record::Folder(v) => v.name(),
            Record::Datacenter(v) => v.name(),
            Record::Cluster(v) => v.name(),
            Record::Host(v) => v.name(),
            Record::Network(v) => v.name(),
            Record::Datastore(v) => v.name(),
            Record::Vm(v) => v.name(),
        }
    }

    pub fn parent(&self) -> Option<&Ref> {
        match self {
            Record::Folder(v) => v.parent(),
            Record::Datacenter(v) => v.parent(),
            Record::Cluster(v) => v.parent(),
            Record::Host(v) => v.parent(),
            Record::Network(v) => v.parent(),
            Record::Datastore(v) => v.parent(),
            Record::Vm(v) => v.parent(),
        }
    }

    pub fn revision(&self) -> u64 {
        match self {
            Record::Folder(v) => v.revision,
            Record::Datacenter(v) => v.revision,
            Record::Cluster(v) => v.revision,
            Record::Host(v) => v.revision,
            Record::Network(v) => v.revision,
            Record::Datastore(v) => v.revision,
            Record::Vm(v) => v.revision,
        }
    }

    pub fn reference(&self) -> Ref {
        match self {
            Record::Folder(v) => v.reference(),
            Record::Datacenter(v) => v.reference(),
            Record::Cluster(v) => v.reference(),
            Record::Host(v) => v.reference(),
            Record::Network(v) => v.reference(),
            Record::Datastore(v) => v.reference(),
            Record::Vm(v) => v.reference(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn sdk_types_map_to_kinds() {
        assert_eq!(Kind::from_sdk_type("ClusterComputeResource"), Kind::Cluster);
        assert_eq!(Kind::from_sdk_type("ComputeResource"), Kind::Cluster);
        assert_eq!(Kind::from_sdk_type("DistributedVirtualPortgroup"), Kind::Network);
        assert_eq!(Kind::from_sdk_type("VirtualMachine"), Kind::Vm);
        assert_eq!(Kind::from_sdk_type("ResourcePool"), Kind::Unknown);
    }

    #[test]
    fn kinds_round_trip_through_strings() {
        assert_eq!(Kind::Datastore.to_string(), "datastore");
        assert_eq!(Kind::from_str("vm").unwrap(), Kind::Vm);
        assert_eq!(Ref::new(Kind::Host, "host-9").to_string(), "host:host-9");
    }
}
