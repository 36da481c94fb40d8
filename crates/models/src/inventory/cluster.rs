use serde::{Deserialize, Serialize};

use super::{inventory_model, Kind, Ref};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ClusterVariant {
    #[default]
    Cluster,
    /// A standalone host wrapped in its own compute resource
    ComputeResource,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct Cluster {
    pub id: String,
    pub name: String,
    pub parent: Option<Ref>,
    #[serde(default)]
    pub revision: u64,
    pub variant: ClusterVariant,
    pub hosts: Vec<Ref>,
    pub networks: Vec<Ref>,
    pub datastores: Vec<Ref>,
    pub das_enabled: bool,
    pub das_vms: Vec<Ref>,
    pub drs_enabled: bool,
    pub drs_behavior: String,
    pub drs_vms: Vec<Ref>,
}

inventory_model!(Cluster, Kind::Cluster, "clusters");
