use serde::{Deserialize, Serialize};

use super::{inventory_model, Kind, Ref};

/// A datacenter and the four folders hanging off it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct Datacenter {
    pub id: String,
    pub name: String,
    pub parent: Option<Ref>,
    #[serde(default)]
    pub revision: u64,
    pub vms: Option<Ref>,
    pub clusters: Option<Ref>,
    pub networks: Option<Ref>,
    pub datastores: Option<Ref>,
}

inventory_model!(Datacenter, Kind::Datacenter, "datacenters");
