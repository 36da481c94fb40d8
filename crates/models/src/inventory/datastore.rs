use serde::{Deserialize, Serialize};

use super::{inventory_model, Kind, Ref};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct Datastore {
    pub id: String,
    pub name: String,
    pub parent: Option<Ref>,
    #[serde(default)]
    pub revision: u64,
    #[serde(rename = "type")]
    pub datastore_type: String,
    pub capacity: i64,
    pub free: i64,
    pub maintenance_mode: String,
    /// The id reported by the SDK, when it had to be canonicalized
    pub reported_id: Option<String>,
    pub hosts: Vec<Ref>,
}

inventory_model!(Datastore, Kind::Datastore, "datastores");
