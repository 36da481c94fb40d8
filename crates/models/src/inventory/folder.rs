use serde::{Deserialize, Serialize};

use super::{inventory_model, Kind, Ref};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct Folder {
    pub id: String,
    pub name: String,
    pub parent: Option<Ref>,
    #[serde(default)]
    pub revision: u64,
    pub children: Vec<Ref>,
}

inventory_model!(Folder, Kind::Folder, "folders");
