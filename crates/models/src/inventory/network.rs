use serde::{Deserialize, Serialize};

use super::{inventory_model, Kind, Ref};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkVariant {
    #[default]
    Standard,
    Opaque,
    DvPortGroup,
    DvSwitch,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct DvsHost {
    pub host: Ref,
    pub pnics: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct Network {
    pub id: String,
    pub name: String,
    pub parent: Option<Ref>,
    #[serde(default)]
    pub revision: u64,
    pub variant: NetworkVariant,
    pub tag: String,
    /// Port group key or opaque network id, the identity VM NIC backings carry
    pub key: String,
    pub dv_switch: Option<Ref>,
    pub vlan_id: String,
    pub hosts: Vec<DvsHost>,
}

impl Network {
    /// The identifier a VM NIC backing uses to point at this network
    pub fn backing_id(&self) -> &str {
        match self.variant {
            NetworkVariant::DvPortGroup | NetworkVariant::Opaque if !self.key.is_empty() => {
                &self.key
            }
            _ => &self.id,
        }
    }
}

inventory_model!(Network, Kind::Network, "networks");
