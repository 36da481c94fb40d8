use serde::{Deserialize, Serialize};

use super::{inventory_model, Kind, Ref};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct Pnic {
    pub key: String,
    /// Megabits per second, zero when the link is down
    pub link_speed: i32,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct Vnic {
    pub key: String,
    pub port_group: String,
    pub dv_port_group: String,
    pub ip_address: String,
    pub subnet_mask: String,
    pub mtu: i32,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct PortGroup {
    pub key: String,
    pub name: String,
    pub switch: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct Switch {
    pub key: String,
    pub name: String,
    pub port_groups: Vec<String>,
    pub pnics: Vec<String>,
}

/// Host network configuration; pnics are kept fastest first, vnics largest MTU first.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct HostNetwork {
    pub pnics: Vec<Pnic>,
    pub vnics: Vec<Vnic>,
    pub port_groups: Vec<PortGroup>,
    pub switches: Vec<Switch>,
}

impl HostNetwork {
    pub fn sort(&mut self) {
        self.pnics.sort_by(|a, b| b.link_speed.cmp(&a.link_speed));
        self.vnics.sort_by(|a, b| b.mtu.cmp(&a.mtu));
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct Host {
    pub id: String,
    pub name: String,
    pub parent: Option<Ref>,
    #[serde(default)]
    pub revision: u64,
    pub status: String,
    pub in_maintenance: bool,
    pub thumbprint: String,
    pub product_name: String,
    pub product_version: String,
    pub timezone: String,
    pub mgmt_server_ip: String,
    pub cpu_sockets: i16,
    pub cpu_cores: i16,
    pub model: String,
    pub vendor: String,
    pub networks: Vec<Ref>,
    pub datastores: Vec<Ref>,
    pub vms: Vec<Ref>,
    pub network_config: HostNetwork,
}

inventory_model!(Host, Kind::Host, "hosts");
