// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum_macros::Display;

use super::{inventory_model, Kind, Ref};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Firmware {
    #[default]
    Bios,
    Efi,
}

/// Controller bus a disk hangs off.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Display, PartialOrd, Ord,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Bus {
    #[default]
    Scsi,
    Sata,
    Nvme,
    Ide,
}

impl Bus {
    /// Position of the bus in the destination disk order; SCSI and NVMe share the first slot
    pub fn priority(self) -> u8 {
        match self {
            Bus::Scsi | Bus::Nvme => 0,
            Bus::Sata => 1,
            Bus::Ide => 2,
        }
    }

    /// Maps a vSphere controller device type to its bus
    pub fn from_controller_type(sdk_type: &str) -> Option<Self> {
        match sdk_type {
            "VirtualLsiLogicController"
            | "VirtualLsiLogicSASController"
            | "ParaVirtualSCSIController"
            | "VirtualBusLogicController"
            | "VirtualSCSIController" => Some(Bus::Scsi),
            "VirtualAHCIController" | "VirtualSATAController" => Some(Bus::Sata),
            "VirtualNVMEController" => Some(Bus::Nvme),
            "VirtualIDEController" => Some(Bus::Ide),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct Controller {
    pub key: i32,
    pub bus: Bus,
    pub bus_number: i32,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct Disk {
    pub key: i32,
    /// Backing file, e.g. `[datastore1] vm/vm.vmdk`
    pub file: String,
    pub capacity: i64,
    pub datastore: Ref,
    pub bus: Bus,
    pub controller_key: i32,
    pub unit_number: i32,
    pub shared: bool,
    pub rdm: bool,
    pub mode: String,
    pub change_tracking_enabled: bool,
    pub win_drive_letter: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct Nic {
    pub mac: String,
    pub network: Ref,
    /// Position of the device in the VM's hardware list
    pub index: usize,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct GuestDisk {
    /// Virtual disk key this mount is backed by, when the tools report it
    pub key: Option<i32>,
    pub path: String,
    pub capacity: i64,
    pub free: i64,
    pub fs_type: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct GuestNetwork {
    pub mac: String,
    pub ip: String,
    pub prefix: i32,
    /// `manual`, `dhcp`, `linklayer`, ...
    pub origin: String,
    pub dns: Vec<String>,
    pub device: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct GuestIpStack {
    pub gateway: String,
    pub network: String,
    pub device: String,
    pub dns: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct Vm {
    pub id: String,
    pub name: String,
    pub parent: Option<Ref>,
    #[serde(default)]
    pub revision: u64,
    pub uuid: String,
    pub firmware: Firmware,
    pub secure_boot: bool,
    pub power_state: String,
    pub connection_state: String,
    pub guest_id: String,
    pub guest_name: String,
    pub host_name: String,
    pub ip_address: String,
    pub cpu_count: i32,
    pub cores_per_socket: i32,
    pub memory_mb: i32,
    pub cpu_hot_add: bool,
    pub cpu_hot_remove: bool,
    pub memory_hot_add: bool,
    pub nested_hv: bool,
    pub fault_tolerance: bool,
    pub cpu_affinity: Vec<i32>,
    pub numa_node_affinity: Vec<String>,
    pub balloon_mem: i32,
    pub storage_used: i64,
    pub change_tracking_enabled: bool,
    pub tpm_present: bool,
    pub is_template: bool,
    pub host: Option<Ref>,
    pub networks: Vec<Ref>,
    /// Device types with migration impact (passthrough, SR-IOV, USB, ...)
    pub devices: Vec<String>,
    pub controllers: Vec<Controller>,
    pub nics: Vec<Nic>,
    pub disks: Vec<Disk>,
    pub guest_disks: Vec<GuestDisk>,
    pub guest_networks: Vec<GuestNetwork>,
    pub guest_ip_stack: Vec<GuestIpStack>,
    pub snapshot: Option<Ref>,
    /// Raw `<bus><n>:<unit>.ctkEnabled` flags from extraConfig
    pub ctk_flags: BTreeMap<String, bool>,
}

inventory_model!(Vm, Kind::Vm, "vms");

impl Vm {
    pub fn is_windows(&self) -> bool {
        self.guest_id.contains("win") || self.guest_name.contains("win")
    }

    pub fn powered_on(&self) -> bool {
        self.power_state == "poweredOn"
    }

    pub fn connected(&self) -> bool {
        self.connection_state.is_empty() || self.connection_state == "connected"
    }

    pub fn controller(&self, key: i32) -> Option<&Controller> {
        self.controllers.iter().find(|c| c.key == key)
    }

    pub fn has_shared_disks(&self) -> bool {
        self.disks.iter().any(|d| d.shared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_priority_puts_nvme_with_scsi() {
        assert_eq!(Bus::Scsi.priority(), Bus::Nvme.priority());
        assert!(Bus::Sata.priority() > Bus::Scsi.priority());
        assert!(Bus::Ide.priority() > Bus::Sata.priority());
    }

    #[test]
    fn windows_detection_uses_guest_id() {
        let vm = Vm {
            guest_id: "windows2019srv_64Guest".to_owned(),
            ..Default::default()
        };
        assert!(vm.is_windows());

        let vm = Vm {
            guest_id: "rhel8_64Guest".to_owned(),
            guest_name: "Red Hat Enterprise Linux 8 (64-bit)".to_owned(),
            ..Default::default()
        };
        assert!(!vm.is_windows());
    }

    #[test]
    fn controller_types_map_to_buses() {
        assert_eq!(Bus::from_controller_type("ParaVirtualSCSIController"), Some(Bus::Scsi));
        assert_eq!(Bus::from_controller_type("VirtualAHCIController"), Some(Bus::Sata));
        assert_eq!(Bus::from_controller_type("VirtualNVMEController"), Some(Bus::Nvme));
        assert_eq!(Bus::from_controller_type("VirtualIDEController"), Some(Bus::Ide));
        assert_eq!(Bus::from_controller_type("VirtualUSBController"), None);
    }
}
