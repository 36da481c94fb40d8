// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

use std::collections::HashMap;

use client::{property::PropertyChange, soap::Element};
use models::inventory::{
    Bus, Controller, Disk, Firmware, GuestDisk, GuestIpStack, GuestNetwork, Kind, Nic, Ref, Vm,
};

use super::adapters::{canonical_datastore_id, flag, int, parent, ref_list, text, to_ref, val, Adapter};

/// Device types recorded on the VM because they block or complicate a migration
const NOTABLE_DEVICES: [&str; 5] = [
    "VirtualPCIPassthrough",
    "VirtualSriovEthernetCard",
    "VirtualSCSIPassthrough",
    "VirtualUSBController",
    "VirtualUSB",
];

impl Adapter for Vm {
    fn fresh(id: &str, _: &str) -> Self {
        Self {
            id: id.to_owned(),
            ..Default::default()
        }
    }

    fn apply(&mut self, change: &PropertyChange) {
        match change.name.as_str() {
            "name" => self.name = text(change),
            "parent" => self.parent = parent(change),
            "config.uuid" => self.uuid = text(change),
            "config.firmware" => {
                self.firmware = match text(change).as_str() {
                    "efi" => Firmware::Efi,
                    _ => Firmware::Bios,
                }
            }
            "config.ftInfo" => self.fault_tolerance = val(change).is_some(),
            "config.cpuAffinity" => {
                self.cpu_affinity = val(change)
                    .map(|v| {
                        v.children_named("affinitySet")
                            .filter_map(Element::as_i64)
                            .map(|n| n as i32)
                            .collect()
                    })
                    .unwrap_or_default()
            }
            "config.bootOptions" => {
                if let Some(b) = val(change).and_then(|v| v.child("efiSecureBootEnabled")) {
                    self.secure_boot = b.as_bool();
                }
            }
            "config.cpuHotAddEnabled" => self.cpu_hot_add = flag(change),
            "config.cpuHotRemoveEnabled" => self.cpu_hot_remove = flag(change),
            "config.memoryHotAddEnabled" => self.memory_hot_add = flag(change),
            "config.hardware.numCPU" => self.cpu_count = int(change) as i32,
            "config.hardware.numCoresPerSocket" => self.cores_per_socket = int(change) as i32,
            "config.hardware.memoryMB" => self.memory_mb = int(change) as i32,
            "config.nestedHVEnabled" => self.nested_hv = flag(change),
            "config.changeTrackingEnabled" => self.change_tracking_enabled = flag(change),
            "config.template" => self.is_template = flag(change),
            "config.extraConfig" => self.apply_extra_config(val(change)),
            "config.hardware.device" => {
                if let Some(devices) = val(change) {
                    self.apply_devices(devices);
                }
            }
            "summary.config.guestFullName" => self.guest_name = text(change),
            "guest.guestFullName" => {
                let name = text(change);
                if !name.is_empty() {
                    self.guest_name = name;
                }
            }
            "summary.guest.guestId" => {
                // the tools stop reporting it while the guest is down
                let id = text(change);
                if !id.is_empty() {
                    self.guest_id = id;
                }
            }
            "guest.hostName" => self.host_name = text(change),
            "summary.guest.ipAddress" => self.ip_address = text(change),
            "summary.quickStats.balloonedMemory" => self.balloon_mem = int(change) as i32,
            "summary.storage.committed" => self.storage_used = int(change),
            "summary.config.tpmPresent" => self.tpm_present = flag(change),
            "datastore" => {}
            "network" => self.networks = ref_list(change),
            "runtime.host" => self.host = parent(change),
            "runtime.powerState" => self.power_state = text(change),
            "runtime.connectionState" => self.connection_state = text(change),
            "snapshot" => {
                self.snapshot = val(change)
                    .and_then(|v| v.child("currentSnapshot"))
                    .map(|s| Ref::new(Kind::Unknown, s.text.clone()))
            }
            "guest.net" => {
                let nets = guest_networks(val(change));
                if !nets.is_empty() {
                    self.guest_networks = nets;
                }
            }
            "guest.ipStack" => {
                let stack = guest_ip_stack(val(change));
                if !stack.is_empty() {
                    self.guest_ip_stack = stack;
                }
            }
            "guest.disk" => {
                let disks = guest_disks(val(change));
                if !disks.is_empty() {
                    self.guest_disks = disks;
                }
            }
            _ => {}
        }
    }

    fn finish(&mut self) {
        self.apply_change_tracking();
        self.merge_guest_disks();
        self.reorder_nics();
    }
}

/// Device and guest parsing that fills in a [`Vm`] record
trait VmCollect {
    fn apply_extra_config(&mut self, options: Option<&Element>);
    fn apply_devices(&mut self, devices: &Element);
    fn disk(&self, dev: &Element) -> Option<Disk>;
    fn apply_change_tracking(&mut self);
    fn merge_guest_disks(&mut self);
    fn reorder_nics(&mut self);
}

impl VmCollect for Vm {
    fn apply_extra_config(&mut self, options: Option<&Element>) {
        let Some(options) = options else {
            return;
        };

        self.ctk_flags.clear();
        for opt in &options.children {
            let (Some(key), Some(value)) = (opt.text_of("key"), opt.text_of("value")) else {
                continue;
            };

            if key == "numa.nodeAffinity" {
                self.numa_node_affinity = value.split(',').map(str::to_owned).collect();
            } else if let Some(disk) = key.strip_suffix(".ctkEnabled") {
                self.ctk_flags
                    .insert(disk.to_owned(), value.eq_ignore_ascii_case("true"));
            }
        }
    }

    fn apply_devices(&mut self, devices: &Element) {
        let mut controllers = Vec::new();
        let mut notable = Vec::new();

        for dev in &devices.children {
            let ty = dev.xsi_type.as_deref().unwrap_or_default();
            if let Some(bus) = Bus::from_controller_type(ty) {
                controllers.push(Controller {
                    key: dev_int(dev, "key"),
                    bus,
                    bus_number: dev_int(dev, "busNumber"),
                });
            }
            if NOTABLE_DEVICES.contains(&ty) {
                notable.push(ty.to_owned());
            }
        }
        self.controllers = controllers;
        self.devices = notable;

        let mut nics = Vec::new();
        let mut disks = Vec::new();
        for dev in &devices.children {
            if dev.is_type("VirtualDisk") {
                if let Some(disk) = self.disk(dev) {
                    disks.push(disk);
                }
            } else if let Some(mac) = dev.text_of("macAddress") {
                let Some(network) = dev.child("backing").and_then(nic_network) else {
                    continue;
                };

                nics.push(Nic {
                    mac: mac.to_owned(),
                    network,
                    index: nics.len(),
                });
            }
        }
        self.nics = nics;
        self.disks = disks;
    }

    fn disk(&self, dev: &Element) -> Option<Disk> {
        let backing = dev.child("backing")?;
        let ty = backing.xsi_type.as_deref().unwrap_or_default();
        let file = match ty {
            "VirtualDiskRawDiskVer2BackingInfo" => backing.text_of("descriptorFileName"),
            _ => backing.text_of("fileName"),
        }
        .unwrap_or_default()
        .to_owned();

        let controller_key = dev_int(dev, "controllerKey");
        let capacity = match dev.child("capacityInBytes").and_then(Element::as_i64) {
            Some(bytes) => bytes,
            None => dev.child("capacityInKB").and_then(Element::as_i64).unwrap_or(0) * 1024,
        };

        Some(Disk {
            key: dev_int(dev, "key"),
            file,
            capacity,
            datastore: backing
                .child("datastore")
                .and_then(Element::moref)
                .map(|m| Ref::new(Kind::Datastore, canonical_datastore_id(&m.value)))
                .unwrap_or_default(),
            bus: self.controller(controller_key).map(|c| c.bus).unwrap_or_default(),
            controller_key,
            unit_number: dev_int(dev, "unitNumber"),
            shared: backing
                .text_of("sharing")
                .is_some_and(|s| s != "sharingNone"),
            rdm: ty.contains("RawDisk"),
            mode: backing.text_of("diskMode").unwrap_or_default().to_owned(),
            change_tracking_enabled: false,
            win_drive_letter: None,
        })
    }

    fn apply_change_tracking(&mut self) {
        if self.disks.is_empty() {
            return;
        }

        let lookup: HashMap<i32, (Bus, i32)> = self
            .controllers
            .iter()
            .map(|c| (c.key, (c.bus, c.bus_number)))
            .collect();

        for disk in &mut self.disks {
            disk.change_tracking_enabled = lookup
                .get(&disk.controller_key)
                .and_then(|(bus, n)| {
                    self.ctk_flags
                        .get(&format!("{bus}{n}:{}", disk.unit_number))
                        .copied()
                })
                .unwrap_or(false);
        }

        self.change_tracking_enabled = self.disks.iter().all(|d| d.change_tracking_enabled);
    }

    fn merge_guest_disks(&mut self) {
        for disk in &mut self.disks {
            disk.win_drive_letter = self
                .guest_disks
                .iter()
                .find(|g| g.key == Some(disk.key))
                .and_then(|g| drive_letter(&g.path));
        }
    }

    fn reorder_nics(&mut self) {
        let mut order: Vec<String> = Vec::new();
        for net in &self.guest_networks {
            let mac = net.mac.to_ascii_lowercase();
            if !order.contains(&mac) {
                order.push(mac);
            }
        }

        // stable, so unmatched NICs keep their relative order at the end
        self.nics.sort_by_key(|nic| {
            order
                .iter()
                .position(|m| *m == nic.mac.to_ascii_lowercase())
                .unwrap_or(usize::MAX)
        });
    }
}

fn dev_int(dev: &Element, name: &str) -> i32 {
    dev.child(name).and_then(Element::as_i64).unwrap_or(0) as i32
}

/// The identity a NIC backing points at, matched against `Network::backing_id`
fn nic_network(backing: &Element) -> Option<Ref> {
    let id = match backing.xsi_type.as_deref() {
        Some("VirtualEthernetCardDistributedVirtualPortBackingInfo") => {
            backing.path(&["port", "portgroupKey"])?.text.clone()
        }
        Some("VirtualEthernetCardOpaqueNetworkBackingInfo") => {
            backing.text_of("opaqueNetworkId")?.to_owned()
        }
        _ => return backing.child("network").and_then(to_ref),
    };

    Some(Ref::new(Kind::Network, id))
}

fn drive_letter(path: &str) -> Option<String> {
    let mut chars = path.chars();
    let letter = chars.next().filter(char::is_ascii_alphabetic)?;

    (chars.next() == Some(':') && chars.next() == Some('\\'))
        .then(|| letter.to_ascii_lowercase().to_string())
}

fn guest_networks(val: Option<&Element>) -> Vec<GuestNetwork> {
    let Some(val) = val else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for (device, nic) in val.children.iter().enumerate() {
        let Some(ip_config) = nic.child("ipConfig") else {
            continue;
        };
        let dns: Vec<String> = nic
            .child("dnsConfig")
            .map(|d| d.children_named("ipAddress").map(|a| a.text.clone()).collect())
            .unwrap_or_default();

        for ip in ip_config.children_named("ipAddress") {
            out.push(GuestNetwork {
                mac: nic.text_of("macAddress").unwrap_or_default().to_owned(),
                ip: ip.text_of("ipAddress").unwrap_or_default().to_owned(),
                prefix: ip.child("prefixLength").and_then(Element::as_i64).unwrap_or(0) as i32,
                origin: ip.text_of("origin").unwrap_or_default().to_owned(),
                dns: dns.clone(),
                device: device.to_string(),
            });
        }
    }

    out
}

fn guest_ip_stack(val: Option<&Element>) -> Vec<GuestIpStack> {
    let Some(val) = val else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for stack in &val.children {
        let dns: Vec<String> = stack
            .child("dnsConfig")
            .map(|d| d.children_named("ipAddress").map(|a| a.text.clone()).collect())
            .unwrap_or_default();
        let Some(routes) = stack.child("ipRouteConfig") else {
            continue;
        };

        for route in routes.children_named("ipRoute") {
            let Some(gateway) = route.child("gateway") else {
                continue;
            };
            let address = gateway.text_of("ipAddress").unwrap_or_default();
            if address.is_empty() {
                continue;
            }

            out.push(GuestIpStack {
                gateway: address.to_owned(),
                network: route.text_of("network").unwrap_or_default().to_owned(),
                device: gateway.text_of("device").unwrap_or_default().to_owned(),
                dns: dns.clone(),
            });
        }
    }

    out
}

fn guest_disks(val: Option<&Element>) -> Vec<GuestDisk> {
    let Some(val) = val else {
        return Vec::new();
    };

    val.children
        .iter()
        .map(|d| GuestDisk {
            key: d
                .path(&["mappings", "key"])
                .and_then(Element::as_i64)
                .map(|k| k as i32),
            path: d.text_of("diskPath").unwrap_or_default().to_owned(),
            capacity: d.child("capacity").and_then(Element::as_i64).unwrap_or(0),
            free: d.child("freeSpace").and_then(Element::as_i64).unwrap_or(0),
            fs_type: d.text_of("filesystemType").unwrap_or_default().to_owned(),
        })
        .collect()
}
