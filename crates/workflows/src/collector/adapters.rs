// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

//! Property path to record field translation, one flat match per kind.

use client::{
    property::{PropertyChange, UpdateKind},
    soap::Element,
};
use md5::{Digest, Md5};
use models::inventory::{
    Cluster, ClusterVariant, Datacenter, Datastore, DvsHost, Folder, Host, Kind, Model, Network,
    NetworkVariant, PortGroup, Pnic, Ref, Switch, Vnic,
};
use tracing::info;

/// A record kind the collector can build from property changes
pub trait Adapter: Model + Default + PartialEq {
    /// An empty record for an object entering the view
    fn fresh(id: &str, sdk_type: &str) -> Self;

    fn apply(&mut self, change: &PropertyChange);

    /// Derived fields, recomputed after every applied batch of changes
    fn finish(&mut self) {}

    /// Applies every change of one object update
    fn apply_all(&mut self, kind: UpdateKind, changes: &[PropertyChange]) {
        if kind == UpdateKind::Leave {
            return;
        }
        for change in changes {
            self.apply(change);
        }
        self.finish();
    }
}

fn url_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '~' | '-')
}

/// Datastore ids that are not URL safe become their lowercase MD5 hex digest
pub fn canonical_datastore_id(raw: &str) -> String {
    if raw.chars().all(url_safe) {
        return raw.to_owned();
    }

    base16ct::lower::encode_string(&Md5::digest(raw.as_bytes()))
}

/// The store id of a managed object
pub fn canonical_id(kind: Kind, raw: &str) -> String {
    match kind {
        Kind::Datastore => canonical_datastore_id(raw),
        _ => raw.to_owned(),
    }
}

pub(crate) fn to_ref(el: &Element) -> Option<Ref> {
    let m = el.moref()?;
    let kind = Kind::from_sdk_type(&m.kind);

    Some(Ref::new(kind, canonical_id(kind, &m.value)))
}

/// Every managed object reference directly below `el`
pub(crate) fn refs(el: &Element) -> Vec<Ref> {
    el.children.iter().filter_map(to_ref).collect()
}

pub(crate) fn val(change: &PropertyChange) -> Option<&Element> {
    change.val.as_ref()
}

pub(crate) fn text(change: &PropertyChange) -> String {
    val(change).map(|v| v.text.clone()).unwrap_or_default()
}

pub(crate) fn flag(change: &PropertyChange) -> bool {
    val(change).is_some_and(Element::as_bool)
}

pub(crate) fn int(change: &PropertyChange) -> i64 {
    val(change).and_then(Element::as_i64).unwrap_or(0)
}

pub(crate) fn parent(change: &PropertyChange) -> Option<Ref> {
    val(change).and_then(to_ref)
}

pub(crate) fn ref_list(change: &PropertyChange) -> Vec<Ref> {
    val(change).map(refs).unwrap_or_default()
}

fn keyed_refs(change: &PropertyChange) -> Vec<Ref> {
    val(change)
        .map(|v| {
            v.children
                .iter()
                .filter_map(|c| c.child("key").and_then(to_ref))
                .collect()
        })
        .unwrap_or_default()
}

fn as_i32(v: i64) -> i32 {
    v.clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

impl Adapter for Folder {
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
            "childEntity" => self.children = ref_list(change),
            _ => {}
        }
    }
}

impl Adapter for Datacenter {
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
            "vmFolder" => self.vms = parent(change),
            "hostFolder" => self.clusters = parent(change),
            "networkFolder" => self.networks = parent(change),
            "datastoreFolder" => self.datastores = parent(change),
            _ => {}
        }
    }
}

impl Adapter for Cluster {
    fn fresh(id: &str, sdk_type: &str) -> Self {
        let variant = match sdk_type {
            "ComputeResource" => ClusterVariant::ComputeResource,
            _ => ClusterVariant::Cluster,
        };

        Self {
            id: id.to_owned(),
            variant,
            ..Default::default()
        }
    }

    fn apply(&mut self, change: &PropertyChange) {
        match change.name.as_str() {
            "name" => self.name = text(change),
            "parent" => self.parent = parent(change),
            "host" => self.hosts = ref_list(change),
            "network" => self.networks = ref_list(change),
            "datastore" => self.datastores = ref_list(change),
            "configuration.dasConfig.enabled" => self.das_enabled = flag(change),
            "configuration.dasVmConfig" => self.das_vms = keyed_refs(change),
            "configuration.drsConfig.enabled" => self.drs_enabled = flag(change),
            "configuration.drsConfig.defaultVmBehavior" => self.drs_behavior = text(change),
            "configuration.drsVmConfig" => self.drs_vms = keyed_refs(change),
            _ => {}
        }
    }
}

impl Adapter for Host {
    fn fresh(id: &str, _: &str) -> Self {
        Self {
            id: id.to_owned(),
            ..Default::default()
        }
    }

    fn apply(&mut self, change: &PropertyChange) {
        let net = &mut self.network_config;

        match change.name.as_str() {
            "name" => self.name = text(change),
            "parent" => self.parent = parent(change),
            "overallStatus" => self.status = text(change),
            "config.product.name" => self.product_name = text(change),
            "config.product.version" => self.product_version = text(change),
            "summary.config.sslThumbprint" => self.thumbprint = text(change),
            "config.dateTimeInfo.timeZone.name" => self.timezone = text(change),
            "summary.managementServerIp" => self.mgmt_server_ip = text(change),
            "summary.runtime.inMaintenanceMode" => self.in_maintenance = flag(change),
            "summary.hardware.numCpuPkgs" => self.cpu_sockets = int(change) as i16,
            "summary.hardware.numCpuCores" => self.cpu_cores = int(change) as i16,
            "hardware.systemInfo.model" => self.model = text(change),
            "hardware.systemInfo.vendor" => self.vendor = text(change),
            "datastore" => self.datastores = ref_list(change),
            "network" => self.networks = ref_list(change),
            "vm" => self.vms = ref_list(change),
            "config.network.pnic" => {
                net.pnics = children(change)
                    .map(|p| Pnic {
                        key: p.text_of("key").unwrap_or_default().to_owned(),
                        link_speed: p
                            .path(&["linkSpeed", "speedMb"])
                            .and_then(Element::as_i64)
                            .map(as_i32)
                            .unwrap_or(0),
                    })
                    .collect()
            }
            "config.network.vnic" => {
                net.vnics = children(change)
                    .map(|v| {
                        let spec = v.child("spec");
                        let get = |p: &[&str]| {
                            spec.and_then(|s| s.path(p))
                                .map(|e| e.text.clone())
                                .unwrap_or_default()
                        };

                        Vnic {
                            key: v.text_of("key").unwrap_or_default().to_owned(),
                            port_group: v.text_of("portgroup").unwrap_or_default().to_owned(),
                            dv_port_group: get(&["distributedVirtualPort", "portgroupKey"]),
                            ip_address: get(&["ip", "ipAddress"]),
                            subnet_mask: get(&["ip", "subnetMask"]),
                            mtu: spec
                                .and_then(|s| s.child("mtu"))
                                .and_then(Element::as_i64)
                                .map(as_i32)
                                .unwrap_or(0),
                        }
                    })
                    .collect()
            }
            "config.network.portgroup" => {
                net.port_groups = children(change)
                    .map(|p| PortGroup {
                        key: p.text_of("key").unwrap_or_default().to_owned(),
                        name: p.path(&["spec", "name"]).map(|e| e.text.clone()).unwrap_or_default(),
                        switch: p
                            .path(&["spec", "vswitchName"])
                            .map(|e| e.text.clone())
                            .unwrap_or_default(),
                    })
                    .collect()
            }
            "config.network.vswitch" => {
                net.switches = children(change)
                    .map(|s| Switch {
                        key: s.text_of("key").unwrap_or_default().to_owned(),
                        name: s.text_of("name").unwrap_or_default().to_owned(),
                        port_groups: s.children_named("portgroup").map(|e| e.text.clone()).collect(),
                        pnics: s.children_named("pnic").map(|e| e.text.clone()).collect(),
                    })
                    .collect()
            }
            _ => {}
        }
    }

    fn finish(&mut self) {
        self.network_config.sort();
    }
}

fn children(change: &PropertyChange) -> impl Iterator<Item = &Element> {
    val(change).into_iter().flat_map(|v| v.children.iter())
}

impl Adapter for Network {
    fn fresh(id: &str, sdk_type: &str) -> Self {
        let variant = match sdk_type {
            "OpaqueNetwork" => NetworkVariant::Opaque,
            "DistributedVirtualPortgroup" => NetworkVariant::DvPortGroup,
            "VmwareDistributedVirtualSwitch" | "DistributedVirtualSwitch" => NetworkVariant::DvSwitch,
            _ => NetworkVariant::Standard,
        };

        Self {
            id: id.to_owned(),
            variant,
            ..Default::default()
        }
    }

    fn apply(&mut self, change: &PropertyChange) {
        match change.name.as_str() {
            "name" => self.name = text(change),
            "parent" => self.parent = parent(change),
            "tag" => {
                self.tag = children(change)
                    .filter_map(|t| t.text_of("key"))
                    .collect::<Vec<_>>()
                    .join(",")
            }
            "key" => self.key = text(change),
            "summary" if self.variant == NetworkVariant::Opaque => {
                if let Some(id) = val(change).and_then(|v| v.text_of("opaqueNetworkId")) {
                    self.key = id.to_owned();
                }
            }
            "config.distributedVirtualSwitch" => self.dv_switch = parent(change),
            "config.defaultPortConfig" => {
                self.vlan_id = val(change)
                    .and_then(|v| v.path(&["vlan", "vlanId"]))
                    .map(|e| e.text.clone())
                    .unwrap_or_default()
            }
            "config.host" => {
                self.hosts = children(change)
                    .filter_map(|m| {
                        let config = m.child("config")?;
                        let host = config.child("host").and_then(to_ref)?;
                        let pnics = config
                            .path(&["backing"])
                            .map(|b| {
                                b.children_named("pnicSpec")
                                    .filter_map(|p| p.text_of("pnicDevice"))
                                    .map(str::to_owned)
                                    .collect()
                            })
                            .unwrap_or_default();

                        Some(DvsHost { host, pnics })
                    })
                    .collect()
            }
            _ => {}
        }
    }
}

impl Adapter for Datastore {
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
            "summary.type" => self.datastore_type = text(change),
            "summary.capacity" => self.capacity = int(change),
            "summary.freeSpace" => self.free = int(change),
            "summary.maintenanceMode" => self.maintenance_mode = text(change),
            "host" => self.hosts = keyed_refs(change),
            _ => {}
        }
    }
}

/// Records the reported id of a datastore whose id had to be canonicalized
pub fn note_reported_id(ds: &mut Datastore, raw: &str) {
    if ds.id != raw && ds.reported_id.as_deref() != Some(raw) {
        info!("Datastore id {raw} stored as {}", ds.id);
        ds.reported_id = Some(raw.to_owned());
    }
}
