// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

//! Translates an inventory VM into what the destination needs: one data
//! volume per migrated disk and the virtual machine spec that binds them.
//!
//! The builder only reads the inventory; everything it produces is plain
//! data handed to a [`crate::destination::Destination`].

mod disks;
mod env;
mod networks;
pub mod osmap;
pub mod serial;
pub mod static_ips;
pub mod template;

use std::collections::BTreeMap;

use client::source::trim_backing_file;
use config::ConversionConfig;
use dal::Readable;
use models::{
    inventory::{Host, Inventory, QueryError, Vm},
    plan::{Plan, PlanVm},
    provider::{CredentialError, Provider},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub use disks::{ordered_disks, pvc_data};
pub use networks::{mac_conflicts, network_by_id, nic_network, pod_nics};
use template::TemplateError;

use crate::destination::TargetVm;

pub const LABEL_PLAN: &str = "vmigrate.io/plan";
pub const LABEL_VM: &str = "vmigrate.io/vm";
pub const LABEL_SHAREABLE: &str = "vmigrate.io/shareable";
pub const ANN_DISK_SOURCE: &str = "vmigrate.io/disk-source";
pub const ANN_DISK_INDEX: &str = "vmigrate.io/disk-index";
/// CBT change id of the disk at the volume's latest checkpoint
pub const ANN_CHANGE_ID: &str = "vmigrate.io/change-id";

const MACHINE_TYPE: &str = "q35";
const VIRTIO: &str = "virtio";

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Query(#[from] QueryError),

    #[error("VM {0} is a template")]
    Template(String),

    #[error("VM {0} is not connected")]
    NotConnected(String),

    #[error("Changed Block Tracking (CBT) is disabled for VM {0}")]
    ChangeTracking(String),

    #[error("Source VM has a mac address conflict with one or more destination VMs: {}", .0.join(", "))]
    MacConflict(Vec<String>),

    #[error("datastore {datastore} of disk {disk} is not in the storage map")]
    StorageUnmapped { disk: String, datastore: String },

    #[error("network {0} is not in the network map")]
    NetworkUnmapped(String),

    #[error("failed to find a data volume for disk {0}")]
    MissingVolume(String),

    #[error("volume name template: {0}")]
    PvcName(#[from] TemplateError),

    #[error("provider url: {0}")]
    Url(#[from] url::ParseError),

    #[error("host credentials: {0}")]
    Credentials(#[from] CredentialError),
}

impl BuildError {
    /// Condition reason recorded on the VM status
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Query(e) if e.is_not_found() => "NotFound",
            Self::Query(_) => "Inventory",
            Self::Template(_) => "Template",
            Self::NotConnected(_) => "NotConnected",
            Self::ChangeTracking(_) => "ChangeTracking",
            Self::MacConflict(_) => "MACConflict",
            Self::StorageUnmapped { .. } => "StorageNotMapped",
            Self::NetworkUnmapped(_) => "NetworkNotMapped",
            Self::MissingVolume(_) => "MissingVolume",
            Self::PvcName(_) => "PVCNameTemplate",
            Self::Url(_) | Self::Credentials(_) => "Configuration",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Checkpoint {
    pub previous: String,
    pub current: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum VolumeSource {
    /// Pulled from the source over the SDK by the data mover
    #[serde(rename_all = "camelCase")]
    Vddk {
        url: String,
        thumbprint: String,
        uuid: String,
        backing_file: String,
        secret: String,
        #[serde(default)]
        init_image: Option<String>,
    },
    /// Filled in by the guest converter
    Blank,
}

/// Transfer descriptor and destination volume for one source disk
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DataVolume {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    pub source: VolumeSource,
    pub storage_class: String,
    #[serde(default)]
    pub access_mode: Option<String>,
    #[serde(default)]
    pub volume_mode: Option<String>,
    /// Bytes
    pub capacity: i64,
    pub disk_index: usize,
    #[serde(default)]
    pub checkpoints: Vec<Checkpoint>,
    #[serde(default)]
    pub final_checkpoint: bool,
}

impl DataVolume {
    /// The source disk this volume is filled from, without snapshot suffix
    pub fn disk_source(&self) -> Option<String> {
        self.annotations
            .get(ANN_DISK_SOURCE)
            .map(|f| trim_backing_file(f))
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Bootloader {
    Bios,
    #[serde(rename_all = "camelCase")]
    Efi { secure_boot: bool },
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Firmware {
    pub serial: String,
    pub bootloader: Bootloader,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cpu {
    pub sockets: u32,
    pub cores: u32,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Memory {
    /// Bytes
    pub guest: u64,
    pub request: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Input {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub bus: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DiskDevice {
    pub name: String,
    pub bus: String,
    #[serde(default)]
    pub shareable: bool,
    #[serde(default)]
    pub cache: Option<String>,
    #[serde(default)]
    pub boot_order: Option<u32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub name: String,
    pub claim_name: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Binding {
    Masquerade,
    Bridge,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Interface {
    pub name: String,
    pub mac_address: String,
    pub model: String,
    pub binding: Binding,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Attachment {
    Pod,
    #[serde(rename_all = "camelCase")]
    Multus { network_name: String },
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct NetworkAttachment {
    pub name: String,
    #[serde(flatten)]
    pub attachment: Attachment,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VmSpec {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    pub running: bool,
    #[serde(default)]
    pub preference: Option<String>,
    pub machine: String,
    pub firmware: Firmware,
    pub cpu: Cpu,
    pub memory: Memory,
    #[serde(default)]
    pub timezone: Option<String>,
    /// Persistent TPM
    #[serde(default)]
    pub tpm: bool,
    pub inputs: Vec<Input>,
    pub disks: Vec<DiskDevice>,
    pub volumes: Vec<Volume>,
    pub interfaces: Vec<Interface>,
    pub networks: Vec<NetworkAttachment>,
}

impl VmSpec {
    pub fn macs(&self) -> Vec<String> {
        self.interfaces.iter().map(|i| i.mac_address.clone()).collect()
    }
}

/// Whether the guest converter copies the disks itself instead of the mover.
///
/// Only for cold migrations into the local cluster that convert the guest and
/// take every disk along.
pub fn converter_transfers(plan: &Plan, local: bool) -> bool {
    !plan.warm && local && plan.migrate_shared_disks && !plan.skip_guest_conversion
}

pub fn plan_vm<'p>(plan: &'p Plan, vm: &Vm) -> Option<&'p PlanVm> {
    plan.vms.iter().find(|p| match (&p.id, &p.name) {
        (Some(id), _) => *id == vm.id,
        (None, Some(name)) => *name == vm.name,
        (None, None) => false,
    })
}

/// Destination name: the plan's choice, else the source name made DNS safe
pub fn target_name(plan_vm: Option<&PlanVm>, vm: &Vm) -> String {
    if let Some(name) = plan_vm.and_then(|p| p.target_name.clone()) {
        return name;
    }

    let mut out = String::with_capacity(vm.name.len());
    for c in vm.name.to_lowercase().chars() {
        match c {
            'a'..='z' | '0'..='9' => out.push(c),
            _ if !out.ends_with('-') => out.push('-'),
            _ => {}
        }
    }
    let out: String = out.trim_matches('-').chars().take(63).collect();
    let out = out.trim_end_matches('-');

    if out.is_empty() {
        format!("vm-{}", vm.id.to_lowercase())
    } else {
        out.to_owned()
    }
}

pub struct Builder<'a, R: Readable> {
    plan: &'a Plan,
    provider: &'a Provider,
    /// Certificate fingerprint observed when connecting to the provider
    fingerprint: String,
    inventory: Inventory<'a, R>,
    conversion: &'a ConversionConfig,
    local: bool,
}

impl<'a, R: Readable> Builder<'a, R> {
    pub fn new(
        plan: &'a Plan,
        provider: &'a Provider,
        fingerprint: impl Into<String>,
        view: &'a R,
        conversion: &'a ConversionConfig,
        local: bool,
    ) -> Self {
        Self {
            plan,
            provider,
            fingerprint: fingerprint.into(),
            inventory: Inventory::new(view),
            conversion,
            local,
        }
    }

    pub fn plan(&self) -> &Plan {
        self.plan
    }

    pub fn inventory(&self) -> &Inventory<'a, R> {
        &self.inventory
    }

    fn host(&self, vm: &Vm) -> Result<Option<Host>, QueryError> {
        match &vm.host {
            Some(h) => match self.inventory.get_as::<Host>(&h.id) {
                Ok(host) => Ok(Some(host)),
                Err(e) if e.is_not_found() => Ok(None),
                Err(e) => Err(e),
            },
            None => Ok(None),
        }
    }

    fn root_disk(&self, vm: &Vm, disks: usize) -> usize {
        let wanted = plan_vm(self.plan, vm).and_then(|p| p.root_disk).unwrap_or(0);
        if wanted >= disks {
            if wanted > 0 {
                warn!(vm = %vm.id, "Root disk {wanted} is out of range, booting from the first disk");
            }
            0
        } else {
            wanted
        }
    }

    /// Labels put on everything created for `vm`
    pub fn labels(&self, vm: &Vm) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_PLAN.to_owned(), self.plan.id.clone()),
            (LABEL_VM.to_owned(), vm.id.clone()),
        ])
    }

    /// The destination VM spec, bound to the volumes made for it.
    ///
    /// `destination_vms` is the destination's current VM inventory, checked
    /// for MAC address collisions.
    pub fn virtual_machine(
        &self,
        vm: &Vm,
        volumes: &[DataVolume],
        destination_vms: &[TargetVm],
        preference: Option<String>,
        running: bool,
    ) -> Result<VmSpec, BuildError> {
        if vm.is_template {
            return Err(BuildError::Template(vm.id.clone()));
        }
        if !vm.connected() {
            return Err(BuildError::NotConnected(vm.id.clone()));
        }
        if self.plan.warm && !vm.change_tracking_enabled {
            return Err(BuildError::ChangeTracking(vm.id.clone()));
        }

        let name = target_name(plan_vm(self.plan, vm), vm);
        let namespace = self.plan.target_namespace.clone();

        let conflicts = mac_conflicts(vm, destination_vms, &namespace, &name);
        if !conflicts.is_empty() {
            return Err(BuildError::MacConflict(conflicts));
        }

        let (disks, volumes) = self.map_disks(vm, volumes)?;
        let (interfaces, networks) = self.map_networks(vm)?;
        let host = self.host(vm)?;

        let cores = vm.cores_per_socket.max(1) as u32;
        let sockets = (vm.cpu_count.max(1) as u32 / cores).max(1);
        let memory = vm.memory_mb.max(0) as u64 * 1024 * 1024;

        let mut labels = self.labels(vm);
        labels.extend(osmap::template_labels(vm));

        Ok(VmSpec {
            name,
            namespace,
            labels,
            annotations: BTreeMap::from([("vmigrate.io/source-vm".to_owned(), vm.id.clone())]),
            running,
            preference,
            machine: MACHINE_TYPE.to_owned(),
            firmware: Firmware {
                serial: serial::uuid_to_vmware_serial(&vm.uuid),
                bootloader: match vm.firmware {
                    models::inventory::Firmware::Efi => Bootloader::Efi { secure_boot: false },
                    models::inventory::Firmware::Bios => Bootloader::Bios,
                },
            },
            cpu: Cpu { sockets, cores },
            memory: Memory {
                guest: memory,
                request: memory,
            },
            timezone: host.map(|h| h.timezone).filter(|tz| !tz.is_empty()),
            tpm: vm.tpm_present,
            inputs: vec![Input {
                name: "tablet".to_owned(),
                kind: "tablet".to_owned(),
                bus: VIRTIO.to_owned(),
            }],
            disks,
            volumes,
            interfaces,
            networks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::TargetVm;
    use pretty_assertions::assert_eq;
    use testing_utils::{fixtures, Fixture};

    fn s1() -> Fixture {
        let mut f = fixtures::s1();
        f.plan.pvc_name_template = Some("{{.VmName}}-disk-{{.DiskIndex}}".to_owned());
        f
    }

    #[tokio::test]
    async fn cold_efi_vm_spec() {
        let f = s1();
        let store = f.store().await;
        let view = store.snapshot();
        let conversion = ConversionConfig::default();
        let builder = Builder::new(&f.plan, &f.provider, "AA:BB", &view, &conversion, false);

        let volumes = builder.volumes(&f.vm, "vm-16-secret").unwrap();
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].name, "test-vm-disk-0");
        assert_eq!(volumes[0].capacity, 20 * 1024 * 1024 * 1024);

        let spec = builder.virtual_machine(&f.vm, &volumes, &[], None, true).unwrap();
        assert_eq!(spec.firmware.serial, "VMware-42 2c 6a 2a 5e a9 10 83-39 f3 3b 14 0f ff b4 44");
        assert_eq!(spec.firmware.bootloader, Bootloader::Efi { secure_boot: false });
        assert_eq!(spec.machine, "q35");
        assert_eq!(
            spec.inputs,
            vec![Input {
                name: "tablet".into(),
                kind: "tablet".into(),
                bus: "virtio".into()
            }]
        );
        assert_eq!(spec.disks.len(), 1);
        assert_eq!(spec.disks[0].name, "vol-0");
        assert_eq!(spec.disks[0].boot_order, Some(1));
        assert_eq!(
            spec.volumes,
            vec![Volume {
                name: "vol-0".into(),
                claim_name: "test-vm-disk-0".into()
            }]
        );
        assert_eq!(spec.interfaces.len(), 1);
        assert_eq!(spec.interfaces[0].name, "net-0");
        assert_eq!(spec.interfaces[0].mac_address, "00:50:56:83:25:47");
        assert_eq!(spec.interfaces[0].binding, Binding::Masquerade);
        assert_eq!(
            spec.networks,
            vec![NetworkAttachment {
                name: "net-0".into(),
                attachment: Attachment::Pod
            }]
        );
        assert!(!spec.tpm);
        assert_eq!(spec.cpu, Cpu { sockets: 2, cores: 2 });
        assert_eq!(spec.memory.guest, 4096 * 1024 * 1024);
        assert_eq!(spec.timezone.as_deref(), Some("UTC"));
    }

    #[tokio::test]
    async fn mac_conflict_lists_the_destination_vm() {
        let f = s1();
        let store = f.store().await;
        let view = store.snapshot();
        let conversion = ConversionConfig::default();
        let builder = Builder::new(&f.plan, &f.provider, "AA:BB", &view, &conversion, false);
        let volumes = builder.volumes(&f.vm, "s").unwrap();

        let others = vec![
            TargetVm {
                namespace: "prod".into(),
                name: "legacy-web".into(),
                macs: vec!["00:50:56:83:25:47".into()],
            },
            TargetVm {
                namespace: "prod".into(),
                name: "unrelated".into(),
                macs: vec!["00:50:56:83:99:99".into()],
            },
        ];

        let err = builder
            .virtual_machine(&f.vm, &volumes, &others, None, true)
            .unwrap_err();
        assert_eq!(err.reason(), "MACConflict");
        match err {
            BuildError::MacConflict(paths) => assert_eq!(paths, vec!["prod/legacy-web"]),
            other => panic!("unexpected {other}"),
        }

        // the VM this migration already created is not a conflict
        let own = vec![TargetVm {
            namespace: f.plan.target_namespace.clone(),
            name: "test-vm".into(),
            macs: vec!["00:50:56:83:25:47".into()],
        }];
        assert!(builder.virtual_machine(&f.vm, &volumes, &own, None, true).is_ok());
    }

    #[tokio::test]
    async fn guest_ordered_nics_keep_their_order() {
        let mut f = s1();
        f.vm.nics = fixtures::nics(&["66:77", "00:11", "CC:DD"], &f.vm.nics[0].network);
        let store = f.store().await;
        let view = store.snapshot();
        let conversion = ConversionConfig::default();
        let builder = Builder::new(&f.plan, &f.provider, "AA:BB", &view, &conversion, false);
        let volumes = builder.volumes(&f.vm, "s").unwrap();

        let spec = builder.virtual_machine(&f.vm, &volumes, &[], None, true).unwrap();
        let order: Vec<_> = spec
            .interfaces
            .iter()
            .map(|i| (i.name.as_str(), i.mac_address.as_str()))
            .collect();
        assert_eq!(order, vec![("net-0", "66:77"), ("net-1", "00:11"), ("net-2", "CC:DD")]);
    }

    #[tokio::test]
    async fn warm_vm_without_cbt_is_refused() {
        let mut f = s1();
        f.plan.warm = true;
        f.vm.change_tracking_enabled = false;
        let store = f.store().await;
        let view = store.snapshot();
        let conversion = ConversionConfig::default();
        let builder = Builder::new(&f.plan, &f.provider, "AA:BB", &view, &conversion, false);

        let err = builder.virtual_machine(&f.vm, &[], &[], None, true).unwrap_err();
        assert!(matches!(err, BuildError::ChangeTracking(_)));
    }

    #[test]
    fn target_names_are_dns_safe() {
        let vm = |name: &str| Vm {
            id: "vm-7".into(),
            name: name.into(),
            ..Default::default()
        };
        assert_eq!(target_name(None, &vm("Web Server_01")), "web-server-01");
        assert_eq!(target_name(None, &vm("--x--")), "x");
        assert_eq!(target_name(None, &vm("***")), "vm-vm-7");
        assert_eq!(target_name(None, &vm(&"a".repeat(80))).len(), 63);

        let chosen = PlanVm {
            target_name: Some("db".into()),
            ..Default::default()
        };
        assert_eq!(target_name(Some(&chosen), &vm("Web")), "db");
    }

    #[test]
    fn converter_only_copies_cold_local_full_conversions() {
        let plan = Plan {
            migrate_shared_disks: true,
            ..Default::default()
        };
        assert!(converter_transfers(&plan, true));
        assert!(!converter_transfers(&plan, false));
        assert!(!converter_transfers(&Plan { warm: true, ..plan.clone() }, true));
        assert!(!converter_transfers(&Plan { skip_guest_conversion: true, ..plan.clone() }, true));
        assert!(!converter_transfers(&Plan { migrate_shared_disks: false, ..plan }, true));
    }
}
