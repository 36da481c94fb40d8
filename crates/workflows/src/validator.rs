// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

//! Pre-flight plan checks.
//!
//! Every check yields a [`Check`]; a plan may start when none of the failed
//! checks is blocking. The orchestrator repeats the per-VM checks right
//! before it touches a VM.

use std::collections::{HashMap, HashSet};

use client::{session::test_connect, Timeouts};
use dal::Readable;
use models::{
    inventory::{Datastore, Host, Inventory, QueryError, Vm},
    plan::{Plan, PlanVm},
    provider::Provider,
};
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    builder::{
        mac_conflicts, network_by_id, ordered_disks, plan_vm, pod_nics, pvc_data, target_name,
        template::pvc_name,
    },
    destination::{Destination, DestinationError, TargetVm},
};

#[derive(Debug, Error)]
pub enum PlanCheckError {
    #[error("inventory: {0}")]
    Query(#[from] QueryError),

    #[error("listing destination VMs: {0}")]
    Destination(#[from] DestinationError),
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Reason {
    WarmSupported,
    NetworksMapped,
    PodNetwork,
    StorageMapped,
    HostMaintenance,
    StaticIps,
    PvcNameTemplate,
    ChangeTracking,
    MacConflict,
    VmExists,
    Template,
    Connection,
    SharedDisksWarm,
    ProviderConnection,
}

impl Reason {
    /// Whether a failure of this check stops the VM from migrating
    pub fn is_blocking(self) -> bool {
        !matches!(self, Reason::HostMaintenance)
    }

    /// Condition reason recorded on a VM that failed this check
    pub fn condition(self) -> &'static str {
        match self {
            Reason::WarmSupported => "WarmMigrationNotSupported",
            Reason::NetworksMapped => "NetworkNotMapped",
            Reason::PodNetwork => "MultiplePodNetworks",
            Reason::StorageMapped => "StorageNotMapped",
            Reason::HostMaintenance => "HostMaintenance",
            Reason::StaticIps => "StaticIPsNotAvailable",
            Reason::PvcNameTemplate => "PVCNameTemplate",
            Reason::ChangeTracking => "ChangeTracking",
            Reason::MacConflict => "MACConflict",
            Reason::VmExists => "VMNotFound",
            Reason::Template => "Template",
            Reason::Connection => "NotConnected",
            Reason::SharedDisksWarm => "SharedDisksWarm",
            Reason::ProviderConnection => "ConnectionTestFailed",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Check {
    /// Source VM id, unset for plan wide checks
    pub vm: Option<String>,
    pub reason: Reason,
    pub ok: bool,
    pub message: String,
}

impl Check {
    fn pass(vm: Option<&str>, reason: Reason) -> Self {
        Self {
            vm: vm.map(str::to_owned),
            reason,
            ok: true,
            message: String::new(),
        }
    }

    fn fail(vm: Option<&str>, reason: Reason, message: impl Into<String>) -> Self {
        Self {
            vm: vm.map(str::to_owned),
            reason,
            ok: false,
            message: message.into(),
        }
    }

    fn expect(vm: &str, reason: Reason, ok: bool, message: impl FnOnce() -> String) -> Self {
        if ok {
            Self::pass(Some(vm), reason)
        } else {
            Self::fail(Some(vm), reason, message())
        }
    }

    pub fn is_blocking_failure(&self) -> bool {
        !self.ok && self.reason.is_blocking()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Report {
    pub checks: Vec<Check>,
}

impl Report {
    pub fn failures(&self) -> impl Iterator<Item = &Check> {
        self.checks.iter().filter(|c| !c.ok)
    }

    pub fn blocking(&self) -> impl Iterator<Item = &Check> {
        self.checks.iter().filter(|c| c.is_blocking_failure())
    }

    pub fn is_ok(&self) -> bool {
        self.blocking().next().is_none()
    }

    /// One line per blocking failure, `reason: message`
    pub fn summary(&self) -> Vec<String> {
        self.blocking()
            .map(|c| format!("{}: {}", c.reason, c.message))
            .collect()
    }
}

pub struct Validator<'a, R: Readable> {
    plan: &'a Plan,
    inventory: Inventory<'a, R>,
    destination_vms: &'a [TargetVm],
}

impl<'a, R: Readable> Validator<'a, R> {
    pub fn new(plan: &'a Plan, view: &'a R, destination_vms: &'a [TargetVm]) -> Self {
        Self {
            plan,
            inventory: Inventory::new(view),
            destination_vms,
        }
    }

    /// Checks every VM of the plan
    pub fn validate(&self) -> Result<Report, QueryError> {
        let mut report = Report::default();
        for pvm in &self.plan.vms {
            report.checks.extend(self.validate_vm(pvm)?);
        }
        Ok(report)
    }

    /// Looks a plan entry up, by id when it has one, by name otherwise
    pub fn resolve(&self, pvm: &PlanVm) -> Result<Option<Vm>, QueryError> {
        let found = match (&pvm.id, &pvm.name) {
            (Some(id), _) => self.inventory.get_as::<Vm>(id),
            (None, Some(name)) => self.inventory.find::<Vm>(name),
            (None, None) => return Ok(None),
        };

        match found {
            Ok(vm) => Ok(Some(vm)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn validate_vm(&self, pvm: &PlanVm) -> Result<Vec<Check>, QueryError> {
        let Some(vm) = self.resolve(pvm)? else {
            let who = pvm.id.clone().or_else(|| pvm.name.clone()).unwrap_or_default();
            return Ok(vec![Check::fail(
                Some(&who),
                Reason::VmExists,
                format!("VM {who} was not found in the inventory"),
            )]);
        };
        let id = vm.id.as_str();
        debug!(vm = %id, "Validating");

        let mut checks = vec![
            Check::pass(Some(id), Reason::VmExists),
            // vSphere sources always support warm migration
            Check::pass(Some(id), Reason::WarmSupported),
            Check::expect(id, Reason::Template, !vm.is_template, || {
                "templates cannot be migrated".to_owned()
            }),
            Check::expect(id, Reason::Connection, vm.connected(), || {
                format!("VM connection state is {}", vm.connection_state)
            }),
        ];

        checks.push(self.networks_mapped(&vm)?);
        checks.push(self.pod_network(&vm)?);
        checks.push(self.storage_mapped(&vm)?);
        checks.push(self.host_maintenance(&vm)?);
        checks.push(self.static_ips(&vm));
        checks.push(self.pvc_names(&vm));

        checks.push(Check::expect(
            id,
            Reason::ChangeTracking,
            !self.plan.warm || vm.change_tracking_enabled,
            || "warm migration needs Changed Block Tracking (CBT) enabled".to_owned(),
        ));
        checks.push(Check::expect(
            id,
            Reason::SharedDisksWarm,
            !(self.plan.warm && self.plan.migrate_shared_disks && vm.has_shared_disks()),
            || "warm migration of a VM with shared disks must skip shared disks".to_owned(),
        ));

        let conflicts = mac_conflicts(
            &vm,
            self.destination_vms,
            &self.plan.target_namespace,
            &target_name(plan_vm(self.plan, &vm), &vm),
        );
        checks.push(Check::expect(id, Reason::MacConflict, conflicts.is_empty(), || {
            format!("MAC addresses already used by {}", conflicts.join(", "))
        }));

        for c in checks.iter().filter(|c| !c.ok) {
            warn!(vm = %id, "Validation {} failed: {}", c.reason, c.message);
        }

        Ok(checks)
    }

    fn networks_mapped(&self, vm: &Vm) -> Result<Check, QueryError> {
        let mut unmapped = Vec::new();

        for r in &vm.networks {
            match network_by_id(&self.inventory, &r.id) {
                Ok(net) if self.plan.network_pair(&net).is_some() => {}
                Ok(net) => unmapped.push(net.name),
                Err(e) if e.is_not_found() => unmapped.push(r.id.clone()),
                Err(e) => return Err(e),
            }
        }

        Ok(Check::expect(&vm.id, Reason::NetworksMapped, unmapped.is_empty(), || {
            format!("networks not in the network map: {}", unmapped.join(", "))
        }))
    }

    fn pod_network(&self, vm: &Vm) -> Result<Check, QueryError> {
        let pod = match pod_nics(self.plan, &self.inventory, vm) {
            Ok(n) => n.len(),
            // an unknown network is reported by networks-mapped
            Err(e) if e.is_not_found() => 0,
            Err(e) => return Err(e),
        };

        Ok(Check::expect(&vm.id, Reason::PodNetwork, pod <= 1, || {
            format!("{pod} NICs are mapped to the pod network, at most one may be")
        }))
    }

    fn storage_mapped(&self, vm: &Vm) -> Result<Check, QueryError> {
        let mut unmapped = Vec::new();

        for disk in ordered_disks(vm, self.plan.migrate_shared_disks) {
            match self.inventory.get_as::<Datastore>(&disk.datastore.id) {
                Ok(ds) if self.plan.storage_pair(&ds).is_some() => {}
                Ok(ds) => unmapped.push(ds.name),
                Err(e) if e.is_not_found() => unmapped.push(disk.datastore.id.clone()),
                Err(e) => return Err(e),
            }
        }
        unmapped.dedup();

        Ok(Check::expect(&vm.id, Reason::StorageMapped, unmapped.is_empty(), || {
            format!("datastores not in the storage map: {}", unmapped.join(", "))
        }))
    }

    fn host_maintenance(&self, vm: &Vm) -> Result<Check, QueryError> {
        let host = match &vm.host {
            Some(h) => match self.inventory.get_as::<Host>(&h.id) {
                Ok(host) => Some(host),
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e),
            },
            None => None,
        };

        Ok(match host {
            Some(h) if h.in_maintenance => Check::fail(
                Some(&vm.id),
                Reason::HostMaintenance,
                format!("host {} is in maintenance mode", h.name),
            ),
            _ => Check::pass(Some(&vm.id), Reason::HostMaintenance),
        })
    }

    fn static_ips(&self, vm: &Vm) -> Check {
        if !self.plan.preserve_static_ips || !vm.is_windows() {
            return Check::pass(Some(&vm.id), Reason::StaticIps);
        }

        let manual: HashSet<String> = vm
            .guest_networks
            .iter()
            .filter(|n| n.origin == "manual")
            .map(|n| n.mac.to_lowercase())
            .collect();
        let missing: Vec<&str> = vm
            .nics
            .iter()
            .filter(|n| !manual.contains(&n.mac.to_lowercase()))
            .map(|n| n.mac.as_str())
            .collect();

        Check::expect(&vm.id, Reason::StaticIps, missing.is_empty(), || {
            format!("NICs without a static address: {}", missing.join(", "))
        })
    }

    fn pvc_names(&self, vm: &Vm) -> Check {
        let Some(template) = self.plan.pvc_name_template.as_deref().filter(|t| !t.is_empty()) else {
            return Check::pass(Some(&vm.id), Reason::PvcNameTemplate);
        };

        let disks = ordered_disks(vm, self.plan.migrate_shared_disks);
        let target = target_name(plan_vm(self.plan, vm), vm);
        let root = plan_vm(self.plan, vm)
            .and_then(|p| p.root_disk)
            .filter(|r| *r < disks.len())
            .unwrap_or(0);

        let mut seen: HashMap<String, usize> = HashMap::new();
        for (index, disk) in disks.iter().enumerate() {
            let name = match pvc_name(template, &pvc_data(self.plan, vm, &target, disk, index, root)) {
                Ok(n) => n,
                Err(e) => {
                    return Check::fail(Some(&vm.id), Reason::PvcNameTemplate, format!("disk {index}: {e}"))
                }
            };
            if let Some(other) = seen.insert(name.clone(), index) {
                return Check::fail(
                    Some(&vm.id),
                    Reason::PvcNameTemplate,
                    format!("disks {other} and {index} both render to {name}"),
                );
            }
        }

        Check::pass(Some(&vm.id), Reason::PvcNameTemplate)
    }
}

/// Checks every VM of the plan against the inventory and the VMs already
/// running on the destination
pub async fn validate_plan<R: Readable>(
    plan: &Plan,
    view: &R,
    destination: &dyn Destination,
) -> Result<Report, PlanCheckError> {
    let destination_vms = destination.target_vms().await?;
    Ok(Validator::new(plan, view, &destination_vms).validate()?)
}

/// Opens and closes a session against the source provider
pub async fn provider_connection(provider: &Provider, timeouts: Timeouts) -> Check {
    match test_connect(&provider.url, &provider.credentials, timeouts).await {
        Ok(()) => Check::pass(None, Reason::ProviderConnection),
        Err(e) => Check::fail(None, Reason::ProviderConnection, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{builder::VmSpec, destination::LocalDestination};
    use models::{
        inventory::{Disk, GuestNetwork, Kind, Ref},
        plan::{DestinationNetwork, NetworkPair, SourceRef},
    };
    use pretty_assertions::assert_eq;
    use testing_utils::fixtures;

    fn failed(checks: &[Check]) -> Vec<Reason> {
        checks.iter().filter(|c| !c.ok).map(|c| c.reason).collect()
    }

    #[tokio::test]
    async fn clean_vm_passes_everything() {
        let f = fixtures::s1();
        let store = f.store().await;
        let view = store.snapshot();
        let v = Validator::new(&f.plan, &view, &[]);

        let report = v.validate().unwrap();
        assert!(report.is_ok(), "{:?}", report.summary());
        assert_eq!(report.failures().count(), 0);
        assert_eq!(report.checks.len(), 13);
    }

    #[tokio::test]
    async fn missing_vm_is_reported_alone() {
        let mut f = fixtures::s1();
        f.plan.vms = vec![PlanVm {
            name: Some("ghost".into()),
            ..Default::default()
        }];
        let store = f.store().await;
        let view = store.snapshot();

        let checks = Validator::new(&f.plan, &view, &[]).validate_vm(&f.plan.vms[0]).unwrap();
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0].reason, Reason::VmExists);
        assert_eq!(checks[0].vm.as_deref(), Some("ghost"));
        assert!(!checks[0].ok);
    }

    #[tokio::test]
    async fn two_pod_nics_are_rejected_but_pod_plus_multus_is_fine() {
        let mut f = fixtures::s1();
        let pod = f.vm.nics[0].network.clone();
        f.vm.nics = fixtures::nics(&["00:00:00:00:00:01", "00:00:00:00:00:02"], &pod);
        let store = f.store().await;
        let view = store.snapshot();
        let checks = Validator::new(&f.plan, &view, &[]).validate_vm(&f.plan.vms[0]).unwrap();
        assert_eq!(failed(&checks), vec![Reason::PodNetwork]);

        let mut f = fixtures::s1();
        f.extra_networks.push(fixtures::network("network-9", "backend"));
        f.vm.nics.push(models::inventory::Nic {
            mac: "00:00:00:00:00:02".into(),
            network: Ref::new(Kind::Network, "network-9"),
            index: 1,
        });
        f.vm.networks.push(Ref::new(Kind::Network, "network-9"));
        f.plan.network_map.push(NetworkPair {
            source: SourceRef { id: Some("network-9".into()), name: None },
            destination: DestinationNetwork::Multus { namespace: "net".into(), name: "backend".into() },
        });
        let store = f.store().await;
        let view = store.snapshot();
        let checks = Validator::new(&f.plan, &view, &[]).validate_vm(&f.plan.vms[0]).unwrap();
        assert_eq!(failed(&checks), vec![]);
    }

    #[tokio::test]
    async fn unmapped_network_and_storage() {
        let mut f = fixtures::s1();
        f.plan.network_map.clear();
        f.plan.storage_map.clear();
        let store = f.store().await;
        let view = store.snapshot();

        let checks = Validator::new(&f.plan, &view, &[]).validate_vm(&f.plan.vms[0]).unwrap();
        assert_eq!(failed(&checks), vec![Reason::NetworksMapped, Reason::StorageMapped]);
    }

    #[tokio::test]
    async fn warm_plans_need_cbt_and_no_shared_disks() {
        let mut f = fixtures::s1();
        f.plan.warm = true;
        f.vm.change_tracking_enabled = false;
        let mut shared = f.vm.disks[0].clone();
        shared.file = "[ds1] quorum/quorum.vmdk".into();
        shared.shared = true;
        shared.unit_number = 1;
        f.vm.disks.push(shared);
        let store = f.store().await;
        let view = store.snapshot();

        let checks = Validator::new(&f.plan, &view, &[]).validate_vm(&f.plan.vms[0]).unwrap();
        assert_eq!(failed(&checks), vec![Reason::ChangeTracking, Reason::SharedDisksWarm]);
    }

    #[tokio::test]
    async fn windows_static_ips_need_manual_addresses() {
        let mut f = fixtures::s1();
        f.plan.preserve_static_ips = true;
        f.vm.guest_id = "windows2019srv_64Guest".into();
        f.vm.guest_networks = vec![GuestNetwork {
            mac: f.vm.nics[0].mac.to_uppercase(),
            ip: "10.0.0.5".into(),
            prefix: 24,
            origin: "dhcp".into(),
            ..Default::default()
        }];
        let store = f.store().await;
        let view = store.snapshot();
        let checks = Validator::new(&f.plan, &view, &[]).validate_vm(&f.plan.vms[0]).unwrap();
        assert_eq!(failed(&checks), vec![Reason::StaticIps]);

        f.vm.guest_networks[0].origin = "manual".into();
        let store = f.store().await;
        let view = store.snapshot();
        let checks = Validator::new(&f.plan, &view, &[]).validate_vm(&f.plan.vms[0]).unwrap();
        assert_eq!(failed(&checks), vec![]);
    }

    #[tokio::test]
    async fn pvc_templates_must_render_unique_labels() {
        let mut f = fixtures::s1();
        f.vm.disks.push(Disk {
            file: "[ds1] test-vm/test-vm_1.vmdk".into(),
            unit_number: 1,
            ..f.vm.disks[0].clone()
        });

        f.plan.pvc_name_template = Some("{{.VmName}}-disk".into());
        let store = f.store().await;
        let view = store.snapshot();
        let checks = Validator::new(&f.plan, &view, &[]).validate_vm(&f.plan.vms[0]).unwrap();
        let c = checks.iter().find(|c| c.reason == Reason::PvcNameTemplate).unwrap();
        assert!(!c.ok);
        assert!(c.message.contains("both render to test-vm-disk"));

        f.plan.pvc_name_template = Some("{{.VmName}}-{{.FileName}}".into());
        let checks = Validator::new(&f.plan, &view, &[]).validate_vm(&f.plan.vms[0]).unwrap();
        let c = checks.iter().find(|c| c.reason == Reason::PvcNameTemplate).unwrap();
        assert!(!c.ok, "underscores are not DNS-1123");

        f.plan.pvc_name_template = Some("{{.VmName}}-{{.DiskIndex}}".into());
        let checks = Validator::new(&f.plan, &view, &[]).validate_vm(&f.plan.vms[0]).unwrap();
        assert_eq!(failed(&checks), vec![]);
    }

    #[tokio::test]
    async fn maintenance_is_not_blocking_but_mac_conflicts_are() {
        let mut f = fixtures::s1();
        f.host.in_maintenance = true;
        let store = f.store().await;
        let view = store.snapshot();
        let others = vec![TargetVm {
            namespace: "prod".into(),
            name: "legacy".into(),
            macs: vec![f.vm.nics[0].mac.clone()],
        }];

        let report = Validator::new(&f.plan, &view, &others).validate().unwrap();
        let failures: Vec<_> = report.failures().map(|c| c.reason).collect();
        assert_eq!(failures, vec![Reason::HostMaintenance, Reason::MacConflict]);
        assert_eq!(report.summary(), vec!["mac-conflict: MAC addresses already used by prod/legacy"]);
        assert!(!report.is_ok());
    }

    #[tokio::test]
    async fn plan_checks_see_destination_vms() {
        let f = fixtures::s1();
        let store = f.store().await;
        let view = store.snapshot();
        let destination = LocalDestination::in_memory();

        let report = validate_plan(&f.plan, &view, &destination).await.unwrap();
        assert!(report.is_ok(), "{:?}", report.summary());

        let legacy: VmSpec = serde_json::from_value(serde_json::json!({
            "name": "legacy",
            "namespace": "prod",
            "running": true,
            "machine": "q35",
            "firmware": { "serial": "VMware-00", "bootloader": { "type": "bios" } },
            "cpu": { "sockets": 1, "cores": 1 },
            "memory": { "guest": 1073741824u64, "request": 1073741824u64 },
            "inputs": [],
            "disks": [],
            "volumes": [],
            "interfaces": [{
                "name": "net-0",
                "macAddress": f.vm.nics[0].mac.to_uppercase(),
                "model": "virtio",
                "binding": "bridge"
            }],
            "networks": []
        }))
        .unwrap();
        destination.ensure_namespace("prod").await.unwrap();
        destination.apply_vm(&legacy).await.unwrap();

        let report = validate_plan(&f.plan, &view, &destination).await.unwrap();
        assert_eq!(report.summary(), vec!["mac-conflict: MAC addresses already used by prod/legacy"]);
    }

    #[test]
    fn reasons_read_as_kebab_case() {
        assert_eq!(Reason::PvcNameTemplate.to_string(), "pvc-name-template");
        assert_eq!(serde_json::to_string(&Reason::SharedDisksWarm).unwrap(), "\"shared-disks-warm\"");
        assert_eq!(Reason::MacConflict.condition(), "MACConflict");
    }
}
