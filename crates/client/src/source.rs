// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

//! VM operations used while migrating: power, snapshots, CBT and tasks.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use async_trait::async_trait;
use common::prelude::{once_cell::sync::Lazy, regex::Regex};
use models::{
    migration::PowerState,
    plan::HostOverride,
    provider::{Credentials, Provider},
};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::{
    error::SdkError,
    session::{Session, Timeouts},
    soap::{self, Element, MoRef},
};

pub const SNAPSHOT_NAME: &str = "forklift-migration-precopy";
pub const SNAPSHOT_DESCRIPTION: &str = "Forklift Operator warm migration precopy";

static BACKING_FILE_SUFFIX: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"-\d\d\d\d\d\d.vmdk").unwrap()
});

/// Strips the six digit delta suffix snapshots add to disk backing files,
/// `[ds] vm/disk-000015.vmdk` becomes `[ds] vm/disk.vmdk`
pub fn trim_backing_file(file: &str) -> String {
    BACKING_FILE_SUFFIX.replace_all(file, ".vmdk").into_owned()
}

/// The VM an operation applies to
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VmTarget {
    pub id: String,
    /// BIOS uuid, used to look the VM up on whichever session serves it
    pub uuid: String,
    /// Host the VM currently runs on
    pub host: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    /// Carries the task result, a managed object id for snapshot creation
    Success(Option<String>),
    Error(String),
}

/// Inputs to picking the session an operation runs on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionPolicy {
    /// The guest converter moves the disks itself
    pub converter_transfers: bool,
    /// Cold migration into the local destination cluster
    pub cold_local: bool,
    pub esxi: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionChoice {
    Primary,
    Host(String),
}

pub fn select_session(
    policy: &SessionPolicy,
    vm_host: Option<&str>,
    overrides: &[HostOverride],
) -> SessionChoice {
    if policy.converter_transfers || policy.cold_local || policy.esxi {
        return SessionChoice::Primary;
    }

    match vm_host.and_then(|h| overrides.iter().find(|o| o.host == h && o.ready)) {
        Some(o) if o.network.is_some() => SessionChoice::Host(o.host.clone()),
        _ => SessionChoice::Primary,
    }
}

/// The source side of a migration.
#[async_trait]
pub trait Source: Send + Sync {
    async fn power_state(&self, vm: &VmTarget) -> Result<PowerState, SdkError>;

    /// Powers on unless already on
    async fn power_on(&self, vm: &VmTarget) -> Result<(), SdkError>;

    /// Requests a guest shutdown unless already off
    async fn power_off(&self, vm: &VmTarget) -> Result<(), SdkError>;

    async fn powered_off(&self, vm: &VmTarget) -> Result<bool, SdkError>;

    /// Starts a precopy snapshot, returning the task id
    async fn create_snapshot(&self, vm: &VmTarget) -> Result<String, SdkError>;

    /// Starts removing a snapshot, returning the task id
    async fn remove_snapshot(
        &self,
        vm: &VmTarget,
        snapshot: &str,
        children: bool,
    ) -> Result<String, SdkError>;

    async fn check_task(&self, vm: &VmTarget, task: &str) -> Result<TaskState, SdkError>;

    /// Trimmed disk backing file to CBT change id, one entry per disk of the snapshot
    async fn snapshot_deltas(
        &self,
        vm: &VmTarget,
        snapshot: &str,
    ) -> Result<BTreeMap<String, String>, SdkError>;

    async fn close(&self);
}

/// [`Source`] backed by SDK sessions
pub struct VSphereSource {
    provider: Provider,
    timeouts: Timeouts,
    policy: SessionPolicy,
    overrides: Vec<HostOverride>,
    /// Host id to certificate thumbprint, from the inventory
    host_thumbprints: HashMap<String, String>,
    primary: Arc<Session>,
    hosts: RwLock<HashMap<String, Arc<Session>>>,
}

impl VSphereSource {
    pub async fn connect(
        provider: Provider,
        timeouts: Timeouts,
        policy: SessionPolicy,
        overrides: Vec<HostOverride>,
        host_thumbprints: HashMap<String, String>,
    ) -> Result<Self, SdkError> {
        let primary = Arc::new(Session::open(&provider.url, &provider.credentials, timeouts).await?);

        Ok(Self {
            provider,
            timeouts,
            policy,
            overrides,
            host_thumbprints,
            primary,
            hosts: RwLock::new(HashMap::new()),
        })
    }

    /// Fingerprint of the primary endpoint observed while connecting
    pub fn fingerprint(&self) -> Option<&str> {
        self.primary.fingerprint()
    }

    async fn session(&self, vm: &VmTarget) -> Result<Arc<Session>, SdkError> {
        let host = match select_session(&self.policy, vm.host.as_deref(), &self.overrides) {
            SessionChoice::Primary => return Ok(self.primary.clone()),
            SessionChoice::Host(h) => h,
        };

        if let Some(s) = self.hosts.read().get(&host) {
            return Ok(s.clone());
        }

        let session = Arc::new(self.open_host(&host).await?);

        // another operation may have raced us here, keep the first one
        let (kept, extra) = {
            let mut hosts = self.hosts.write();
            match hosts.get(&host) {
                Some(existing) => (existing.clone(), Some(session)),
                None => {
                    hosts.insert(host.clone(), session.clone());
                    (session, None)
                }
            }
        };
        if let Some(extra) = extra {
            extra.close().await;
        }

        Ok(kept)
    }

    async fn open_host(&self, host: &str) -> Result<Session, SdkError> {
        let o = self
            .overrides
            .iter()
            .find(|o| o.host == host)
            .ok_or_else(|| SdkError::Configuration(format!("no override for host {host}")))?;

        let mut credentials = Credentials::from_secret(&o.credentials)
            .map_err(|e| SdkError::Configuration(format!("host {host}: {e}")))?;
        if let Some(t) = self.host_thumbprints.get(host) {
            credentials.thumbprint = Some(t.clone());
        }
        credentials.insecure_skip_verify |= self.provider.credentials.insecure_skip_verify;

        info!("Opening host session to {host} at {}", o.ip_address);
        Session::open(&format!("https://{}/sdk", o.ip_address), &credentials, self.timeouts).await
    }

    async fn find_vm(&self, session: &Session, vm: &VmTarget) -> Result<MoRef, SdkError> {
        let args = format!(
            "{}<vmSearch>true</vmSearch><instanceUuid>false</instanceUuid>",
            soap::text("uuid", &vm.uuid)
        );

        session
            .call_returnval("FindByUuid", &session.content().search_index, &args)
            .await?
            .and_then(|r| r.moref())
            .ok_or_else(|| SdkError::not_found("VirtualMachine", &vm.id))
    }

    async fn vm_power(&self, session: &Session, vm_ref: &MoRef) -> Result<PowerState, SdkError> {
        let state = retrieve_property(session, vm_ref, "runtime.powerState").await?;

        Ok(state
            .map(|s| PowerState::from_sdk(&s.text))
            .unwrap_or(PowerState::Unknown))
    }
}

/// Reads a single property of one object
pub async fn retrieve_property(
    session: &Session,
    obj: &MoRef,
    path: &str,
) -> Result<Option<Element>, SdkError> {
    let args = format!(
        "<specSet><propSet>{}<all>false</all>{}</propSet><objectSet>{}<skip>false</skip></objectSet></specSet><options></options>",
        soap::text("type", &obj.kind),
        soap::text("pathSet", path),
        obj.to_xml("obj"),
    );

    let Some(ret) = session
        .call_returnval("RetrievePropertiesEx", &session.content().property_collector, &args)
        .await?
    else {
        return Ok(None);
    };

    let val = ret
        .children_named("objects")
        .flat_map(|o| o.children_named("propSet"))
        .find(|p| p.text_of("name") == Some(path))
        .and_then(|p| p.child("val").cloned());
    Ok(val)
}

/// Reads a `TaskInfo` element
pub fn task_state(info: &Element) -> TaskState {
    match info.text_of("state") {
        Some("success") => TaskState::Success(info.child("result").map(|r| r.text.clone())),
        Some("error") => TaskState::Error(
            info.path(&["error", "localizedMessage"])
                .map(|e| e.text.clone())
                .unwrap_or_else(|| "task failed without a message".to_owned()),
        ),
        _ => TaskState::Pending,
    }
}

/// Trimmed backing file to change id for every disk of a device list
pub fn disk_change_ids(devices: &Element) -> Result<BTreeMap<String, String>, SdkError> {
    let mut out = BTreeMap::new();

    for disk in devices.children.iter().filter(|d| d.is_type("VirtualDisk")) {
        let Some(backing) = disk.child("backing") else {
            continue;
        };
        let file = backing.text_of("fileName").unwrap_or_default();
        let change_id = backing
            .text_of("changeId")
            .filter(|c| !c.is_empty())
            .ok_or_else(|| {
                SdkError::Precondition(format!(
                    "Disk backing info of {file} doesn't include changeId."
                ))
            })?;

        out.insert(trim_backing_file(file), change_id.to_owned());
    }

    Ok(out)
}

#[async_trait]
impl Source for VSphereSource {
    async fn power_state(&self, vm: &VmTarget) -> Result<PowerState, SdkError> {
        let session = self.session(vm).await?;
        let vm_ref = self.find_vm(&session, vm).await?;

        self.vm_power(&session, &vm_ref).await
    }

    async fn power_on(&self, vm: &VmTarget) -> Result<(), SdkError> {
        let session = self.session(vm).await?;
        let vm_ref = self.find_vm(&session, vm).await?;

        if self.vm_power(&session, &vm_ref).await? != PowerState::On {
            info!("Powering on {}", vm.id);
            session.call("PowerOnVM_Task", &vm_ref, "").await?;
        }

        Ok(())
    }

    async fn power_off(&self, vm: &VmTarget) -> Result<(), SdkError> {
        let session = self.session(vm).await?;
        let vm_ref = self.find_vm(&session, vm).await?;

        if self.vm_power(&session, &vm_ref).await? == PowerState::Off {
            return Ok(());
        }

        info!("Requesting guest shutdown of {}", vm.id);
        session.call("ShutdownGuest", &vm_ref, "").await?;

        Ok(())
    }

    async fn powered_off(&self, vm: &VmTarget) -> Result<bool, SdkError> {
        Ok(self.power_state(vm).await? == PowerState::Off)
    }

    async fn create_snapshot(&self, vm: &VmTarget) -> Result<String, SdkError> {
        let session = self.session(vm).await?;
        let vm_ref = self.find_vm(&session, vm).await?;

        let args = format!(
            "{}{}<memory>false</memory><quiesce>true</quiesce>",
            soap::text("name", SNAPSHOT_NAME),
            soap::text("description", SNAPSHOT_DESCRIPTION),
        );

        let task = session
            .call_returnval("CreateSnapshot_Task", &vm_ref, &args)
            .await?
            .and_then(|r| r.moref())
            .ok_or_else(|| SdkError::Xml("CreateSnapshot_Task returned no task".into()))?;

        debug!("Snapshot of {} started as {task}", vm.id);
        Ok(task.value)
    }

    async fn remove_snapshot(
        &self,
        vm: &VmTarget,
        snapshot: &str,
        children: bool,
    ) -> Result<String, SdkError> {
        let session = self.session(vm).await?;

        let args = format!("<removeChildren>{children}</removeChildren><consolidate>true</consolidate>");
        let task = session
            .call_returnval(
                "RemoveSnapshot_Task",
                &MoRef::new("VirtualMachineSnapshot", snapshot),
                &args,
            )
            .await?
            .and_then(|r| r.moref())
            .ok_or_else(|| SdkError::Xml("RemoveSnapshot_Task returned no task".into()))?;

        debug!("Removal of snapshot {snapshot} of {} started as {task}", vm.id);
        Ok(task.value)
    }

    async fn check_task(&self, vm: &VmTarget, task: &str) -> Result<TaskState, SdkError> {
        let session = self.session(vm).await?;

        let info = retrieve_property(&session, &MoRef::new("Task", task), "info")
            .await?
            .ok_or_else(|| SdkError::not_found("Task", task))?;

        Ok(task_state(&info))
    }

    async fn snapshot_deltas(
        &self,
        vm: &VmTarget,
        snapshot: &str,
    ) -> Result<BTreeMap<String, String>, SdkError> {
        let session = self.session(vm).await?;

        let devices = retrieve_property(
            &session,
            &MoRef::new("VirtualMachineSnapshot", snapshot),
            "config.hardware.device",
        )
        .await?
        .ok_or_else(|| SdkError::not_found("VirtualMachineSnapshot", snapshot))?;

        disk_change_ids(&devices)
    }

    async fn close(&self) {
        let hosts: Vec<(String, Arc<Session>)> = self.hosts.write().drain().collect();
        for (host, session) in hosts {
            debug!("Closing host session to {host}");
            session.close().await;
        }

        self.primary.close().await;
        if self.primary.fingerprint().is_none() && !self.provider.credentials.insecure_skip_verify {
            warn!("Source {} was used without a recorded fingerprint", self.provider.name);
        }
    }
}
