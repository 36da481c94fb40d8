// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

//! Property collector subscription.
//!
//! The inventory collector consumes [`UpdateSet`]s through the
//! [`PropertyFeed`] trait; [`VSphereFeed`] is the SDK backed feed.

use std::sync::Arc;

use async_trait::async_trait;
use models::provider::Provider;
use tracing::{debug, info, warn};

use crate::{
    error::SdkError,
    session::{Session, Timeouts},
    soap::{self, Element, MoRef},
};

/// Seconds a single WaitForUpdatesEx may block before returning empty
const MAX_WAIT_SECONDS: u32 = 60;

const TRAVERSE_FOLDERS: &str = "traverseFolders";
const TRAVERSE_VAPPS: &str = "traverseVApps";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    Add,
    Remove,
    Assign,
    IndirectRemove,
}

impl ChangeOp {
    fn parse(s: &str) -> Self {
        match s {
            "add" => Self::Add,
            "remove" => Self::Remove,
            "indirectRemove" => Self::IndirectRemove,
            _ => Self::Assign,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyChange {
    /// Property path, e.g. `summary.runtime.inMaintenanceMode`
    pub name: String,
    pub op: ChangeOp,
    pub val: Option<Element>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Enter,
    Modify,
    Leave,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectUpdate {
    pub kind: UpdateKind,
    pub obj: MoRef,
    pub changes: Vec<PropertyChange>,
}

/// One batch of object updates and the version to resume from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateSet {
    pub version: String,
    pub truncated: bool,
    pub objects: Vec<ObjectUpdate>,
}

impl UpdateSet {
    /// Reads the `returnval` of a WaitForUpdatesEx response
    pub fn from_element(returnval: &Element) -> Result<Self, SdkError> {
        let version = returnval
            .text_of("version")
            .ok_or_else(|| SdkError::Xml("update set has no version".into()))?
            .to_owned();
        let truncated = returnval.child("truncated").is_some_and(Element::as_bool);

        let mut objects = Vec::new();
        for filter in returnval.children_named("filterSet") {
            for os in filter.children_named("objectSet") {
                objects.push(object_update(os)?);
            }
        }

        Ok(Self {
            version,
            truncated,
            objects,
        })
    }
}

fn object_update(os: &Element) -> Result<ObjectUpdate, SdkError> {
    let kind = match os.text_of("kind") {
        Some("enter") => UpdateKind::Enter,
        Some("modify") => UpdateKind::Modify,
        Some("leave") => UpdateKind::Leave,
        other => {
            return Err(SdkError::Xml(format!(
                "unknown object update kind {other:?}"
            )))
        }
    };
    let obj = os
        .child("obj")
        .and_then(Element::moref)
        .ok_or_else(|| SdkError::Xml("object update without obj".into()))?;

    let changes = os
        .children_named("changeSet")
        .map(|cs| PropertyChange {
            name: cs.text_of("name").unwrap_or_default().to_owned(),
            op: ChangeOp::parse(cs.text_of("op").unwrap_or("assign")),
            val: cs.child("val").cloned(),
        })
        .collect();

    Ok(ObjectUpdate { kind, obj, changes })
}

/// SDK type names and the properties collected for each
pub fn property_sets(with_tpm: bool) -> Vec<(&'static str, Vec<&'static str>)> {
    let mut vm = vec![
        "name",
        "parent",
        "config.uuid",
        "config.firmware",
        "config.ftInfo",
        "config.cpuAffinity",
        "config.bootOptions",
        "config.cpuHotAddEnabled",
        "config.cpuHotRemoveEnabled",
        "config.memoryHotAddEnabled",
        "config.hardware.numCPU",
        "config.hardware.numCoresPerSocket",
        "config.hardware.memoryMB",
        "config.hardware.device",
        "config.extraConfig",
        "config.nestedHVEnabled",
        "config.changeTrackingEnabled",
        "config.template",
        "summary.config.guestFullName",
        "guest.guestFullName",
        "summary.guest.guestId",
        "summary.quickStats.balloonedMemory",
        "summary.guest.ipAddress",
        "summary.storage.committed",
        "datastore",
        "network",
        "runtime.host",
        "runtime.powerState",
        "runtime.connectionState",
        "snapshot",
        "guest.net",
        "guest.disk",
        "guest.ipStack",
        "guest.hostName",
    ];
    if with_tpm {
        vm.push("summary.config.tpmPresent");
    }

    vec![
        ("Folder", vec!["name", "parent", "childEntity"]),
        (
            "Datacenter",
            vec![
                "name",
                "parent",
                "vmFolder",
                "hostFolder",
                "networkFolder",
                "datastoreFolder",
            ],
        ),
        ("ComputeResource", vec!["name", "parent", "host", "network", "datastore"]),
        (
            "ClusterComputeResource",
            vec![
                "name",
                "parent",
                "configuration.dasConfig.enabled",
                "configuration.dasVmConfig",
                "configuration.drsConfig.enabled",
                "configuration.drsConfig.defaultVmBehavior",
                "configuration.drsVmConfig",
                "host",
                "network",
                "datastore",
            ],
        ),
        (
            "HostSystem",
            vec![
                "name",
                "parent",
                "overallStatus",
                "config.product.name",
                "config.product.version",
                "summary.config.sslThumbprint",
                "config.dateTimeInfo.timeZone.name",
                "summary.managementServerIp",
                "summary.runtime.inMaintenanceMode",
                "summary.hardware.numCpuPkgs",
                "summary.hardware.numCpuCores",
                "datastore",
                "network",
                "vm",
                "config.network.vswitch",
                "config.network.portgroup",
                "config.network.pnic",
                "config.network.vnic",
                "hardware.systemInfo.model",
                "hardware.systemInfo.vendor",
            ],
        ),
        ("Network", vec!["name", "parent", "tag"]),
        ("OpaqueNetwork", vec!["name", "parent", "tag", "summary"]),
        (
            "DistributedVirtualPortgroup",
            vec![
                "name",
                "parent",
                "config.distributedVirtualSwitch",
                "config.defaultPortConfig",
                "tag",
                "key",
            ],
        ),
        (
            "VmwareDistributedVirtualSwitch",
            vec!["name", "parent", "config.host"],
        ),
        (
            "Datastore",
            vec![
                "name",
                "parent",
                "summary.type",
                "summary.capacity",
                "summary.freeSpace",
                "summary.maintenanceMode",
                "host",
            ],
        ),
        ("VirtualMachine", vm),
    ]
}

fn traversal(name: Option<&str>, ty: &str, path: &str, select: &[&str], nested: &str) -> String {
    let name = name.map(|n| soap::text("name", n)).unwrap_or_default();
    let selects: String = select
        .iter()
        .map(|s| {
            format!(
                r#"<selectSet xsi:type="SelectionSpec">{}</selectSet>"#,
                soap::text("name", s)
            )
        })
        .collect();

    format!(
        r#"<selectSet xsi:type="TraversalSpec">{name}{}{}<skip>false</skip>{selects}{nested}</selectSet>"#,
        soap::text("type", ty),
        soap::text("path", path),
    )
}

/// The CreateFilter spec: everything reachable from `root` with the collected properties
pub fn filter_spec(root: &MoRef, with_tpm: bool) -> String {
    let to_folders = [TRAVERSE_FOLDERS];

    let vapp_vms = traversal(None, "ResourcePool", "vm", &to_folders, "");
    let nested_vapps = traversal(
        Some(TRAVERSE_VAPPS),
        "ResourcePool",
        "resourcePool",
        &[TRAVERSE_VAPPS],
        &vapp_vms,
    );

    let children = [
        traversal(None, "ComputeResource", "host", &to_folders, ""),
        traversal(None, "Datacenter", "vmFolder", &to_folders, ""),
        traversal(None, "Datacenter", "hostFolder", &to_folders, ""),
        traversal(None, "Datacenter", "networkFolder", &to_folders, ""),
        traversal(None, "Datacenter", "datastoreFolder", &to_folders, ""),
        vapp_vms.clone(),
        nested_vapps,
    ]
    .concat();

    let root_traversal = traversal(
        Some(TRAVERSE_FOLDERS),
        "Folder",
        "childEntity",
        &to_folders,
        &children,
    );

    let props: String = property_sets(with_tpm)
        .into_iter()
        .map(|(ty, paths)| {
            let paths: String = paths.iter().map(|p| soap::text("pathSet", p)).collect();
            format!(
                "<propSet>{}<all>false</all>{paths}</propSet>",
                soap::text("type", ty)
            )
        })
        .collect();

    format!(
        "<spec><objectSet>{}<skip>false</skip>{root_traversal}</objectSet>{props}</spec><partialUpdates>false</partialUpdates>",
        root.to_xml("obj")
    )
}

/// A stream of property updates.
#[async_trait]
pub trait PropertyFeed: Send {
    /// Waits for the changes after `version` (empty for the initial
    /// contents). `None` means nothing changed within the wait window.
    async fn wait(&mut self, version: &str) -> Result<Option<UpdateSet>, SdkError>;

    /// Interrupts an outstanding [`PropertyFeed::wait`]
    async fn cancel_wait(&mut self) -> Result<(), SdkError>;

    /// Destroys the subscription and logs out
    async fn close(&mut self);
}

/// Opens fresh feeds, once at start and again after each lost session.
#[async_trait]
pub trait FeedConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn PropertyFeed>, SdkError>;
}

/// Property collector subscription over an SDK session
pub struct VSphereFeed {
    session: Arc<Session>,
    collector: MoRef,
    max_object_updates: u32,
}

impl VSphereFeed {
    /// Creates a private property collector and installs the inventory filter on it
    pub async fn subscribe(session: Arc<Session>, max_object_updates: u32) -> Result<Self, SdkError> {
        let content = session.content().clone();

        let collector = session
            .call_returnval("CreatePropertyCollector", &content.property_collector, "")
            .await?
            .and_then(|r| r.moref())
            .ok_or_else(|| SdkError::Xml("CreatePropertyCollector returned no collector".into()))?;

        let with_tpm = content.api_at_least(6, 7);
        session
            .call(
                "CreateFilter",
                &collector,
                &filter_spec(&content.root_folder, with_tpm),
            )
            .await?;

        info!("Subscribed to inventory of {} (tpm properties: {with_tpm})", session.url());

        Ok(Self {
            session,
            collector,
            max_object_updates,
        })
    }
}

#[async_trait]
impl PropertyFeed for VSphereFeed {
    async fn wait(&mut self, version: &str) -> Result<Option<UpdateSet>, SdkError> {
        let args = format!(
            "{}<options>{}{}</options>",
            soap::text("version", version),
            soap::text("maxWaitSeconds", &MAX_WAIT_SECONDS.to_string()),
            soap::text("maxObjectUpdates", &self.max_object_updates.to_string()),
        );

        match self
            .session
            .call_returnval("WaitForUpdatesEx", &self.collector, &args)
            .await?
        {
            Some(r) => Ok(Some(UpdateSet::from_element(&r)?)),
            None => Ok(None),
        }
    }

    async fn cancel_wait(&mut self) -> Result<(), SdkError> {
        self.session
            .call("CancelWaitForUpdates", &self.collector, "")
            .await
            .map(|_| ())
    }

    async fn close(&mut self) {
        if let Err(e) = self
            .session
            .call("DestroyPropertyCollector", &self.collector, "")
            .await
        {
            warn!("Could not destroy property collector {}: {e}", self.collector);
        }
        self.session.close().await;
    }
}

/// Connects feeds against a provider's primary endpoint
pub struct VSphereConnector {
    provider: Provider,
    timeouts: Timeouts,
    max_object_updates: u32,
}

impl VSphereConnector {
    pub fn new(provider: Provider, timeouts: Timeouts, max_object_updates: u32) -> Self {
        Self {
            provider,
            timeouts,
            max_object_updates,
        }
    }
}

#[async_trait]
impl FeedConnector for VSphereConnector {
    async fn connect(&self) -> Result<Box<dyn PropertyFeed>, SdkError> {
        debug!("Connecting inventory feed for provider {}", self.provider.name);
        let session = Arc::new(
            Session::open(&self.provider.url, &self.provider.credentials, self.timeouts).await?,
        );

        match VSphereFeed::subscribe(session.clone(), self.max_object_updates).await {
            Ok(feed) => Ok(Box::new(feed)),
            Err(e) => {
                session.close().await;
                Err(e)
            }
        }
    }
}
