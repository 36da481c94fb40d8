// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

//! Inventory collector.
//!
//! Keeps the local [`dal::Store`] in step with the source's property
//! collector. Every update set is applied in one transaction; the first
//! complete pass after (re)connecting establishes parity, and parity is
//! dropped again on any error.

pub mod adapters;
mod vm;

use std::{collections::HashSet, sync::Arc, time::Duration};

use client::{
    property::{FeedConnector, ObjectUpdate, PropertyFeed, UpdateKind, UpdateSet},
    ErrorKind, SdkError,
};
use config::CollectorConfig;
use dal::{DBTable, EasyTransaction, ExistingRow, NewRow, Store, StoreError};
use models::inventory::{
    Cluster, Datacenter, Datastore, Folder, Host, Kind, Network, Vm, VmAnalysis,
};
use parking_lot::RwLock;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::analyzer;
use adapters::{canonical_id, note_reported_id, Adapter};

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error(transparent)]
    Sdk(#[from] SdkError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What the collector reports about itself, for the provider's status
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectorStatus {
    pub connected: bool,
    pub parity: bool,
    /// Version of the last applied update set
    pub version: String,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    /// Set once `consecutive_failures` reaches the configured threshold
    pub degraded: bool,
    /// Complete passes since start
    pub passes: u64,
}

enum Ended {
    Cancelled,
    Lost(SdkError),
}

enum Next {
    Cancelled,
    Reply(Result<Option<UpdateSet>, SdkError>),
}

pub struct Collector {
    store: Arc<Store>,
    connector: Arc<dyn FeedConnector>,
    settings: CollectorConfig,
    status: Arc<RwLock<CollectorStatus>>,
}

impl Collector {
    pub fn new(store: Arc<Store>, connector: Arc<dyn FeedConnector>, settings: CollectorConfig) -> Self {
        Self {
            store,
            connector,
            settings,
            status: Arc::new(RwLock::new(CollectorStatus::default())),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn status(&self) -> CollectorStatus {
        self.status.read().clone()
    }

    pub async fn wait_for_parity(&self) {
        self.store.wait_for_parity().await
    }

    fn lose_parity(&self, reason: &str) {
        if self.store.has_parity() {
            warn!("Inventory parity lost: {reason}");
        }
        self.store.set_parity(false);

        let mut status = self.status.write();
        status.parity = false;
        status.last_error = Some(reason.to_owned());
    }

    /// Follows the source until `cancel` fires.
    ///
    /// Only authentication and configuration failures end the loop early,
    /// everything else reconnects with exponential backoff.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), CollectorError> {
        let mut delay = self.settings.retry_delay();

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                r = self.connector.connect() => r,
            };

            let mut feed = match connected {
                Ok(feed) => feed,
                Err(e) if fatal(&e) => {
                    error!("Inventory collector stopped: {e}");
                    self.lose_parity(&e.to_string());
                    return Err(e.into());
                }
                Err(e) => {
                    warn!("Inventory collector could not connect, retrying in {delay:?}: {e}");
                    self.lose_parity(&e.to_string());
                    if !sleep_or_cancel(delay, &cancel).await {
                        break;
                    }
                    delay = (delay * 2).min(self.settings.max_retry_delay());
                    continue;
                }
            };

            self.status.write().connected = true;
            let ended = self.follow(feed.as_mut(), &cancel, &mut delay).await;
            self.status.write().connected = false;

            match ended {
                Ended::Cancelled => {
                    if let Err(e) = feed.cancel_wait().await {
                        debug!("Cancelling outstanding wait failed: {e}");
                    }
                    feed.close().await;
                    break;
                }
                Ended::Lost(e) => {
                    feed.close().await;
                    if fatal(&e) {
                        error!("Inventory collector stopped: {e}");
                        self.lose_parity(&e.to_string());
                        return Err(e.into());
                    }

                    warn!("Inventory session lost, reconnecting in {delay:?}: {e}");
                    self.lose_parity(&e.to_string());
                    if !sleep_or_cancel(delay, &cancel).await {
                        break;
                    }
                    delay = (delay * 2).min(self.settings.max_retry_delay());
                }
            }
        }

        self.store.set_parity(false);
        self.status.write().parity = false;
        info!("Inventory collector stopped");

        Ok(())
    }

    async fn follow(
        &self,
        feed: &mut dyn PropertyFeed,
        cancel: &CancellationToken,
        delay: &mut Duration,
    ) -> Ended {
        // a fresh subscription always starts over from the full contents
        let mut version = String::new();
        let mut seen: Option<HashSet<(Kind, String)>> = Some(HashSet::new());

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => Next::Cancelled,
                r = feed.wait(&version) => Next::Reply(r),
            };

            let set = match next {
                Next::Cancelled => return Ended::Cancelled,
                Next::Reply(Ok(None)) => continue,
                Next::Reply(Ok(Some(set))) => set,
                Next::Reply(Err(e)) => return Ended::Lost(e),
            };

            match self.apply(&set, seen.as_mut()).await {
                Ok(revision) => {
                    *delay = self.settings.retry_delay();
                    version = set.version.clone();

                    let complete = !set.truncated;
                    {
                        let mut status = self.status.write();
                        status.version = version.clone();
                        status.consecutive_failures = 0;
                        status.degraded = false;
                        if complete {
                            status.parity = true;
                            status.passes += 1;
                            status.last_error = None;
                        }
                    }

                    if complete {
                        if !self.store.has_parity() {
                            info!("Inventory reached parity at version {version} (revision {revision})");
                        }
                        seen = None;
                        self.store.set_parity(true);
                        if !set.objects.is_empty() {
                            self.write_snapshot().await;
                        }
                    }
                }
                Err(e) => {
                    let failures = {
                        let mut status = self.status.write();
                        status.consecutive_failures += 1;
                        if status.consecutive_failures >= self.settings.apply_failure_threshold {
                            status.degraded = true;
                        }
                        status.consecutive_failures
                    };
                    self.lose_parity(&e.to_string());

                    if failures >= self.settings.apply_failure_threshold {
                        error!("Applying update set {} failed {failures} times in a row: {e}", set.version);
                    } else {
                        warn!("Applying update set {} failed, retrying: {e}", set.version);
                    }

                    if !sleep_or_cancel(self.settings.retry_delay(), cancel).await {
                        return Ended::Cancelled;
                    }
                }
            }
        }
    }

    /// Applies one update set atomically, returning the store revision after it.
    ///
    /// While `seen` is set (the first pass after connecting) the ids of every
    /// object are collected, and the last set of the pass removes records the
    /// source no longer reported.
    pub async fn apply(
        &self,
        set: &UpdateSet,
        mut seen: Option<&mut HashSet<(Kind, String)>>,
    ) -> Result<u64, CollectorError> {
        let mut tx = self.store.easy_transaction().await;

        for update in &set.objects {
            let kind = Kind::from_sdk_type(&update.obj.kind);
            let id = canonical_id(kind, &update.obj.value);

            match kind {
                Kind::Folder => {
                    upsert::<Folder>(&mut tx, &id, update)?;
                }
                Kind::Datacenter => {
                    upsert::<Datacenter>(&mut tx, &id, update)?;
                }
                Kind::Cluster => {
                    upsert::<Cluster>(&mut tx, &id, update)?;
                }
                Kind::Host => {
                    upsert::<Host>(&mut tx, &id, update)?;
                }
                Kind::Network => {
                    upsert::<Network>(&mut tx, &id, update)?;
                }
                Kind::Datastore => {
                    if let Some(mut ds) = upsert::<Datastore>(&mut tx, &id, update)? {
                        let before = ds.reported_id.clone();
                        note_reported_id(&mut ds, &update.obj.value);
                        if ds.reported_id != before {
                            ExistingRow::from_existing(ds).update(&mut tx)?;
                        }
                    }
                }
                Kind::Vm => match upsert::<Vm>(&mut tx, &id, update)? {
                    Some(vm) => analyze(&mut tx, &vm)?,
                    None => {
                        if let Some(row) = VmAnalysis::try_get(&tx, &id)? {
                            row.delete(&mut tx)?;
                        }
                    }
                },
                Kind::Unknown => {
                    debug!("Ignoring update for {}", update.obj);
                    continue;
                }
            }

            if let Some(seen) = seen.as_deref_mut() {
                if update.kind != UpdateKind::Leave {
                    seen.insert((kind, id));
                }
            }
        }

        if let Some(seen) = seen {
            if !set.truncated {
                let pruned = prune(&mut tx, seen)?;
                if pruned > 0 {
                    info!("Removed {pruned} records the source no longer reports");
                }
            }
        }

        debug!(
            "Applied update set {} ({} objects, {} mutations)",
            set.version,
            set.objects.len(),
            tx.staged()
        );

        Ok(tx.commit()?)
    }

    async fn write_snapshot(&self) {
        let Some(path) = self.settings.snapshot_file.clone() else {
            return;
        };

        let store = self.store.clone();
        let written = tokio::task::spawn_blocking(move || store.save_snapshot(&path)).await;
        match written {
            Ok(Ok(())) => debug!("Wrote inventory snapshot"),
            Ok(Err(e)) => warn!("Could not write inventory snapshot: {e}"),
            Err(e) => warn!("Inventory snapshot writer failed: {e}"),
        }
    }
}

fn fatal(e: &SdkError) -> bool {
    matches!(e.kind(), ErrorKind::Authentication | ErrorKind::Configuration)
}

/// Returns false when cancelled first
async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Inserts, mutates or deletes one record; returns the record as stored, `None` on leave
fn upsert<T: Adapter>(
    tx: &mut EasyTransaction<'_>,
    id: &str,
    update: &ObjectUpdate,
) -> Result<Option<T>, StoreError> {
    if update.kind == UpdateKind::Leave {
        if let Some(row) = T::try_get(&*tx, id)? {
            row.delete(tx)?;
        }
        return Ok(None);
    }

    match T::try_get(&*tx, id)? {
        Some(mut row) => {
            let before = (*row).clone();
            row.apply_all(update.kind, &update.changes);

            // every write takes a new revision, so unchanged records are left alone
            if *row != before {
                let revision = row.update(tx)?;
                row.set_revision(revision);
            }
            Ok(Some(row.into_inner()))
        }
        None => {
            let mut fresh = T::fresh(id, &update.obj.kind);
            fresh.apply_all(update.kind, &update.changes);
            let revision = NewRow::new(fresh.clone()).insert(tx)?;
            fresh.set_revision(revision);
            Ok(Some(fresh))
        }
    }
}

fn analyze(tx: &mut EasyTransaction<'_>, vm: &Vm) -> Result<(), StoreError> {
    let concerns = analyzer::concerns(vm);

    match VmAnalysis::try_get(&*tx, &vm.id)? {
        Some(mut row) => {
            if row.revision_analyzed != vm.revision || row.concerns != concerns {
                row.revision_analyzed = vm.revision;
                row.concerns = concerns;
                row.update(tx)?;
            }
        }
        None => {
            NewRow::new(VmAnalysis {
                id: vm.id.clone(),
                revision: 0,
                revision_analyzed: vm.revision,
                concerns,
            })
            .insert(tx)?;
        }
    }

    Ok(())
}

fn prune_table<T: DBTable>(
    tx: &mut EasyTransaction<'_>,
    kind: Kind,
    seen: &HashSet<(Kind, String)>,
) -> Result<usize, StoreError> {
    let stale: Vec<_> = T::all(&*tx)?
        .into_iter()
        .filter(|r| !seen.contains(&(kind, r.id())))
        .collect();
    let count = stale.len();

    for row in stale {
        row.delete(tx)?;
    }

    Ok(count)
}

fn prune(tx: &mut EasyTransaction<'_>, seen: &HashSet<(Kind, String)>) -> Result<usize, StoreError> {
    let mut pruned = prune_table::<Folder>(tx, Kind::Folder, seen)?
        + prune_table::<Datacenter>(tx, Kind::Datacenter, seen)?
        + prune_table::<Cluster>(tx, Kind::Cluster, seen)?
        + prune_table::<Host>(tx, Kind::Host, seen)?
        + prune_table::<Network>(tx, Kind::Network, seen)?
        + prune_table::<Datastore>(tx, Kind::Datastore, seen)?
        + prune_table::<Vm>(tx, Kind::Vm, seen)?;

    // analyses share the VM ids
    pruned += prune_table::<VmAnalysis>(tx, Kind::Vm, seen)?;

    Ok(pruned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use client::{
        property::{ChangeOp, PropertyChange},
        soap::{xml, MoRef},
    };
    use models::inventory::{Inventory, Model, Ref};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::collections::VecDeque;

    type Script = VecDeque<Result<Option<UpdateSet>, SdkError>>;

    struct FakeFeed {
        script: Script,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl PropertyFeed for FakeFeed {
        async fn wait(&mut self, version: &str) -> Result<Option<UpdateSet>, SdkError> {
            self.log.lock().push(format!("wait:{version}"));
            match self.script.pop_front() {
                Some(r) => r,
                None => futures::future::pending().await,
            }
        }

        async fn cancel_wait(&mut self) -> Result<(), SdkError> {
            self.log.lock().push("cancel_wait".to_owned());
            Ok(())
        }

        async fn close(&mut self) {
            self.log.lock().push("close".to_owned());
        }
    }

    #[derive(Default)]
    struct FakeConnector {
        connections: Mutex<VecDeque<Result<Script, SdkError>>>,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl FakeConnector {
        fn new(connections: Vec<Result<Script, SdkError>>) -> Arc<Self> {
            Arc::new(Self {
                connections: Mutex::new(connections.into()),
                log: Arc::default(),
            })
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().clone()
        }
    }

    #[async_trait]
    impl FeedConnector for FakeConnector {
        async fn connect(&self) -> Result<Box<dyn PropertyFeed>, SdkError> {
            self.log.lock().push("connect".to_owned());
            match self.connections.lock().pop_front() {
                Some(Ok(script)) => Ok(Box::new(FakeFeed {
                    script,
                    log: self.log.clone(),
                })),
                Some(Err(e)) => Err(e),
                None => Err(SdkError::Transport("no more connections".to_owned())),
            }
        }
    }

    fn settings() -> CollectorConfig {
        CollectorConfig {
            retry_delay_secs: 0,
            max_retry_delay_secs: 0,
            ..Default::default()
        }
    }

    fn change(name: &str, val: &str) -> PropertyChange {
        PropertyChange {
            name: name.to_owned(),
            op: ChangeOp::Assign,
            val: Some(xml::parse(val).unwrap()),
        }
    }

    fn object(kind: UpdateKind, ty: &str, id: &str, changes: Vec<PropertyChange>) -> ObjectUpdate {
        ObjectUpdate {
            kind,
            obj: MoRef::new(ty, id),
            changes,
        }
    }

    fn named(ty: &str, id: &str, name: &str, parent: Option<(&str, &str)>) -> ObjectUpdate {
        let mut changes = vec![change("name", &format!("<val>{name}</val>"))];
        if let Some((pty, pid)) = parent {
            changes.push(change("parent", &format!(r#"<val type="{pty}">{pid}</val>"#)));
        }
        object(UpdateKind::Enter, ty, id, changes)
    }

    fn set(version: &str, truncated: bool, objects: Vec<ObjectUpdate>) -> UpdateSet {
        UpdateSet {
            version: version.to_owned(),
            truncated,
            objects,
        }
    }

    fn initial_inventory() -> UpdateSet {
        set(
            "1",
            false,
            vec![
                named("Folder", "group-d1", "Datacenters", None),
                named("Datacenter", "datacenter-2", "DC0", Some(("Folder", "group-d1"))),
                named("Folder", "group-h4", "host", Some(("Datacenter", "datacenter-2"))),
                named("ClusterComputeResource", "domain-c7", "cluster0", Some(("Folder", "group-h4"))),
                named("HostSystem", "host-20", "host.example.com", Some(("ClusterComputeResource", "domain-c7"))),
            ],
        )
    }

    async fn eventually(what: &str, mut f: impl FnMut() -> bool) {
        for _ in 0..500 {
            if f() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test]
    async fn cancel_sends_cancel_wait_then_restart_resumes_from_scratch() {
        let store = Arc::new(Store::new());
        let connector = FakeConnector::new(vec![Ok(vec![Ok(Some(initial_inventory()))].into())]);
        let collector = Arc::new(Collector::new(store.clone(), connector.clone(), settings()));

        let cancel = CancellationToken::new();
        let running = {
            let collector = collector.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { collector.run(cancel).await })
        };

        tokio::time::timeout(Duration::from_secs(5), collector.wait_for_parity())
            .await
            .expect("parity reached");
        eventually("the second wait", || connector.log().contains(&"wait:1".to_owned())).await;

        cancel.cancel();
        running.await.unwrap().unwrap();

        assert_eq!(
            connector.log(),
            vec!["connect", "wait:", "wait:1", "cancel_wait", "close"]
        );
        assert!(!store.has_parity());

        let view = store.snapshot();
        let inv = Inventory::new(&view);
        assert_eq!(
            inv.path(&Ref::new(Kind::Host, "host-20")).unwrap(),
            "/DC0/host/cluster0/host.example.com"
        );

        // a restarted collector starts over at version zero and regains parity
        let connector = FakeConnector::new(vec![Ok(vec![Ok(Some(initial_inventory()))].into())]);
        let collector = Arc::new(Collector::new(store.clone(), connector.clone(), settings()));
        let cancel = CancellationToken::new();
        let running = {
            let collector = collector.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { collector.run(cancel).await })
        };

        tokio::time::timeout(Duration::from_secs(5), collector.wait_for_parity())
            .await
            .expect("parity regained");
        assert_eq!(connector.log()[1], "wait:");
        assert_eq!(collector.status().passes, 1);

        cancel.cancel();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn lost_session_reconnects_and_resyncs() {
        let store = Arc::new(Store::new());
        let connector = FakeConnector::new(vec![
            Ok(vec![
                Ok(Some(initial_inventory())),
                Err(SdkError::Transport("connection reset".to_owned())),
            ]
            .into()),
            Err(SdkError::Timeout(Duration::from_secs(1))),
            Ok(vec![Ok(Some(set(
                "1",
                false,
                vec![named("Folder", "group-d1", "Datacenters", None)],
            )))]
            .into()),
        ]);
        let collector = Arc::new(Collector::new(store.clone(), connector.clone(), settings()));

        let cancel = CancellationToken::new();
        let running = {
            let collector = collector.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { collector.run(cancel).await })
        };

        eventually("the resync", || connector.log().iter().filter(|l| *l == "wait:").count() == 2).await;
        eventually("the resynced wait", || connector.log().len() >= 8).await;
        cancel.cancel();
        running.await.unwrap().unwrap();

        assert_eq!(
            connector.log(),
            vec![
                "connect", "wait:", "wait:1", "close", "connect", "connect", "wait:", "wait:1",
                "cancel_wait", "close"
            ]
        );

        // the resync no longer reported the datacenter, so it was pruned
        let view = store.snapshot();
        assert!(Datacenter::try_get(&view, "datacenter-2").unwrap().is_none());
        assert!(Folder::try_get(&view, "group-d1").unwrap().is_some());
    }

    #[tokio::test]
    async fn authentication_failure_stops_the_collector() {
        let store = Arc::new(Store::new());
        let connector = FakeConnector::new(vec![Err(SdkError::Authentication("bad password".into()))]);
        let collector = Collector::new(store, connector, settings());

        let r = collector.run(CancellationToken::new()).await;
        assert!(matches!(r, Err(CollectorError::Sdk(SdkError::Authentication(_)))));
        assert!(collector.status().last_error.unwrap().contains("bad password"));
    }

    #[tokio::test]
    async fn truncated_sets_do_not_reach_parity() {
        let store = Arc::new(Store::new());
        let collector = Collector::new(store.clone(), FakeConnector::new(vec![]), settings());

        let mut seen = HashSet::new();
        collector
            .apply(
                &set("1", true, vec![named("Folder", "group-d1", "Datacenters", None)]),
                Some(&mut seen),
            )
            .await
            .unwrap();
        assert!(!store.has_parity());
        assert!(seen.contains(&(Kind::Folder, "group-d1".to_owned())));
    }

    #[tokio::test]
    async fn unchanged_modify_keeps_the_revision() {
        let store = Arc::new(Store::new());
        let collector = Collector::new(store.clone(), FakeConnector::new(vec![]), settings());
        collector.apply(&initial_inventory(), None).await.unwrap();

        let before = Host::get(&store.snapshot(), "host-20").unwrap().revision;
        collector
            .apply(
                &set(
                    "2",
                    false,
                    vec![object(
                        UpdateKind::Modify,
                        "HostSystem",
                        "host-20",
                        vec![change("name", "<val>host.example.com</val>")],
                    )],
                ),
                None,
            )
            .await
            .unwrap();
        assert_eq!(Host::get(&store.snapshot(), "host-20").unwrap().revision, before);

        collector
            .apply(
                &set(
                    "3",
                    false,
                    vec![object(
                        UpdateKind::Modify,
                        "HostSystem",
                        "host-20",
                        vec![change("summary.runtime.inMaintenanceMode", "<val>true</val>")],
                    )],
                ),
                None,
            )
            .await
            .unwrap();
        let host = Host::get(&store.snapshot(), "host-20").unwrap();
        assert!(host.in_maintenance);
        assert!(host.revision > before);
    }

    #[tokio::test]
    async fn unsafe_datastore_ids_are_canonicalized() {
        let store = Arc::new(Store::new());
        let collector = Collector::new(store.clone(), FakeConnector::new(vec![]), settings());
        let raw = "ds:///vmfs/volumes/5e6b1c1a/";

        collector
            .apply(
                &set(
                    "1",
                    false,
                    vec![object(
                        UpdateKind::Enter,
                        "Datastore",
                        raw,
                        vec![change("name", "<val>nfs-1</val>")],
                    )],
                ),
                None,
            )
            .await
            .unwrap();

        let view = store.snapshot();
        let ds = Inventory::new(&view).find::<Datastore>("nfs-1").unwrap();
        assert_eq!(ds.id, adapters::canonical_datastore_id(raw));
        assert_eq!(ds.reported_id.as_deref(), Some(raw));
    }

    #[tokio::test]
    async fn vm_analysis_follows_the_vm() {
        let store = Arc::new(Store::new());
        let collector = Collector::new(store.clone(), FakeConnector::new(vec![]), settings());
        let vm = |kind| {
            object(
                kind,
                "VirtualMachine",
                "vm-16",
                vec![
                    change("name", "<val>web</val>"),
                    change("config.changeTrackingEnabled", "<val>false</val>"),
                ],
            )
        };

        collector.apply(&set("1", false, vec![vm(UpdateKind::Enter)]), None).await.unwrap();
        let view = store.snapshot();
        let analysis = Inventory::new(&view).analysis("vm-16").unwrap().unwrap();
        let vm_rec = Vm::get(&view, "vm-16").unwrap();
        assert_eq!(analysis.revision_analyzed, vm_rec.revision);
        assert!(!analysis.concerns.is_empty());

        collector
            .apply(
                &set("2", false, vec![object(UpdateKind::Leave, "VirtualMachine", "vm-16", vec![])]),
                None,
            )
            .await
            .unwrap();
        let view = store.snapshot();
        assert!(Vm::try_get(&view, "vm-16").unwrap().is_none());
        assert!(Inventory::new(&view).analysis("vm-16").unwrap().is_none());
    }

    #[derive(Debug, Clone)]
    enum Step {
        Enter(usize),
        Leave(usize),
        Rename(usize, u8),
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            (0..3usize).prop_map(Step::Enter),
            (0..3usize).prop_map(Step::Leave),
            (0..3usize, any::<u8>()).prop_map(|(i, n)| Step::Rename(i, n)),
        ]
    }

    proptest! {
        #[test]
        fn revisions_only_grow_across_leave_and_enter(steps in prop::collection::vec(step(), 1..30)) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let store = Arc::new(Store::new());
                let collector = Collector::new(store.clone(), FakeConnector::new(vec![]), settings());
                let mut highest = [0u64; 3];

                for (v, s) in steps.into_iter().enumerate() {
                    let (i, update) = match s {
                        Step::Enter(i) => (i, object(UpdateKind::Enter, "Folder", &format!("group-{i}"), vec![change("name", "<val>f</val>")])),
                        Step::Leave(i) => (i, object(UpdateKind::Leave, "Folder", &format!("group-{i}"), vec![])),
                        Step::Rename(i, n) => (i, object(UpdateKind::Modify, "Folder", &format!("group-{i}"), vec![change("name", &format!("<val>f{n}</val>"))])),
                    };
                    collector.apply(&set(&v.to_string(), false, vec![update]), None).await.unwrap();

                    if let Some(f) = Folder::try_get(&store.snapshot(), &format!("group-{i}")).unwrap() {
                        prop_assert!(f.revision >= highest[i]);
                        if f.revision > 0 && f.revision != highest[i] {
                            prop_assert!(f.revision > highest[i]);
                        }
                        highest[i] = f.revision;
                        prop_assert_eq!(f.reference(), Ref::new(Kind::Folder, format!("group-{i}")));
                    }
                }
                Ok(())
            })?;
        }
    }
}
