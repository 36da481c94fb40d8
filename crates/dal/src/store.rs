//! Copyright (c) 2023 University of New Hampshire
//! SPDX-License-Identifier: MIT

use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
    sync::Arc,
};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch, Mutex, MutexGuard};

use crate::{DBTable, StoreError};

/// Capacity of the change event channel; slow subscribers observe `Lagged`
const EVENT_CAPACITY: usize = 4096;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Row {
    pub revision: u64,
    pub data: serde_json::Value,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventAction {
    Created,
    Updated,
    Deleted,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub table: String,
    pub id: String,
    pub action: EventAction,
    pub revision: u64,
}

type Table = Arc<BTreeMap<String, Arc<Row>>>;

#[derive(Clone, Default, Serialize, Deserialize)]
struct Tables {
    last_revision: u64,
    tables: HashMap<String, Table>,
}

impl Tables {
    fn row(&self, table: &str, id: &str) -> Option<&Row> {
        self.tables.get(table).and_then(|t| t.get(id)).map(|r| &**r)
    }

    fn rows<'a>(&'a self, table: &str) -> Box<dyn Iterator<Item = &'a Row> + 'a> {
        match self.tables.get(table) {
            Some(t) => Box::new(t.values().map(|r| &**r)),
            None => Box::new(std::iter::empty()),
        }
    }

    fn table_mut(&mut self, table: &str) -> &mut BTreeMap<String, Arc<Row>> {
        Arc::make_mut(self.tables.entry(table.to_owned()).or_default())
    }
}

/// Read access shared by snapshots and open transactions
pub trait Readable {
    fn row(&self, table: &str, id: &str) -> Option<&Row>;

    fn rows<'a>(&'a self, table: &str) -> Box<dyn Iterator<Item = &'a Row> + 'a>;

    /// Highest revision handed out so far
    fn revision(&self) -> u64;
}

/// An immutable view of the store at one point in time.
#[derive(Clone)]
pub struct Snapshot {
    tables: Tables,
}

impl Readable for Snapshot {
    fn row(&self, table: &str, id: &str) -> Option<&Row> {
        self.tables.row(table, id)
    }

    fn rows<'a>(&'a self, table: &str) -> Box<dyn Iterator<Item = &'a Row> + 'a> {
        self.tables.rows(table)
    }

    fn revision(&self) -> u64 {
        self.tables.last_revision
    }
}

pub struct Store {
    state: RwLock<Tables>,
    writer: Mutex<()>,
    events: broadcast::Sender<Event>,
    parity: watch::Sender<bool>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self::from_tables(Tables::default())
    }

    fn from_tables(tables: Tables) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (parity, _) = watch::channel(false);

        Self {
            state: RwLock::new(tables),
            writer: Mutex::new(()),
            events,
            parity,
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            tables: self.state.read().clone(),
        }
    }

    /// Opens the single write transaction, waiting for any other writer to finish
    pub async fn easy_transaction(&self) -> EasyTransaction<'_> {
        let guard = self.writer.lock().await;
        let working = self.state.read().clone();

        EasyTransaction {
            store: self,
            _guard: guard,
            working,
            pending: Vec::new(),
            finished: false,
        }
    }

    /// Change events, delivered only for commits made while at parity
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub fn set_parity(&self, parity: bool) {
        self.parity.send_if_modified(|p| {
            let changed = *p != parity;
            *p = parity;
            changed
        });
    }

    pub fn has_parity(&self) -> bool {
        *self.parity.borrow()
    }

    /// Resolves once the store is at parity
    pub async fn wait_for_parity(&self) {
        let mut rx = self.parity.subscribe();
        // the sender lives as long as self, so this cannot fail
        let _ = rx.wait_for(|p| *p).await;
    }

    pub fn save_snapshot(&self, path: &Path) -> Result<(), StoreError> {
        let tables = self.state.read().clone();
        let file = std::fs::File::create(path)?;
        serde_json::to_writer(std::io::BufWriter::new(file), &tables)?;

        Ok(())
    }

    /// Loads a store previously written with [`Store::save_snapshot`], without parity
    pub fn load_snapshot(path: &Path) -> Result<Self, StoreError> {
        let file = std::fs::File::open(path)?;
        let tables: Tables = serde_json::from_reader(std::io::BufReader::new(file))?;

        Ok(Self::from_tables(tables))
    }

    fn publish(&self, working: Tables, pending: Vec<Event>) {
        *self.state.write() = working;

        if self.has_parity() {
            for event in pending {
                // no subscribers is not an error
                let _ = self.events.send(event);
            }
        }
    }
}

/// The store's single write transaction.
///
/// Mutations are staged on a private copy and become visible atomically on
/// [`EasyTransaction::commit`]. Dropping the transaction discards them.
pub struct EasyTransaction<'a> {
    store: &'a Store,
    _guard: MutexGuard<'a, ()>,
    working: Tables,
    pending: Vec<Event>,
    finished: bool,
}

impl Readable for EasyTransaction<'_> {
    fn row(&self, table: &str, id: &str) -> Option<&Row> {
        self.working.row(table, id)
    }

    fn rows<'a>(&'a self, table: &str) -> Box<dyn Iterator<Item = &'a Row> + 'a> {
        self.working.rows(table)
    }

    fn revision(&self) -> u64 {
        self.working.last_revision
    }
}

impl<'a> EasyTransaction<'a> {
    fn stamp<T: DBTable>(&mut self, v: &T) -> Result<Row, StoreError> {
        let revision = self.working.last_revision + 1;
        let mut v = v.clone();
        v.set_revision(revision);
        let data = v.to_rowlike()?;
        self.working.last_revision = revision;

        Ok(Row { revision, data })
    }

    fn record(&mut self, table: &str, id: String, action: EventAction, revision: u64) {
        self.pending.push(Event {
            table: table.to_owned(),
            id,
            action,
            revision,
        });
    }

    pub(crate) fn insert<T: DBTable>(&mut self, v: &T) -> Result<u64, StoreError> {
        let table = T::table_name();
        let id = v.id();
        if self.working.row(table, &id).is_some() {
            return Err(StoreError::AlreadyExists { table, id });
        }

        let row = self.stamp(v)?;
        let revision = row.revision;
        self.working.table_mut(table).insert(id.clone(), Arc::new(row));
        self.record(table, id, EventAction::Created, revision);

        Ok(revision)
    }

    pub(crate) fn update<T: DBTable>(&mut self, v: &T) -> Result<u64, StoreError> {
        let table = T::table_name();
        let id = v.id();
        if self.working.row(table, &id).is_none() {
            return Err(StoreError::NotFound { table, id });
        }

        let row = self.stamp(v)?;
        let revision = row.revision;
        self.working.table_mut(table).insert(id.clone(), Arc::new(row));
        self.record(table, id, EventAction::Updated, revision);

        Ok(revision)
    }

    pub(crate) fn delete<T: DBTable>(&mut self, id: &str) -> Result<(), StoreError> {
        let table = T::table_name();
        let removed = self.working.table_mut(table).remove(id);

        match removed {
            Some(_) => {
                self.working.last_revision += 1;
                let revision = self.working.last_revision;
                self.record(table, id.to_owned(), EventAction::Deleted, revision);
                Ok(())
            }
            None => Err(StoreError::NotFound {
                table,
                id: id.to_owned(),
            }),
        }
    }

    /// Number of mutations staged so far
    pub fn staged(&self) -> usize {
        self.pending.len()
    }

    /// Makes every staged mutation visible at once
    pub fn commit(mut self) -> Result<u64, StoreError> {
        self.finished = true;

        let working = std::mem::take(&mut self.working);
        let pending = std::mem::take(&mut self.pending);
        let revision = working.last_revision;
        self.store.publish(working, pending);

        Ok(revision)
    }

    /// Take this transaction and roll it back, consuming the transaction in the process
    pub fn rollback(mut self) {
        self.finished = true;
    }
}

// note that dropping an unfinished transaction rolls back its contents
impl Drop for EasyTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished && !self.pending.is_empty() {
            tracing::warn!(
                "Dropping a transaction with {} staged changes without committing it",
                self.pending.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{test_table::Widget, ExistingRow, NewRow};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    async fn seed(store: &Store, ids: &[&str]) {
        let mut t = store.easy_transaction().await;
        for id in ids {
            NewRow::new(Widget::named(id, id)).insert(&mut t).unwrap();
        }
        t.commit().unwrap();
    }

    #[tokio::test]
    async fn commit_is_atomic_and_dropped_transactions_roll_back() {
        let store = Store::new();
        seed(&store, &["a"]).await;

        {
            let mut t = store.easy_transaction().await;
            NewRow::new(Widget::named("b", "b")).insert(&mut t).unwrap();
            assert!(Widget::get(&t, "b").is_ok());
            assert!(Widget::get(&store.snapshot(), "b").is_err());
        }

        let snap = store.snapshot();
        assert!(Widget::try_get(&snap, "b").unwrap().is_none());
        assert_eq!(Widget::all(&snap).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn insert_twice_and_update_missing_fail() {
        let store = Store::new();
        seed(&store, &["a"]).await;

        let mut t = store.easy_transaction().await;
        let dup = NewRow::new(Widget::named("a", "again")).insert(&mut t);
        assert!(matches!(dup, Err(StoreError::AlreadyExists { .. })));

        let ghost = ExistingRow::from_existing(Widget::named("ghost", "g"));
        assert!(ghost.update(&mut t).unwrap_err().is_not_found());
        t.rollback();
    }

    #[tokio::test]
    async fn update_keeps_id() {
        let store = Store::new();
        seed(&store, &["a"]).await;

        let mut t = store.easy_transaction().await;
        let mut row = Widget::get(&t, "a").unwrap();
        row.id = "b".to_owned();
        assert!(matches!(row.update(&mut t), Err(StoreError::IdChanged { .. })));
    }

    #[tokio::test]
    async fn snapshots_do_not_observe_later_commits() {
        let store = Store::new();
        seed(&store, &["a"]).await;
        let before = store.snapshot();

        let mut t = store.easy_transaction().await;
        let mut row = Widget::get(&t, "a").unwrap();
        row.name = "renamed".to_owned();
        row.update(&mut t).unwrap();
        t.commit().unwrap();

        assert_eq!(Widget::get(&before, "a").unwrap().name, "a");
        assert_eq!(Widget::get(&store.snapshot(), "a").unwrap().name, "renamed");
    }

    #[tokio::test]
    async fn events_only_flow_at_parity() {
        let store = Store::new();
        let mut rx = store.subscribe();
        seed(&store, &["quiet"]).await;
        assert!(rx.try_recv().is_err());

        store.set_parity(true);
        seed(&store, &["loud"]).await;

        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.id, "loud");
        assert_eq!(ev.action, EventAction::Created);
        assert_eq!(ev.table, "widgets");
    }

    #[tokio::test]
    async fn parity_waiters_wake_up() {
        let store = Arc::new(Store::new());
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.wait_for_parity().await })
        };

        store.set_parity(true);
        waiter.await.unwrap();
        assert!(store.has_parity());
    }

    #[tokio::test]
    async fn snapshot_file_round_trip() {
        let store = Store::new();
        seed(&store, &["a", "b"]).await;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inventory.json");
        store.save_snapshot(&path).unwrap();

        let loaded = Store::load_snapshot(&path).unwrap();
        let snap = loaded.snapshot();
        assert_eq!(snap.revision(), store.snapshot().revision());
        assert_eq!(
            Widget::all(&snap).unwrap().into_iter().map(|w| w.id.clone()).collect::<Vec<_>>(),
            vec!["a".to_owned(), "b".to_owned()]
        );
        assert!(!loaded.has_parity());
    }

    proptest! {
        #[test]
        fn revisions_strictly_increase_across_leave_and_enter(cycles in 1usize..8, modifies in 0usize..4) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let store = Store::new();
                let mut last = 0;

                for _ in 0..cycles {
                    let mut t = store.easy_transaction().await;
                    let rev = NewRow::new(Widget::named("vm-1", "x")).insert(&mut t).unwrap();
                    t.commit().unwrap();
                    prop_assert!(rev > last);
                    last = rev;

                    for _ in 0..modifies {
                        let mut t = store.easy_transaction().await;
                        let row = Widget::get(&t, "vm-1").unwrap();
                        let rev = row.update(&mut t).unwrap();
                        t.commit().unwrap();
                        prop_assert!(rev > last);
                        last = rev;
                    }

                    let mut t = store.easy_transaction().await;
                    Widget::get(&t, "vm-1").unwrap().delete(&mut t).unwrap();
                    t.commit().unwrap();
                }
                Ok(())
            })?;
        }
    }
}
