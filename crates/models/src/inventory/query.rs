// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

//! Read side of the inventory.
//!
//! Everything here works off a [`Readable`] view, normally a
//! [`dal::Snapshot`], so a caller sees one consistent revision of the
//! inventory for as long as it holds on to the view.

use dal::{DBTable, ExistingRow, Readable, StoreError};
use thiserror::Error;

use super::{
    Cluster, Datacenter, Datastore, Folder, Host, Kind, Model, Network, Record, Ref, Vm,
    VmAnalysis,
};

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("{kind} {id} not found")]
    NotFound { kind: Kind, id: String },

    #[error("{count} {kind} records are named {name}")]
    Ambiguous {
        kind: Kind,
        name: String,
        count: usize,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl QueryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Page {
    pub offset: usize,
    pub limit: Option<usize>,
}

impl Page {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self {
            offset,
            limit: Some(limit),
        }
    }
}

/// A VM with the objects it runs on filled in.
#[derive(Debug, Clone, PartialEq)]
pub struct Workload {
    pub vm: Vm,
    pub host: Option<Host>,
    pub cluster: Option<Cluster>,
    pub datacenter: Option<Datacenter>,
}

pub struct Inventory<'a, R: Readable> {
    view: &'a R,
}

impl<'a, R: Readable> Inventory<'a, R> {
    pub fn new(view: &'a R) -> Self {
        Self { view }
    }

    pub fn get(&self, r: &Ref) -> Result<Record, QueryError> {
        match r.kind {
            Kind::Folder => self.get_as::<Folder>(&r.id).map(Model::into_record),
            Kind::Datacenter => self.get_as::<Datacenter>(&r.id).map(Model::into_record),
            Kind::Cluster => self.get_as::<Cluster>(&r.id).map(Model::into_record),
            Kind::Host => self.get_as::<Host>(&r.id).map(Model::into_record),
            Kind::Network => self.get_as::<Network>(&r.id).map(Model::into_record),
            Kind::Datastore => self.get_as::<Datastore>(&r.id).map(Model::into_record),
            Kind::Vm => self.get_as::<Vm>(&r.id).map(Model::into_record),
            Kind::Unknown => Err(QueryError::NotFound {
                kind: r.kind,
                id: r.id.clone(),
            }),
        }
    }

    pub fn get_as<T: Model>(&self, id: &str) -> Result<T, QueryError> {
        T::get(self.view, id)
            .map(ExistingRow::into_inner)
            .map_err(|e| {
                if e.is_not_found() {
                    QueryError::NotFound {
                        kind: T::KIND,
                        id: id.to_owned(),
                    }
                } else {
                    e.into()
                }
            })
    }

    /// Case-exact lookup by name; more than one match is an error
    pub fn find<T: Model>(&self, name: &str) -> Result<T, QueryError> {
        let mut found: Vec<T> = self.list(|v: &T| v.name() == name, Page::default()).collect();

        match found.len() {
            0 => Err(QueryError::NotFound {
                kind: T::KIND,
                id: name.to_owned(),
            }),
            1 => Ok(found.remove(0)),
            count => Err(QueryError::Ambiguous {
                kind: T::KIND,
                name: name.to_owned(),
                count,
            }),
        }
    }

    /// Lazily walks a table in id order
    pub fn list<'b, T, F>(&self, predicate: F, page: Page) -> impl Iterator<Item = T> + 'b
    where
        'a: 'b,
        T: Model,
        F: Fn(&T) -> bool + 'b,
    {
        let view: &'b R = self.view;

        view.rows(T::table_name())
            .filter_map(|row| match T::from_row(row) {
                Ok(v) => Some(v.into_inner()),
                Err(e) => {
                    tracing::warn!("skipping unreadable {} row: {e}", T::KIND);
                    None
                }
            })
            .filter(move |v| predicate(v))
            .skip(page.offset)
            .take(page.limit.unwrap_or(usize::MAX))
    }

    /// Inventory path of the object, e.g. `/dc1/vm/web/web-01`.
    ///
    /// The root folder is not part of the path; the walk stops early at
    /// parents outside the replicated kinds or not (yet) in the store.
    pub fn path(&self, r: &Ref) -> Result<String, QueryError> {
        let leaf = self.get(r)?;
        let mut names = vec![leaf.name().to_owned()];
        let mut next = leaf.parent().cloned();

        while let Some(parent) = next.take() {
            if parent.kind == Kind::Unknown {
                break;
            }

            match self.get(&parent) {
                Ok(record) => {
                    let is_root = matches!(record, Record::Folder(_)) && record.parent().is_none();
                    if is_root {
                        break;
                    }
                    names.push(record.name().to_owned());
                    next = record.parent().cloned();
                }
                Err(e) if e.is_not_found() => break,
                Err(e) => return Err(e),
            }
        }

        names.reverse();

        Ok(format!("/{}", names.join("/")))
    }

    /// The VM together with its host, cluster and datacenter
    pub fn workload(&self, vm_id: &str) -> Result<Workload, QueryError> {
        let vm = self.get_as::<Vm>(vm_id)?;

        let host = match &vm.host {
            Some(h) => self.optional::<Host>(&h.id)?,
            None => None,
        };

        let cluster = match host.as_ref().and_then(|h| h.parent.as_ref()) {
            Some(p) if p.kind == Kind::Cluster => self.optional::<Cluster>(&p.id)?,
            _ => None,
        };

        let start = cluster
            .as_ref()
            .and_then(|c| c.parent.clone())
            .or_else(|| vm.parent.clone());
        let datacenter = self.enclosing_datacenter(start)?;

        Ok(Workload {
            vm,
            host,
            cluster,
            datacenter,
        })
    }

    pub fn analysis(&self, vm_id: &str) -> Result<Option<VmAnalysis>, QueryError> {
        Ok(VmAnalysis::try_get(self.view, vm_id)?.map(ExistingRow::into_inner))
    }

    fn optional<T: Model>(&self, id: &str) -> Result<Option<T>, QueryError> {
        match self.get_as::<T>(id) {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn enclosing_datacenter(&self, mut next: Option<Ref>) -> Result<Option<Datacenter>, QueryError> {
        while let Some(r) = next.take() {
            if r.kind == Kind::Datacenter {
                return self.optional::<Datacenter>(&r.id);
            }
            if r.kind == Kind::Unknown {
                break;
            }
            match self.get(&r) {
                Ok(record) => next = record.parent().cloned(),
                Err(e) if e.is_not_found() => break,
                Err(e) => return Err(e),
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dal::{NewRow, Store};
    use pretty_assertions::assert_eq;

    fn folder(id: &str, name: &str, parent: Option<Ref>) -> Folder {
        Folder {
            id: id.to_owned(),
            name: name.to_owned(),
            parent,
            ..Default::default()
        }
    }

    /// root folder -> dc1 -> vm folder -> web folder -> web-01, with host/cluster
    async fn seeded() -> Store {
        let store = Store::new();
        let mut t = store.easy_transaction().await;

        NewRow::new(folder("group-d1", "Datacenters", None)).insert(&mut t).unwrap();
        NewRow::new(Datacenter {
            id: "datacenter-1".into(),
            name: "dc1".into(),
            parent: Some(Ref::new(Kind::Folder, "group-d1")),
            vms: Some(Ref::new(Kind::Folder, "group-v1")),
            ..Default::default()
        })
        .insert(&mut t)
        .unwrap();
        NewRow::new(folder("group-v1", "vm", Some(Ref::new(Kind::Datacenter, "datacenter-1"))))
            .insert(&mut t)
            .unwrap();
        NewRow::new(folder("group-v7", "web", Some(Ref::new(Kind::Folder, "group-v1"))))
            .insert(&mut t)
            .unwrap();
        NewRow::new(folder("group-h1", "host", Some(Ref::new(Kind::Datacenter, "datacenter-1"))))
            .insert(&mut t)
            .unwrap();
        NewRow::new(Cluster {
            id: "domain-c8".into(),
            name: "prod".into(),
            parent: Some(Ref::new(Kind::Folder, "group-h1")),
            ..Default::default()
        })
        .insert(&mut t)
        .unwrap();
        NewRow::new(Host {
            id: "host-20".into(),
            name: "esx-01".into(),
            parent: Some(Ref::new(Kind::Cluster, "domain-c8")),
            ..Default::default()
        })
        .insert(&mut t)
        .unwrap();
        for (id, name) in [("vm-1", "web-01"), ("vm-2", "web-02"), ("vm-3", "db-01")] {
            NewRow::new(Vm {
                id: id.into(),
                name: name.into(),
                parent: Some(Ref::new(Kind::Folder, "group-v7")),
                host: Some(Ref::new(Kind::Host, "host-20")),
                ..Default::default()
            })
            .insert(&mut t)
            .unwrap();
        }
        t.commit().unwrap();

        store
    }

    #[tokio::test]
    async fn path_walks_parents_without_root_folder() {
        let store = seeded().await;
        let snap = store.snapshot();
        let inv = Inventory::new(&snap);

        assert_eq!(inv.path(&Ref::new(Kind::Vm, "vm-1")).unwrap(), "/dc1/vm/web/web-01");
        assert_eq!(inv.path(&Ref::new(Kind::Host, "host-20")).unwrap(), "/dc1/host/prod/esx-01");
        assert_eq!(inv.path(&Ref::new(Kind::Datacenter, "datacenter-1")).unwrap(), "/dc1");
    }

    #[tokio::test]
    async fn path_stops_at_unknown_or_missing_parents() {
        let store = seeded().await;
        let mut t = store.easy_transaction().await;
        NewRow::new(Vm {
            id: "vm-9".into(),
            name: "in-vapp".into(),
            parent: Some(Ref::new(Kind::Unknown, "resgroup-v4")),
            ..Default::default()
        })
        .insert(&mut t)
        .unwrap();
        NewRow::new(Vm {
            id: "vm-10".into(),
            name: "orphan".into(),
            parent: Some(Ref::new(Kind::Folder, "group-gone")),
            ..Default::default()
        })
        .insert(&mut t)
        .unwrap();
        t.commit().unwrap();

        let snap = store.snapshot();
        let inv = Inventory::new(&snap);
        assert_eq!(inv.path(&Ref::new(Kind::Vm, "vm-9")).unwrap(), "/in-vapp");
        assert_eq!(inv.path(&Ref::new(Kind::Vm, "vm-10")).unwrap(), "/orphan");
    }

    #[tokio::test]
    async fn get_find_and_list() {
        let store = seeded().await;
        let snap = store.snapshot();
        let inv = Inventory::new(&snap);

        let rec = inv.get(&Ref::new(Kind::Cluster, "domain-c8")).unwrap();
        assert_eq!(rec.name(), "prod");
        assert!(inv.get(&Ref::new(Kind::Vm, "vm-404")).unwrap_err().is_not_found());
        assert!(inv.get(&Ref::new(Kind::Unknown, "resgroup-1")).unwrap_err().is_not_found());

        assert_eq!(inv.find::<Vm>("db-01").unwrap().id, "vm-3");
        assert!(inv.find::<Vm>("DB-01").unwrap_err().is_not_found());

        let webs: Vec<String> = inv
            .list(|v: &Vm| v.name.starts_with("web"), Page::default())
            .map(|v| v.id)
            .collect();
        assert_eq!(webs, vec!["vm-1".to_owned(), "vm-2".to_owned()]);

        let second: Vec<String> = inv.list(|_: &Vm| true, Page::new(1, 1)).map(|v| v.id).collect();
        assert_eq!(second, vec!["vm-2".to_owned()]);
    }

    #[tokio::test]
    async fn duplicate_names_are_ambiguous() {
        let store = seeded().await;
        let mut t = store.easy_transaction().await;
        NewRow::new(Vm {
            id: "vm-4".into(),
            name: "db-01".into(),
            ..Default::default()
        })
        .insert(&mut t)
        .unwrap();
        t.commit().unwrap();

        let snap = store.snapshot();
        let err = Inventory::new(&snap).find::<Vm>("db-01").unwrap_err();
        assert!(matches!(err, QueryError::Ambiguous { count: 2, .. }));
    }

    #[tokio::test]
    async fn workload_hydrates_host_cluster_and_datacenter() {
        let store = seeded().await;
        let snap = store.snapshot();
        let w = Inventory::new(&snap).workload("vm-2").unwrap();

        assert_eq!(w.vm.name, "web-02");
        assert_eq!(w.host.unwrap().name, "esx-01");
        assert_eq!(w.cluster.unwrap().name, "prod");
        assert_eq!(w.datacenter.unwrap().name, "dc1");
    }
}
