// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

use std::{
    collections::{BTreeMap, BTreeSet},
    io::ErrorKind,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use config::DestinationConfig;
use models::migration::VmMigrationStatus;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info, warn};

use super::{Destination, DestinationError, TargetVm};
use crate::builder::{DataVolume, VmSpec};

const NAMESPACES: &str = "namespaces.yaml";
const SECRETS: &str = "secrets";
const VOLUMES: &str = "volumes";
const VMS: &str = "vms";
const MIGRATIONS: &str = "migrations";

#[derive(Default)]
struct State {
    namespaces: BTreeSet<String>,
    secrets: BTreeMap<String, BTreeMap<String, String>>,
    volumes: BTreeMap<String, DataVolume>,
    vms: BTreeMap<String, VmSpec>,
    statuses: BTreeMap<String, VmMigrationStatus>,
}

fn key(a: &str, b: &str) -> String {
    format!("{a}/{b}")
}

/// A destination kept in memory and, when given a directory, mirrored to
/// one file per object: YAML for resources, JSON for migration records.
pub struct LocalDestination {
    dir: Option<PathBuf>,
    state: Mutex<State>,
}

impl LocalDestination {
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            state: Mutex::new(State::default()),
        }
    }

    /// Opens `dir`, loading whatever an earlier run left there
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, DestinationError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let mut state = State::default();

        match tokio::fs::read_to_string(dir.join(NAMESPACES)).await {
            Ok(body) => state.namespaces = serde_yaml::from_str(&body)?,
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        for (k, v) in read_tree::<BTreeMap<String, String>>(&dir.join(SECRETS), Format::Yaml).await? {
            state.secrets.insert(k, v);
        }
        for (k, v) in read_tree::<DataVolume>(&dir.join(VOLUMES), Format::Yaml).await? {
            state.volumes.insert(k, v);
        }
        for (k, v) in read_tree::<VmSpec>(&dir.join(VMS), Format::Yaml).await? {
            state.vms.insert(k, v);
        }
        for (k, v) in read_tree::<VmMigrationStatus>(&dir.join(MIGRATIONS), Format::Json).await? {
            state.statuses.insert(k, v);
        }

        info!(
            "Loaded destination state from {}: {} volumes, {} vms, {} migration records",
            dir.display(),
            state.volumes.len(),
            state.vms.len(),
            state.statuses.len()
        );

        Ok(Self {
            dir: Some(dir),
            state: Mutex::new(state),
        })
    }

    pub async fn from_settings(cfg: &DestinationConfig) -> Result<Self, DestinationError> {
        match &cfg.state_dir {
            Some(dir) => Self::open(dir.clone()).await,
            None => Ok(Self::in_memory()),
        }
    }

    pub fn volumes(&self) -> Vec<DataVolume> {
        self.state.lock().volumes.values().cloned().collect()
    }

    pub fn vms(&self) -> Vec<VmSpec> {
        self.state.lock().vms.values().cloned().collect()
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<BTreeMap<String, String>> {
        self.state.lock().secrets.get(&key(namespace, name)).cloned()
    }

    async fn write<T: Serialize>(
        &self,
        rel: PathBuf,
        value: &T,
        format: Format,
    ) -> Result<(), DestinationError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };

        let body = match format {
            Format::Yaml => serde_yaml::to_string(value)?,
            Format::Json => serde_json::to_string_pretty(value)?,
        };

        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!("Wrote {}", path.display());
        Ok(())
    }

    async fn remove(&self, rel: PathBuf) -> Result<(), DestinationError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };

        match tokio::fs::remove_file(dir.join(rel)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Clone, Copy)]
enum Format {
    Yaml,
    Json,
}

impl Format {
    fn extension(self) -> &'static str {
        match self {
            Format::Yaml => "yaml",
            Format::Json => "json",
        }
    }
}

fn file(kind: &str, group: &str, name: &str, format: Format) -> PathBuf {
    Path::new(kind)
        .join(group)
        .join(format!("{name}.{}", format.extension()))
}

/// Reads `<root>/<group>/<name>.<ext>` files, keyed `group/name`
async fn read_tree<T: DeserializeOwned>(
    root: &Path,
    format: Format,
) -> Result<Vec<(String, T)>, DestinationError> {
    let mut out = Vec::new();

    let mut groups = match tokio::fs::read_dir(root).await {
        Ok(d) => d,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e.into()),
    };

    while let Some(group) = groups.next_entry().await? {
        if !group.file_type().await?.is_dir() {
            continue;
        }
        let group_name = group.file_name().to_string_lossy().into_owned();

        let mut files = tokio::fs::read_dir(group.path()).await?;
        while let Some(f) = files.next_entry().await? {
            let path = f.path();
            if path.extension().and_then(|e| e.to_str()) != Some(format.extension()) {
                continue;
            }
            let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
                continue;
            };

            let body = tokio::fs::read_to_string(&path).await?;
            let parsed = match format {
                Format::Yaml => serde_yaml::from_str(&body).map_err(DestinationError::from),
                Format::Json => serde_json::from_str(&body).map_err(DestinationError::from),
            };
            match parsed {
                Ok(v) => out.push((key(&group_name, &stem), v)),
                Err(e) => warn!("Skipping unreadable record {}: {e}", path.display()),
            }
        }
    }

    Ok(out)
}

#[async_trait]
impl Destination for LocalDestination {
    async fn ensure_namespace(&self, name: &str) -> Result<(), DestinationError> {
        let snapshot = {
            let mut state = self.state.lock();
            if !state.namespaces.insert(name.to_owned()) {
                return Ok(());
            }
            state.namespaces.clone()
        };

        info!("Created namespace {name}");
        self.write(PathBuf::from(NAMESPACES), &snapshot, Format::Yaml).await
    }

    async fn ensure_secret(
        &self,
        namespace: &str,
        name: &str,
        data: &BTreeMap<String, String>,
    ) -> Result<(), DestinationError> {
        {
            let mut state = self.state.lock();
            if !state.namespaces.contains(namespace) {
                return Err(DestinationError::not_found("namespace", namespace));
            }
            if state.secrets.get(&key(namespace, name)) == Some(data) {
                return Ok(());
            }
            state.secrets.insert(key(namespace, name), data.clone());
        }

        self.write(file(SECRETS, namespace, name, Format::Yaml), data, Format::Yaml)
            .await
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), DestinationError> {
        self.state.lock().secrets.remove(&key(namespace, name));
        self.remove(file(SECRETS, namespace, name, Format::Yaml)).await
    }

    async fn target_vms(&self) -> Result<Vec<TargetVm>, DestinationError> {
        Ok(self.state.lock().vms.values().map(TargetVm::from).collect())
    }

    async fn ensure_volume(&self, volume: &DataVolume) -> Result<(), DestinationError> {
        {
            let mut state = self.state.lock();
            if !state.namespaces.contains(&volume.namespace) {
                return Err(DestinationError::not_found("namespace", &volume.namespace));
            }
            let k = key(&volume.namespace, &volume.name);
            if state.volumes.get(&k) == Some(volume) {
                return Ok(());
            }
            if state.volumes.insert(k, volume.clone()).is_none() {
                info!("Created data volume {}/{}", volume.namespace, volume.name);
            }
        }

        self.write(
            file(VOLUMES, &volume.namespace, &volume.name, Format::Yaml),
            volume,
            Format::Yaml,
        )
        .await
    }

    async fn get_volume(&self, namespace: &str, name: &str) -> Result<DataVolume, DestinationError> {
        self.state
            .lock()
            .volumes
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| DestinationError::not_found("data volume", key(namespace, name)))
    }

    async fn delete_volume(&self, namespace: &str, name: &str) -> Result<(), DestinationError> {
        if self.state.lock().volumes.remove(&key(namespace, name)).is_some() {
            info!("Deleted data volume {namespace}/{name}");
        }
        self.remove(file(VOLUMES, namespace, name, Format::Yaml)).await
    }

    async fn apply_vm(&self, spec: &VmSpec) -> Result<(), DestinationError> {
        {
            let mut state = self.state.lock();
            if !state.namespaces.contains(&spec.namespace) {
                return Err(DestinationError::not_found("namespace", &spec.namespace));
            }
            for v in &spec.volumes {
                if !state.volumes.contains_key(&key(&spec.namespace, &v.claim_name)) {
                    return Err(DestinationError::not_found(
                        "data volume",
                        key(&spec.namespace, &v.claim_name),
                    ));
                }
            }
            state.vms.insert(key(&spec.namespace, &spec.name), spec.clone());
        }

        info!("Applied virtual machine {}/{}", spec.namespace, spec.name);
        self.write(file(VMS, &spec.namespace, &spec.name, Format::Yaml), spec, Format::Yaml)
            .await
    }

    async fn delete_vm(&self, namespace: &str, name: &str) -> Result<(), DestinationError> {
        if self.state.lock().vms.remove(&key(namespace, name)).is_some() {
            info!("Deleted virtual machine {namespace}/{name}");
        }
        self.remove(file(VMS, namespace, name, Format::Yaml)).await
    }

    async fn save_status(&self, status: &VmMigrationStatus) -> Result<(), DestinationError> {
        self.state
            .lock()
            .statuses
            .insert(key(&status.plan, &status.vm), status.clone());

        self.write(
            file(MIGRATIONS, &status.plan, &status.vm, Format::Json),
            status,
            Format::Json,
        )
        .await
    }

    async fn load_status(
        &self,
        plan: &str,
        vm: &str,
    ) -> Result<Option<VmMigrationStatus>, DestinationError> {
        Ok(self.state.lock().statuses.get(&key(plan, vm)).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::VolumeSource;
    use models::migration::Phase;
    use pretty_assertions::assert_eq;

    fn volume(name: &str) -> DataVolume {
        DataVolume {
            name: name.into(),
            namespace: "migrated".into(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            source: VolumeSource::Blank,
            storage_class: "standard".into(),
            access_mode: None,
            volume_mode: None,
            capacity: 1 << 30,
            disk_index: 0,
            checkpoints: Vec::new(),
            final_checkpoint: false,
        }
    }

    #[tokio::test]
    async fn ensure_is_idempotent() {
        let dest = LocalDestination::in_memory();

        dest.ensure_namespace("migrated").await.unwrap();
        dest.ensure_namespace("migrated").await.unwrap();

        let v = volume("web-disk-0");
        dest.ensure_volume(&v).await.unwrap();
        let first = dest.volumes();
        dest.ensure_volume(&v).await.unwrap();
        assert_eq!(dest.volumes(), first);
        assert_eq!(first.len(), 1);

        let data = BTreeMap::from([("accessKeyId".to_owned(), "root".to_owned())]);
        dest.ensure_secret("migrated", "creds", &data).await.unwrap();
        dest.ensure_secret("migrated", "creds", &data).await.unwrap();
        assert_eq!(dest.secret("migrated", "creds"), Some(data));

        dest.delete_volume("migrated", "web-disk-0").await.unwrap();
        dest.delete_volume("migrated", "web-disk-0").await.unwrap();
        assert!(dest.volumes().is_empty());
    }

    #[tokio::test]
    async fn missing_objects_are_retryable() {
        let dest = LocalDestination::in_memory();

        let err = dest.get_volume("migrated", "nope").await.unwrap_err();
        assert!(err.is_retryable());

        let err = dest.ensure_volume(&volume("x")).await.unwrap_err();
        assert!(matches!(err, DestinationError::NotFound { kind: "namespace", .. }));
    }

    #[tokio::test]
    async fn state_survives_reopening() {
        let dir = tempfile::tempdir().unwrap();

        {
            let dest = LocalDestination::open(dir.path()).await.unwrap();
            dest.ensure_namespace("migrated").await.unwrap();
            dest.ensure_volume(&volume("db-disk-0")).await.unwrap();
            dest.ensure_volume(&volume("db-disk-1")).await.unwrap();
            dest.delete_volume("migrated", "db-disk-1").await.unwrap();

            let mut status = VmMigrationStatus::new("plan-1", "vm-16", "db", "db", false);
            status.phase = Phase::ColdCopy;
            dest.save_status(&status).await.unwrap();
        }

        let dest = LocalDestination::open(dir.path()).await.unwrap();
        let names: Vec<_> = dest.volumes().into_iter().map(|v| v.name).collect();
        assert_eq!(names, vec!["db-disk-0"]);

        let status = dest.load_status("plan-1", "vm-16").await.unwrap().unwrap();
        assert_eq!(status.phase, Phase::ColdCopy);
        assert!(dest.load_status("plan-1", "vm-17").await.unwrap().is_none());

        // namespace survived too, so creating into it works straight away
        dest.ensure_volume(&volume("db-disk-2")).await.unwrap();
    }
}
