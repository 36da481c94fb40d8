// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

//! Block transfer agents.
//!
//! A mover copies source disks into destination volumes. Cold transfers run
//! once; warm transfers are driven checkpoint by checkpoint, the orchestrator
//! recording a new checkpoint on every volume before calling
//! [`DataMover::advance`].

use std::{collections::{BTreeMap, HashMap}, process::Stdio};

use async_trait::async_trait;
use config::MoverConfig;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{info, warn};
use uuid::Uuid;

use crate::builder::{DataVolume, VolumeSource};

#[derive(Debug, Error)]
pub enum MoverError {
    #[error("no data mover is configured")]
    NotConfigured,

    #[error("unknown transfer {0}")]
    UnknownTransfer(String),

    #[error("could not launch the data mover: {0}")]
    Launch(#[from] std::io::Error),

    #[error("volume {0} has no source to copy from")]
    NoSource(String),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct MoverStatus {
    /// `current` of the last checkpoint every volume finished copying
    pub checkpoint: Option<String>,
    /// Volumes finished with the current round
    pub completed: usize,
    pub total: usize,
    /// Nothing more will be copied: a cold copy or the final checkpoint is done
    pub done: bool,
    pub failed: Option<String>,
}

#[async_trait]
pub trait DataMover: Send + Sync {
    /// Starts copying into `volumes`, returning the transfer id
    async fn start(
        &self,
        volumes: &[DataVolume],
        secret: &BTreeMap<String, String>,
    ) -> Result<String, MoverError>;

    /// Copies the checkpoint last recorded on `volumes`
    async fn advance(&self, id: &str, volumes: &[DataVolume]) -> Result<(), MoverError>;

    async fn status(&self, id: &str) -> Result<MoverStatus, MoverError>;

    async fn cancel(&self, id: &str) -> Result<(), MoverError>;
}

struct Job {
    secret: BTreeMap<String, String>,
    checkpoint: Option<String>,
    last: bool,
    children: Vec<Child>,
    finished: usize,
    failed: Option<String>,
}

/// Runs the configured program once per volume and checkpoint.
///
/// Each run gets the transfer described in its environment (`MOVER_*`) and
/// is expected to exit non-zero on failure.
pub struct CommandMover {
    command: Vec<String>,
    jobs: Mutex<HashMap<String, Job>>,
}

impl CommandMover {
    pub fn new(cfg: &MoverConfig) -> Self {
        Self {
            command: cfg.command.clone(),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    fn spawn(
        &self,
        volume: &DataVolume,
        secret: &BTreeMap<String, String>,
    ) -> Result<Child, MoverError> {
        let (program, args) = self.command.split_first().ok_or(MoverError::NotConfigured)?;

        let VolumeSource::Vddk { url, thumbprint, uuid, backing_file, .. } = &volume.source else {
            return Err(MoverError::NoSource(volume.name.clone()));
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .env("MOVER_URL", url)
            .env("MOVER_THUMBPRINT", thumbprint)
            .env("MOVER_VM_UUID", uuid)
            .env("MOVER_BACKING_FILE", backing_file)
            .env("MOVER_DESTINATION", format!("{}/{}", volume.namespace, volume.name))
            .env("MOVER_CAPACITY", volume.capacity.to_string())
            .env("MOVER_FINAL", volume.final_checkpoint.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        if let Some(cp) = volume.checkpoints.last() {
            cmd.env("MOVER_PREVIOUS_CHECKPOINT", &cp.previous)
                .env("MOVER_CURRENT_CHECKPOINT", &cp.current);
        }
        for (k, v) in secret {
            cmd.env(format!("MOVER_SECRET_{}", k.to_uppercase()), v);
        }

        Ok(cmd.spawn()?)
    }

    fn launch(&self, job: &mut Job, volumes: &[DataVolume]) -> Result<(), MoverError> {
        let mut children = Vec::with_capacity(volumes.len());
        for v in volumes {
            children.push(self.spawn(v, &job.secret)?);
        }

        job.checkpoint = volumes
            .iter()
            .find_map(|v| v.checkpoints.last())
            .map(|c| c.current.clone());
        job.last = volumes.iter().all(|v| v.checkpoints.is_empty() || v.final_checkpoint);
        job.children = children;
        job.finished = 0;
        job.failed = None;
        Ok(())
    }
}

#[async_trait]
impl DataMover for CommandMover {
    async fn start(
        &self,
        volumes: &[DataVolume],
        secret: &BTreeMap<String, String>,
    ) -> Result<String, MoverError> {
        let id = Uuid::new_v4().to_string();
        let mut job = Job {
            secret: secret.clone(),
            checkpoint: None,
            last: false,
            children: Vec::new(),
            finished: 0,
            failed: None,
        };
        self.launch(&mut job, volumes)?;

        info!("Started transfer {id} of {} volumes", volumes.len());
        self.jobs.lock().insert(id.clone(), job);
        Ok(id)
    }

    async fn advance(&self, id: &str, volumes: &[DataVolume]) -> Result<(), MoverError> {
        let mut jobs = self.jobs.lock();
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| MoverError::UnknownTransfer(id.to_owned()))?;

        self.launch(job, volumes)
    }

    async fn status(&self, id: &str) -> Result<MoverStatus, MoverError> {
        let mut jobs = self.jobs.lock();
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| MoverError::UnknownTransfer(id.to_owned()))?;

        let total = job.children.len() + job.finished;
        let mut running = Vec::with_capacity(job.children.len());
        for mut child in job.children.drain(..) {
            match child.try_wait() {
                Ok(Some(exit)) if exit.success() => job.finished += 1,
                Ok(Some(exit)) => {
                    job.failed.get_or_insert_with(|| format!("data mover exited with {exit}"));
                }
                Ok(None) => running.push(child),
                Err(e) => {
                    warn!("Lost track of a data mover of transfer {id}: {e}");
                    job.failed.get_or_insert_with(|| e.to_string());
                }
            }
        }
        job.children = running;

        let round_done = job.children.is_empty() && job.failed.is_none();
        Ok(MoverStatus {
            checkpoint: if round_done { job.checkpoint.clone() } else { None },
            completed: job.finished,
            total,
            done: round_done && job.last,
            failed: job.failed.clone(),
        })
    }

    async fn cancel(&self, id: &str) -> Result<(), MoverError> {
        let Some(mut job) = self.jobs.lock().remove(id) else {
            return Ok(());
        };

        for child in &mut job.children {
            if let Err(e) = child.start_kill() {
                warn!("Could not stop a data mover of transfer {id}: {e}");
            }
        }
        info!("Cancelled transfer {id}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::Checkpoint;
    use std::time::Duration;

    fn volume(checkpoint: Option<(&str, &str)>, last: bool) -> DataVolume {
        DataVolume {
            name: "web-disk-0".into(),
            namespace: "migrated".into(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            source: VolumeSource::Vddk {
                url: "https://vcenter.example.com/sdk".into(),
                thumbprint: "AA:BB".into(),
                uuid: "422c6a2a-5ea9-1083-39f3-3b140fffb444".into(),
                backing_file: "[ds1] web/web.vmdk".into(),
                secret: "web-credentials".into(),
                init_image: None,
            },
            storage_class: "standard".into(),
            access_mode: None,
            volume_mode: None,
            capacity: 1 << 30,
            disk_index: 0,
            checkpoints: checkpoint
                .map(|(p, c)| vec![Checkpoint { previous: p.into(), current: c.into() }])
                .unwrap_or_default(),
            final_checkpoint: last,
        }
    }

    fn mover(cmd: &[&str]) -> CommandMover {
        CommandMover::new(&MoverConfig {
            command: cmd.iter().map(|s| s.to_string()).collect(),
        })
    }

    async fn settle(m: &CommandMover, id: &str) -> MoverStatus {
        for _ in 0..200 {
            let s = m.status(id).await.unwrap();
            if s.checkpoint.is_some() || s.done || s.failed.is_some() || s.completed == s.total {
                return s;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("transfer {id} never settled");
    }

    #[tokio::test]
    async fn cold_copy_finishes() {
        let m = mover(&["true"]);
        let id = m.start(&[volume(None, false)], &BTreeMap::new()).await.unwrap();
        let s = settle(&m, &id).await;
        assert!(s.done);
        assert_eq!(s.failed, None);
    }

    #[tokio::test]
    async fn warm_rounds_report_their_checkpoint() {
        let m = mover(&["true"]);
        let id = m
            .start(&[volume(Some(("", "snapshot-1")), false)], &BTreeMap::new())
            .await
            .unwrap();
        let s = settle(&m, &id).await;
        assert_eq!(s.checkpoint.as_deref(), Some("snapshot-1"));
        assert!(!s.done);

        m.advance(&id, &[volume(Some(("snapshot-1", "snapshot-2")), true)])
            .await
            .unwrap();
        let s = settle(&m, &id).await;
        assert_eq!(s.checkpoint.as_deref(), Some("snapshot-2"));
        assert!(s.done);
    }

    #[tokio::test]
    async fn failing_program_is_reported() {
        let m = mover(&["false"]);
        let id = m.start(&[volume(None, false)], &BTreeMap::new()).await.unwrap();
        let s = settle(&m, &id).await;
        assert!(s.failed.is_some());
        assert!(!s.done);
    }

    #[tokio::test]
    async fn unconfigured_mover_refuses_to_start() {
        let m = mover(&[]);
        let err = m.start(&[volume(None, false)], &BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err, MoverError::NotConfigured));
        assert!(matches!(m.status("nope").await, Err(MoverError::UnknownTransfer(_))));
    }
}
