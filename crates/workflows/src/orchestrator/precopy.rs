// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

//! Warm migration: snapshot, copy the changed blocks, repeat until cutover.

use std::collections::BTreeMap;

use chrono::Utc;
use client::{SdkError, TaskState};
use models::migration::{Phase, Precopy, Progress, StepName, Token};
use tokio::{sync::watch, time::Instant};
use tracing::{debug, info};

use super::{machine::Machine, MigrationError};
use crate::{
    builder::{Checkpoint, ANN_CHANGE_ID},
    mover::MoverError,
};

/// Where an interrupted precopy picks up, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Stage {
    Snapshot,
    Checkpoint,
    Transfer,
    Remove,
}

impl Stage {
    fn of(token: Option<&Token>) -> Self {
        match token {
            Some(Token::CreateSnapshot { .. }) => Stage::Checkpoint,
            Some(Token::Transfer { .. }) => Stage::Transfer,
            Some(Token::RemoveSnapshot { .. }) => Stage::Remove,
            _ => Stage::Snapshot,
        }
    }
}

impl Machine {
    pub(super) async fn precopy_loop(&mut self) -> Result<(), MigrationError> {
        self.status.start_step(StepName::DiskTransfer);
        self.prepare_destination().await?;

        loop {
            let resuming = self.status.token.is_some();
            if !resuming && !self.status.precopies.is_empty() && !self.next_precopy_due().await? {
                break;
            }
            self.precopy(false).await?;
        }

        self.transition(Phase::Cutover).await
    }

    pub(super) async fn cutover(&mut self) -> Result<(), MigrationError> {
        self.status.start_step(StepName::Cutover);

        let final_copied = self
            .status
            .last_precopy()
            .is_some_and(|p| p.last && p.ended.is_some())
            && self.status.token.is_none();

        if !final_copied {
            let in_progress = matches!(
                self.status.token,
                Some(Token::CreateSnapshot { .. } | Token::Transfer { .. } | Token::RemoveSnapshot { .. })
            );
            if !in_progress {
                self.power_off(false).await?;
            }
            self.precopy(true).await?;
        }

        self.status.complete_step(StepName::DiskTransfer);
        self.status.complete_step(StepName::Cutover);
        self.transition(Phase::ConvertGuest).await
    }

    fn cutover_due(&self, requested: &watch::Receiver<bool>) -> bool {
        *requested.borrow() || self.m.plan.cutover.is_some_and(|at| at <= Utc::now())
    }

    /// Sleeps until the next precopy, returns false when cutover is due instead
    async fn next_precopy_due(&self) -> Result<bool, MigrationError> {
        let mut requested = self.m.cutover_requested();
        if self.cutover_due(&requested) {
            return Ok(false);
        }

        let mut wait = self.m.settings.migration.precopy_interval();
        if let Some(at) = self.m.plan.cutover {
            wait = wait.min((at - Utc::now()).to_std().unwrap_or_default());
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(MigrationError::Cancelled),
            _ = requested.wait_for(|r| *r) => {}
            _ = tokio::time::sleep(wait) => {}
        }
        Ok(!self.cutover_due(&requested))
    }

    /// One snapshot and delta copy.
    ///
    /// `last` marks the cutover copy: the mover finishes the volumes and the
    /// snapshot is removed along with its predecessor.
    pub(super) async fn precopy(&mut self, last: bool) -> Result<(), MigrationError> {
        let m = self.m.clone();
        let stage = Stage::of(self.status.token.as_ref());

        if stage <= Stage::Snapshot {
            let task_id = self.guard(m.source.create_snapshot(&self.target)).await?;
            self.status.precopies.push(Precopy {
                snapshot_id: None,
                create_task_id: task_id.clone(),
                remove_task_id: None,
                deltas: BTreeMap::new(),
                started: Utc::now(),
                ended: None,
                last,
            });
            self.set_token(Token::CreateSnapshot { task_id }).await?;
        }

        if stage <= Stage::Checkpoint {
            let task_id = self.current()?.create_task_id.clone();
            let snapshot = self.wait_task(&task_id).await?.ok_or_else(|| {
                MigrationError::Internal(format!("snapshot task {task_id} finished without a snapshot"))
            })?;
            info!(vm = %self.status.vm, "Created snapshot {snapshot}");
            self.current_mut()?.snapshot_id = Some(snapshot.clone());
            self.persist().await?;

            let deltas = self
                .guard(m.source.snapshot_deltas(&self.target, &snapshot))
                .await?;
            let previous = self.previous_snapshot().unwrap_or_default();
            let mover_id = self.checkpoint(&previous, &snapshot, &deltas, last).await?;

            self.current_mut()?.deltas = deltas;
            self.set_token(Token::Transfer {
                mover_id,
                checkpoint: Some(snapshot),
            })
            .await?;
        }

        if stage <= Stage::Transfer {
            let Some(Token::Transfer { mover_id, checkpoint }) = self.status.token.clone() else {
                return Err(MigrationError::Internal("precopy lost track of its transfer".to_owned()));
            };
            self.wait_mover(&mover_id, checkpoint.as_deref(), last).await?;
            self.current_mut()?.ended = Some(Utc::now());
        }

        self.remove_consumed(last).await?;

        self.status.warm.successes += 1;
        self.status.warm.consecutive_failures = 0;
        self.status.token = None;
        debug!(vm = %self.status.vm, "Precopy {} done", self.status.precopies.len());
        self.persist().await
    }

    fn current(&self) -> Result<&Precopy, MigrationError> {
        self.status
            .last_precopy()
            .ok_or_else(|| MigrationError::Internal("no precopy in progress".to_owned()))
    }

    fn current_mut(&mut self) -> Result<&mut Precopy, MigrationError> {
        self.status
            .last_precopy_mut()
            .ok_or_else(|| MigrationError::Internal("no precopy in progress".to_owned()))
    }

    fn previous_snapshot(&self) -> Option<String> {
        let precopies = &self.status.precopies;
        precopies
            .len()
            .checked_sub(2)
            .and_then(|i| precopies[i].snapshot_id.clone())
    }

    /// Records the checkpoint on every volume and hands it to the mover,
    /// starting the transfer on the first one
    async fn checkpoint(
        &mut self,
        previous: &str,
        current: &str,
        deltas: &BTreeMap<String, String>,
        last: bool,
    ) -> Result<String, MigrationError> {
        let m = self.m.clone();
        let mut volumes = self.volumes().await?;

        for v in &mut volumes {
            if v.checkpoints.last().map(|c| c.current.as_str()) != Some(current) {
                v.checkpoints.push(Checkpoint {
                    previous: previous.to_owned(),
                    current: current.to_owned(),
                });
            }
            v.final_checkpoint = last;
            if let Some(change_id) = v.disk_source().and_then(|d| deltas.get(&d)) {
                v.annotations.insert(ANN_CHANGE_ID.to_owned(), change_id.clone());
            }
            self.guard(m.destination.ensure_volume(v)).await?;
        }

        match self.status.mover_id.clone() {
            Some(id) => {
                self.guard(m.mover.advance(&id, &volumes)).await?;
                Ok(id)
            }
            None => {
                let secret = self.source_secret()?;
                let id = self.guard(m.mover.start(&volumes, &secret)).await?;
                info!(vm = %self.status.vm, "Started transfer {id}");
                self.status.mover_id = Some(id.clone());
                Ok(id)
            }
        }
    }

    /// Removes every snapshot this migration still owns except the newest,
    /// which the next precopy diffs against. The last precopy removes all.
    async fn remove_consumed(&mut self, last: bool) -> Result<(), MigrationError> {
        let m = self.m.clone();

        if let Some(Token::RemoveSnapshot { task_id, snapshot_id }) = self.status.token.clone() {
            self.wait_task(&task_id).await?;
            self.snapshot_removed(&snapshot_id, task_id);
            info!(vm = %self.status.vm, "Removed snapshot {snapshot_id}");
        }

        let keep = if last {
            None
        } else {
            self.current()?.snapshot_id.clone()
        };

        for snapshot in self.status.owned_snapshots() {
            if keep.as_ref() == Some(&snapshot) {
                continue;
            }

            let task_id = self
                .guard(m.source.remove_snapshot(&self.target, &snapshot, false))
                .await?;
            self.set_token(Token::RemoveSnapshot {
                task_id: task_id.clone(),
                snapshot_id: snapshot.clone(),
            })
            .await?;

            self.wait_task(&task_id).await?;
            self.snapshot_removed(&snapshot, task_id);
            info!(vm = %self.status.vm, "Removed snapshot {snapshot}");
        }
        Ok(())
    }

    /// Marks `snapshot` as no longer owned, once its remove task is known
    pub(super) fn snapshot_removed(&mut self, snapshot: &str, task_id: String) {
        if let Some(p) = self
            .status
            .precopies
            .iter_mut()
            .find(|p| p.snapshot_id.as_deref() == Some(snapshot))
        {
            p.remove_task_id = Some(task_id);
        }
    }

    /// Polls a source task, returning its result
    pub(super) async fn wait_task(&self, task_id: &str) -> Result<Option<String>, MigrationError> {
        let cfg = &self.m.settings.migration;
        let deadline = Instant::now() + cfg.sdk_timeout();

        loop {
            match self.guard(self.m.source.check_task(&self.target, task_id)).await? {
                TaskState::Success(result) => return Ok(result),
                TaskState::Error(message) => return Err(SdkError::TaskFailed(message).into()),
                TaskState::Pending if Instant::now() >= deadline => {
                    return Err(SdkError::Timeout(cfg.sdk_timeout()).into())
                }
                TaskState::Pending => self.pause(cfg.task_poll()).await?,
            }
        }
    }

    /// Polls the mover until `checkpoint` is copied, or until it is done
    pub(super) async fn wait_mover(
        &mut self,
        id: &str,
        checkpoint: Option<&str>,
        until_done: bool,
    ) -> Result<(), MigrationError> {
        let m = self.m.clone();

        loop {
            let status = match self.guard(m.mover.status(id)).await {
                Err(MigrationError::Mover(MoverError::UnknownTransfer(id))) => {
                    // lost with a restart, the next attempt starts it over
                    self.status.mover_id = None;
                    self.status.token = None;
                    return Err(MoverError::UnknownTransfer(id).into());
                }
                r => r?,
            };

            if let Some(reason) = status.failed {
                return Err(MigrationError::Transfer(reason));
            }
            if let Some(step) = self.status.step_mut(StepName::DiskTransfer) {
                step.progress = Progress {
                    completed: status.completed as i64,
                    total: status.total as i64,
                };
            }

            let reached = checkpoint.map_or(true, |c| status.checkpoint.as_deref() == Some(c));
            if reached && (status.done || !until_done) {
                return Ok(());
            }
            self.pause(m.settings.migration.mover_poll()).await?;
        }
    }
}
