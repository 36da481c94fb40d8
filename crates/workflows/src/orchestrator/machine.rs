// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

use std::{collections::BTreeMap, future::Future, sync::Arc, time::Duration};

use client::VmTarget;
use dal::Snapshot;
use models::{
    inventory::Vm,
    migration::{Failure, Phase, PowerState, StepName, StepPhase, Token, VmMigrationStatus},
    plan::{PlanVm, TargetPowerState},
};
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{vm_key, MigrationError, Migrator};
use crate::{
    builder::{converter_transfers, osmap, target_name, Builder, DataVolume},
    conversion,
    validator::{Check, Validator},
};

/// Drives one VM through its phases.
///
/// Each call to [`Machine::advance`] performs the work of the current phase
/// and moves to the next one. The status is saved whenever a token is set or
/// cleared, so every wait can be resumed from the record alone.
pub(super) struct Machine {
    pub(super) m: Arc<Migrator>,
    pub(super) status: VmMigrationStatus,
    pub(super) plan_vm: PlanVm,
    pub(super) target: VmTarget,
    pub(super) cancel: CancellationToken,
}

fn target_of(vm: &Vm) -> VmTarget {
    VmTarget {
        id: vm.id.clone(),
        uuid: vm.uuid.clone(),
        host: vm.host.as_ref().map(|h| h.id.clone()),
    }
}

pub(super) fn builder<'a>(m: &'a Migrator, view: &'a Snapshot) -> Builder<'a, Snapshot> {
    Builder::new(
        &m.plan,
        &m.provider,
        m.fingerprint.clone(),
        view,
        &m.settings.conversion,
        m.settings.local,
    )
}

fn lookup(m: &Migrator, view: &Snapshot, plan_vm: &PlanVm) -> Result<Vm, MigrationError> {
    Validator::new(&m.plan, view, &[])
        .resolve(plan_vm)?
        .ok_or_else(|| MigrationError::VmNotFound(vm_key(plan_vm)))
}

/// Records a VM that could not even start migrating
pub(super) async fn rejected(m: &Migrator, plan_vm: &PlanVm, e: MigrationError) -> VmMigrationStatus {
    let key = vm_key(plan_vm);
    error!(vm = %key, "Migration could not start: {e}");

    let name = plan_vm.name.clone().unwrap_or_else(|| key.clone());
    let target = plan_vm.target_name.clone().unwrap_or_else(|| name.clone());
    let mut status = VmMigrationStatus::new(&m.plan.id, &key, &name, &target, m.plan.warm);

    let phase = if e.is_internal() { Phase::Error } else { Phase::Failed };
    status.terminate(
        phase,
        Some(Failure {
            phase: Phase::Started,
            step: None,
            message: e.to_string(),
            reasons: e.reasons(),
        }),
    );

    if let Err(e) = m.destination.save_status(&status).await {
        error!(vm = %key, "Could not record the rejected migration: {e}");
    }
    status
}

impl Machine {
    /// Loads the VM's record, or starts a fresh one, once the inventory is
    /// in sync with the source
    pub(super) async fn start(
        m: Arc<Migrator>,
        plan_vm: PlanVm,
        cancel: CancellationToken,
    ) -> Result<Self, MigrationError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(MigrationError::Cancelled),
            _ = m.store.wait_for_parity() => {}
        }

        let view = m.store.snapshot();
        let vm = lookup(&m, &view, &plan_vm)?;

        let status = match m
            .destination
            .load_status(&m.plan.id, &vm.id)
            .await
            .map_err(MigrationError::Persistence)?
        {
            Some(status) => {
                info!(vm = %vm.id, phase = %status.phase, "Resuming migration");
                status
            }
            None => VmMigrationStatus::new(
                &m.plan.id,
                &vm.id,
                &vm.name,
                &target_name(Some(&plan_vm), &vm),
                m.plan.warm,
            ),
        };

        Ok(Self {
            target: target_of(&vm),
            m,
            status,
            plan_vm,
            cancel,
        })
    }

    /// Runs until the migration reaches a terminal phase
    pub(super) async fn run(mut self) -> VmMigrationStatus {
        let mut attempts = 0;

        while !self.status.phase.is_terminal() {
            let result = if self.cancel.is_cancelled() {
                Err(MigrationError::Cancelled)
            } else {
                self.advance().await
            };

            let spent = if self.status.phase == Phase::PrecopyLoop {
                self.status.warm.consecutive_failures as usize
            } else {
                attempts
            };

            match result {
                Ok(()) => attempts = 0,
                Err(MigrationError::Cancelled) => self.cancelled().await,
                Err(e) if e.is_retryable() && spent < self.m.settings.migration.retry_count => {
                    attempts += 1;
                    self.retry_later(e, attempts).await;
                }
                Err(e) => self.fail(e).await,
            }
        }

        self.status
    }

    pub(super) async fn advance(&mut self) -> Result<(), MigrationError> {
        match self.status.phase {
            Phase::Started => self.validate().await,
            Phase::Validated => self.sample_power().await,
            Phase::PowerSampled if self.m.plan.warm => self.transition(Phase::PrecopyLoop).await,
            Phase::PowerSampled => self.transition(Phase::ColdCopy).await,
            Phase::PrecopyLoop => self.precopy_loop().await,
            Phase::ColdCopy => self.cold_copy().await,
            Phase::Cutover => self.cutover().await,
            Phase::ConvertGuest => self.convert_guest().await,
            Phase::TargetVmCreated => self.finish().await,
            Phase::Completed | Phase::Failed | Phase::Error | Phase::Cancelled => Ok(()),
        }
    }

    pub(super) async fn persist(&mut self) -> Result<(), MigrationError> {
        self.m
            .destination
            .save_status(&self.status)
            .await
            .map_err(MigrationError::Persistence)
    }

    pub(super) async fn set_token(&mut self, token: Token) -> Result<(), MigrationError> {
        self.status.token = Some(token);
        self.persist().await
    }

    pub(super) async fn transition(&mut self, phase: Phase) -> Result<(), MigrationError> {
        info!(vm = %self.status.vm, "{} -> {}", self.status.phase, phase);
        self.status.phase = phase;
        self.status.token = None;
        self.persist().await
    }

    /// Awaits `fut` unless the migration is cancelled first
    pub(super) async fn guard<T, E>(
        &self,
        fut: impl Future<Output = Result<T, E>>,
    ) -> Result<T, MigrationError>
    where
        MigrationError: From<E>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(MigrationError::Cancelled),
            r = fut => Ok(r?),
        }
    }

    pub(super) async fn pause(&self, d: Duration) -> Result<(), MigrationError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(MigrationError::Cancelled),
            _ = sleep(d) => Ok(()),
        }
    }

    async fn retry_later(&mut self, e: MigrationError, attempt: usize) {
        let cfg = &self.m.settings.migration;
        warn!(vm = %self.status.vm, phase = %self.status.phase, "Attempt {attempt} failed, retrying: {e}");

        self.status.record_error(e.to_string(), cfg.recent_error_limit);
        if matches!(self.status.phase, Phase::PrecopyLoop | Phase::Cutover) {
            self.status.warm.failures += 1;
            self.status.warm.consecutive_failures += 1;
        }

        let backoff = cfg.task_poll() * 2u32.pow(attempt.min(6) as u32);
        if let Err(e) = self.persist().await {
            warn!(vm = %self.status.vm, "Could not record the failed attempt: {e}");
        }
        if self.pause(backoff).await.is_err() {
            self.cancelled().await;
        }
    }

    async fn fail(&mut self, e: MigrationError) {
        error!(vm = %self.status.vm, phase = %self.status.phase, "Migration failed: {e}");

        let failure = Failure {
            phase: self.status.phase,
            step: self.status.running_step(),
            message: e.to_string(),
            reasons: e.reasons(),
        };
        self.release().await;

        let phase = if e.is_internal() { Phase::Error } else { Phase::Failed };
        self.status.terminate(phase, Some(failure));
        self.save_final().await;
    }

    async fn cancelled(&mut self) {
        info!(vm = %self.status.vm, phase = %self.status.phase, "Cancelling migration");

        self.release().await;
        self.remove_created().await;
        self.status.terminate(Phase::Cancelled, None);
        self.save_final().await;
    }

    async fn save_final(&mut self) {
        if let Err(e) = self.persist().await {
            error!(vm = %self.status.vm, "Could not record the outcome of the migration: {e}");
        }
    }

    /// Gives back what the migration holds on the source: the transfer,
    /// its snapshots and, unless the target took over, the VM's power.
    ///
    /// Runs after cancellation, so nothing here waits on the cancel token.
    async fn release(&mut self) {
        let m = self.m.clone();
        let limit = m.settings.migration.sdk_timeout();

        if let Some(id) = &self.status.mover_id {
            if let Err(e) = m.mover.cancel(id).await {
                warn!(vm = %self.status.vm, "Could not stop transfer {id}: {e}");
            }
        }

        for snapshot in self.status.owned_snapshots() {
            match timeout(limit, m.source.remove_snapshot(&self.target, &snapshot, false)).await {
                Ok(Ok(task)) => {
                    info!(vm = %self.status.vm, "Removing snapshot {snapshot}");
                    self.snapshot_removed(&snapshot, task);
                }
                Ok(Err(e)) => warn!(vm = %self.status.vm, "Could not remove snapshot {snapshot}: {e}"),
                Err(_) => warn!(vm = %self.status.vm, "Removing snapshot {snapshot} timed out"),
            }
        }

        if self.status.initial_power_state != Some(PowerState::On)
            || self.status.phase == Phase::TargetVmCreated
        {
            return;
        }
        match timeout(limit, m.source.power_state(&self.target)).await {
            Ok(Ok(PowerState::Off)) => {
                info!(vm = %self.status.vm, "Powering the source VM back on");
                match timeout(limit, m.source.power_on(&self.target)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(vm = %self.status.vm, "Could not power the source back on: {e}"),
                    Err(_) => warn!(vm = %self.status.vm, "Powering the source back on timed out"),
                }
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(vm = %self.status.vm, "Could not read the source power state: {e}"),
            Err(_) => warn!(vm = %self.status.vm, "Reading the source power state timed out"),
        }
    }

    /// Deletes what the migration created on the destination
    async fn remove_created(&mut self) {
        let m = self.m.clone();
        let namespace = &m.plan.target_namespace;

        if self.status.phase == Phase::TargetVmCreated
            || self.status.token == Some(Token::CreateTarget)
        {
            if let Err(e) = m.destination.delete_vm(namespace, &self.status.target_name).await {
                warn!(vm = %self.status.vm, "Could not delete the target VM: {e}");
            }
        }

        let mut kept = Vec::new();
        for name in std::mem::take(&mut self.status.volumes) {
            if let Err(e) = m.destination.delete_volume(namespace, &name).await {
                warn!(vm = %self.status.vm, "Could not delete data volume {name}: {e}");
                kept.push(name);
            }
        }
        self.status.volumes = kept;

        if let Some(secret) = self.status.secret.take() {
            if let Err(e) = m.destination.delete_secret(namespace, &secret).await {
                warn!(vm = %self.status.vm, "Could not delete secret {secret}: {e}");
                self.status.secret = Some(secret);
            }
        }
    }

    async fn validate(&mut self) -> Result<(), MigrationError> {
        let m = self.m.clone();
        self.status.start_step(StepName::Initialize);

        let destination_vms = self.guard(m.destination.target_vms()).await?;
        let view = m.store.snapshot();
        let checks = Validator::new(&m.plan, &view, &destination_vms).validate_vm(&self.plan_vm)?;

        for c in checks.iter().filter(|c| !c.ok && !c.reason.is_blocking()) {
            warn!(vm = %self.status.vm, reason = %c.reason, "{}", c.message);
        }
        let blocking: Vec<Check> = checks.into_iter().filter(Check::is_blocking_failure).collect();
        if !blocking.is_empty() {
            return Err(MigrationError::Validation(blocking));
        }

        // the VM may have moved hosts since the task started
        self.target = target_of(&lookup(&m, &view, &self.plan_vm)?);
        self.transition(Phase::Validated).await
    }

    async fn sample_power(&mut self) -> Result<(), MigrationError> {
        let m = self.m.clone();
        let state = self.guard(m.source.power_state(&self.target)).await?;
        let initial = *self.status.initial_power_state.get_or_insert(state);
        debug!(vm = %self.status.vm, "Source VM was {initial} before migrating");

        self.status.complete_step(StepName::Initialize);
        self.transition(Phase::PowerSampled).await
    }

    /// Creates the namespace, credentials and data volumes, once
    pub(super) async fn prepare_destination(&mut self) -> Result<(), MigrationError> {
        if !self.status.volumes.is_empty() {
            return Ok(());
        }

        let m = self.m.clone();
        let view = m.store.snapshot();
        let vm = lookup(&m, &view, &self.plan_vm)?;
        let builder = builder(&m, &view);
        let namespace = &m.plan.target_namespace;

        self.guard(m.destination.ensure_namespace(namespace)).await?;

        let secret_name = format!("{}-source", self.status.target_name);
        let secret = builder.secret(&vm)?;
        self.guard(m.destination.ensure_secret(namespace, &secret_name, &secret)).await?;
        self.status.secret = Some(secret_name.clone());

        let volumes = builder.volumes(&vm, &secret_name)?;
        for v in &volumes {
            self.guard(m.destination.ensure_volume(v)).await?;
        }
        info!(vm = %vm.id, "Created {} data volumes in {namespace}", volumes.len());

        self.status.volumes = volumes.iter().map(|v| v.name.clone()).collect();
        if let Some(step) = self.status.step_mut(StepName::DiskTransfer) {
            step.progress.total = volumes.len() as i64;
        }
        self.persist().await
    }

    pub(super) async fn volumes(&self) -> Result<Vec<DataVolume>, MigrationError> {
        let mut out = Vec::with_capacity(self.status.volumes.len());
        for name in &self.status.volumes {
            out.push(
                self.guard(self.m.destination.get_volume(&self.m.plan.target_namespace, name))
                    .await?,
            );
        }
        Ok(out)
    }

    /// Credentials handed to the data mover
    pub(super) fn source_secret(&self) -> Result<BTreeMap<String, String>, MigrationError> {
        let view = self.m.store.snapshot();
        let vm = lookup(&self.m, &view, &self.plan_vm)?;
        Ok(builder(&self.m, &view).secret(&vm)?)
    }

    /// Shuts the source down and waits for it to stop.
    ///
    /// A strict power off fails the migration when the VM will not stop; a
    /// lenient one logs and carries on.
    pub(super) async fn power_off(&mut self, strict: bool) -> Result<(), MigrationError> {
        let m = self.m.clone();
        let cfg = &m.settings.migration;

        if self.status.token != Some(Token::PowerOff) {
            match self.guard(m.source.power_off(&self.target)).await {
                Ok(()) => {}
                Err(e) if strict || matches!(e, MigrationError::Cancelled) => return Err(e),
                Err(e) => {
                    warn!(vm = %self.status.vm, "Shutdown failed, cutting over anyway: {e}");
                    return Ok(());
                }
            }
            self.set_token(Token::PowerOff).await?;
        }

        let deadline = Instant::now() + cfg.power_off_timeout();
        loop {
            match self.guard(m.source.powered_off(&self.target)).await {
                Ok(true) => {
                    info!(vm = %self.status.vm, "Source VM is powered off");
                    return Ok(());
                }
                Ok(false) => {}
                Err(e) if strict || matches!(e, MigrationError::Cancelled) => return Err(e),
                Err(e) => {
                    warn!(vm = %self.status.vm, "Could not confirm shutdown, cutting over anyway: {e}");
                    return Ok(());
                }
            }

            if Instant::now() >= deadline {
                if strict {
                    return Err(MigrationError::Timeout("source power off", cfg.power_off_timeout()));
                }
                warn!(vm = %self.status.vm, "Source VM still running after {:?}, cutting over anyway", cfg.power_off_timeout());
                return Ok(());
            }
            self.pause(cfg.task_poll()).await?;
        }
    }

    async fn cold_copy(&mut self) -> Result<(), MigrationError> {
        self.status.start_step(StepName::DiskTransfer);

        if !matches!(self.status.token, Some(Token::Transfer { .. })) {
            self.power_off(true).await?;
            self.prepare_destination().await?;
        }

        if converter_transfers(&self.m.plan, self.m.settings.local) {
            debug!(vm = %self.status.vm, "Disks are copied during guest conversion");
        } else {
            self.copy_disks().await?;
        }

        self.status.complete_step(StepName::DiskTransfer);
        self.transition(Phase::ConvertGuest).await
    }

    async fn copy_disks(&mut self) -> Result<(), MigrationError> {
        let m = self.m.clone();
        let mover_id = match self.status.mover_id.clone() {
            Some(id) => id,
            None => {
                let volumes = self.volumes().await?;
                let secret = self.source_secret()?;
                let id = self.guard(m.mover.start(&volumes, &secret)).await?;
                info!(vm = %self.status.vm, "Started transfer {id}");
                self.status.mover_id = Some(id.clone());
                id
            }
        };

        self.set_token(Token::Transfer {
            mover_id: mover_id.clone(),
            checkpoint: None,
        })
        .await?;
        self.wait_mover(&mover_id, None, true).await
    }

    async fn convert_guest(&mut self) -> Result<(), MigrationError> {
        let converted = self
            .status
            .step(StepName::ImageConversion)
            .is_some_and(|s| s.phase == StepPhase::Completed);
        if !converted {
            self.convert().await?;
        }
        self.create_target().await
    }

    async fn convert(&mut self) -> Result<(), MigrationError> {
        let m = self.m.clone();
        let view = m.store.snapshot();
        let vm = lookup(&m, &view, &self.plan_vm)?;
        self.status.start_step(StepName::ImageConversion);

        let osinfo = if m.plan.skip_guest_conversion {
            info!(vm = %vm.id, "Skipping guest conversion");
            osmap::osinfo_for_guest(&vm.guest_id).to_owned()
        } else {
            let env = builder(&m, &view).environment(&vm)?;
            self.set_token(Token::Conversion).await?;

            let volumes = self.volumes().await?;
            let inspection = self
                .guard(m.converter.convert(&env, &volumes, self.cancel.child_token()))
                .await?;

            let os = conversion::operating_system(&inspection);
            info!(vm = %vm.id, "Converted guest, operating system {}", os.as_deref().unwrap_or("unknown"));
            self.status.operating_system = os.clone();
            os.unwrap_or_else(|| osmap::osinfo_for_guest(&vm.guest_id).to_owned())
        };

        self.status.preference = osmap::preference_for(&osinfo, &m.settings.conversion.os_preferences);
        self.status.complete_step(StepName::ImageConversion);
        self.status.token = None;
        self.persist().await
    }

    async fn create_target(&mut self) -> Result<(), MigrationError> {
        let m = self.m.clone();
        let view = m.store.snapshot();
        let vm = lookup(&m, &view, &self.plan_vm)?;

        self.status.start_step(StepName::VirtualMachineCreation);
        self.set_token(Token::CreateTarget).await?;

        let destination_vms = self.guard(m.destination.target_vms()).await?;
        let volumes = self.volumes().await?;
        let running = match m.plan.target_power_state {
            TargetPowerState::On => true,
            TargetPowerState::Off => false,
            TargetPowerState::Auto => self.status.initial_power_state == Some(PowerState::On),
        };

        let spec = builder(&m, &view).virtual_machine(
            &vm,
            &volumes,
            &destination_vms,
            self.status.preference.clone(),
            running,
        )?;
        self.guard(m.destination.apply_vm(&spec)).await?;
        info!(vm = %vm.id, "Created target VM {}/{}", spec.namespace, spec.name);

        self.status.complete_step(StepName::VirtualMachineCreation);
        self.transition(Phase::TargetVmCreated).await
    }

    async fn finish(&mut self) -> Result<(), MigrationError> {
        let m = self.m.clone();

        if let Some(secret) = self.status.secret.clone() {
            self.guard(m.destination.delete_secret(&m.plan.target_namespace, &secret))
                .await?;
            self.status.secret = None;
        }
        // drops the finished transfer
        if let Some(id) = &self.status.mover_id {
            if let Err(e) = m.mover.cancel(id).await {
                debug!(vm = %self.status.vm, "Transfer {id} already gone: {e}");
            }
        }

        info!(vm = %self.status.vm, "Migration completed");
        self.status.terminate(Phase::Completed, None);
        self.persist().await
    }
}
