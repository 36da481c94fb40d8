// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

//! Per-VM migration state machine and the runner that drives a plan.
//!
//! Every VM of a plan is migrated by one [`VmMigration`] task enrolled into a
//! bounded [`tascii`] runtime, so at most `max_in_flight` VMs of a plan are in
//! flight at once. A task walks its VM through the phases of
//! [`models::migration::Phase`], persisting the status after each step so a
//! restarted process resumes where the last one stopped.
//!
//! Cancelling a VM (or the plan) is graceful: the task notices at its next
//! wait, removes whatever it created and records `Cancelled`.
//! [`PlanRunner::abort`] is the hard stop that drops tasks on the floor.

mod machine;
mod precopy;

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use client::{ErrorKind, SdkError, Source};
use config::{ConversionConfig, MigrationConfig, VmigrateConfig};
use dal::Store;
use models::{
    inventory::QueryError,
    migration::{Failure, Phase, VmMigrationStatus},
    plan::{Plan, PlanVm},
    provider::Provider,
};
use parking_lot::Mutex;
use tascii::{prelude::*, workflows::join_all};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    builder::BuildError,
    conversion::{ConversionError, GuestConverter},
    destination::{Destination, DestinationError},
    mover::{DataMover, MoverError},
    validator::Check,
};

use machine::Machine;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("source: {0}")]
    Source(#[from] SdkError),

    #[error("destination: {0}")]
    Destination(#[from] DestinationError),

    /// Saving or loading the migration record failed
    #[error("migration record: {0}")]
    Persistence(DestinationError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("inventory: {0}")]
    Query(#[from] QueryError),

    #[error("data mover: {0}")]
    Mover(#[from] MoverError),

    #[error(transparent)]
    Conversion(#[from] ConversionError),

    #[error("validation failed: {}", .0.iter().map(|c| format!("{}: {}", c.reason, c.message)).collect::<Vec<_>>().join("; "))]
    Validation(Vec<Check>),

    #[error("VM {0} is not in the inventory")]
    VmNotFound(String),

    #[error("disk transfer failed: {0}")]
    Transfer(String),

    #[error("{0} did not finish within {1:?}")]
    Timeout(&'static str, Duration),

    #[error("{0}")]
    Internal(String),

    #[error("migration was cancelled")]
    Cancelled,
}

impl MigrationError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Source(e) => e.is_retryable(),
            Self::Destination(e) | Self::Persistence(e) => e.is_retryable(),
            Self::Mover(MoverError::UnknownTransfer(_)) => true,
            _ => false,
        }
    }

    /// Whether the runtime rather than the migration broke
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Persistence(_) | Self::Internal(_))
    }

    /// Condition reason recorded on the VM status
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Source(e) => match e.kind() {
                ErrorKind::Configuration => "Configuration",
                ErrorKind::Authentication => "Authentication",
                ErrorKind::Transient => "SourceUnavailable",
                ErrorKind::NotFound => "NotFound",
                ErrorKind::Precondition => "Precondition",
                ErrorKind::TaskFailure => "TaskFailed",
            },
            Self::Destination(_) => "Destination",
            Self::Persistence(_) | Self::Internal(_) => "Internal",
            Self::Build(e) => e.reason(),
            Self::Query(e) if e.is_not_found() => "NotFound",
            Self::Query(_) => "Inventory",
            Self::Mover(_) | Self::Transfer(_) => "TransferFailed",
            Self::Conversion(_) => "ConversionFailed",
            Self::Validation(_) => "ValidationFailed",
            Self::VmNotFound(_) => "VMNotFound",
            Self::Timeout(..) => "Timeout",
            Self::Cancelled => "Cancelled",
        }
    }

    /// Every reason the failure carries; validation reports one per check
    pub fn reasons(&self) -> Vec<String> {
        match self {
            Self::Validation(checks) => checks
                .iter()
                .map(|c| c.reason.condition().to_owned())
                .collect(),
            e => vec![e.reason().to_owned()],
        }
    }
}

/// What the orchestrator talks to
pub struct Endpoints {
    pub source: Arc<dyn Source>,
    pub destination: Arc<dyn Destination>,
    pub mover: Arc<dyn DataMover>,
    pub converter: Arc<dyn GuestConverter>,
}

#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub migration: MigrationConfig,
    pub conversion: ConversionConfig,
    /// Whether the destination is the cluster this process runs in
    pub local: bool,
}

impl From<&VmigrateConfig> for Settings {
    fn from(cfg: &VmigrateConfig) -> Self {
        Self {
            migration: cfg.migration.clone(),
            conversion: cfg.conversion.clone(),
            local: cfg.destination.local,
        }
    }
}

/// Everything the VM migrations of one plan share
pub struct Migrator {
    pub plan: Plan,
    pub provider: Provider,
    /// Certificate fingerprint of the provider endpoint
    pub fingerprint: String,
    pub store: Arc<Store>,
    pub source: Arc<dyn Source>,
    pub destination: Arc<dyn Destination>,
    pub mover: Arc<dyn DataMover>,
    pub converter: Arc<dyn GuestConverter>,
    pub settings: Settings,
    cutover: watch::Sender<bool>,
}

impl Migrator {
    pub fn new(
        plan: Plan,
        provider: Provider,
        fingerprint: impl Into<String>,
        store: Arc<Store>,
        endpoints: Endpoints,
        settings: Settings,
    ) -> Self {
        let (cutover, _) = watch::channel(false);
        Self {
            plan,
            provider,
            fingerprint: fingerprint.into(),
            store,
            source: endpoints.source,
            destination: endpoints.destination,
            mover: endpoints.mover,
            converter: endpoints.converter,
            settings,
            cutover,
        }
    }

    /// Tells warm migrations to stop precopying and cut over
    pub fn request_cutover(&self) {
        info!("Cutover requested for plan {}", self.plan.name);
        self.cutover.send_replace(true);
    }

    pub(crate) fn cutover_requested(&self) -> watch::Receiver<bool> {
        self.cutover.subscribe()
    }
}

/// Migrates one VM of a plan.
///
/// Output is the VM's final status; a VM that fails still returns `Ok` with
/// its failure recorded. `Err` means the task never got to start.
#[derive(Clone, Serialize, Deserialize)]
pub struct VmMigration {
    pub plan: String,
    pub vm: PlanVm,
    #[serde(skip)]
    migrator: Option<Arc<Migrator>>,
    #[serde(skip)]
    cancel: CancellationToken,
}

impl VmMigration {
    pub fn new(migrator: Arc<Migrator>, vm: PlanVm, cancel: CancellationToken) -> Self {
        Self {
            plan: migrator.plan.id.clone(),
            vm,
            migrator: Some(migrator),
            cancel,
        }
    }
}

impl fmt::Debug for VmMigration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmMigration")
            .field("plan", &self.plan)
            .field("vm", &vm_key(&self.vm))
            .finish()
    }
}

#[async_trait]
impl AsyncRunnable for VmMigration {
    type Output = VmMigrationStatus;

    async fn execute_task(&mut self, _context: &Context) -> Result<VmMigrationStatus, TaskError> {
        let Some(m) = self.migrator.clone() else {
            return Err(TaskError::Fatal(format!(
                "migration of {} was restored without its plan",
                vm_key(&self.vm)
            )));
        };

        match Machine::start(m.clone(), self.vm.clone(), self.cancel.clone()).await {
            Ok(machine) => Ok(machine.run().await),
            Err(MigrationError::Cancelled) => Err(TaskError::Cancelled),
            Err(e) => Ok(machine::rejected(&m, &self.vm, e).await),
        }
    }

    fn timeout() -> Duration {
        // warm migrations precopy until someone asks for cutover
        Duration::from_secs(60 * 60 * 24 * 30)
    }

    fn identifier() -> TaskIdentifier {
        TaskIdentifier::named("VmMigrationTask").versioned(1)
    }
}

/// How a plan VM is named in logs and cancel requests
pub fn vm_key(vm: &PlanVm) -> String {
    vm.id.clone().or_else(|| vm.name.clone()).unwrap_or_default()
}

/// Runs every VM of a plan, at most `max_in_flight` at a time
pub struct PlanRunner {
    migrator: Arc<Migrator>,
    runtime: Runtime,
    cancel: CancellationToken,
    vms: Mutex<HashMap<String, CancellationToken>>,
}

impl PlanRunner {
    pub fn new(migrator: Migrator) -> Self {
        let runtime = tascii::init("vm-migrations", migrator.settings.migration.max_in_flight);
        Self {
            migrator: Arc::new(migrator),
            runtime,
            cancel: CancellationToken::new(),
            vms: Mutex::new(HashMap::new()),
        }
    }

    pub fn migrator(&self) -> &Arc<Migrator> {
        &self.migrator
    }

    /// Migrates all VMs of the plan, returning once each has settled
    pub async fn run(&self) -> Vec<Result<VmMigrationStatus, TaskError>> {
        let plan = &self.migrator.plan;
        info!("Running plan {} with {} VMs", plan.name, plan.vms.len());

        let handles: Vec<_> = plan
            .vms
            .iter()
            .map(|vm| {
                let token = self.cancel.child_token();
                self.vms.lock().insert(vm_key(vm), token.clone());
                self.runtime
                    .enroll(VmMigration::new(self.migrator.clone(), vm.clone(), token))
            })
            .collect();

        let results = join_all(handles).await;
        for (vm, r) in plan.vms.iter().zip(&results) {
            match r {
                Ok(_) => {}
                Err(e @ (TaskError::Panic(_) | TaskError::Internal(_))) => {
                    self.record_crash(vm, e).await
                }
                Err(e) => warn!("Migration of {} did not finish: {e}", vm_key(vm)),
            }
        }

        // every VM has settled, log out of the source
        self.migrator.source.close().await;
        results
    }

    /// Marks a migration whose task died underneath it
    async fn record_crash(&self, vm: &PlanVm, e: &TaskError) {
        let m = &self.migrator;
        let key = vm_key(vm);
        error!(vm = %key, "Migration task crashed: {e}");

        match m.destination.load_status(&m.plan.id, &key).await {
            Ok(Some(mut status)) if !status.phase.is_terminal() => {
                let failure = Failure {
                    phase: status.phase,
                    step: status.running_step(),
                    message: e.to_string(),
                    reasons: vec!["Internal".to_owned()],
                };
                status.terminate(Phase::Error, Some(failure));
                if let Err(e) = m.destination.save_status(&status).await {
                    error!(vm = %key, "Could not record the crash: {e}");
                }
            }
            Ok(_) => {}
            Err(e) => error!(vm = %key, "Could not load the crashed migration: {e}"),
        }
    }

    /// Cancels one VM by id or name, returns whether it is part of the plan
    pub fn cancel_vm(&self, vm: &str) -> bool {
        match self.vms.lock().get(vm) {
            Some(token) => {
                info!("Cancelling migration of {vm}");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels every VM of the plan
    pub fn cancel(&self) {
        info!("Cancelling plan {}", self.migrator.plan.name);
        self.cancel.cancel();
    }

    pub fn cutover(&self) {
        self.migrator.request_cutover();
    }

    /// Stops every task at once, without cleaning up
    pub fn abort(&self) {
        warn!("Aborting plan {}", self.migrator.plan.name);
        self.runtime.shutdown();
    }

    pub fn in_flight(&self) -> usize {
        self.runtime.in_flight()
    }
}
