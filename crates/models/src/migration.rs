// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

//! Persisted state of a single VM's migration.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::Display;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display)]
pub enum PowerState {
    On,
    Off,
    #[default]
    Unknown,
}

impl PowerState {
    /// Maps the SDK's `runtime.powerState` values
    pub fn from_sdk(state: &str) -> Self {
        match state {
            "poweredOn" => Self::On,
            "poweredOff" => Self::Off,
            _ => Self::Unknown,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display)]
pub enum Phase {
    #[default]
    Started,
    Validated,
    PowerSampled,
    PrecopyLoop,
    ColdCopy,
    Cutover,
    ConvertGuest,
    TargetVmCreated,
    Completed,
    Failed,
    /// The migration runtime itself broke (panic, lost persistence)
    Error,
    Cancelled,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Phase::Completed | Phase::Failed | Phase::Error | Phase::Cancelled
        )
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum StepName {
    Initialize,
    DiskTransfer,
    Cutover,
    ImageConversion,
    VirtualMachineCreation,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepPhase {
    #[default]
    Pending,
    Running,
    Completed,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    pub completed: i64,
    pub total: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Step {
    pub name: StepName,
    pub phase: StepPhase,
    pub started: Option<DateTime<Utc>>,
    pub completed: Option<DateTime<Utc>>,
    pub progress: Progress,
    pub error: Option<String>,
}

impl Step {
    pub fn new(name: StepName, total: i64) -> Self {
        Self {
            name,
            phase: StepPhase::Pending,
            started: None,
            completed: None,
            progress: Progress { completed: 0, total },
            error: None,
        }
    }
}

/// One warm precopy iteration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Precopy {
    pub snapshot_id: Option<String>,
    pub create_task_id: String,
    pub remove_task_id: Option<String>,
    /// Trimmed disk backing file to CBT change id at this snapshot
    pub deltas: BTreeMap<String, String>,
    pub started: DateTime<Utc>,
    pub ended: Option<DateTime<Utc>>,
    /// Whether this is the cutover snapshot
    #[serde(default)]
    pub last: bool,
}

/// What the orchestrator was waiting on when it last yielded.
///
/// A restarted orchestrator resumes the wait instead of redoing the step.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Token {
    CreateSnapshot { task_id: String },
    RemoveSnapshot { task_id: String, snapshot_id: String },
    PowerOff,
    Transfer { mover_id: String, checkpoint: Option<String> },
    Conversion,
    CreateTarget,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub phase: Phase,
    pub step: Option<StepName>,
    pub message: String,
    #[serde(default)]
    pub reasons: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WarmStatus {
    pub successes: u32,
    pub failures: u32,
    pub consecutive_failures: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct VmMigrationStatus {
    pub plan: String,
    pub vm: String,
    pub name: String,
    pub target_name: String,
    pub phase: Phase,
    pub started: DateTime<Utc>,
    pub completed: Option<DateTime<Utc>>,
    pub error: Option<Failure>,
    /// Most recent retryable errors, oldest first
    pub recent_errors: Vec<String>,
    pub pipeline: Vec<Step>,
    pub precopies: Vec<Precopy>,
    pub token: Option<Token>,
    pub initial_power_state: Option<PowerState>,
    pub mover_id: Option<String>,
    /// Destination data volumes created for this VM
    pub volumes: Vec<String>,
    pub secret: Option<String>,
    pub operating_system: Option<String>,
    pub preference: Option<String>,
    pub warm: WarmStatus,
}

impl VmMigrationStatus {
    pub fn new(plan: &str, vm: &str, name: &str, target_name: &str, warm: bool) -> Self {
        let mut pipeline = vec![Step::new(StepName::Initialize, 1), Step::new(StepName::DiskTransfer, 0)];
        if warm {
            pipeline.push(Step::new(StepName::Cutover, 1));
        }
        pipeline.push(Step::new(StepName::ImageConversion, 1));
        pipeline.push(Step::new(StepName::VirtualMachineCreation, 1));

        Self {
            plan: plan.to_owned(),
            vm: vm.to_owned(),
            name: name.to_owned(),
            target_name: target_name.to_owned(),
            phase: Phase::Started,
            started: Utc::now(),
            completed: None,
            error: None,
            recent_errors: Vec::new(),
            pipeline,
            precopies: Vec::new(),
            token: None,
            initial_power_state: None,
            mover_id: None,
            volumes: Vec::new(),
            secret: None,
            operating_system: None,
            preference: None,
            warm: WarmStatus::default(),
        }
    }

    pub fn step_mut(&mut self, name: StepName) -> Option<&mut Step> {
        self.pipeline.iter_mut().find(|s| s.name == name)
    }

    pub fn step(&self, name: StepName) -> Option<&Step> {
        self.pipeline.iter().find(|s| s.name == name)
    }

    pub fn start_step(&mut self, name: StepName) {
        if let Some(step) = self.step_mut(name) {
            if step.phase == StepPhase::Pending {
                step.phase = StepPhase::Running;
                step.started = Some(Utc::now());
            }
        }
    }

    pub fn complete_step(&mut self, name: StepName) {
        if let Some(step) = self.step_mut(name) {
            step.phase = StepPhase::Completed;
            step.progress.completed = step.progress.total;
            step.completed = Some(Utc::now());
        }
    }

    /// The step currently running, if any
    pub fn running_step(&self) -> Option<StepName> {
        self.pipeline
            .iter()
            .find(|s| s.phase == StepPhase::Running)
            .map(|s| s.name)
    }

    /// Keeps a bounded tail of retryable errors
    pub fn record_error(&mut self, message: impl Into<String>, limit: usize) {
        self.recent_errors.push(message.into());
        if self.recent_errors.len() > limit {
            let excess = self.recent_errors.len() - limit;
            self.recent_errors.drain(..excess);
        }
    }

    /// Moves to a terminal phase, keeping only the first failure
    pub fn terminate(&mut self, phase: Phase, failure: Option<Failure>) {
        if let (Some(f), Some(step)) = (&failure, failure.as_ref().and_then(|f| f.step)) {
            if let Some(s) = self.step_mut(step) {
                s.error.get_or_insert_with(|| f.message.clone());
            }
        }
        if self.error.is_none() {
            self.error = failure;
        }
        self.phase = phase;
        self.token = None;
        self.completed = Some(Utc::now());
    }

    pub fn last_precopy(&self) -> Option<&Precopy> {
        self.precopies.last()
    }

    pub fn last_precopy_mut(&mut self) -> Option<&mut Precopy> {
        self.precopies.last_mut()
    }

    /// Snapshots this migration created and has not yet removed
    pub fn owned_snapshots(&self) -> Vec<String> {
        self.precopies
            .iter()
            .filter(|p| p.remove_task_id.is_none())
            .filter_map(|p| p.snapshot_id.clone())
            .collect()
    }
}
