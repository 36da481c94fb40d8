//! A scripted in-memory [`Source`].
//!
//! Snapshots are numbered `snapshot-1`, `snapshot-2`, ... in creation order
//! and every task completes after a configurable number of pending polls,
//! or stays pending while its operation is held.
//! Failures can be queued per operation; each queued error is returned once.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use client::{source::trim_backing_file, SdkError, Source, TaskState, VmTarget};
use models::{inventory::Vm, migration::PowerState};
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    PowerState,
    PowerOn,
    PowerOff,
    PoweredOff,
    CreateSnapshot,
    RemoveSnapshot,
    CheckTask,
    SnapshotDeltas,
}

/// Every call the source received, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    PowerState,
    PowerOn,
    PowerOff,
    PoweredOff,
    CreateSnapshot { snapshot: String },
    RemoveSnapshot { snapshot: String, children: bool },
    CheckTask(String),
    SnapshotDeltas(String),
    Close,
}

struct Task {
    result: TaskState,
    polls_left: u32,
    held: bool,
}

struct State {
    power: PowerState,
    ignore_shutdown: bool,
    disks: Vec<String>,
    live: Vec<String>,
    created: u32,
    tasks: HashMap<String, Task>,
    next_task: u32,
    pending_polls: u32,
    /// Operations whose tasks stay pending until released
    held: HashSet<Op>,
    failures: HashMap<Op, VecDeque<SdkError>>,
    calls: Vec<Call>,
}

impl State {
    fn take_failure(&mut self, op: Op) -> Result<(), SdkError> {
        match self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn task(&mut self, op: Op, result: TaskState) -> String {
        self.next_task += 1;
        let id = format!("task-{}", self.next_task);
        let task = Task {
            result,
            polls_left: self.pending_polls,
            held: self.held.contains(&op),
        };
        self.tasks.insert(id.clone(), task);
        id
    }
}

pub struct FakeSource {
    state: Mutex<State>,
}

impl FakeSource {
    pub fn new<I, S>(power: PowerState, disks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            state: Mutex::new(State {
                power,
                ignore_shutdown: false,
                disks: disks.into_iter().map(Into::into).collect(),
                live: Vec::new(),
                created: 0,
                tasks: HashMap::new(),
                next_task: 0,
                pending_polls: 0,
                held: HashSet::new(),
                failures: HashMap::new(),
                calls: Vec::new(),
            }),
        }
    }

    /// A source serving `vm` as the inventory describes it
    pub fn for_vm(vm: &Vm) -> Self {
        Self::new(
            PowerState::from_sdk(&vm.power_state),
            vm.disks.iter().map(|d| d.file.clone()),
        )
    }

    /// Tasks report `Pending` this many times before finishing
    pub fn pending_polls(self, polls: u32) -> Self {
        self.state.lock().pending_polls = polls;
        self
    }

    /// Guest shutdown requests are accepted but the VM stays on
    pub fn ignore_shutdown(self) -> Self {
        self.state.lock().ignore_shutdown = true;
        self
    }

    /// Queues `err` for the next call of `op`
    pub fn fail(&self, op: Op, err: SdkError) {
        self.state.lock().failures.entry(op).or_default().push_back(err);
    }

    pub fn power(&self) -> PowerState {
        self.state.lock().power
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    /// Snapshots created and not yet removed
    pub fn live_snapshots(&self) -> Vec<String> {
        self.state.lock().live.clone()
    }

    /// Snapshot ids passed to `remove_snapshot`, in call order
    pub fn removed_snapshots(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::RemoveSnapshot { snapshot, .. } => Some(snapshot),
                _ => None,
            })
            .collect()
    }

    /// Tasks started by `op` from now on stay pending until [`FakeSource::release`]
    pub fn hold(&self, op: Op) {
        self.state.lock().held.insert(op);
    }

    /// Lets every held task finish on its next poll
    pub fn release(&self) {
        let mut s = self.state.lock();
        s.held.clear();
        for t in s.tasks.values_mut() {
            t.held = false;
        }
    }

    pub fn closed(&self) -> bool {
        self.calls().contains(&Call::Close)
    }

    fn change_id(disk: usize, snapshot: u32) -> String {
        format!("52 1c 3a 7d 90 4e 0b {disk:02}-8f 61 4a 2c 35 d4 19 e6/{snapshot}")
    }
}

#[async_trait]
impl Source for FakeSource {
    async fn power_state(&self, _vm: &VmTarget) -> Result<PowerState, SdkError> {
        let mut s = self.state.lock();
        s.calls.push(Call::PowerState);
        s.take_failure(Op::PowerState)?;
        Ok(s.power)
    }

    async fn power_on(&self, _vm: &VmTarget) -> Result<(), SdkError> {
        let mut s = self.state.lock();
        s.calls.push(Call::PowerOn);
        s.take_failure(Op::PowerOn)?;
        s.power = PowerState::On;
        Ok(())
    }

    async fn power_off(&self, _vm: &VmTarget) -> Result<(), SdkError> {
        let mut s = self.state.lock();
        s.calls.push(Call::PowerOff);
        s.take_failure(Op::PowerOff)?;
        if !s.ignore_shutdown {
            s.power = PowerState::Off;
        }
        Ok(())
    }

    async fn powered_off(&self, _vm: &VmTarget) -> Result<bool, SdkError> {
        let mut s = self.state.lock();
        s.calls.push(Call::PoweredOff);
        s.take_failure(Op::PoweredOff)?;
        Ok(s.power == PowerState::Off)
    }

    async fn create_snapshot(&self, _vm: &VmTarget) -> Result<String, SdkError> {
        let mut s = self.state.lock();
        s.take_failure(Op::CreateSnapshot)?;

        s.created += 1;
        let snapshot = format!("snapshot-{}", s.created);
        s.calls.push(Call::CreateSnapshot {
            snapshot: snapshot.clone(),
        });
        s.live.push(snapshot.clone());
        Ok(s.task(Op::CreateSnapshot, TaskState::Success(Some(snapshot))))
    }

    async fn remove_snapshot(
        &self,
        _vm: &VmTarget,
        snapshot: &str,
        children: bool,
    ) -> Result<String, SdkError> {
        let mut s = self.state.lock();
        s.calls.push(Call::RemoveSnapshot {
            snapshot: snapshot.to_owned(),
            children,
        });
        s.take_failure(Op::RemoveSnapshot)?;

        let Some(pos) = s.live.iter().position(|l| l == snapshot) else {
            return Err(SdkError::not_found("snapshot", snapshot));
        };
        s.live.remove(pos);
        Ok(s.task(Op::RemoveSnapshot, TaskState::Success(None)))
    }

    async fn check_task(&self, _vm: &VmTarget, task: &str) -> Result<TaskState, SdkError> {
        let mut s = self.state.lock();
        s.calls.push(Call::CheckTask(task.to_owned()));
        s.take_failure(Op::CheckTask)?;

        let Some(t) = s.tasks.get_mut(task) else {
            return Err(SdkError::not_found("task", task));
        };
        if t.held {
            return Ok(TaskState::Pending);
        }
        if t.polls_left > 0 {
            t.polls_left -= 1;
            return Ok(TaskState::Pending);
        }
        Ok(t.result.clone())
    }

    async fn snapshot_deltas(
        &self,
        _vm: &VmTarget,
        snapshot: &str,
    ) -> Result<BTreeMap<String, String>, SdkError> {
        let mut s = self.state.lock();
        s.calls.push(Call::SnapshotDeltas(snapshot.to_owned()));
        s.take_failure(Op::SnapshotDeltas)?;

        let n: u32 = snapshot
            .strip_prefix("snapshot-")
            .and_then(|n| n.parse().ok())
            .filter(|_| s.live.iter().any(|l| l == snapshot))
            .ok_or_else(|| SdkError::not_found("snapshot", snapshot))?;

        Ok(s
            .disks
            .iter()
            .enumerate()
            .map(|(i, d)| (trim_backing_file(d), Self::change_id(i, n)))
            .collect())
    }

    async fn close(&self) {
        self.state.lock().calls.push(Call::Close);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn snapshots_chain_and_tasks_settle() {
        let src = FakeSource::new(PowerState::On, ["[ds1] vm/disk1.vmdk"]).pending_polls(1);
        let vm = VmTarget::default();

        let task = src.create_snapshot(&vm).await.unwrap();
        assert_eq!(src.check_task(&vm, &task).await.unwrap(), TaskState::Pending);
        assert_eq!(
            src.check_task(&vm, &task).await.unwrap(),
            TaskState::Success(Some("snapshot-1".into()))
        );

        let deltas = src.snapshot_deltas(&vm, "snapshot-1").await.unwrap();
        assert_eq!(deltas.len(), 1);
        assert!(deltas["[ds1] vm/disk1.vmdk"].ends_with("/1"));

        src.remove_snapshot(&vm, "snapshot-1", false).await.unwrap();
        assert!(src.live_snapshots().is_empty());
        assert!(src.snapshot_deltas(&vm, "snapshot-1").await.is_err());
    }

    #[tokio::test]
    async fn held_tasks_wait_for_release() {
        let src = FakeSource::new(PowerState::On, ["[ds1] vm/disk1.vmdk"]);
        let vm = VmTarget::default();
        src.hold(Op::RemoveSnapshot);

        let create = src.create_snapshot(&vm).await.unwrap();
        assert!(matches!(src.check_task(&vm, &create).await.unwrap(), TaskState::Success(_)));

        let remove = src.remove_snapshot(&vm, "snapshot-1", false).await.unwrap();
        assert_eq!(src.check_task(&vm, &remove).await.unwrap(), TaskState::Pending);
        assert_eq!(src.check_task(&vm, &remove).await.unwrap(), TaskState::Pending);

        src.release();
        assert_eq!(src.check_task(&vm, &remove).await.unwrap(), TaskState::Success(None));
    }

    #[tokio::test]
    async fn queued_failures_fire_once() {
        let src = FakeSource::new(PowerState::On, Vec::<String>::new());
        let vm = VmTarget::default();
        src.fail(Op::PowerOff, SdkError::Transport("reset".into()));

        assert!(src.power_off(&vm).await.is_err());
        src.power_off(&vm).await.unwrap();
        assert!(src.powered_off(&vm).await.unwrap());
    }
}
