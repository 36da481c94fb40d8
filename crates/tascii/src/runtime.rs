//! Copyright (c) 2023 University of New Hampshire
//! SPDX-License-Identifier: MIT

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::{
    task_trait::{AsyncRunnable, TaskIdentifier},
    workflows::{panic_message, Context, TaskError, TaskHandle},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting for a worker slot
    Ready,
    Running,
    Done,
    Failed,
}

#[derive(Clone, Debug)]
pub struct TaskSummary {
    pub identifier: TaskIdentifier,
    pub summary: String,
    pub state: TaskState,
}

struct RuntimeInner {
    identity: &'static str,
    capacity: usize,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    all_tasks: Mutex<HashMap<Uuid, TaskSummary>>,
}

/// A bounded pool of async workers.
///
/// Top level tasks wait for one of `capacity` slots before they start.
/// Subtasks spawned through a task's [`Context`] inherit their parent's slot.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("identity", &self.inner.identity)
            .field("capacity", &self.inner.capacity)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl Runtime {
    pub fn new(runtime_identity: &'static str, capacity: usize) -> Self {
        let capacity = capacity.max(1);

        Self {
            inner: Arc::new(RuntimeInner {
                identity: runtime_identity,
                capacity,
                permits: Arc::new(Semaphore::new(capacity)),
                cancel: CancellationToken::new(),
                all_tasks: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn identity(&self) -> &'static str {
        self.inner.identity
    }

    /// Number of tasks currently holding a worker slot
    pub fn in_flight(&self) -> usize {
        self.inner.capacity - self.inner.permits.available_permits()
    }

    /// Enrolls a top level task, it starts once a worker slot frees up
    pub fn enroll<R: AsyncRunnable>(&self, t: R) -> TaskHandle<R::Output> {
        self.enroll_with(t, self.inner.cancel.child_token())
    }

    pub(crate) fn enroll_with<R: AsyncRunnable>(
        &self,
        t: R,
        cancel: CancellationToken,
    ) -> TaskHandle<R::Output> {
        let id = self.track(&t);
        let permits = self.inner.permits.clone();
        let rt = self.clone();

        debug!("Enrolled task {id} into runtime {}", self.inner.identity);

        TaskHandle::new(
            id,
            tokio::spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        rt.set_state(id, TaskState::Failed);
                        return Err(TaskError::Cancelled);
                    }
                    p = permits.acquire_owned() => p.map_err(|_| TaskError::internal("worker pool closed"))?,
                };

                let r = rt.execute(t, id, cancel).await;
                drop(permit);
                r
            }),
        )
    }

    /// Runs a subtask without taking a slot of its own
    pub(crate) fn enroll_subtask<R: AsyncRunnable>(
        &self,
        t: R,
        cancel: CancellationToken,
    ) -> TaskHandle<R::Output> {
        let id = self.track(&t);
        let rt = self.clone();

        TaskHandle::new(id, tokio::spawn(async move { rt.execute(t, id, cancel).await }))
    }

    fn track<R: AsyncRunnable>(&self, t: &R) -> Uuid {
        let id = Uuid::new_v4();
        self.inner.all_tasks.lock().insert(
            id,
            TaskSummary {
                identifier: R::identifier(),
                summary: t.summarize(id),
                state: TaskState::Ready,
            },
        );
        id
    }

    async fn execute<R: AsyncRunnable>(
        &self,
        mut t: R,
        id: Uuid,
        cancel: CancellationToken,
    ) -> Result<R::Output, TaskError> {
        self.set_state(id, TaskState::Running);
        let ctx = Context::within(self, id, cancel);

        // run on its own tokio task so a panic surfaces as a JoinError
        let joined = tokio::spawn(async move { t.run(&ctx).await }).await;

        let r = match joined {
            Ok(r) => r,
            Err(e) if e.is_panic() => {
                let msg = panic_message(e.into_panic());
                error!("Panic within runtime {} in task {id}: {msg}", self.inner.identity);
                Err(TaskError::Panic(msg))
            }
            Err(_) => Err(TaskError::Cancelled),
        };

        match &r {
            Ok(_) => {
                info!("Task {id} finished");
                self.set_state(id, TaskState::Done)
            }
            Err(e) => {
                info!("Task {id} failed: {e}");
                self.set_state(id, TaskState::Failed)
            }
        }

        r
    }

    fn set_state(&self, id: Uuid, state: TaskState) {
        if let Some(t) = self.inner.all_tasks.lock().get_mut(&id) {
            t.state = state;
        }
    }

    pub fn task(&self, id: Uuid) -> Option<TaskSummary> {
        self.inner.all_tasks.lock().get(&id).cloned()
    }

    pub fn tasks_in(&self, state: TaskState) -> Vec<Uuid> {
        self.inner
            .all_tasks
            .lock()
            .iter()
            .filter(|(_, t)| t.state == state)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Cancels every task enrolled in this runtime
    pub fn shutdown(&self) {
        info!("Shutting down runtime {}", self.inner.identity);
        self.inner.cancel.cancel();
    }
}

impl Context {
    /// Enrolls `t` as a subtask of the task owning this context
    pub fn spawn<R: AsyncRunnable>(&self, t: R) -> TaskHandle<R::Output> {
        match self.runtime() {
            Some(rt) => rt.enroll_subtask(t, self.token().child_token()),
            None => {
                let ctx = self.child();
                let mut t = t;
                TaskHandle::new(ctx.id(), tokio::spawn(async move { t.run(&ctx).await }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Sleepy {
        #[serde(skip)]
        running: Arc<AtomicUsize>,
        #[serde(skip)]
        peak: Arc<AtomicUsize>,
        panics: bool,
    }

    #[async_trait]
    impl AsyncRunnable for Sleepy {
        type Output = ();

        async fn execute_task(&mut self, _context: &Context) -> Result<(), TaskError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            if self.panics {
                panic!("sleepy task blew up");
            }
            Ok(())
        }

        fn timeout() -> Duration {
            Duration::from_secs(5)
        }

        fn identifier() -> TaskIdentifier {
            TaskIdentifier::named("SleepyTask")
        }
    }

    #[tokio::test]
    async fn never_exceeds_capacity() {
        let rt = Runtime::new("test", 3);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                rt.enroll(Sleepy {
                    running: running.clone(),
                    peak: peak.clone(),
                    panics: false,
                })
            })
            .collect();

        for r in crate::workflows::join_all(handles).await {
            assert!(r.is_ok());
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 1);
        assert_eq!(rt.tasks_in(TaskState::Done).len(), 10);
    }

    #[tokio::test]
    async fn panics_become_task_errors() {
        let rt = Runtime::new("test", 1);
        let h = rt.enroll(Sleepy {
            running: Default::default(),
            peak: Default::default(),
            panics: true,
        });
        let id = h.id();

        match h.join().await {
            Err(TaskError::Panic(msg)) => assert!(msg.contains("blew up")),
            other => panic!("expected a panic error, got {other:?}"),
        }
        assert_eq!(rt.task(id).unwrap().state, TaskState::Failed);
        // the slot is released again
        assert_eq!(rt.in_flight(), 0);
    }

    #[tokio::test]
    async fn shutdown_cancels_waiting_tasks() {
        let rt = Runtime::new("test", 1);
        let t = Sleepy {
            running: Default::default(),
            peak: Default::default(),
            panics: false,
        };
        let first = rt.enroll(t.clone());
        let second = rt.enroll(t);
        rt.shutdown();

        assert!(matches!(first.join().await, Err(TaskError::Cancelled)));
        assert!(matches!(second.join().await, Err(TaskError::Cancelled)));
    }
}
