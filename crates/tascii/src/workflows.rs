//! Copyright (c) 2023 University of New Hampshire
//! SPDX-License-Identifier: MIT

use std::{marker::PhantomData, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::runtime::Runtime;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// Task panicked during execution,
    /// the panic was caught by the runtime and
    /// the message from the panic is contained within
    #[error("task panicked: {0}")]
    Panic(String),

    /// Task returned Err(T), so T
    /// has been serialized to a string
    #[error("{0}")]
    Reason(String),

    /// The runtime itself broke while running the task
    #[error("runtime error: {0}")]
    Internal(String),

    /// A failure that retrying cannot fix
    #[error("{0}")]
    Fatal(String),

    #[error("task was cancelled")]
    Cancelled,

    #[error("task timed out after {0:?}")]
    Timeout(Duration),
}

impl TaskError {
    pub fn internal(s: &str) -> Self {
        Self::Internal(s.to_owned())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Reason(_) | Self::Timeout(_))
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(value: anyhow::Error) -> Self {
        Self::Reason(format!("{value:#}"))
    }
}

/// Runtime facilities handed to every running task.
///
/// Cloning a context shares its cancellation; [`Context::child`] derives
/// one that is cancelled with its parent but can also be cancelled alone.
#[derive(Clone, Debug)]
pub struct Context {
    tid: Uuid,
    cancel: CancellationToken,
    rt: Option<Runtime>,
}

impl Context {
    pub fn within(rt: &Runtime, tid: Uuid, cancel: CancellationToken) -> Self {
        Self {
            tid,
            cancel,
            rt: Some(rt.clone()),
        }
    }

    /// A context with no runtime, so tasks can be driven directly
    pub fn detached() -> Self {
        Self {
            tid: Uuid::new_v4(),
            cancel: CancellationToken::new(),
            rt: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.tid
    }

    pub fn child(&self) -> Self {
        Self {
            tid: Uuid::new_v4(),
            cancel: self.cancel.child_token(),
            rt: self.rt.clone(),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once this context (or an ancestor) has been cancelled
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn runtime(&self) -> Option<&Runtime> {
        self.rt.as_ref()
    }
}

/// Awaitable result of an enrolled task
pub struct TaskHandle<D> {
    id: Uuid,
    inner: JoinHandle<Result<D, TaskError>>,
    _p: PhantomData<D>,
}

impl<D: Send + 'static> TaskHandle<D> {
    pub(crate) fn new(id: Uuid, inner: JoinHandle<Result<D, TaskError>>) -> Self {
        Self {
            id,
            inner,
            _p: PhantomData,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }

    /// Waits for the task to complete (with a result or in error)
    pub async fn join(self) -> Result<D, TaskError> {
        match self.inner.await {
            Ok(r) => r,
            Err(e) if e.is_panic() => Err(TaskError::Panic(panic_message(e.into_panic()))),
            Err(_) => Err(TaskError::Cancelled),
        }
    }
}

/// Waits until all tasks in question have finished,
/// returns a collection of the results of those tasks
pub async fn join_all<D, I>(handles: I) -> Vec<Result<D, TaskError>>
where
    D: Send + 'static,
    I: IntoIterator<Item = TaskHandle<D>>,
{
    let mut out = Vec::new();
    for h in handles {
        out.push(h.join().await);
    }
    out
}

pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    match payload.downcast_ref::<&'static str>() {
        Some(s) => (*s).to_owned(),
        None => match payload.downcast_ref::<String>() {
            Some(s) => s.clone(),
            None => "Box<dyn Any>".to_owned(),
        },
    }
}
