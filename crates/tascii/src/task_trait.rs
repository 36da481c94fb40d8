//! Copyright (c) 2023 University of New Hampshire
//! SPDX-License-Identifier: MIT

use std::{any::type_name, time::Duration};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::workflows::{Context, TaskError};

/// Trait used for creating "Tascii tasks".
#[async_trait]
pub trait AsyncRunnable:
    Send + Sync + Clone + Sized + std::fmt::Debug + Serialize + DeserializeOwned + 'static
{
    type Output: TaskSafe;

    // Actual body of the task. Called by the run function.
    async fn execute_task(&mut self, context: &Context) -> Result<Self::Output, TaskError>;

    // Called by the runtime. Executes the task body while accounting for retries, timeouts and cancellation.
    // DO NOT override this in implementations unless you want to entirely circumvent the timeout / retry mechanism.
    async fn run(&mut self, context: &Context) -> Result<Self::Output, TaskError> {
        let mut last_error = TaskError::Reason("Task never ran".to_owned());

        for attempt_number in 0..(Self::retry_count() + 1) {
            if context.is_cancelled() {
                return Err(TaskError::Cancelled);
            }

            tracing::info!("Running task {:?} (attempt no. {attempt_number})", self);

            let attempt = tokio::select! {
                _ = context.cancelled() => return Err(TaskError::Cancelled),
                r = tokio::time::timeout(Self::timeout(), self.execute_task(context)) => r,
            };

            match attempt {
                Ok(Ok(output)) => return Ok(output),
                Ok(Err(error)) if !error.is_retryable() => return Err(error),
                Ok(Err(error)) => {
                    tracing::warn!("Task {:?} failed on attempt {attempt_number}: {error}", self);
                    last_error = error
                }
                Err(_) => {
                    last_error = TaskError::Timeout(Self::timeout());
                    tracing::info!("Task {:?} timed out!", self);
                }
            }

            if attempt_number < Self::retry_count() {
                tokio::select! {
                    _ = context.cancelled() => return Err(TaskError::Cancelled),
                    _ = tokio::time::sleep(Self::retry_buffer_time()) => {}
                }
            }
        }

        Err(last_error)
    }

    /// Provided with the id of the wrapping task
    fn summarize(&self, id: Uuid) -> String {
        let task_ty_name = type_name::<Self>();
        format!("Async Task {task_ty_name} with ID {id}")
    }

    /// The timeout duration for each task attempt (not total duration)
    /// Upon timeout, the attempt is abandoned and treated as a failure, triggering the retry mechanism.
    /// When in doubt, give a task more time than you'd expect it to take to complete.
    fn timeout() -> Duration;

    /// The total timeout including retries and buffer time.
    /// There is no need to implement this in trait implementations
    fn overall_timeout() -> Duration {
        (Self::timeout() + Self::retry_buffer_time()) * (Self::retry_count() as u32 + 1)
    }

    /// How many times the runtime should retry running the task on a retryable failure
    /// before declaring it "failed". The task will run at least once, even if retry count is 0.
    fn retry_count() -> usize {
        0
    }

    /// Time to wait in between retry attempts
    fn retry_buffer_time() -> Duration {
        Duration::from_secs(5)
    }

    fn identifier() -> TaskIdentifier;
}

pub trait TaskSafe: std::fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static + Clone {}

impl<T: std::fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static + Clone> TaskSafe
    for T
{
}

#[derive(PartialEq, Eq, Hash, Clone, Serialize, Deserialize, Debug)]
pub struct TaskIdentifier {
    version: usize,
    name: String,
}

impl TaskIdentifier {
    pub fn versioned(self, version: usize) -> Self {
        Self { version, ..self }
    }

    pub fn named(name: &'static str) -> Self {
        Self {
            name: name.into(),
            version: 1,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Display for TaskIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@v{}", self.name, self.version)
    }
}
