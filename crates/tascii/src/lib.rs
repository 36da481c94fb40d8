// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

//! Bounded async task runtime.
//!
//! Tasks implement [`task_trait::AsyncRunnable`] and are enrolled into a
//! [`runtime::Runtime`], which runs at most a fixed number of them at once,
//! applies each task's timeout and retry policy, turns panics into
//! [`workflows::TaskError::Panic`], and propagates cancellation through the
//! [`workflows::Context`] handed to every task.

pub mod runtime;
pub mod task_trait;
pub mod workflows;

pub mod prelude {
    pub use crate::task_trait::{AsyncRunnable, TaskIdentifier, TaskSafe};

    pub use crate::workflows::{Context, TaskError, TaskHandle};

    pub use crate::runtime::Runtime;

    pub use async_trait::async_trait;

    pub use serde::{Deserialize, Serialize};

    pub use uuid::Uuid;
}

use crate::runtime::Runtime;

/// Creates a named runtime allowing `max_in_flight` tasks to run at once
pub fn init(name: &'static str, max_in_flight: usize) -> Runtime {
    tracing::info!("Starting task runtime {name} with {max_in_flight} workers");

    Runtime::new(name, max_in_flight)
}
