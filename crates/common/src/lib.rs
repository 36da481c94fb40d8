//! Copyright (c) 2023 University of New Hampshire
//! SPDX-License-Identifier: MIT

pub mod prelude {
    pub use anyhow;
    pub use async_trait;
    pub use chrono;
    pub use config;
    pub use futures;
    pub use itertools;
    pub use once_cell;
    pub use parking_lot;
    pub use regex;
    pub use serde_json;
    pub use serde_yaml;
    pub use strum;
    pub use strum_macros;
    pub use thiserror;
    pub use tokio;
    pub use tokio_util;
    pub use tracing;

    pub use serde::{Deserialize, Serialize};
}
