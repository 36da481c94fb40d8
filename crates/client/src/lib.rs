// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

//! vSphere SDK client.
//!
//! [`session::Session`] speaks the vim25 SOAP protocol over HTTPS, pinning
//! or verifying the endpoint certificate as the provider credentials ask
//! ([`tls`]). On top of it sit the property collector feed consumed by the
//! inventory collector ([`property`]) and the VM operations used during a
//! migration ([`source`]).

pub mod error;
pub mod property;
pub mod session;
pub mod soap;
pub mod source;
pub mod tls;

pub use error::{ErrorKind, SdkError};
pub use session::{Session, Timeouts};
pub use source::{Source, TaskState, VmTarget};
