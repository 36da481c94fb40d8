// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

//! The migration pipeline.
//!
//! - [`collector`] keeps the inventory store in sync with the source
//! - [`analyzer`] derives workload and concern reports from the inventory
//! - [`validator`] checks a plan before anything is touched
//! - [`builder`] turns inventory records into destination resources
//! - [`orchestrator`] runs the per-VM state machine of a plan
//! - [`destination`], [`mover`] and [`conversion`] are the seams to the
//!   destination cluster, the disk copier and the guest converter

pub mod analyzer;
pub mod builder;
pub mod collector;
pub mod conversion;
pub mod destination;
pub mod mover;
pub mod orchestrator;
pub mod validator;
