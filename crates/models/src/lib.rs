#![doc = include_str!("../README.md")]

pub mod inventory;
pub mod migration;
pub mod plan;
pub mod provider;
