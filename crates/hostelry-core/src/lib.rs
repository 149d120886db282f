//! Workflow engine and persistence port definitions for Hostelry.
//!
//! This crate defines the engine itself plus the "ports" (the `KvStore`
//! trait) that the infrastructure layer implements. It depends only on
//! `hostelry-types` -- never on `hostelry-infra` or any database/IO crate.

pub mod event;
pub mod storage;
pub mod workflow;
