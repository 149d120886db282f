//! Shared domain types for Hostelry.
//!
//! This crate contains the types that cross crate boundaries in the workflow
//! engine: execution state and metrics, the persisted execution snapshot,
//! engine configuration, lifecycle events, and repository errors.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod workflow;
