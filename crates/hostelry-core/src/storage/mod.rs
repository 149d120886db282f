//! Storage abstractions for Hostelry.
//!
//! Defines the key-value port used for best-effort execution snapshot
//! persistence. The SQLite implementation lives in hostelry-infra.

pub mod kv_store;
pub mod memory;
