//! Infrastructure layer for Hostelry.
//!
//! Implementations of the ports defined in `hostelry-core`: the SQLite
//! snapshot store and the `config.toml` loader.

pub mod config;
pub mod sqlite;
