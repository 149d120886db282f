//! Key-value store trait.
//!
//! The engine only writes through this port (fire-and-forget snapshots);
//! readers such as the CLI use `get`. Implementations live in hostelry-infra
//! and in `super::memory`.

use std::time::Duration;

use hostelry_types::error::RepositoryError;

/// Trait for expiring key-value storage of JSON values.
///
/// Uses RPITIT (native async fn in traits, Rust 2024 edition).
pub trait KvStore: Send + Sync {
    /// Set a value with an expiry (upsert). The TTL restarts on overwrite.
    fn set_with_ttl(
        &self,
        key: &str,
        value: &serde_json::Value,
        ttl: Duration,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a value by key. Expired entries are reported as absent.
    fn get(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<Option<serde_json::Value>, RepositoryError>> + Send;

    /// Delete a key. No-op if the key does not exist.
    fn delete(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Remove every expired entry, returning how many were removed.
    fn purge_expired(
        &self,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;
}
