//! In-process `KvStore` backed by a concurrent map.

use std::time::Duration;

use dashmap::DashMap;
use hostelry_types::error::RepositoryError;
use tokio::time::Instant;

use super::kv_store::KvStore;

/// Volatile key-value store with per-entry expiry.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: DashMap<String, (serde_json::Value, Instant)>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries held, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KvStore for MemoryKvStore {
    async fn set_with_ttl(
        &self,
        key: &str,
        value: &serde_json::Value,
        ttl: Duration,
    ) -> Result<(), RepositoryError> {
        let now = Instant::now();
        let expires_at = now.checked_add(ttl).unwrap_or_else(|| far_future(now));
        self.entries
            .insert(key.to_string(), (value.clone(), expires_at));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, RepositoryError> {
        let now = Instant::now();
        Ok(self
            .entries
            .get(key)
            .filter(|entry| entry.1 > now)
            .map(|entry| entry.0.clone()))
    }

    async fn delete(&self, key: &str) -> Result<(), RepositoryError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64, RepositoryError> {
        let now = Instant::now();
        let mut purged = 0u64;
        self.entries.retain(|_, (_, expires_at)| {
            let live = *expires_at > now;
            if !live {
                purged += 1;
            }
            live
        });
        Ok(purged)
    }
}

/// Latest representable expiry, for TTLs that overflow `Instant`.
fn far_future(now: Instant) -> Instant {
    const CENTURY: Duration = Duration::from_secs(100 * 365 * 86_400);
    now.checked_add(CENTURY).unwrap_or(now)
}
