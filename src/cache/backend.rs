//! Cache backend implementations.
//!
//! Backends store the latest payload per key together with its `stored_at`
//! timestamp. Freshness is never decided here: the caller passes `max_age`
//! at read time, so a stale entry stays in place and may still satisfy a
//! later caller with a looser freshness requirement.

use crate::clock::Clock;
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// A stored payload and the time it was written (epoch ms).
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub value: Bytes,
    pub stored_at_ms: u64,
}

impl CacheEntry {
    pub fn new(value: Bytes, stored_at_ms: u64) -> Self {
        Self {
            value,
            stored_at_ms,
        }
    }

    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.stored_at_ms)
    }

    /// Fresh iff `now - stored_at < max_age`.
    pub fn is_fresh(&self, now_ms: u64, max_age_ms: u64) -> bool {
        self.age_ms(now_ms) < max_age_ms
    }
}

#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Raw entry lookup; freshness is evaluated by the caller.
    async fn entry(&self, key: &str) -> Result<Option<CacheEntry>>;
    /// Unconditionally overwrite the entry for `key`.
    async fn store(&self, key: &str, entry: CacheEntry) -> Result<()>;
    async fn clear(&self) -> Result<()>;
    async fn len(&self) -> Result<usize>;
    fn name(&self) -> &'static str;
}

/// Process-local backend. Grows without bound; entries are only replaced.
pub struct MemoryCache {
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn entry(&self, key: &str) -> Result<Option<CacheEntry>> {
        let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());
        Ok(entries.get(key).cloned())
    }
    async fn store(&self, key: &str, entry: CacheEntry) -> Result<()> {
        self.entries
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key.to_string(), entry);
        Ok(())
    }
    async fn clear(&self) -> Result<()> {
        self.entries
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
        Ok(())
    }
    async fn len(&self) -> Result<usize> {
        Ok(self.entries.read().unwrap_or_else(|p| p.into_inner()).len())
    }
    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Disables caching: every lookup misses, every store is dropped.
pub struct NullCache;
impl NullCache {
    pub fn new() -> Self {
        Self
    }
}
impl Default for NullCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for NullCache {
    async fn entry(&self, _: &str) -> Result<Option<CacheEntry>> {
        Ok(None)
    }
    async fn store(&self, _: &str, _: CacheEntry) -> Result<()> {
        Ok(())
    }
    async fn clear(&self) -> Result<()> {
        Ok(())
    }
    async fn len(&self) -> Result<usize> {
        Ok(0)
    }
    fn name(&self) -> &'static str {
        "null"
    }
}

/// Helper used by the manager and tests: current time from an injected clock.
pub(crate) fn stamp(clock: &dyn Clock, value: Bytes) -> CacheEntry {
    CacheEntry::new(value, clock.now_ms())
}
