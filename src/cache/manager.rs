//! Response cache manager.

use super::backend::{stamp, CacheBackend};
use super::key::RequestKey;
use crate::clock::{system_clock, Clock};
use crate::Result;
use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_entry_size: usize,
    pub key_prefix: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entry_size: 10 * 1024 * 1024,
            key_prefix: None,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
    pub fn with_max_entry_size(mut self, bytes: usize) -> Self {
        self.max_entry_size = bytes;
        self
    }
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stale: u64,
    pub sets: u64,
    pub skipped: u64,
    pub errors: u64,
}

impl CacheStats {
    /// Hit ratio over all lookups; stale reads count as misses.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses + self.stale;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct AtomicStats {
    hits: AtomicU64,
    misses: AtomicU64,
    stale: AtomicU64,
    sets: AtomicU64,
    skipped: AtomicU64,
    errors: AtomicU64,
}

impl AtomicStats {
    fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stale: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }
    fn to_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Outcome of a freshness-aware lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup<T> {
    Fresh { value: T, age: Duration },
    /// Present but older than the requested `max_age`. Still stored.
    Stale { value: T, age: Duration },
    Miss,
}

impl<T> CacheLookup<T> {
    pub fn fresh(self) -> Option<T> {
        match self {
            CacheLookup::Fresh { value, .. } => Some(value),
            _ => None,
        }
    }

    /// Any stored value no older than `max_stale`, fresh or not.
    pub fn within(self, max_stale: Duration) -> Option<T> {
        match self {
            CacheLookup::Fresh { value, .. } => Some(value),
            CacheLookup::Stale { value, age } if age < max_stale => Some(value),
            _ => None,
        }
    }
}

/// Response cache keyed by [`RequestKey`], storing serialized payloads.
///
/// Backend choice (process-local [`super::MemoryCache`] vs a shared store) is
/// made by whoever constructs this.
pub struct ResponseCache {
    config: CacheConfig,
    backend: Arc<dyn CacheBackend>,
    clock: Arc<dyn Clock>,
    stats: Arc<AtomicStats>,
}

impl ResponseCache {
    pub fn new(config: CacheConfig, backend: Arc<dyn CacheBackend>) -> Self {
        Self::with_clock(config, backend, system_clock())
    }

    pub fn with_clock(
        config: CacheConfig,
        backend: Arc<dyn CacheBackend>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            backend,
            clock,
            stats: Arc::new(AtomicStats::new()),
        }
    }

    /// Stored value only if `now - stored_at < max_age`; otherwise a miss.
    pub async fn get<T: DeserializeOwned>(
        &self,
        key: &RequestKey,
        max_age: Duration,
    ) -> Result<Option<T>> {
        Ok(self.lookup(key, max_age).await?.fresh())
    }

    pub async fn lookup<T: DeserializeOwned>(
        &self,
        key: &RequestKey,
        max_age: Duration,
    ) -> Result<CacheLookup<T>> {
        let raw = self.lookup_raw(key, max_age).await?;
        let decoded = match raw {
            CacheLookup::Fresh { value, age } => {
                self.decode(key, &value).map(|value| CacheLookup::Fresh { value, age })
            }
            CacheLookup::Stale { value, age } => {
                self.decode(key, &value).map(|value| CacheLookup::Stale { value, age })
            }
            CacheLookup::Miss => None,
        };
        Ok(decoded.unwrap_or(CacheLookup::Miss))
    }

    /// Lookup without decoding the payload.
    pub async fn lookup_raw(
        &self,
        key: &RequestKey,
        max_age: Duration,
    ) -> Result<CacheLookup<Bytes>> {
        if !self.config.enabled {
            return Ok(CacheLookup::Miss);
        }
        let storage_key = self.storage_key(key);
        let entry = match self.backend.entry(&storage_key).await {
            Ok(entry) => entry,
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };
        let Some(entry) = entry else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            debug!(key = %storage_key, "cache miss");
            return Ok(CacheLookup::Miss);
        };
        let now = self.clock.now_ms();
        let age = Duration::from_millis(entry.age_ms(now));
        if entry.is_fresh(now, max_age.as_millis() as u64) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            debug!(key = %storage_key, age_ms = age.as_millis() as u64, "cache hit");
            Ok(CacheLookup::Fresh {
                value: entry.value,
                age,
            })
        } else {
            self.stats.stale.fetch_add(1, Ordering::Relaxed);
            debug!(key = %storage_key, age_ms = age.as_millis() as u64, "cache entry stale");
            Ok(CacheLookup::Stale {
                value: entry.value,
                age,
            })
        }
    }

    /// Overwrite the entry for `key` with `stored_at = now`.
    pub async fn set<T: Serialize>(&self, key: &RequestKey, value: &T) -> Result<()> {
        let data = serde_json::to_vec(value)?;
        self.set_raw(key, Bytes::from(data)).await
    }

    pub async fn set_raw(&self, key: &RequestKey, data: Bytes) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        if data.len() > self.config.max_entry_size {
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, size = data.len(), "payload exceeds max_entry_size, not cached");
            return Ok(());
        }
        let storage_key = self.storage_key(key);
        match self
            .backend
            .store(&storage_key, stamp(self.clock.as_ref(), data))
            .await
        {
            Ok(()) => {
                self.stats.sets.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    pub async fn clear(&self) -> Result<()> {
        self.backend.clear().await
    }

    pub async fn len(&self) -> Result<usize> {
        self.backend.len().await
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.to_stats()
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    fn decode<T: DeserializeOwned>(&self, key: &RequestKey, data: &[u8]) -> Option<T> {
        match serde_json::from_slice(data) {
            Ok(val) => Some(val),
            Err(e) => {
                // A payload of another shape under the same key reads as a miss.
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %e, "cached payload could not be decoded");
                None
            }
        }
    }

    fn storage_key(&self, key: &RequestKey) -> String {
        match self.config.key_prefix {
            Some(ref p) => format!("{}:{}", p, key.as_str()),
            None => key.as_str().to_string(),
        }
    }
}
