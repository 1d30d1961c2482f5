//! Response caching and request key derivation.
//!
//! # Response Cache
//!
//! Stores the most recent upstream result per [`RequestKey`] together with the
//! time it was stored. Freshness is a per-call policy: every lookup supplies
//! its own `max_age`, so the same entry can be fresh for a static listing and
//! stale for a search page. Stale entries are kept, never deleted.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`ResponseCache`] | Typed get/set with per-lookup freshness and statistics |
//! | [`CacheConfig`] | Enable switch, entry size ceiling, key prefix |
//! | [`CacheBackend`] | Trait for implementing custom cache backends |
//! | [`MemoryCache`] | Process-local backend |
//! | [`NullCache`] | No-op backend for disabling caching |
//! | [`KeyDeriver`] | Stable key derivation from [`CanonicalParams`] |
//! | [`RequestDescriptor`] | Typed per-call-site request description |
//!
//! ## Example
//!
//! ```rust
//! use catalog_guard::cache::{CacheConfig, CanonicalParams, KeyDeriver, MemoryCache, ResponseCache};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn demo() -> catalog_guard::Result<()> {
//! let cache = ResponseCache::new(CacheConfig::default(), Arc::new(MemoryCache::new()));
//! let key = KeyDeriver::new().derive("products", &CanonicalParams::new().with("page", 1));
//! cache.set(&key, &vec!["sku-1"]).await?;
//! let hit: Option<Vec<String>> = cache.get(&key, Duration::from_secs(60)).await?;
//! assert!(hit.is_some());
//! # Ok(())
//! # }
//! ```
//!
//! ## Key Derivation
//!
//! Keys are derived from a sorted parameter map, so any enumeration order of
//! the same parameters yields the same key. Absent parameters are encoded as
//! an explicit "omitted" marker instead of being dropped.

mod backend;
mod key;
mod manager;

pub use backend::{CacheBackend, CacheEntry, MemoryCache, NullCache};
pub use key::{
    derive_key, derive_salted_key, CanonicalParams, KeyDeriver, KeyFormat, ParamValue,
    RequestDescriptor, RequestKey,
};
pub use manager::{CacheConfig, CacheLookup, CacheStats, ResponseCache};

pub(crate) use key::sha256_hex;
