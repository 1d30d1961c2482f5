//! Request coordination: admission, cache, in-flight sharing, upstream.
//!
//! [`Coordinator::fetch`] runs the whole path for one logical request:
//!
//! 1. the [`AdmissionLimiter`] counts the caller against a named limiter and
//!    fails fast with [`Error::RateLimited`]
//! 2. the descriptor's cache key is looked up with the caller's `max_age`
//! 3. on a miss the upstream call goes through the [`InFlightDeduplicator`],
//!    keyed in the flight keyspace
//! 4. the leader's background task stores the result in the cache, even if
//!    every waiter has already given up

use crate::cache::{
    CacheBackend, CacheConfig, CacheLookup, KeyDeriver, MemoryCache, RequestDescriptor, RequestKey,
    ResponseCache,
};
use crate::clock::{system_clock, Clock};
use crate::dedup::{FlightRole, InFlightDeduplicator};
use crate::error::BoxError;
use crate::limiter::{
    AdmissionLimiter, Decision, FailurePolicy, Identity, LimiterName, LimiterTable,
    MemoryRateLimitStore, RateLimitStore,
};
use crate::{Error, Result};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// How a response was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Served from a fresh cache entry.
    Hit,
    /// This caller led the upstream call.
    Miss,
    /// Joined an upstream call another caller started.
    Shared,
    /// Upstream failed or timed out; an older entry was served.
    Stale,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Shared => "SHARED",
            CacheStatus::Stale => "STALE",
        }
    }
}

impl std::fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-call settings chosen by the route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchPolicy {
    pub limiter: LimiterName,
    pub max_age: Duration,
    /// Wait bound for this caller; `None` uses the coordinator default.
    pub timeout: Option<Duration>,
    /// Serve an entry up to this old when upstream fails. Off by default.
    pub stale_fallback: Option<Duration>,
}

impl FetchPolicy {
    pub fn new(limiter: LimiterName, max_age: Duration) -> Self {
        Self {
            limiter,
            max_age,
            timeout: None,
            stale_fallback: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_stale_fallback(mut self, max_stale: Duration) -> Self {
        self.stale_fallback = Some(max_stale);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fetched<T> {
    pub value: T,
    pub cache_status: CacheStatus,
    pub decision: Decision,
}

impl<T> Fetched<T> {
    pub fn into_value(self) -> T {
        self.value
    }
}

/// Owns the limiter, cache and deduplicator for one serving process.
pub struct Coordinator {
    limiter: Arc<AdmissionLimiter>,
    cache: Arc<ResponseCache>,
    dedup: InFlightDeduplicator<Bytes>,
    deriver: KeyDeriver,
    default_timeout: Duration,
}

impl Coordinator {
    pub fn new(limiter: Arc<AdmissionLimiter>, cache: Arc<ResponseCache>) -> Self {
        Self {
            limiter,
            cache,
            dedup: InFlightDeduplicator::new(),
            deriver: KeyDeriver::new(),
            default_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }

    pub fn builder() -> CoordinatorBuilder {
        CoordinatorBuilder::new()
    }

    pub fn limiter(&self) -> &AdmissionLimiter {
        &self.limiter
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn deduplicator(&self) -> &InFlightDeduplicator<Bytes> {
        &self.dedup
    }

    pub fn deriver(&self) -> &KeyDeriver {
        &self.deriver
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Admit, then serve `descriptor` from cache or from `compute`.
    pub async fn fetch<D, T, F, Fut, E>(
        &self,
        identity: &Identity,
        descriptor: &D,
        policy: FetchPolicy,
        compute: F,
    ) -> Result<Fetched<T>>
    where
        D: RequestDescriptor,
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let decision = self.limiter.enforce(identity, policy.limiter).await?;

        let cache_key = descriptor.cache_key(&self.deriver);
        let lookup = match self.cache.lookup_raw(&cache_key, policy.max_age).await {
            Ok(lookup) => lookup,
            Err(e) => {
                // the cache only saves work; an unreachable backend reads as a miss
                warn!(key = %cache_key, error = %e, "cache lookup failed");
                CacheLookup::Miss
            }
        };
        let stale = match lookup {
            CacheLookup::Fresh { value, .. } => {
                if let Ok(value) = serde_json::from_slice::<T>(&value) {
                    return Ok(Fetched {
                        value,
                        cache_status: CacheStatus::Hit,
                        decision,
                    });
                }
                None
            }
            CacheLookup::Stale { value, age } => Some((value, age)),
            CacheLookup::Miss => None,
        };

        let flight_key = descriptor.flight_key(&self.deriver);
        let timeout = policy.timeout.unwrap_or(self.default_timeout);
        let cache = self.cache.clone();
        let populate_key = cache_key.clone();
        let outcome = self
            .dedup
            .deduplicate_with_role(
                flight_key.as_str(),
                move || compute_and_store(compute(), cache, populate_key),
                timeout,
            )
            .await;

        match outcome {
            Ok((bytes, role)) => {
                let value = serde_json::from_slice(&bytes)?;
                let cache_status = match role {
                    FlightRole::Leader => CacheStatus::Miss,
                    FlightRole::Follower => CacheStatus::Shared,
                };
                Ok(Fetched {
                    value,
                    cache_status,
                    decision,
                })
            }
            Err(e @ (Error::Upstream(_) | Error::DeduplicationTimeout { .. })) => {
                let fallback = policy
                    .stale_fallback
                    .zip(stale)
                    .filter(|(max_stale, (_, age))| age < max_stale)
                    .and_then(|(_, (bytes, age))| {
                        serde_json::from_slice::<T>(&bytes).ok().map(|v| (v, age))
                    });
                match fallback {
                    Some((value, age)) => {
                        warn!(key = %cache_key, age_ms = age.as_millis() as u64, error = %e, "serving stale entry");
                        Ok(Fetched {
                            value,
                            cache_status: CacheStatus::Stale,
                            decision,
                        })
                    }
                    None => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }
}

/// Body of the leader's background task: run upstream, then warm the cache.
async fn compute_and_store<T, Fut, E>(
    upstream: Fut,
    cache: Arc<ResponseCache>,
    key: RequestKey,
) -> std::result::Result<Bytes, BoxError>
where
    T: Serialize,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Into<BoxError>,
{
    let value = match upstream.await {
        Ok(value) => value,
        Err(e) => return Err(e.into()),
    };
    let bytes = Bytes::from(serde_json::to_vec(&value)?);
    if let Err(e) = cache.set_raw(&key, bytes.clone()).await {
        warn!(key = %key, error = %e, "cache populate failed");
    } else {
        debug!(key = %key, size = bytes.len(), "cache populated");
    }
    Ok(bytes)
}

/// Builder for [`Coordinator`].
///
/// Unset fields fall back to env:
/// - `CATALOG_GUARD_KEY_PREFIX` (default `guard`)
/// - `CATALOG_GUARD_LIMITS_FILE` (YAML limiter overrides)
/// - `CATALOG_GUARD_CACHE_MAX_ENTRY_BYTES`
/// - `CATALOG_GUARD_DEDUP_TIMEOUT_MS` (default 10000)
/// - `CATALOG_GUARD_REDIS_URL` (feature `redis`: shared limiter store)
pub struct CoordinatorBuilder {
    limiter_store: Option<Arc<dyn RateLimitStore>>,
    cache_backend: Option<Arc<dyn CacheBackend>>,
    cache_config: Option<CacheConfig>,
    table: Option<LimiterTable>,
    key_prefix: Option<String>,
    failure_policy: Option<FailurePolicy>,
    deriver: KeyDeriver,
    clock: Arc<dyn Clock>,
    default_timeout: Option<Duration>,
    #[cfg(feature = "redis")]
    redis_url: Option<String>,
    #[cfg(feature = "redis")]
    shared_cache: bool,
}

impl CoordinatorBuilder {
    pub fn new() -> Self {
        Self {
            limiter_store: None,
            cache_backend: None,
            cache_config: None,
            table: None,
            key_prefix: None,
            failure_policy: None,
            deriver: KeyDeriver::new(),
            clock: system_clock(),
            default_timeout: None,
            #[cfg(feature = "redis")]
            redis_url: None,
            #[cfg(feature = "redis")]
            shared_cache: false,
        }
    }

    pub fn limiter_store(mut self, store: Arc<dyn RateLimitStore>) -> Self {
        self.limiter_store = Some(store);
        self
    }

    pub fn cache_backend(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.cache_backend = Some(backend);
        self
    }

    pub fn cache_config(mut self, config: CacheConfig) -> Self {
        self.cache_config = Some(config);
        self
    }

    pub fn limiter_table(mut self, table: LimiterTable) -> Self {
        self.table = Some(table);
        self
    }

    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    /// Replaces [`STORE_FAILURE_POLICY`](crate::limiter::STORE_FAILURE_POLICY)
    /// for the limiter this builder wires up.
    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = Some(policy);
        self
    }

    pub fn key_deriver(mut self, deriver: KeyDeriver) -> Self {
        self.deriver = deriver;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    #[cfg(feature = "redis")]
    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    /// Also keep the response cache in Redis instead of process memory.
    #[cfg(feature = "redis")]
    pub fn shared_cache(mut self, enable: bool) -> Self {
        self.shared_cache = enable;
        self
    }

    pub fn build(self) -> Result<Coordinator> {
        let key_prefix = self
            .key_prefix
            .or_else(|| std::env::var("CATALOG_GUARD_KEY_PREFIX").ok())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "guard".to_string());

        let table = match self.table {
            Some(table) => table,
            None => match std::env::var("CATALOG_GUARD_LIMITS_FILE") {
                Ok(path) => LimiterTable::from_yaml_file(&path)?,
                Err(_) => LimiterTable::default(),
            },
        };

        let cache_config = self.cache_config.unwrap_or_else(|| {
            let config = CacheConfig::default();
            match std::env::var("CATALOG_GUARD_CACHE_MAX_ENTRY_BYTES")
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
            {
                Some(bytes) => config.with_max_entry_size(bytes),
                None => config,
            }
        });

        let default_timeout = self
            .default_timeout
            .or_else(|| {
                std::env::var("CATALOG_GUARD_DEDUP_TIMEOUT_MS")
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
                    .filter(|ms| *ms > 0)
                    .map(Duration::from_millis)
            })
            .unwrap_or(DEFAULT_FETCH_TIMEOUT);

        #[cfg(feature = "redis")]
        let (limiter_store, cache_backend) = {
            let mut limiter_store = self.limiter_store;
            let mut cache_backend = self.cache_backend;
            let url = self
                .redis_url
                .or_else(|| std::env::var("CATALOG_GUARD_REDIS_URL").ok());
            if let Some(url) = url {
                let redis = crate::redis_store::RedisStore::new(&url)?.with_prefix(&key_prefix);
                if limiter_store.is_none() {
                    limiter_store = Some(Arc::new(crate::redis_store::RedisRateLimitStore::new(
                        redis.clone(),
                    )));
                }
                if self.shared_cache && cache_backend.is_none() {
                    cache_backend = Some(Arc::new(crate::redis_store::RedisCache::new(redis)));
                }
            }
            (limiter_store, cache_backend)
        };
        #[cfg(not(feature = "redis"))]
        let (limiter_store, cache_backend) = {
            if self.limiter_store.is_none() && std::env::var("CATALOG_GUARD_REDIS_URL").is_ok() {
                warn!("CATALOG_GUARD_REDIS_URL is set but the `redis` feature is disabled; using the in-memory limiter store");
            }
            (self.limiter_store, self.cache_backend)
        };

        let limiter_store =
            limiter_store.unwrap_or_else(|| Arc::new(MemoryRateLimitStore::new()));
        let cache_backend = cache_backend.unwrap_or_else(|| Arc::new(MemoryCache::new()));

        let mut limiter = AdmissionLimiter::new(limiter_store)
            .with_table(table)
            .with_clock(self.clock.clone())
            .with_key_prefix(key_prefix);
        if let Some(policy) = self.failure_policy {
            limiter = limiter.with_failure_policy(policy);
        }
        let cache = ResponseCache::with_clock(cache_config, cache_backend, self.clock);

        info!(
            limiter_store = limiter.store_name(),
            cache_backend = cache.backend_name(),
            failure_policy = ?limiter.failure_policy(),
            default_timeout_ms = default_timeout.as_millis() as u64,
            "request coordinator ready"
        );

        Ok(Coordinator {
            limiter: Arc::new(limiter),
            cache: Arc::new(cache),
            dedup: InFlightDeduplicator::new(),
            deriver: self.deriver,
            default_timeout,
        })
    }
}

impl Default for CoordinatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
