use super::RedisStore;
use crate::cache::{CacheBackend, CacheEntry};
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// Response cache shared across instances.
///
/// Each entry is a hash of `value` and `stored_at`, written in one atomic
/// pipeline. Freshness stays a read-time decision; `retention` only bounds
/// how long a stale entry can be kept around for fallback.
#[derive(Clone, Debug)]
pub struct RedisCache {
    store: RedisStore,
    retention: Option<Duration>,
}

impl RedisCache {
    pub fn new(store: RedisStore) -> Self {
        Self {
            store,
            retention: None,
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn entry(&self, key: &str) -> Result<Option<CacheEntry>> {
        let redis_key = self.store.key_response(key);
        let (value, stored_at): (Option<Vec<u8>>, Option<u64>) = self
            .store
            .run("cache.get", async {
                let mut conn = self.store.connection().await?;
                redis::cmd("HMGET")
                    .arg(&redis_key)
                    .arg("value")
                    .arg("stored_at")
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(match (value, stored_at) {
            (Some(value), Some(stored_at)) => Some(CacheEntry::new(Bytes::from(value), stored_at)),
            _ => None,
        })
    }

    async fn store(&self, key: &str, entry: CacheEntry) -> Result<()> {
        let redis_key = self.store.key_response(key);
        self.store
            .run("cache.set", async {
                let mut conn = self.store.connection().await?;
                let mut pipe = redis::pipe();
                pipe.atomic()
                    .cmd("HSET")
                    .arg(&redis_key)
                    .arg("value")
                    .arg(entry.value.as_ref())
                    .arg("stored_at")
                    .arg(entry.stored_at_ms)
                    .ignore();
                match self.retention {
                    Some(retention) => {
                        pipe.cmd("PEXPIRE")
                            .arg(&redis_key)
                            .arg(retention.as_millis() as u64)
                            .ignore();
                    }
                    None => {
                        pipe.cmd("PERSIST").arg(&redis_key).ignore();
                    }
                }
                pipe.query_async::<()>(&mut conn).await
            })
            .await
    }

    async fn clear(&self) -> Result<()> {
        let pattern = self.store.response_pattern();
        self.store
            .run("cache.clear", async {
                let mut conn = self.store.connection().await?;
                let keys: Vec<String> = redis::cmd("KEYS")
                    .arg(&pattern)
                    .query_async(&mut conn)
                    .await?;
                if !keys.is_empty() {
                    redis::cmd("DEL")
                        .arg(keys)
                        .query_async::<()>(&mut conn)
                        .await?;
                }
                Ok(())
            })
            .await
    }

    async fn len(&self) -> Result<usize> {
        let pattern = self.store.response_pattern();
        let keys: Vec<String> = self
            .store
            .run("cache.len", async {
                let mut conn = self.store.connection().await?;
                redis::cmd("KEYS").arg(&pattern).query_async(&mut conn).await
            })
            .await?;
        Ok(keys.len())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
