//! Redis-backed shared state (feature `redis`).
//!
//! One [`RedisStore`] handle is shared by the rate-limit store and the
//! optional shared response cache. Every operation is bounded by an
//! operation timeout; connection and timeout failures surface as
//! [`Error::SharedStoreUnavailable`].

use crate::{Error, ErrorContext, Result};
use redis::aio::MultiplexedConnection;
use redis::RedisError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

mod rate_limits;
mod response_cache;

pub use rate_limits::RedisRateLimitStore;
pub use response_cache::RedisCache;

const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    prefix: String,
    operation_timeout: Duration,
    conn: Arc<Mutex<Option<MultiplexedConnection>>>,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("prefix", &self.prefix)
            .field("operation_timeout", &self.operation_timeout)
            .finish()
    }
}

impl RedisStore {
    pub fn new(url: impl AsRef<str>) -> Result<Self> {
        let client = redis::Client::open(url.as_ref()).map_err(|e| {
            Error::configuration_with_context(
                format!("invalid redis url: {}", e),
                ErrorContext::new().with_source("redis_store"),
            )
        })?;
        Ok(Self {
            client,
            prefix: "guard".to_string(),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            conn: Arc::new(Mutex::new(None)),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub async fn ping(&self) -> Result<()> {
        self.run("ping", async {
            let mut conn = self.connection().await?;
            redis::cmd("PING").query_async::<String>(&mut conn).await?;
            Ok(())
        })
        .await
    }

    async fn connection(&self) -> std::result::Result<MultiplexedConnection, RedisError> {
        let mut slot = self.conn.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.client.get_multiplexed_async_connection().await?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// Run one store operation under the operation timeout.
    async fn run<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, RedisError>>,
    {
        match tokio::time::timeout(self.operation_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
                    // next operation reconnects
                    self.conn.lock().await.take();
                }
                Err(unavailable(op, e))
            }
            Err(_) => {
                self.conn.lock().await.take();
                Err(unavailable(
                    op,
                    format!("timed out after {:?}", self.operation_timeout),
                ))
            }
        }
    }

    fn key_rate_limit(&self, key: &str) -> String {
        format!("{}:rate_limit:{key}", self.prefix)
    }

    fn key_response(&self, key: &str) -> String {
        format!("{}:response:{key}", self.prefix)
    }

    fn response_pattern(&self) -> String {
        format!("{}:response:*", self.prefix)
    }
}

fn unavailable(op: &str, err: impl std::fmt::Display) -> Error {
    Error::store_unavailable_with_context(
        format!("redis {op} failed: {err}"),
        ErrorContext::new().with_source("redis_store"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_url_is_configuration_error() {
        let err = RedisStore::new("not a url").unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[test]
    fn test_key_layout() {
        let store = RedisStore::new("redis://127.0.0.1:6379")
            .unwrap()
            .with_prefix("shop");
        assert_eq!(store.key_rate_limit("a:b"), "shop:rate_limit:a:b");
        assert_eq!(store.key_response("products:1"), "shop:response:products:1");
        assert_eq!(store.response_pattern(), "shop:response:*");
    }

    #[tokio::test]
    async fn test_unreachable_server_is_store_unavailable() {
        // nothing listens on port 1
        let store = RedisStore::new("redis://127.0.0.1:1")
            .unwrap()
            .with_operation_timeout(Duration::from_millis(500));
        let err = store.ping().await.unwrap_err();
        assert!(matches!(err, Error::SharedStoreUnavailable { .. }));
    }
}
