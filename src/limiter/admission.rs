use super::identity::Identity;
use super::policy::{FailurePolicy, LimitPolicy, LimiterName, LimiterTable, STORE_FAILURE_POLICY};
use super::store::{RateLimitStore, WindowSnapshot};
use crate::clock::{system_clock, Clock};
use crate::{Error, ErrorContext, Result};
use arc_swap::ArcSwap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Result of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub limiter: LimiterName,
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Epoch ms at which the oldest counted request leaves the window.
    pub reset_at_ms: u64,
    /// Taken without the shared store (fail-open).
    pub degraded: bool,
}

impl Decision {
    pub fn retry_after(&self, now_ms: u64) -> Duration {
        Duration::from_millis(self.reset_at_ms.saturating_sub(now_ms))
    }

    /// `Err(Error::RateLimited)` when denied.
    pub fn into_result(self) -> Result<Decision> {
        if self.allowed {
            return Ok(self);
        }
        Err(Error::RateLimited {
            limiter: self.limiter.to_string(),
            limit: self.limit,
            remaining: self.remaining,
            reset_at_ms: self.reset_at_ms,
        })
    }
}

/// Sliding-window admission control per identity and named limiter.
///
/// Window state lives in a [`RateLimitStore`]; with more than one serving
/// instance that store has to be shared (see `RedisRateLimitStore`).
pub struct AdmissionLimiter {
    store: Arc<dyn RateLimitStore>,
    table: ArcSwap<LimiterTable>,
    clock: Arc<dyn Clock>,
    key_prefix: String,
    failure_policy: FailurePolicy,
}

impl AdmissionLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>) -> Self {
        Self {
            store,
            table: ArcSwap::from_pointee(LimiterTable::default()),
            clock: system_clock(),
            key_prefix: "guard".to_string(),
            failure_policy: STORE_FAILURE_POLICY,
        }
    }

    pub fn with_table(self, table: LimiterTable) -> Self {
        self.table.store(Arc::new(table));
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Deployment-level replacement for [`STORE_FAILURE_POLICY`], applied to
    /// every code path of this limiter.
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Swap in new deployment thresholds without a restart.
    pub fn reload_table(&self, table: LimiterTable) {
        self.table.store(Arc::new(table));
    }

    pub fn policy(&self, name: LimiterName) -> LimitPolicy {
        self.table.load().policy(name)
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Evaluate and, if allowed, count one request for `identity`.
    pub async fn check(&self, identity: &Identity, name: LimiterName) -> Result<Decision> {
        let policy = self.policy(name);
        let key = self.storage_key(identity, name);
        let now = self.clock.now_ms();
        match self.store.admit(&key, now, policy).await {
            Ok(snapshot) => {
                let decision = decide(name, policy, now, snapshot, snapshot.admitted);
                if decision.allowed {
                    debug!(%identity, limiter = %name, remaining = decision.remaining, "admitted");
                } else {
                    debug!(%identity, limiter = %name, reset_at_ms = decision.reset_at_ms, "rate limited");
                }
                Ok(decision)
            }
            Err(e) => self.on_store_failure(identity, name, policy, now, e),
        }
    }

    /// Like [`check`](Self::check), but a denial becomes `Error::RateLimited`.
    pub async fn enforce(&self, identity: &Identity, name: LimiterName) -> Result<Decision> {
        self.check(identity, name).await?.into_result()
    }

    /// Current quota for `identity` without counting a request.
    pub async fn status(&self, identity: &Identity, name: LimiterName) -> Result<Decision> {
        let policy = self.policy(name);
        let key = self.storage_key(identity, name);
        let now = self.clock.now_ms();
        match self.store.peek(&key, now, policy.window).await {
            Ok(snapshot) => {
                let allowed = snapshot.count < policy.max_requests;
                Ok(decide(name, policy, now, snapshot, allowed))
            }
            Err(e) => self.on_store_failure(identity, name, policy, now, e),
        }
    }

    fn on_store_failure(
        &self,
        identity: &Identity,
        name: LimiterName,
        policy: LimitPolicy,
        now: u64,
        err: Error,
    ) -> Result<Decision> {
        match self.failure_policy {
            FailurePolicy::FailOpen => {
                warn!(%identity, limiter = %name, store = self.store.name(), error = %err, "rate-limit store unavailable, failing open");
                Ok(Decision {
                    limiter: name,
                    allowed: true,
                    limit: policy.max_requests,
                    remaining: policy.max_requests,
                    reset_at_ms: now + policy.window_ms(),
                    degraded: true,
                })
            }
            FailurePolicy::FailClosed => {
                warn!(%identity, limiter = %name, store = self.store.name(), error = %err, "rate-limit store unavailable, failing closed");
                Err(match err {
                    Error::SharedStoreUnavailable { .. } => err,
                    other => Error::store_unavailable_with_context(
                        other.to_string(),
                        ErrorContext::new()
                            .with_source("admission_limiter")
                            .with_details(format!("store={}", self.store.name())),
                    ),
                })
            }
        }
    }

    fn storage_key(&self, identity: &Identity, name: LimiterName) -> String {
        format!("{}:rl:{}:{}", self.key_prefix, name, identity.as_key())
    }
}

fn decide(
    name: LimiterName,
    policy: LimitPolicy,
    now: u64,
    snapshot: WindowSnapshot,
    allowed: bool,
) -> Decision {
    let reset_at_ms = snapshot.oldest_ms.unwrap_or(now) + policy.window_ms();
    Decision {
        limiter: name,
        allowed,
        limit: policy.max_requests,
        remaining: policy.max_requests.saturating_sub(snapshot.count),
        reset_at_ms,
        degraded: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::limiter::store::MemoryRateLimitStore;
    use async_trait::async_trait;

    struct DownStore;

    #[async_trait]
    impl RateLimitStore for DownStore {
        async fn admit(&self, _: &str, _: u64, _: LimitPolicy) -> Result<WindowSnapshot> {
            Err(Error::store_unavailable_with_context(
                "connection refused",
                ErrorContext::new().with_source("test"),
            ))
        }
        async fn peek(&self, _: &str, _: u64, _: Duration) -> Result<WindowSnapshot> {
            Err(Error::store_unavailable_with_context(
                "connection refused",
                ErrorContext::new().with_source("test"),
            ))
        }
        fn name(&self) -> &'static str {
            "down"
        }
    }

    fn limiter(clock: Arc<ManualClock>) -> AdmissionLimiter {
        AdmissionLimiter::new(Arc::new(MemoryRateLimitStore::new())).with_clock(clock)
    }

    #[tokio::test]
    async fn test_decision_metadata() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let limiter = limiter(clock.clone());
        let who = Identity::user("u1");

        let first = limiter.check(&who, LimiterName::Checkout).await.unwrap();
        assert!(first.allowed);
        assert_eq!(first.limit, 5);
        assert_eq!(first.remaining, 4);
        assert_eq!(first.reset_at_ms, 1_000_000 + 15 * 60 * 1000);
        assert!(!first.degraded);

        clock.advance(Duration::from_secs(60));
        let second = limiter.check(&who, LimiterName::Checkout).await.unwrap();
        assert_eq!(second.remaining, 3);
        // reset follows the oldest request, not the latest
        assert_eq!(second.reset_at_ms, first.reset_at_ms);
        assert_eq!(second.retry_after(clock.now_ms()), Duration::from_secs(14 * 60));
    }

    #[tokio::test]
    async fn test_limiters_and_identities_are_independent() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = limiter(clock).with_table(
            LimiterTable::default()
                .with_policy(LimiterName::Checkout, LimitPolicy::new(1, Duration::from_secs(60))),
        );
        let a = Identity::user("a");
        let b = Identity::user("b");
        assert!(limiter.check(&a, LimiterName::Checkout).await.unwrap().allowed);
        assert!(!limiter.check(&a, LimiterName::Checkout).await.unwrap().allowed);
        assert!(limiter.check(&b, LimiterName::Checkout).await.unwrap().allowed);
        assert!(limiter.check(&a, LimiterName::CatalogRead).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_enforce_returns_rate_limited() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = limiter(clock).with_table(
            LimiterTable::default()
                .with_policy(LimiterName::Validation, LimitPolicy::new(1, Duration::from_secs(10))),
        );
        let who = Identity::Unknown;
        limiter.enforce(&who, LimiterName::Validation).await.unwrap();
        match limiter.enforce(&who, LimiterName::Validation).await {
            Err(Error::RateLimited {
                limiter,
                limit,
                remaining,
                reset_at_ms,
            }) => {
                assert_eq!(limiter, "validation");
                assert_eq!(limit, 1);
                assert_eq!(remaining, 0);
                assert_eq!(reset_at_ms, 10_000);
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_status_does_not_consume() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = limiter(clock);
        let who = Identity::user("u");
        limiter.check(&who, LimiterName::Checkout).await.unwrap();
        for _ in 0..10 {
            let status = limiter.status(&who, LimiterName::Checkout).await.unwrap();
            assert!(status.allowed);
            assert_eq!(status.remaining, 4);
        }
    }

    #[tokio::test]
    async fn test_reload_table_applies_immediately() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = limiter(clock);
        let who = Identity::user("u");
        assert_eq!(limiter.policy(LimiterName::Checkout).max_requests, 5);
        limiter.reload_table(
            LimiterTable::default()
                .with_policy(LimiterName::Checkout, LimitPolicy::new(1, Duration::from_secs(60))),
        );
        assert!(limiter.check(&who, LimiterName::Checkout).await.unwrap().allowed);
        assert!(!limiter.check(&who, LimiterName::Checkout).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_fail_open_is_flagged() {
        assert_eq!(STORE_FAILURE_POLICY, FailurePolicy::FailOpen);
        let limiter = AdmissionLimiter::new(Arc::new(DownStore));
        let who = Identity::user("u");
        let decision = limiter.check(&who, LimiterName::Checkout).await.unwrap();
        assert!(decision.allowed);
        assert!(decision.degraded);
        let status = limiter.status(&who, LimiterName::Checkout).await.unwrap();
        assert!(status.degraded);
    }

    #[tokio::test]
    async fn test_fail_closed_surfaces_store_error() {
        let limiter = AdmissionLimiter::new(Arc::new(DownStore))
            .with_failure_policy(FailurePolicy::FailClosed);
        let who = Identity::user("u");
        let err = limiter.check(&who, LimiterName::Checkout).await.unwrap_err();
        assert!(matches!(err, Error::SharedStoreUnavailable { .. }));
        let err = limiter.enforce(&who, LimiterName::Checkout).await.unwrap_err();
        assert_eq!(err.http_status(), 503);
        assert!(limiter.status(&who, LimiterName::Checkout).await.is_err());
    }
}
