//! Admission limiting module: sliding-window rate limits per caller identity.
//!
//! # Admission Limiter
//!
//! Bounds the rate of upstream-bound requests per [`Identity`] and named
//! [`LimiterName`] policy. Checked first in the request path so a denied
//! caller fails fast, before any cache or upstream work.
//!
//! ## Algorithm
//!
//! A sliding log: every admitted request is recorded with its timestamp, and
//! a request is admitted iff fewer than `max_requests` recorded requests fall
//! in the trailing `window` ending now. Unlike fixed buckets, two bursts
//! straddling a bucket boundary cannot add up to `2 × max_requests`.
//!
//! ## Shared state
//!
//! | Store | Use |
//! |-------|-----|
//! | [`MemoryRateLimitStore`] | Tests, single-instance deployments |
//! | `RedisRateLimitStore` (feature `redis`) | Production: one atomic Lua script per check |
//!
//! With several serving instances a process-local store would let a burst
//! spread across instances bypass the limit, so production wiring must use a
//! shared store.
//!
//! ## Store outages
//!
//! [`STORE_FAILURE_POLICY`] decides, for every code path, what happens when
//! the store cannot be reached.
//!
//! ```rust
//! use catalog_guard::limiter::{AdmissionLimiter, Identity, LimiterName, MemoryRateLimitStore};
//! use std::sync::Arc;
//!
//! # async fn demo() -> catalog_guard::Result<()> {
//! let limiter = AdmissionLimiter::new(Arc::new(MemoryRateLimitStore::new()));
//! let decision = limiter.check(&Identity::user("usr_1"), LimiterName::Checkout).await?;
//! assert!(decision.allowed);
//! assert_eq!(decision.remaining, 4);
//! # Ok(())
//! # }
//! ```

mod admission;
mod identity;
mod policy;
mod store;

pub use admission::{AdmissionLimiter, Decision};
pub use identity::{Identity, FORWARDED_FOR, REAL_IP};
pub use policy::{FailurePolicy, LimitPolicy, LimiterName, LimiterTable, STORE_FAILURE_POLICY};
pub use store::{MemoryRateLimitStore, RateLimitStore, WindowSnapshot};
