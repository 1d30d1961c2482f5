//! # catalog-guard
//!
//! Request coordination layer for expensive, rate-limited upstream calls
//! such as a product catalog API.
//!
//! ## Overview
//!
//! Every upstream-bound request goes through the same path:
//!
//! ```text
//! admission limiter -> key derivation -> response cache
//!     -> (miss) in-flight deduplicator -> upstream -> cache populate
//! ```
//!
//! The layer never knows how the upstream call is made; it receives a
//! `compute` function and decides whether, and how often, to run it.
//!
//! ## Key Features
//!
//! - **Per-lookup freshness**: [`cache::ResponseCache`] keeps the latest
//!   result per key; each caller decides what `max_age` it accepts
//! - **Single flight**: [`dedup::InFlightDeduplicator`] runs at most one
//!   upstream call per key and shares the outcome with every concurrent caller
//! - **Sliding-window admission**: [`limiter::AdmissionLimiter`] counts
//!   requests per identity and named limiter against a pluggable shared store
//! - **Typed keys**: [`cache::RequestDescriptor`] makes every call site spell
//!   out its canonical parameters
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use catalog_guard::catalog::ProductListQuery;
//! use catalog_guard::error::BoxError;
//! use catalog_guard::limiter::{Identity, LimiterName};
//! use catalog_guard::{Coordinator, FetchPolicy};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> catalog_guard::Result<()> {
//!     let coordinator = Coordinator::builder().build()?;
//!     let policy = FetchPolicy::new(LimiterName::CatalogRead, Duration::from_secs(60));
//!
//!     let fetched = coordinator
//!         .fetch(
//!             &Identity::user("usr_1"),
//!             &ProductListQuery::default(),
//!             policy,
//!             || async { Ok::<_, BoxError>(vec!["sku-1".to_string()]) },
//!         )
//!         .await?;
//!     println!("{} ({})", fetched.value.len(), fetched.cache_status);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`cache`] | Key derivation and the response cache |
//! | [`dedup`] | In-flight request deduplication |
//! | [`limiter`] | Sliding-window admission control |
//! | [`coordinator`] | The full request path |
//! | [`catalog`] | Typed catalog request descriptors |
//! | [`headers`] | Rate-limit and cache-status response headers |
//! | `redis_store` | Shared Redis state (feature `redis`) |

pub mod cache;
pub mod catalog;
pub mod clock;
pub mod coordinator;
pub mod dedup;
pub mod headers;
pub mod limiter;

#[cfg(feature = "redis")]
pub mod redis_store;

// Re-export main types for convenience
pub use coordinator::{CacheStatus, Coordinator, CoordinatorBuilder, FetchPolicy, Fetched};
pub use limiter::{Decision, Identity, LimiterName};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};
