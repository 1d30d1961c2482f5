//! In-flight request deduplication.
//!
//! When several callers ask for the same upstream resource at the same time,
//! only the first one (the leader) starts the upstream call; everyone else
//! awaits the leader's outcome. Once the computation settles its marker is
//! removed, so the next request for that key starts a fresh computation.
//!
//! ```rust
//! use catalog_guard::dedup::InFlightDeduplicator;
//! use catalog_guard::error::BoxError;
//! use std::time::Duration;
//!
//! # async fn demo() -> catalog_guard::Result<()> {
//! let dedup = InFlightDeduplicator::<String>::new();
//! let value = dedup
//!     .deduplicate(
//!         "flight:products:page=1",
//!         || async { Ok::<_, BoxError>("[]".to_string()) },
//!         Duration::from_secs(5),
//!     )
//!     .await?;
//! assert_eq!(value, "[]");
//! # Ok(())
//! # }
//! ```
//!
//! A waiter whose `timeout` elapses gets [`crate::Error::DeduplicationTimeout`];
//! the computation itself keeps running and other waiters keep their own
//! deadlines.

mod flight;

pub use flight::{ComputationAborted, FlightRole, InFlightDeduplicator};
