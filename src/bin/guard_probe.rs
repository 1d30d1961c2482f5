//! Drives concurrent catalog traffic through a coordinator backed by a fake
//! upstream and prints what the cache, deduplicator and limiter did.
//!
//! Usage: `guard-probe [callers] [rounds]` (defaults: 32 callers, 3 rounds).
//! Set `RUST_LOG=catalog_guard=debug` to see individual decisions.

use anyhow::Context;
use catalog_guard::catalog::ProductListQuery;
use catalog_guard::error::BoxError;
use catalog_guard::{CacheStatus, Coordinator, Error, FetchPolicy, Identity, LimiterName};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let callers: usize = args
        .next()
        .map(|s| s.parse())
        .transpose()
        .context("callers must be a number")?
        .unwrap_or(32);
    let rounds: usize = args
        .next()
        .map(|s| s.parse())
        .transpose()
        .context("rounds must be a number")?
        .unwrap_or(3);

    let coordinator = Arc::new(
        Coordinator::builder()
            .build()
            .context("failed to build coordinator")?,
    );
    let upstream_calls = Arc::new(AtomicUsize::new(0));
    let policy = FetchPolicy::new(LimiterName::CatalogRead, Duration::from_secs(30))
        .with_timeout(Duration::from_secs(2));

    println!(
        "limiter store: {}, cache backend: {}",
        coordinator.limiter().store_name(),
        coordinator.cache().backend_name()
    );

    for round in 1..=rounds {
        let mut handles = Vec::with_capacity(callers);
        for i in 0..callers {
            let coordinator = coordinator.clone();
            let upstream_calls = upstream_calls.clone();
            // a handful of callers share one identity to exercise the limiter
            let identity = Identity::user(format!("usr_{}", i % 4));
            let page = (i % 2) as u32 + 1;
            let query = ProductListQuery {
                page,
                ..ProductListQuery::default()
            };
            handles.push(tokio::spawn(async move {
                coordinator
                    .fetch(&identity, &query, policy, move || async move {
                        upstream_calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(150)).await;
                        Ok::<_, BoxError>(vec![format!("page-{page}")])
                    })
                    .await
                    .map(|fetched: catalog_guard::Fetched<Vec<String>>| fetched.cache_status)
            }));
        }

        let mut outcomes: BTreeMap<&'static str, usize> = BTreeMap::new();
        for handle in handles {
            let label = match handle.await.context("caller task panicked")? {
                Ok(CacheStatus::Hit) => "hit",
                Ok(CacheStatus::Miss) => "miss",
                Ok(CacheStatus::Shared) => "shared",
                Ok(CacheStatus::Stale) => "stale",
                Err(Error::RateLimited { .. }) => "rate_limited",
                Err(Error::DeduplicationTimeout { .. }) => "timeout",
                Err(_) => "error",
            };
            *outcomes.entry(label).or_default() += 1;
        }
        println!(
            "round {round}: {:?} (upstream calls so far: {})",
            outcomes,
            upstream_calls.load(Ordering::SeqCst)
        );
    }

    let stats = coordinator.cache().stats();
    println!(
        "cache: hits={} misses={} stale={} sets={} hit_ratio={:.2}",
        stats.hits,
        stats.misses,
        stats.stale,
        stats.sets,
        stats.hit_ratio()
    );
    Ok(())
}
