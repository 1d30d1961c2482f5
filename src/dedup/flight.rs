use crate::error::{BoxError, SharedError};
use crate::{Error, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

type Outcome<T> = std::result::Result<T, SharedError>;
type SharedOutcome<T> = Shared<BoxFuture<'static, Outcome<T>>>;
type FlightMap<T> = Arc<Mutex<HashMap<String, Flight<T>>>>;

/// The computation ended without producing an outcome (panic or runtime shutdown).
#[derive(Debug, Error)]
#[error("in-flight computation aborted before settling")]
pub struct ComputationAborted;

/// How a caller took part in a flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightRole {
    /// Installed the marker and started `compute`.
    Leader,
    /// Joined a computation that was already running.
    Follower,
}

struct Flight<T> {
    id: u64,
    outcome: SharedOutcome<T>,
}

/// Removes the marker when the computation task ends, however it ends.
struct FlightGuard<T> {
    flights: FlightMap<T>,
    key: String,
    id: u64,
}

impl<T> Drop for FlightGuard<T> {
    fn drop(&mut self) {
        let mut flights = self.flights.lock().unwrap_or_else(|p| p.into_inner());
        if flights.get(&self.key).map(|f| f.id) == Some(self.id) {
            flights.remove(&self.key);
        }
    }
}

/// At most one outstanding computation per key; concurrent callers share it.
///
/// - The leader's `compute` runs on its own task, so a waiter timing out never
///   cancels it
/// - The marker is removed before the outcome is published
/// - Failures are not remembered: the next call after settlement starts over
pub struct InFlightDeduplicator<T> {
    flights: FlightMap<T>,
    next_id: AtomicU64,
}

impl<T> InFlightDeduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            flights: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Run `compute` for `key` unless a computation is already in flight, in
    /// which case await that one. Each caller waits at most `timeout`.
    pub async fn deduplicate<F, Fut, E>(&self, key: &str, compute: F, timeout: Duration) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        self.deduplicate_with_role(key, compute, timeout)
            .await
            .map(|(value, _)| value)
    }

    pub async fn deduplicate_with_role<F, Fut, E>(
        &self,
        key: &str,
        compute: F,
        timeout: Duration,
    ) -> Result<(T, FlightRole)>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let (outcome, role) = self.join_or_start(key, compute);
        match tokio::time::timeout(timeout, outcome).await {
            Ok(Ok(value)) => Ok((value, role)),
            Ok(Err(e)) => {
                warn!(key, ?role, error = %e, "in-flight computation failed");
                Err(Error::Upstream(e))
            }
            Err(_) => {
                warn!(key, ?role, timeout_ms = timeout.as_millis() as u64, "gave up waiting on in-flight computation");
                Err(Error::DeduplicationTimeout {
                    key: key.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Number of keys with a computation currently in flight.
    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    fn join_or_start<F, Fut, E>(&self, key: &str, compute: F) -> (SharedOutcome<T>, FlightRole)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        // check-and-insert under one lock acquisition
        let mut flights = self.lock();
        if let Some(flight) = flights.get(key) {
            debug!(key, "joining in-flight computation");
            return (flight.outcome.clone(), FlightRole::Follower);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel::<Outcome<T>>();
        let outcome: SharedOutcome<T> = rx
            .map(|received| {
                received.unwrap_or_else(|_| Err(Arc::new(ComputationAborted) as SharedError))
            })
            .boxed()
            .shared();
        flights.insert(
            key.to_string(),
            Flight {
                id,
                outcome: outcome.clone(),
            },
        );
        drop(flights);

        let guard = FlightGuard {
            flights: self.flights.clone(),
            key: key.to_string(),
            id,
        };
        debug!(key, id, "starting computation");
        tokio::spawn(async move {
            let result = compute().await.map_err(|e| {
                let boxed: BoxError = e.into();
                SharedError::from(boxed)
            });
            drop(guard);
            let _ = tx.send(result);
        });

        (outcome, FlightRole::Leader)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Flight<T>>> {
        self.flights.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl<T> Default for InFlightDeduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_computation() {
        let dedup = Arc::new(InFlightDeduplicator::<u32>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let dedup = dedup.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                dedup
                    .deduplicate(
                        "catalog:list",
                        move || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok::<_, BoxError>(7)
                        },
                        Duration::from_secs(5),
                    )
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dedup.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_roles_reported() {
        let dedup = Arc::new(InFlightDeduplicator::<&'static str>::new());
        let leader = {
            let dedup = dedup.clone();
            tokio::spawn(async move {
                dedup
                    .deduplicate_with_role(
                        "k",
                        || async {
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok::<_, BoxError>("v")
                        },
                        Duration::from_secs(1),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(dedup.is_in_flight("k"));
        let follower = dedup
            .deduplicate_with_role("k", || async { Ok::<_, BoxError>("other") }, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(follower, ("v", FlightRole::Follower));
        assert_eq!(leader.await.unwrap().unwrap(), ("v", FlightRole::Leader));
    }

    #[tokio::test]
    async fn test_failure_is_shared_then_forgotten() {
        let dedup = InFlightDeduplicator::<u32>::new();
        let err = dedup
            .deduplicate("k", || async { Err::<u32, _>("catalog 503") }, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Upstream(_)));
        assert!(err.to_string().contains("catalog 503"));
        assert!(!dedup.is_in_flight("k"));

        let ok = dedup
            .deduplicate("k", || async { Ok::<_, BoxError>(1) }, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(ok, 1);
    }

    #[tokio::test]
    async fn test_panicking_computation_still_clears_marker() {
        let dedup = InFlightDeduplicator::<u32>::new();
        let err = dedup
            .deduplicate(
                "k",
                || async {
                    if true {
                        panic!("upstream client bug");
                    }
                    Ok::<u32, BoxError>(0)
                },
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("aborted"));
        assert_eq!(dedup.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_does_not_cancel_computation() {
        let dedup = InFlightDeduplicator::<u32>::new();
        let finished = Arc::new(AtomicUsize::new(0));
        let flag = finished.clone();
        let err = dedup
            .deduplicate(
                "slow",
                move || async move {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    flag.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, BoxError>(5)
                },
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeduplicationTimeout { .. }));
        assert!(dedup.is_in_flight("slow"));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(!dedup.is_in_flight("slow"));
    }
}
