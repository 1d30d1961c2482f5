use super::policy::LimitPolicy;
use crate::Result;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

/// State of one identity's trailing window after an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSnapshot {
    /// Whether this evaluation recorded a request.
    pub admitted: bool,
    /// Requests inside the trailing window, including this one if admitted.
    pub count: u32,
    /// Timestamp of the oldest request still inside the window.
    pub oldest_ms: Option<u64>,
}

impl WindowSnapshot {
    pub fn empty() -> Self {
        Self {
            admitted: false,
            count: 0,
            oldest_ms: None,
        }
    }

    /// Time until the oldest request leaves the window and frees a slot.
    pub fn remaining_ttl(&self, now_ms: u64, window: Duration) -> Option<Duration> {
        self.oldest_ms.map(|oldest| {
            Duration::from_millis((oldest + window.as_millis() as u64).saturating_sub(now_ms))
        })
    }
}

/// Shared sliding-window state.
///
/// `admit` must be atomic per key: prune everything at or before
/// `now - window`, then record `now` iff fewer than `max_requests` remain.
/// Denied requests are not recorded.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn admit(&self, key: &str, now_ms: u64, policy: LimitPolicy) -> Result<WindowSnapshot>;
    /// Window state without recording anything.
    async fn peek(&self, key: &str, now_ms: u64, window: Duration) -> Result<WindowSnapshot>;
    fn name(&self) -> &'static str;
}

const SWEEP_INTERVAL_MS: u64 = 60_000;

struct WindowLog {
    stamps: VecDeque<u64>,
    window_ms: u64,
}

impl WindowLog {
    fn prune(&mut self, now_ms: u64) {
        let Some(cutoff) = now_ms.checked_sub(self.window_ms) else {
            return;
        };
        while self.stamps.front().is_some_and(|ts| *ts <= cutoff) {
            self.stamps.pop_front();
        }
    }

    fn snapshot(&self, admitted: bool) -> WindowSnapshot {
        WindowSnapshot {
            admitted,
            count: self.stamps.len() as u32,
            oldest_ms: self.stamps.front().copied(),
        }
    }
}

#[derive(Default)]
struct Logs {
    by_key: HashMap<String, WindowLog>,
    last_sweep_ms: u64,
}

/// Process-local store: correct for tests and single-instance deployments
/// only, since other instances cannot see its state.
#[derive(Default)]
pub struct MemoryRateLimitStore {
    logs: Mutex<Logs>,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of identities with live window state.
    pub fn tracked_keys(&self) -> usize {
        self.logs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .by_key
            .len()
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn admit(&self, key: &str, now_ms: u64, policy: LimitPolicy) -> Result<WindowSnapshot> {
        let mut logs = self.logs.lock().unwrap_or_else(|p| p.into_inner());

        if now_ms.saturating_sub(logs.last_sweep_ms) >= SWEEP_INTERVAL_MS {
            logs.by_key.retain(|_, log| {
                log.prune(now_ms);
                !log.stamps.is_empty()
            });
            logs.last_sweep_ms = now_ms;
        }

        let log = logs.by_key.entry(key.to_string()).or_insert_with(|| WindowLog {
            stamps: VecDeque::new(),
            window_ms: policy.window_ms(),
        });
        log.window_ms = policy.window_ms();
        log.prune(now_ms);

        let admitted = (log.stamps.len() as u32) < policy.max_requests;
        if admitted {
            log.stamps.push_back(now_ms);
        }
        Ok(log.snapshot(admitted))
    }

    async fn peek(&self, key: &str, now_ms: u64, window: Duration) -> Result<WindowSnapshot> {
        let logs = self.logs.lock().unwrap_or_else(|p| p.into_inner());
        let cutoff = now_ms.checked_sub(window.as_millis() as u64);
        let Some(log) = logs.by_key.get(key) else {
            return Ok(WindowSnapshot::empty());
        };
        let live: Vec<u64> = log
            .stamps
            .iter()
            .copied()
            .filter(|ts| cutoff.map_or(true, |c| *ts > c))
            .collect();
        Ok(WindowSnapshot {
            admitted: false,
            count: live.len() as u32,
            oldest_ms: live.first().copied(),
        })
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
