use super::RedisStore;
use crate::limiter::{LimitPolicy, RateLimitStore, WindowSnapshot};
use crate::Result;
use async_trait::async_trait;
use std::time::Duration;

// KEYS[1] = sorted set of admitted timestamps (score = epoch ms)
// ARGV = now_ms, window_ms, max_requests, member
// returns { admitted (0|1), count, oldest_ms or -1 }
const ADMIT_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local max = tonumber(ARGV[3])

redis.call("ZREMRANGEBYSCORE", KEYS[1], "-inf", now - window)
local count = redis.call("ZCARD", KEYS[1])
local admitted = 0
if count < max then
  redis.call("ZADD", KEYS[1], now, ARGV[4])
  count = count + 1
  admitted = 1
end
if count > 0 then
  redis.call("PEXPIRE", KEYS[1], window)
end

local oldest = -1
local first = redis.call("ZRANGE", KEYS[1], 0, 0, "WITHSCORES")
if first[2] ~= nil then
  oldest = tonumber(first[2])
end
return { admitted, count, oldest }
"#;

const PEEK_SCRIPT: &str = r#"
local cutoff = "(" .. (tonumber(ARGV[1]) - tonumber(ARGV[2]))
local count = redis.call("ZCOUNT", KEYS[1], cutoff, "+inf")
local oldest = -1
local first = redis.call("ZRANGEBYSCORE", KEYS[1], cutoff, "+inf", "WITHSCORES", "LIMIT", 0, 1)
if first[2] ~= nil then
  oldest = tonumber(first[2])
end
return { 0, count, oldest }
"#;

/// Sliding-window store shared by every serving instance.
///
/// Each check is one Lua script, so prune, count and record happen
/// atomically on the server even under concurrent callers.
#[derive(Clone, Debug)]
pub struct RedisRateLimitStore {
    store: RedisStore,
}

impl RedisRateLimitStore {
    pub fn new(store: RedisStore) -> Self {
        Self { store }
    }
}

fn snapshot(raw: Vec<i64>) -> WindowSnapshot {
    let field = |i: usize| raw.get(i).copied().unwrap_or(0);
    let oldest = raw.get(2).copied().unwrap_or(-1);
    WindowSnapshot {
        admitted: field(0) == 1,
        count: field(1).max(0) as u32,
        oldest_ms: (oldest >= 0).then_some(oldest as u64),
    }
}

#[async_trait]
impl RateLimitStore for RedisRateLimitStore {
    async fn admit(&self, key: &str, now_ms: u64, policy: LimitPolicy) -> Result<WindowSnapshot> {
        let redis_key = self.store.key_rate_limit(key);
        // unique per request so equal timestamps do not collapse
        let member = format!("{now_ms}-{}", uuid::Uuid::new_v4().simple());
        let raw: Vec<i64> = self
            .store
            .run("rate_limit.admit", async {
                let mut conn = self.store.connection().await?;
                redis::Script::new(ADMIT_SCRIPT)
                    .key(&redis_key)
                    .arg(now_ms)
                    .arg(policy.window_ms())
                    .arg(policy.max_requests)
                    .arg(&member)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;
        Ok(snapshot(raw))
    }

    async fn peek(&self, key: &str, now_ms: u64, window: Duration) -> Result<WindowSnapshot> {
        let redis_key = self.store.key_rate_limit(key);
        let raw: Vec<i64> = self
            .store
            .run("rate_limit.peek", async {
                let mut conn = self.store.connection().await?;
                redis::Script::new(PEEK_SCRIPT)
                    .key(&redis_key)
                    .arg(now_ms)
                    .arg(window.as_millis() as u64)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;
        Ok(snapshot(raw))
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_decoding() {
        assert_eq!(
            snapshot(vec![1, 3, 1_000]),
            WindowSnapshot {
                admitted: true,
                count: 3,
                oldest_ms: Some(1_000)
            }
        );
        assert_eq!(snapshot(vec![0, 0, -1]), WindowSnapshot::empty());
        assert_eq!(snapshot(Vec::new()), WindowSnapshot::empty());
    }
}
