//! HTTP response headers describing limiter and cache outcomes.

use crate::coordinator::CacheStatus;
use crate::limiter::Decision;
use crate::Error;
use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER};

pub const RATE_LIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";
/// Epoch seconds at which a slot frees up.
pub const RATE_LIMIT_RESET: &str = "x-ratelimit-reset";
pub const CACHE_STATUS: &str = "x-cache";

fn ceil_secs(ms: u64) -> u64 {
    ms.div_ceil(1000)
}

fn insert_rate_limit(headers: &mut HeaderMap, limit: u32, remaining: u32, reset_at_ms: u64) {
    headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(limit));
    headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(remaining));
    headers.insert(RATE_LIMIT_RESET, HeaderValue::from(ceil_secs(reset_at_ms)));
}

fn insert_retry_after(headers: &mut HeaderMap, reset_at_ms: u64, now_ms: u64) {
    let secs = ceil_secs(reset_at_ms.saturating_sub(now_ms)).max(1);
    headers.insert(RETRY_AFTER, HeaderValue::from(secs));
}

/// Quota headers for an admission decision; `retry-after` only when denied.
pub fn apply_decision(headers: &mut HeaderMap, decision: &Decision, now_ms: u64) {
    insert_rate_limit(
        headers,
        decision.limit,
        decision.remaining,
        decision.reset_at_ms,
    );
    if !decision.allowed {
        insert_retry_after(headers, decision.reset_at_ms, now_ms);
    }
}

pub fn apply_cache_status(headers: &mut HeaderMap, status: CacheStatus) {
    headers.insert(CACHE_STATUS, HeaderValue::from_static(status.as_str()));
}

/// Headers for an error response; only rate-limit denials carry any.
pub fn error_headers(err: &Error, now_ms: u64) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Error::RateLimited {
        limit,
        remaining,
        reset_at_ms,
        ..
    } = err
    {
        insert_rate_limit(&mut headers, *limit, *remaining, *reset_at_ms);
        insert_retry_after(&mut headers, *reset_at_ms, now_ms);
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::LimiterName;

    fn decision(allowed: bool) -> Decision {
        Decision {
            limiter: LimiterName::Checkout,
            allowed,
            limit: 5,
            remaining: if allowed { 3 } else { 0 },
            reset_at_ms: 1_700_000_900_500,
            degraded: false,
        }
    }

    #[test]
    fn test_allowed_decision_headers() {
        let mut headers = HeaderMap::new();
        apply_decision(&mut headers, &decision(true), 1_700_000_000_000);
        assert_eq!(headers[RATE_LIMIT_LIMIT], "5");
        assert_eq!(headers[RATE_LIMIT_REMAINING], "3");
        assert_eq!(headers[RATE_LIMIT_RESET], "1700000901");
        assert!(headers.get(RETRY_AFTER).is_none());
    }

    #[test]
    fn test_denied_decision_sets_retry_after() {
        let mut headers = HeaderMap::new();
        apply_decision(&mut headers, &decision(false), 1_700_000_000_000);
        assert_eq!(headers[RETRY_AFTER], "901");

        let err = decision(false).into_result().unwrap_err();
        let headers = error_headers(&err, 1_700_000_900_400);
        assert_eq!(headers[RETRY_AFTER], "1");
        assert_eq!(headers[RATE_LIMIT_REMAINING], "0");
    }

    #[test]
    fn test_cache_status_and_other_errors() {
        let mut headers = HeaderMap::new();
        apply_cache_status(&mut headers, CacheStatus::Shared);
        assert_eq!(headers[CACHE_STATUS], "SHARED");
        assert!(error_headers(&Error::upstream("boom"), 0).is_empty());
    }
}
