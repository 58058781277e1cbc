//! Cooldown hint parsing for 429 responses
//!
//! Upstream signals when a throttled account will recover, in order of
//! preference: a `retry-after` header holding either integer seconds or an
//! HTTP-date, or the `anthropic-ratelimit-unified-reset` header holding a
//! unix timestamp in seconds. Hints are never trusted blindly — negative
//! values collapse to zero and everything is capped at 24 hours. The
//! minimum-cooldown floor is the pool's job, applied in `Pool::report`.

use std::time::Duration;

use chrono::DateTime;

/// Upper bound on any upstream cooldown hint.
const MAX_COOLDOWN: Duration = Duration::from_secs(24 * 60 * 60);

/// Parse a cooldown duration from 429 response header values.
///
/// `retry_after` takes precedence; the unified-reset timestamp is a
/// fallback. Returns `None` when no hint parses — the caller falls back to
/// the configured minimum cooldown.
pub fn cooldown_from_headers(
    retry_after: Option<&str>,
    unified_reset: Option<&str>,
    now_ms: u64,
) -> Option<Duration> {
    if let Some(value) = retry_after {
        let value = value.trim();
        if let Ok(seconds) = value.parse::<i64>() {
            return Some(clamp(seconds.saturating_mul(1000)));
        }
        // HTTP-date ("Wed, 21 Oct 2015 07:28:00 GMT") or ISO-8601
        if let Ok(date) = DateTime::parse_from_rfc2822(value) {
            return Some(clamp(date.timestamp_millis().saturating_sub(now_ms as i64)));
        }
        if let Ok(date) = DateTime::parse_from_rfc3339(value) {
            return Some(clamp(date.timestamp_millis().saturating_sub(now_ms as i64)));
        }
    }

    if let Some(value) = unified_reset
        && let Ok(reset_seconds) = value.trim().parse::<i64>()
    {
        let reset_ms = reset_seconds.saturating_mul(1000);
        return Some(clamp(reset_ms.saturating_sub(now_ms as i64)));
    }

    None
}

fn clamp(millis: i64) -> Duration {
    if millis <= 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(millis as u64).min(MAX_COOLDOWN)
}
