//! Error types for pool operations

use std::fmt;

/// Per-state account counts, attached to `NoAccountAvailable` so callers
/// can build a useful client-facing error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolCounts {
    pub total: usize,
    pub available: usize,
    pub rate_limited: usize,
    pub auth_error: usize,
    pub disabled: usize,
}

impl fmt::Display for PoolCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total={} available={} rate_limited={} auth_error={} disabled={}",
            self.total, self.available, self.rate_limited, self.auth_error, self.disabled
        )
    }
}

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No selectable account. `soonest_ready_ms` is the earliest cooldown
    /// expiry when the cause is rate limiting, for the client Retry-After.
    #[error("no account available ({counts})")]
    NoAccountAvailable {
        counts: PoolCounts,
        soonest_ready_ms: Option<u64>,
    },

    /// Manual selection referenced an unknown or disabled account.
    #[error("no such account: {0}")]
    NoSuchAccount(String),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_display_is_structured() {
        let counts = PoolCounts {
            total: 3,
            available: 0,
            rate_limited: 2,
            auth_error: 1,
            disabled: 0,
        };
        assert_eq!(
            counts.to_string(),
            "total=3 available=0 rate_limited=2 auth_error=1 disabled=0"
        );
    }

    #[test]
    fn no_account_available_display_includes_counts() {
        let err = Error::NoAccountAvailable {
            counts: PoolCounts {
                total: 1,
                ..Default::default()
            },
            soonest_ready_ms: None,
        };
        assert!(err.to_string().contains("total=1"));
    }

    #[test]
    fn no_such_account_display_names_the_account() {
        let err = Error::NoSuchAccount("work".into());
        assert_eq!(err.to_string(), "no such account: work");
    }
}
