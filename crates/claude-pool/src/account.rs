//! Per-account record and state machine
//!
//! State transitions:
//! - Available → RateLimited (upstream 429)
//! - Available → AuthError (upstream 401/403, terminal refresh failure)
//! - RateLimited → Available (cooldown elapsed — observed lazily at the
//!   next selection and by status snapshots)
//! - AuthError → Available (successful refresh, admin enable)
//! - any → Disabled (admin disable), Disabled → Available (admin enable)

use claude_accounts::StoredCredentials;
use tracing::{debug, info};

/// Availability state of one account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountState {
    Available,
    /// Not selectable until the wall clock reaches `until` (unix ms).
    RateLimited { until: u64 },
    /// Credentials rejected upstream; waiting on refresh or operator.
    AuthError,
    /// Taken out of rotation by an operator.
    Disabled,
}

impl AccountState {
    /// Stable label for logs and status views.
    pub fn label(&self) -> &'static str {
        match self {
            AccountState::Available => "available",
            AccountState::RateLimited { .. } => "rate_limited",
            AccountState::AuthError => "auth_error",
            AccountState::Disabled => "disabled",
        }
    }
}

/// One account in the rotation pool: credentials plus runtime state.
///
/// Runtime state is never persisted; it is rebuilt from upstream outcomes
/// after a restart and preserved across document reloads.
#[derive(Debug, Clone)]
pub struct Account {
    pub name: String,
    pub access_token: String,
    pub refresh_token: String,
    /// Access token expiry, unix ms.
    pub expires_at: u64,

    pub state: AccountState,
    /// Unix ms of the last successful request through this account.
    pub last_used: Option<u64>,
    /// Most recent auth/refresh failure detail.
    pub last_error: Option<String>,

    /// Single-flight guard: true while a refresh grant is outstanding.
    pub in_flight_refresh: bool,
    /// Admin requested an immediate refresh (bypasses the expiry buffer).
    pub force_refresh: bool,
    /// The refresh token itself was rejected (`invalid_grant`); the
    /// scheduler will not retry until an operator re-enables the account.
    pub reauth_required: bool,
    /// Consecutive transient refresh failures, drives backoff.
    pub refresh_failures: u32,
    /// No refresh attempts before this time (unix ms).
    pub refresh_backoff_until: u64,
}

impl Account {
    pub fn from_credentials(name: &str, credentials: &StoredCredentials) -> Self {
        Self {
            name: name.to_string(),
            access_token: credentials.access_token.clone(),
            refresh_token: credentials.refresh_token.clone(),
            expires_at: credentials.expires_at,
            state: AccountState::Available,
            last_used: None,
            last_error: None,
            in_flight_refresh: false,
            force_refresh: false,
            reauth_required: false,
            refresh_failures: 0,
            refresh_backoff_until: 0,
        }
    }

    /// Overwrite token material from a reloaded document, keeping all
    /// runtime state. Rewrites caused by our own refresh persistence carry
    /// identical values, so this cannot flap state either way.
    pub fn adopt_credentials(&mut self, credentials: &StoredCredentials) {
        self.access_token = credentials.access_token.clone();
        self.refresh_token = credentials.refresh_token.clone();
        self.expires_at = credentials.expires_at;
    }

    /// Whether `acquire` may hand this account out right now.
    ///
    /// An expired access token does not block selection — the refresh
    /// scheduler is responsible for expiry, and the dispatcher recovers
    /// from a stale token via normal auth-error failover.
    pub fn is_selectable(&self, now_ms: u64) -> bool {
        match self.state {
            AccountState::Available => true,
            AccountState::RateLimited { until } => until <= now_ms,
            AccountState::AuthError | AccountState::Disabled => false,
        }
    }

    /// Lazily promote an elapsed cooldown back to Available.
    pub fn promote_if_cooldown_elapsed(&mut self, now_ms: u64) -> bool {
        if let AccountState::RateLimited { until } = self.state
            && until <= now_ms
        {
            info!(account = %self.name, "cooldown elapsed, account available again");
            self.state = AccountState::Available;
            return true;
        }
        false
    }

    pub fn mark_rate_limited(&mut self, until_ms: u64) {
        info!(
            account = %self.name,
            rate_limited_until = until_ms,
            "account rate limited"
        );
        self.state = AccountState::RateLimited { until: until_ms };
    }

    pub fn mark_auth_error(&mut self, detail: String) {
        info!(account = %self.name, error = %detail, "account auth error");
        self.state = AccountState::AuthError;
        self.last_error = Some(detail);
    }

    /// Restore to Available, clearing cooldown, errors, and refresh
    /// bookkeeping. Used by admin enable and successful refresh recovery.
    pub fn mark_available(&mut self) {
        let previous = self.state.label();
        self.state = AccountState::Available;
        self.last_error = None;
        self.reauth_required = false;
        self.refresh_failures = 0;
        self.refresh_backoff_until = 0;
        debug!(account = %self.name, previous, "account available");
    }

    /// Whether the access token expires within `buffer_ms` of now.
    pub fn expires_within(&self, now_ms: u64, buffer_ms: u64) -> bool {
        self.expires_at <= now_ms.saturating_add(buffer_ms)
    }
}
