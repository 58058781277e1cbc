//! Pool state and round-robin account selection
//!
//! The pool is the only shared mutable structure in the system. A single
//! mutex guards the account set, per-account state, and the rotation
//! cursor; it is held only for read-modify-write and never across network
//! or disk I/O. Token refreshes run outside the lock under the
//! single-flight ticket protocol (`begin_due_refreshes` /
//! `complete_refresh`).
//!
//! Cooldown transitions happen lazily: a rate-limited account whose
//! cooldown has elapsed is promoted back to Available the next time
//! selection or a snapshot observes it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use claude_accounts::{AccountsDocument, StoredCredentials, TokenResponse};
use rand::Rng;
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::account::{Account, AccountState};
use crate::clock::Clock;
use crate::error::{Error, PoolCounts, Result};

/// Initial backoff after a transient refresh failure.
const REFRESH_BACKOFF_INITIAL: Duration = Duration::from_secs(1);

/// Backoff ceiling for transient refresh failures.
const REFRESH_BACKOFF_CAP: Duration = Duration::from_secs(300);

/// Pool behavior knobs.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// With rotation disabled the pool serves only the first document
    /// entry and never advances the cursor.
    pub rotation_enabled: bool,
    /// Floor applied to upstream retry-after hints.
    pub minimum_cooldown: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            rotation_enabled: true,
            minimum_cooldown: Duration::from_secs(60),
        }
    }
}

/// A selected account, ready for one upstream attempt.
///
/// `state` is the account state at acquisition time — the manual selection
/// path hands out non-available accounts and callers want the state for
/// telemetry.
#[derive(Debug, Clone)]
pub struct Lease {
    pub name: String,
    pub access_token: String,
    pub state: AccountState,
}

/// Dispatcher-observed outcome of one upstream attempt.
#[derive(Debug)]
pub enum Outcome {
    /// 2xx — records `last_used`, no state change.
    Ok,
    /// 429 — enter cooldown for `max(retry_after, minimum_cooldown)`.
    RateLimited { retry_after: Option<Duration> },
    /// 401/403 — auth error; wakes the refresh scheduler.
    AuthError { detail: String },
    /// 5xx / network error — telemetry only, no state change.
    Transient,
}

/// Work item handed to the refresh scheduler. The account's
/// `in_flight_refresh` flag is already set when a job is returned.
#[derive(Debug)]
pub struct RefreshJob {
    pub name: String,
    pub refresh_token: String,
}

/// Result of one refresh grant, reported back via `complete_refresh`.
#[derive(Debug)]
pub enum RefreshOutcome {
    Success(TokenResponse),
    /// `invalid_grant` — terminal, no automatic retry.
    Terminal(String),
    /// Anything else — retried after backoff.
    Transient(String),
}

/// Summary of a document reload, for logging and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadSummary {
    pub added: usize,
    pub removed: usize,
    pub total: usize,
    pub generation: u64,
}

struct PoolInner {
    /// Account names in document order; defines round-robin order.
    order: Vec<String>,
    accounts: HashMap<String, Account>,
    /// Next position to try. Always in `[0, order.len())` when non-empty.
    cursor: usize,
    /// Incremented by every successful reload.
    generation: u64,
}

/// The account rotation pool.
pub struct Pool {
    inner: Mutex<PoolInner>,
    config: PoolConfig,
    clock: Arc<dyn Clock>,
    refresh_wake: Notify,
}

impl Pool {
    /// Build a pool from a validated credentials document.
    ///
    /// Accounts whose stored expiry is already past are still selectable;
    /// a wake permit is left for the refresh scheduler so they are
    /// refreshed on its first sweep.
    pub fn new(document: &AccountsDocument, config: PoolConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_ms();
        let mut order = Vec::with_capacity(document.accounts.len());
        let mut accounts = HashMap::with_capacity(document.accounts.len());
        let mut expired = 0usize;

        for (name, credentials) in &document.accounts {
            let account = Account::from_credentials(name, credentials);
            if account.expires_within(now, 0) {
                expired += 1;
            }
            order.push(name.clone());
            accounts.insert(name.clone(), account);
        }

        info!(accounts = order.len(), expired, "pool initialized");

        let pool = Self {
            inner: Mutex::new(PoolInner {
                order,
                accounts,
                cursor: 0,
                generation: 0,
            }),
            config,
            clock,
            refresh_wake: Notify::new(),
        };
        if expired > 0 {
            pool.refresh_wake.notify_one();
        }
        pool
    }

    /// Signal observed by the refresh scheduler (auth errors, reloads with
    /// expired tokens, admin force-refresh).
    pub fn refresh_wake(&self) -> &Notify {
        &self.refresh_wake
    }

    /// Select the next available account round-robin.
    ///
    /// Scans from the cursor, lazily promoting elapsed cooldowns. The
    /// first selectable account is returned and the cursor advances to the
    /// position after it. Never waits for a cooldown — if nothing is
    /// selectable this fails immediately with `NoAccountAvailable`.
    pub async fn acquire(&self) -> Result<Lease> {
        self.acquire_excluding(&[]).await
    }

    /// Round-robin selection skipping the names in `exclude`.
    ///
    /// The dispatcher's failover path passes the accounts already tried in
    /// the current dispatch, so no account is retried by failover within a
    /// single request.
    pub async fn acquire_excluding(&self, exclude: &[String]) -> Result<Lease> {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock().await;

        let n = inner.order.len();
        if n == 0 {
            return Err(unavailable(&inner, now));
        }

        let span = if self.config.rotation_enabled { n } else { 1 };
        let start = if self.config.rotation_enabled {
            inner.cursor
        } else {
            0
        };

        let PoolInner {
            order,
            accounts,
            cursor,
            ..
        } = &mut *inner;

        for offset in 0..span {
            let idx = (start + offset) % n;
            let name = &order[idx];
            if exclude.contains(name) {
                continue;
            }
            let Some(account) = accounts.get_mut(name) else {
                continue;
            };
            account.promote_if_cooldown_elapsed(now);
            if !account.is_selectable(now) {
                continue;
            }
            if self.config.rotation_enabled {
                *cursor = (idx + 1) % n;
            }
            debug!(account = %account.name, "account selected");
            return Ok(Lease {
                name: account.name.clone(),
                access_token: account.access_token.clone(),
                state: account.state.clone(),
            });
        }

        Err(unavailable(&inner, now))
    }

    /// Manual selection by name.
    ///
    /// Unknown and disabled names fail with `NoSuchAccount`. Any other
    /// state is handed out as-is — no filtering, no cursor movement, no
    /// failover; the lease carries the state for telemetry.
    pub async fn acquire_named(&self, name: &str) -> Result<Lease> {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock().await;

        let Some(account) = inner.accounts.get_mut(name) else {
            return Err(Error::NoSuchAccount(name.to_string()));
        };
        account.promote_if_cooldown_elapsed(now);
        if account.state == AccountState::Disabled {
            return Err(Error::NoSuchAccount(name.to_string()));
        }
        debug!(account = %name, state = account.state.label(), "account selected manually");
        Ok(Lease {
            name: account.name.clone(),
            access_token: account.access_token.clone(),
            state: account.state.clone(),
        })
    }

    /// Report the outcome of an upstream attempt.
    ///
    /// Reports for accounts removed by a reload are dropped — the removed
    /// account must not be re-inserted by a straggling request.
    pub async fn report(&self, name: &str, outcome: Outcome) {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock().await;

        let Some(account) = inner.accounts.get_mut(name) else {
            warn!(account = %name, "outcome report for unknown account (removed by reload?)");
            return;
        };

        match outcome {
            Outcome::Ok => {
                account.last_used = Some(now);
            }
            Outcome::RateLimited { retry_after } => {
                let cooldown = retry_after
                    .unwrap_or(Duration::ZERO)
                    .max(self.config.minimum_cooldown);
                account.mark_rate_limited(now + cooldown.as_millis() as u64);
            }
            Outcome::AuthError { detail } => {
                account.mark_auth_error(detail);
                self.refresh_wake.notify_one();
            }
            Outcome::Transient => {
                debug!(account = %name, "transient upstream error, no state change");
            }
        }
    }

    /// Replace the account set from a reloaded document.
    ///
    /// Diff by name: new names join as Available, removed names drop out
    /// (in-flight work against them is discarded at completion), survivors
    /// keep their runtime state but take the document's token material.
    /// The cursor follows the account it pointed at and resets to zero
    /// only if that account was removed, so rewrites caused by token
    /// refresh never restart rotation.
    pub async fn apply_reload(&self, document: &AccountsDocument) -> ReloadSummary {
        let mut inner = self.inner.lock().await;

        let cursor_name = inner.order.get(inner.cursor).cloned();
        let mut previous: HashMap<String, Account> = std::mem::take(&mut inner.accounts);
        let mut order = Vec::with_capacity(document.accounts.len());
        let mut accounts = HashMap::with_capacity(document.accounts.len());
        let mut added = 0usize;

        for (name, credentials) in &document.accounts {
            let account = match previous.remove(name) {
                Some(mut existing) => {
                    existing.adopt_credentials(credentials);
                    existing
                }
                None => {
                    added += 1;
                    Account::from_credentials(name, credentials)
                }
            };
            order.push(name.clone());
            accounts.insert(name.clone(), account);
        }

        let removed = previous.len();
        for name in previous.keys() {
            debug!(account = %name, "account removed from pool");
        }

        inner.cursor = cursor_name
            .and_then(|name| order.iter().position(|n| *n == name))
            .unwrap_or(0);
        inner.order = order;
        inner.accounts = accounts;
        inner.generation += 1;

        let summary = ReloadSummary {
            added,
            removed,
            total: inner.order.len(),
            generation: inner.generation,
        };
        info!(
            added,
            removed,
            total = summary.total,
            generation = summary.generation,
            "pool reloaded"
        );
        drop(inner);

        // Waiters re-evaluate their work list against the new generation
        self.refresh_wake.notify_one();
        summary
    }

    /// Admin enable: any state back to Available, clearing cooldown,
    /// last-error, and refresh backoff. No-op if already available.
    pub async fn enable(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(account) = inner.accounts.get_mut(name) else {
            return Err(Error::NoSuchAccount(name.to_string()));
        };
        account.mark_available();
        info!(account = %name, "account enabled");
        Ok(())
    }

    /// Admin disable: any state to Disabled; the account is skipped by
    /// rotation, manual selection, and the refresh scheduler.
    pub async fn disable(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(account) = inner.accounts.get_mut(name) else {
            return Err(Error::NoSuchAccount(name.to_string()));
        };
        account.state = AccountState::Disabled;
        info!(account = %name, "account disabled");
        Ok(())
    }

    /// Admin force-refresh: flag the account for the next sweep (bypassing
    /// the expiry buffer and backoff) and wake the scheduler.
    pub async fn request_refresh(&self, name: &str) -> Result<()> {
        {
            let mut inner = self.inner.lock().await;
            let Some(account) = inner.accounts.get_mut(name) else {
                return Err(Error::NoSuchAccount(name.to_string()));
            };
            account.force_refresh = true;
        }
        self.refresh_wake.notify_one();
        Ok(())
    }

    /// Claim refresh work for this sweep.
    ///
    /// Under the mutex: selects accounts that are not disabled, have no
    /// refresh in flight, are past their backoff, and either expire within
    /// `refresh_buffer`, sit in a recoverable auth-error state, or carry a
    /// force-refresh flag. Claimed accounts get `in_flight_refresh = true`,
    /// enforcing single-flight; the grant itself runs outside the lock.
    pub async fn begin_due_refreshes(&self, refresh_buffer: Duration) -> Vec<RefreshJob> {
        let now = self.clock.now_ms();
        let buffer_ms = refresh_buffer.as_millis() as u64;
        let mut inner = self.inner.lock().await;

        let PoolInner {
            order, accounts, ..
        } = &mut *inner;

        let mut jobs = Vec::new();
        for name in order.iter() {
            let Some(account) = accounts.get_mut(name) else {
                continue;
            };
            // Sweeps promote elapsed cooldowns eagerly; selection does so
            // lazily
            account.promote_if_cooldown_elapsed(now);
            if account.state == AccountState::Disabled || account.in_flight_refresh {
                continue;
            }

            // A rejected refresh token keeps the account out of every
            // sweep until an operator re-enables it
            let due_normally = !account.reauth_required
                && now >= account.refresh_backoff_until
                && (account.expires_within(now, buffer_ms)
                    || account.state == AccountState::AuthError);

            if account.force_refresh || due_normally {
                account.in_flight_refresh = true;
                account.force_refresh = false;
                jobs.push(RefreshJob {
                    name: account.name.clone(),
                    refresh_token: account.refresh_token.clone(),
                });
            }
        }
        jobs
    }

    /// Record the result of a refresh grant and release the single-flight
    /// guard. Results for accounts removed mid-refresh are discarded.
    pub async fn complete_refresh(&self, name: &str, outcome: RefreshOutcome) {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock().await;

        let Some(account) = inner.accounts.get_mut(name) else {
            info!(account = %name, "refresh result discarded, account removed during refresh");
            return;
        };
        account.in_flight_refresh = false;

        match outcome {
            RefreshOutcome::Success(token) => {
                account.access_token = token.access_token;
                if let Some(rotated) = token.refresh_token {
                    account.refresh_token = rotated;
                }
                account.expires_at = now + token.expires_in * 1000;
                account.refresh_failures = 0;
                account.refresh_backoff_until = 0;
                account.reauth_required = false;
                account.last_error = None;
                if account.state == AccountState::AuthError {
                    account.state = AccountState::Available;
                    info!(account = %name, "auth error cleared by successful refresh");
                }
            }
            RefreshOutcome::Terminal(detail) => {
                account.reauth_required = true;
                account.mark_auth_error(detail);
            }
            RefreshOutcome::Transient(detail) => {
                account.refresh_failures += 1;
                let backoff = refresh_backoff(account.refresh_failures);
                account.refresh_backoff_until = now + backoff.as_millis() as u64;
                warn!(
                    account = %name,
                    failures = account.refresh_failures,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %detail,
                    "transient refresh failure, backing off"
                );
            }
        }
    }

    /// Point-in-time view for the status surface. Does not advance the
    /// cursor; elapsed cooldowns are shown as available.
    pub async fn snapshot(&self) -> PoolView {
        let now = self.clock.now_ms();
        let inner = self.inner.lock().await;

        let mut counts = PoolCounts {
            total: inner.order.len(),
            ..Default::default()
        };
        let mut accounts = Vec::with_capacity(inner.order.len());

        for name in &inner.order {
            let Some(account) = inner.accounts.get(name) else {
                continue;
            };
            let effective = effective_state(account, now);
            match effective {
                AccountState::Available => counts.available += 1,
                AccountState::RateLimited { .. } => counts.rate_limited += 1,
                AccountState::AuthError => counts.auth_error += 1,
                AccountState::Disabled => counts.disabled += 1,
            }
            accounts.push(AccountView {
                name: account.name.clone(),
                state: effective.label().to_string(),
                expires_at: account.expires_at,
                expires_in_seconds: (account.expires_at as i64 - now as i64) / 1000,
                rate_limited_until: match effective {
                    AccountState::RateLimited { until } => Some(until),
                    _ => None,
                },
                last_used: account.last_used,
                last_error: account.last_error.clone(),
                in_flight_refresh: account.in_flight_refresh,
            });
        }

        PoolView {
            total: counts.total,
            available: counts.available,
            rate_limited: counts.rate_limited,
            auth_error: counts.auth_error,
            disabled: counts.disabled,
            next_account: peek_next(&inner, now, self.config.rotation_enabled),
            generation: inner.generation,
            accounts,
        }
    }

    /// Rebuild the on-disk document from current pool state, in rotation
    /// order. Used by the refresh scheduler to persist rotated tokens.
    pub async fn document(&self) -> AccountsDocument {
        let inner = self.inner.lock().await;
        AccountsDocument {
            version: claude_accounts::DOCUMENT_VERSION,
            accounts: inner
                .order
                .iter()
                .filter_map(|name| inner.accounts.get(name))
                .map(|account| {
                    (
                        account.name.clone(),
                        StoredCredentials {
                            access_token: account.access_token.clone(),
                            refresh_token: account.refresh_token.clone(),
                            expires_at: account.expires_at,
                        },
                    )
                })
                .collect(),
        }
    }

    /// Current reload generation.
    pub async fn generation(&self) -> u64 {
        self.inner.lock().await.generation
    }

    /// Number of accounts in the pool.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.order.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Effective state for observation: an elapsed cooldown reads as available.
fn effective_state(account: &Account, now_ms: u64) -> AccountState {
    match account.state {
        AccountState::RateLimited { until } if until <= now_ms => AccountState::Available,
        ref other => other.clone(),
    }
}

/// The account `acquire` would return next, without advancing the cursor.
fn peek_next(inner: &PoolInner, now_ms: u64, rotation_enabled: bool) -> Option<String> {
    let n = inner.order.len();
    if n == 0 {
        return None;
    }
    let span = if rotation_enabled { n } else { 1 };
    let start = if rotation_enabled { inner.cursor } else { 0 };
    for offset in 0..span {
        let name = &inner.order[(start + offset) % n];
        if let Some(account) = inner.accounts.get(name)
            && matches!(effective_state(account, now_ms), AccountState::Available)
        {
            return Some(name.clone());
        }
    }
    None
}

/// Build the `NoAccountAvailable` error with counts and the soonest
/// cooldown expiry.
fn unavailable(inner: &PoolInner, now_ms: u64) -> Error {
    let mut counts = PoolCounts {
        total: inner.order.len(),
        ..Default::default()
    };
    let mut soonest: Option<u64> = None;

    for account in inner.accounts.values() {
        match effective_state(account, now_ms) {
            AccountState::Available => counts.available += 1,
            AccountState::RateLimited { until } => {
                counts.rate_limited += 1;
                soonest = Some(soonest.map_or(until, |s| s.min(until)));
            }
            AccountState::AuthError => counts.auth_error += 1,
            AccountState::Disabled => counts.disabled += 1,
        }
    }

    warn!(%counts, "no account available");
    Error::NoAccountAvailable {
        counts,
        soonest_ready_ms: soonest,
    }
}

/// Exponential backoff with jitter for transient refresh failures:
/// 1s, 2s, 4s, ... capped at 5 minutes, scaled by a random factor in
/// [0.5, 1.5).
fn refresh_backoff(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    let base = REFRESH_BACKOFF_INITIAL
        .saturating_mul(1u32 << exponent)
        .min(REFRESH_BACKOFF_CAP);
    let jitter: f64 = rand::rng().random_range(0.5..1.5);
    Duration::from_millis((base.as_millis() as f64 * jitter) as u64)
}

/// Read-only pool view for the status surface. Token material never
/// appears here.
#[derive(Debug, Serialize)]
pub struct PoolView {
    pub total: usize,
    pub available: usize,
    pub rate_limited: usize,
    pub auth_error: usize,
    pub disabled: usize,
    pub next_account: Option<String>,
    pub generation: u64,
    pub accounts: Vec<AccountView>,
}

/// One account's status record.
#[derive(Debug, Serialize)]
pub struct AccountView {
    pub name: String,
    pub state: String,
    pub expires_at: u64,
    pub expires_in_seconds: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limited_until: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub in_flight_refresh: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::ManualClock;

    const NOW: u64 = 1_700_000_000_000;

    fn document(names: &[&str]) -> AccountsDocument {
        AccountsDocument {
            version: 1,
            accounts: names
                .iter()
                .map(|n| {
                    (
                        n.to_string(),
                        StoredCredentials {
                            access_token: format!("sk-ant-oat01-{n}"),
                            refresh_token: format!("sk-ant-ort01-{n}"),
                            expires_at: NOW + 8 * 3_600_000,
                        },
                    )
                })
                .collect(),
        }
    }

    fn pool_with_clock(names: &[&str]) -> (Pool, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at(NOW));
        let pool = Pool::new(&document(names), PoolConfig::default(), clock.clone());
        (pool, clock)
    }

    #[tokio::test]
    async fn round_robin_cycles_in_document_order() {
        let (pool, _clock) = pool_with_clock(&["a", "b", "c"]);
        let mut names = Vec::new();
        for _ in 0..4 {
            names.push(pool.acquire().await.unwrap().name);
        }
        assert_eq!(names, vec!["a", "b", "c", "a"]);
    }

    #[tokio::test]
    async fn report_ok_sets_last_used() {
        let (pool, clock) = pool_with_clock(&["a"]);
        let lease = pool.acquire().await.unwrap();
        clock.advance(1_234);
        pool.report(&lease.name, Outcome::Ok).await;

        let view = pool.snapshot().await;
        assert_eq!(view.accounts[0].last_used, Some(NOW + 1_234));
    }

    #[tokio::test]
    async fn rate_limited_account_is_skipped_until_cooldown() {
        let (pool, clock) = pool_with_clock(&["a", "b"]);

        pool.report(
            "a",
            Outcome::RateLimited {
                retry_after: Some(Duration::from_secs(90)),
            },
        )
        .await;

        // While a cools down, every selection lands on b
        clock.advance(1_000);
        assert_eq!(pool.acquire().await.unwrap().name, "b");
        assert_eq!(pool.acquire().await.unwrap().name, "b");

        // Once the 90s cooldown elapses, a rejoins the rotation
        clock.advance(90_000);
        assert_eq!(pool.acquire().await.unwrap().name, "a");
        assert_eq!(pool.acquire().await.unwrap().name, "b");
    }

    #[tokio::test]
    async fn minimum_cooldown_floor_applies_to_small_hints() {
        let (pool, clock) = pool_with_clock(&["a"]);
        pool.report(
            "a",
            Outcome::RateLimited {
                retry_after: Some(Duration::ZERO),
            },
        )
        .await;

        // 59s later the floor (60s) still blocks
        clock.advance(59_000);
        assert!(pool.acquire().await.is_err());

        clock.advance(1_000);
        assert_eq!(pool.acquire().await.unwrap().name, "a");
    }

    #[tokio::test]
    async fn missing_hint_uses_minimum_cooldown() {
        let (pool, clock) = pool_with_clock(&["a"]);
        pool.report("a", Outcome::RateLimited { retry_after: None })
            .await;

        let view = pool.snapshot().await;
        assert_eq!(view.accounts[0].rate_limited_until, Some(NOW + 60_000));
        let _ = clock;
    }

    #[tokio::test]
    async fn auth_error_blocks_selection_and_stores_detail() {
        let (pool, _clock) = pool_with_clock(&["a", "b"]);
        pool.report(
            "a",
            Outcome::AuthError {
                detail: "OAuth token has expired".into(),
            },
        )
        .await;

        assert_eq!(pool.acquire().await.unwrap().name, "b");
        let view = pool.snapshot().await;
        let a = view.accounts.iter().find(|v| v.name == "a").unwrap();
        assert_eq!(a.state, "auth_error");
        assert_eq!(a.last_error.as_deref(), Some("OAuth token has expired"));
    }

    #[tokio::test]
    async fn transient_outcome_changes_nothing() {
        let (pool, _clock) = pool_with_clock(&["a"]);
        pool.report("a", Outcome::Transient).await;
        let view = pool.snapshot().await;
        assert_eq!(view.available, 1);
        assert!(view.accounts[0].last_used.is_none());
    }

    #[tokio::test]
    async fn empty_pool_fails_immediately() {
        let (pool, _clock) = pool_with_clock(&[]);
        let err = pool.acquire().await.unwrap_err();
        match err {
            Error::NoAccountAvailable {
                counts,
                soonest_ready_ms,
            } => {
                assert_eq!(counts.total, 0);
                assert!(soonest_ready_ms.is_none());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn all_rate_limited_reports_soonest_cooldown() {
        let (pool, _clock) = pool_with_clock(&["a", "b"]);
        pool.report(
            "a",
            Outcome::RateLimited {
                retry_after: Some(Duration::from_secs(600)),
            },
        )
        .await;
        pool.report(
            "b",
            Outcome::RateLimited {
                retry_after: Some(Duration::from_secs(120)),
            },
        )
        .await;

        match pool.acquire().await.unwrap_err() {
            Error::NoAccountAvailable {
                counts,
                soonest_ready_ms,
            } => {
                assert_eq!(counts.rate_limited, 2);
                assert_eq!(soonest_ready_ms, Some(NOW + 120_000));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn acquire_excluding_skips_tried_accounts() {
        let (pool, _clock) = pool_with_clock(&["a", "b", "c"]);

        let first = pool.acquire().await.unwrap();
        assert_eq!(first.name, "a");

        let second = pool.acquire_excluding(&[first.name.clone()]).await.unwrap();
        assert_eq!(second.name, "b");

        let third = pool
            .acquire_excluding(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(third.name, "c");
    }

    #[tokio::test]
    async fn acquire_excluding_every_account_fails() {
        let (pool, _clock) = pool_with_clock(&["a", "b"]);

        let err = pool
            .acquire_excluding(&["a".to_string(), "b".to_string()])
            .await
            .unwrap_err();
        match err {
            Error::NoAccountAvailable { counts, .. } => {
                // The accounts are selectable, just all tried already
                assert_eq!(counts.available, 2);
            }
            other => panic!("unexpected error: {other}"),
        }

        // An empty exclusion behaves exactly like acquire
        assert_eq!(pool.acquire_excluding(&[]).await.unwrap().name, "a");
    }

    #[tokio::test]
    async fn single_account_round_robin_always_returns_it() {
        let (pool, _clock) = pool_with_clock(&["only"]);
        for _ in 0..5 {
            assert_eq!(pool.acquire().await.unwrap().name, "only");
        }
    }

    #[tokio::test]
    async fn rotation_disabled_pins_first_account() {
        let clock = Arc::new(ManualClock::at(NOW));
        let pool = Pool::new(
            &document(&["first", "second"]),
            PoolConfig {
                rotation_enabled: false,
                ..Default::default()
            },
            clock.clone(),
        );

        for _ in 0..3 {
            assert_eq!(pool.acquire().await.unwrap().name, "first");
        }

        // With the first account cooling down, the pool does NOT fall over
        // to the second entry — single-account mode.
        pool.report("first", Outcome::RateLimited { retry_after: None })
            .await;
        assert!(pool.acquire().await.is_err());
    }

    #[tokio::test]
    async fn acquire_named_ignores_state_except_disabled() {
        let (pool, _clock) = pool_with_clock(&["a"]);
        pool.report("a", Outcome::RateLimited { retry_after: None })
            .await;

        let lease = pool.acquire_named("a").await.unwrap();
        assert!(matches!(lease.state, AccountState::RateLimited { .. }));

        pool.disable("a").await.unwrap();
        assert!(matches!(
            pool.acquire_named("a").await.unwrap_err(),
            Error::NoSuchAccount(_)
        ));

        assert!(matches!(
            pool.acquire_named("ghost").await.unwrap_err(),
            Error::NoSuchAccount(_)
        ));
    }

    #[tokio::test]
    async fn manual_selection_does_not_advance_cursor() {
        let (pool, _clock) = pool_with_clock(&["a", "b"]);
        let _ = pool.acquire_named("b").await.unwrap();
        // Rotation still starts at a
        assert_eq!(pool.acquire().await.unwrap().name, "a");
    }

    #[tokio::test]
    async fn report_for_removed_account_is_dropped() {
        let (pool, _clock) = pool_with_clock(&["a", "b"]);
        pool.apply_reload(&document(&["b"])).await;
        // Must not panic or resurrect "a"
        pool.report("a", Outcome::Ok).await;
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test]
    async fn disable_enable_round_trip() {
        let (pool, _clock) = pool_with_clock(&["a"]);
        pool.report(
            "a",
            Outcome::AuthError {
                detail: "bad".into(),
            },
        )
        .await;
        pool.disable("a").await.unwrap();

        let view = pool.snapshot().await;
        assert_eq!(view.disabled, 1);

        pool.enable("a").await.unwrap();
        let view = pool.snapshot().await;
        assert_eq!(view.available, 1);
        assert!(view.accounts[0].last_error.is_none());
        assert!(view.accounts[0].rate_limited_until.is_none());
    }

    #[tokio::test]
    async fn enable_on_available_account_is_noop() {
        let (pool, _clock) = pool_with_clock(&["a"]);
        pool.enable("a").await.unwrap();
        let view = pool.snapshot().await;
        assert_eq!(view.available, 1);
    }

    #[tokio::test]
    async fn enable_clears_cooldown() {
        let (pool, _clock) = pool_with_clock(&["a"]);
        pool.report(
            "a",
            Outcome::RateLimited {
                retry_after: Some(Duration::from_secs(3600)),
            },
        )
        .await;
        pool.enable("a").await.unwrap();
        assert_eq!(pool.acquire().await.unwrap().name, "a");
    }

    #[tokio::test]
    async fn admin_actions_on_unknown_account_fail() {
        let (pool, _clock) = pool_with_clock(&["a"]);
        assert!(pool.enable("ghost").await.is_err());
        assert!(pool.disable("ghost").await.is_err());
        assert!(pool.request_refresh("ghost").await.is_err());
    }

    #[tokio::test]
    async fn reload_preserves_runtime_state_and_updates_tokens() {
        let (pool, _clock) = pool_with_clock(&["a", "b"]);
        pool.report(
            "a",
            Outcome::RateLimited {
                retry_after: Some(Duration::from_secs(60)),
            },
        )
        .await;

        // Operator rewrites the document with fresh tokens for a plus a new c
        let mut doc = document(&["a", "b", "c"]);
        doc.accounts[0].1.access_token = "sk-ant-oat01-a-fresh".into();

        let summary = pool.apply_reload(&doc).await;
        assert_eq!(summary.added, 1);
        assert_eq!(summary.removed, 0);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.generation, 1);

        let view = pool.snapshot().await;
        let a = view.accounts.iter().find(|v| v.name == "a").unwrap();
        assert_eq!(a.state, "rate_limited");
        assert_eq!(a.rate_limited_until, Some(NOW + 60_000));
        let c = view.accounts.iter().find(|v| v.name == "c").unwrap();
        assert_eq!(c.state, "available");

        // The manual path hands out the fresh token
        let lease = pool.acquire_named("a").await.unwrap();
        assert_eq!(lease.access_token, "sk-ant-oat01-a-fresh");
    }

    #[tokio::test]
    async fn reload_is_idempotent() {
        let (pool, _clock) = pool_with_clock(&["a", "b"]);
        pool.report("a", Outcome::RateLimited { retry_after: None })
            .await;

        let doc = document(&["a", "b"]);
        pool.apply_reload(&doc).await;
        let first = pool.snapshot().await;
        pool.apply_reload(&doc).await;
        let second = pool.snapshot().await;

        assert_eq!(first.total, second.total);
        assert_eq!(first.rate_limited, second.rate_limited);
        assert_eq!(first.next_account, second.next_account);
        let until =
            |v: &PoolView| v.accounts.iter().map(|a| a.rate_limited_until).collect::<Vec<_>>();
        assert_eq!(until(&first), until(&second));
    }

    #[tokio::test]
    async fn reload_with_same_names_keeps_cursor() {
        let (pool, _clock) = pool_with_clock(&["a", "b", "c"]);
        // Advance rotation: cursor now points at b
        assert_eq!(pool.acquire().await.unwrap().name, "a");

        pool.apply_reload(&document(&["a", "b", "c"])).await;

        // Rotation continues at b, not back at a
        assert_eq!(pool.acquire().await.unwrap().name, "b");
    }

    #[tokio::test]
    async fn reload_resets_cursor_when_pointed_account_removed() {
        let (pool, _clock) = pool_with_clock(&["a", "b", "c"]);
        assert_eq!(pool.acquire().await.unwrap().name, "a"); // cursor → b

        pool.apply_reload(&document(&["a", "c"])).await;

        assert_eq!(pool.acquire().await.unwrap().name, "a");
    }

    #[tokio::test]
    async fn reload_cursor_follows_account_position() {
        let (pool, _clock) = pool_with_clock(&["a", "b", "c"]);
        assert_eq!(pool.acquire().await.unwrap().name, "a"); // cursor → b

        // b moves to the front of the document
        pool.apply_reload(&document(&["b", "a", "c"])).await;

        assert_eq!(pool.acquire().await.unwrap().name, "b");
    }

    #[tokio::test]
    async fn snapshot_peeks_without_advancing() {
        let (pool, _clock) = pool_with_clock(&["a", "b"]);
        let view = pool.snapshot().await;
        assert_eq!(view.next_account.as_deref(), Some("a"));
        // Peeking twice still shows a
        let view = pool.snapshot().await;
        assert_eq!(view.next_account.as_deref(), Some("a"));
        assert_eq!(pool.acquire().await.unwrap().name, "a");
    }

    #[tokio::test]
    async fn snapshot_shows_elapsed_cooldown_as_available() {
        let (pool, clock) = pool_with_clock(&["a"]);
        pool.report("a", Outcome::RateLimited { retry_after: None })
            .await;
        assert_eq!(pool.snapshot().await.rate_limited, 1);

        clock.advance(61_000);
        let view = pool.snapshot().await;
        assert_eq!(view.available, 1);
        assert_eq!(view.next_account.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn snapshot_contains_no_token_material() {
        let (pool, _clock) = pool_with_clock(&["a"]);
        let view = pool.snapshot().await;
        let json = serde_json::to_string(&view).unwrap();
        assert!(!json.contains("sk-ant-oat01"));
        assert!(!json.contains("sk-ant-ort01"));
    }

    #[tokio::test]
    async fn begin_due_refreshes_claims_expiring_accounts_once() {
        let clock = Arc::new(ManualClock::at(NOW));
        let mut doc = document(&["near", "far"]);
        doc.accounts[0].1.expires_at = NOW + 300_000; // expires in 5 min

        let pool = Pool::new(&doc, PoolConfig::default(), clock.clone());

        let jobs = pool.begin_due_refreshes(Duration::from_secs(600)).await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].name, "near");
        assert_eq!(jobs[0].refresh_token, "sk-ant-ort01-near");

        // Single-flight: claiming again while in flight yields nothing
        let jobs = pool.begin_due_refreshes(Duration::from_secs(600)).await;
        assert!(jobs.is_empty());
    }

    #[tokio::test]
    async fn successful_refresh_updates_tokens_and_recovers_auth_error() {
        let (pool, _clock) = pool_with_clock(&["a"]);
        pool.report(
            "a",
            Outcome::AuthError {
                detail: "401".into(),
            },
        )
        .await;

        let jobs = pool.begin_due_refreshes(Duration::from_secs(600)).await;
        assert_eq!(jobs.len(), 1);

        pool.complete_refresh(
            "a",
            RefreshOutcome::Success(TokenResponse {
                access_token: "sk-ant-oat01-rotated".into(),
                refresh_token: Some("sk-ant-ort01-rotated".into()),
                expires_in: 28_800,
            }),
        )
        .await;

        let view = pool.snapshot().await;
        assert_eq!(view.accounts[0].state, "available");
        assert!(view.accounts[0].last_error.is_none());
        assert_eq!(view.accounts[0].expires_at, NOW + 28_800_000);

        let lease = pool.acquire().await.unwrap();
        assert_eq!(lease.access_token, "sk-ant-oat01-rotated");

        let doc = pool.document().await;
        assert_eq!(doc.get("a").unwrap().refresh_token, "sk-ant-ort01-rotated");
    }

    #[tokio::test]
    async fn refresh_without_rotated_token_keeps_old_refresh_token() {
        let (pool, _clock) = pool_with_clock(&["a"]);
        pool.request_refresh("a").await.unwrap();
        let jobs = pool.begin_due_refreshes(Duration::from_secs(600)).await;
        assert_eq!(jobs.len(), 1);

        pool.complete_refresh(
            "a",
            RefreshOutcome::Success(TokenResponse {
                access_token: "sk-ant-oat01-new".into(),
                refresh_token: None,
                expires_in: 3_600,
            }),
        )
        .await;

        let doc = pool.document().await;
        assert_eq!(doc.get("a").unwrap().refresh_token, "sk-ant-ort01-a");
        assert_eq!(doc.get("a").unwrap().access_token, "sk-ant-oat01-new");
    }

    #[tokio::test]
    async fn terminal_refresh_failure_is_not_retried() {
        let (pool, _clock) = pool_with_clock(&["a"]);
        pool.request_refresh("a").await.unwrap();
        assert_eq!(
            pool.begin_due_refreshes(Duration::from_secs(600)).await.len(),
            1
        );

        pool.complete_refresh("a", RefreshOutcome::Terminal("invalid_grant".into()))
            .await;

        let view = pool.snapshot().await;
        assert_eq!(view.accounts[0].state, "auth_error");
        assert_eq!(view.accounts[0].last_error.as_deref(), Some("invalid_grant"));

        // Despite being in auth_error, the dead refresh token keeps the
        // account out of every subsequent sweep
        assert!(
            pool.begin_due_refreshes(Duration::from_secs(600))
                .await
                .is_empty()
        );

        // Operator enable makes it eligible again
        pool.enable("a").await.unwrap();
        pool.request_refresh("a").await.unwrap();
        assert_eq!(
            pool.begin_due_refreshes(Duration::from_secs(600)).await.len(),
            1
        );
    }

    #[tokio::test]
    async fn transient_refresh_failure_backs_off() {
        let (pool, clock) = pool_with_clock(&["a"]);
        pool.report(
            "a",
            Outcome::AuthError {
                detail: "401".into(),
            },
        )
        .await;

        assert_eq!(
            pool.begin_due_refreshes(Duration::from_secs(600)).await.len(),
            1
        );
        pool.complete_refresh("a", RefreshOutcome::Transient("503 from endpoint".into()))
            .await;

        // Immediately after the failure, backoff blocks the next claim
        assert!(
            pool.begin_due_refreshes(Duration::from_secs(600))
                .await
                .is_empty()
        );

        // Backoff is jittered 1s×[0.5,1.5); 2s later it has elapsed
        clock.advance(2_000);
        assert_eq!(
            pool.begin_due_refreshes(Duration::from_secs(600)).await.len(),
            1
        );
    }

    #[tokio::test]
    async fn force_refresh_bypasses_buffer_and_backoff() {
        let (pool, _clock) = pool_with_clock(&["a"]); // expires far in the future

        // Not due normally
        assert!(
            pool.begin_due_refreshes(Duration::from_secs(600))
                .await
                .is_empty()
        );

        pool.request_refresh("a").await.unwrap();
        let jobs = pool.begin_due_refreshes(Duration::from_secs(600)).await;
        assert_eq!(jobs.len(), 1);

        // The flag is consumed
        pool.complete_refresh("a", RefreshOutcome::Transient("x".into()))
            .await;
        assert!(
            pool.begin_due_refreshes(Duration::from_secs(600))
                .await
                .is_empty()
        );
    }

    #[tokio::test]
    async fn disabled_accounts_are_never_refreshed() {
        let clock = Arc::new(ManualClock::at(NOW));
        let mut doc = document(&["a"]);
        doc.accounts[0].1.expires_at = NOW; // already expired
        let pool = Pool::new(&doc, PoolConfig::default(), clock);

        pool.disable("a").await.unwrap();
        assert!(
            pool.begin_due_refreshes(Duration::from_secs(600))
                .await
                .is_empty()
        );
    }

    #[tokio::test]
    async fn refresh_result_for_removed_account_is_discarded() {
        let (pool, _clock) = pool_with_clock(&["a", "b"]);
        pool.request_refresh("a").await.unwrap();
        let jobs = pool.begin_due_refreshes(Duration::from_secs(600)).await;
        assert_eq!(jobs.len(), 1);

        // a disappears while its refresh is in flight
        pool.apply_reload(&document(&["b"])).await;

        pool.complete_refresh(
            "a",
            RefreshOutcome::Success(TokenResponse {
                access_token: "sk-ant-oat01-ghost".into(),
                refresh_token: None,
                expires_in: 3_600,
            }),
        )
        .await;

        // The result did not re-insert the account
        assert_eq!(pool.len().await, 1);
        assert!(pool.document().await.get("a").is_none());
    }

    #[tokio::test]
    async fn reload_increments_generation() {
        let (pool, _clock) = pool_with_clock(&["a"]);
        assert_eq!(pool.generation().await, 0);
        pool.apply_reload(&document(&["a"])).await;
        pool.apply_reload(&document(&["a", "b"])).await;
        assert_eq!(pool.generation().await, 2);
    }

    #[tokio::test]
    async fn concurrent_acquires_spread_over_accounts() {
        let (pool, _clock) = pool_with_clock(&["a", "b", "c"]);
        let pool = Arc::new(pool);

        let mut handles = vec![];
        for _ in 0..30 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                pool.acquire().await.unwrap().name
            }));
        }

        let mut counts: HashMap<String, usize> = HashMap::new();
        for h in handles {
            *counts.entry(h.await.unwrap()).or_default() += 1;
        }
        // Strict monotonic cursor: 30 acquires over 3 accounts = 10 each
        assert_eq!(counts.get("a"), Some(&10));
        assert_eq!(counts.get("b"), Some(&10));
        assert_eq!(counts.get("c"), Some(&10));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let first = refresh_backoff(1);
        assert!(first >= Duration::from_millis(500) && first < Duration::from_millis(1_500));

        let tenth = refresh_backoff(10);
        assert!(tenth <= Duration::from_millis(450_000));
        assert!(tenth >= Duration::from_millis(150_000));

        // Far past the cap the jittered value stays bounded
        let huge = refresh_backoff(40);
        assert!(huge <= Duration::from_millis(450_000));
    }
}
