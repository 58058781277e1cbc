//! Proactive background token refresh
//!
//! A periodic sweep claims every account whose token expires within the
//! refresh buffer (plus auth-error recoveries and admin force-refreshes),
//! performs the refresh grants outside the pool mutex, and persists
//! rotated tokens back to the credentials document. The pool can also wake
//! the task between sweeps — on dispatcher auth errors, reloads, and
//! force-refresh requests — so recovery does not wait for the next tick.
//!
//! Per-account serialization is enforced by the pool's single-flight
//! ticket protocol; the sweep itself runs accounts sequentially.

use std::sync::Arc;
use std::time::Duration;

use claude_accounts::{CredentialsStore, TokenClient};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pool::{Pool, RefreshOutcome};

/// Scheduler cadence settings.
#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// Time between sweeps.
    pub interval: Duration,
    /// Refresh tokens expiring within this lead time.
    pub refresh_buffer: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            refresh_buffer: Duration::from_secs(600),
        }
    }
}

/// Spawn the refresh scheduler.
///
/// The first sweep runs immediately so tokens already past expiry at load
/// time are refreshed before traffic relies on them. Cancelling the token
/// stops the loop between sweeps; an in-progress sweep drains first, so
/// no refresh is abandoned with its single-flight guard held.
pub fn spawn_refresh_task(
    pool: Arc<Pool>,
    token_client: TokenClient,
    store: Arc<CredentialsStore>,
    config: RefreshConfig,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            interval_secs = config.interval.as_secs(),
            refresh_buffer_secs = config.refresh_buffer.as_secs(),
            "refresh scheduler started"
        );
        let mut ticker = tokio::time::interval(config.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = pool.refresh_wake().notified() => {
                    debug!("refresh scheduler woken on demand");
                }
                _ = shutdown.cancelled() => break,
            }
            run_sweep(&pool, &token_client, &store, config.refresh_buffer).await;
        }

        info!("refresh scheduler stopped");
    })
}

/// One sweep: claim due accounts, refresh each, persist on success.
async fn run_sweep(
    pool: &Pool,
    token_client: &TokenClient,
    store: &CredentialsStore,
    refresh_buffer: Duration,
) {
    let jobs = pool.begin_due_refreshes(refresh_buffer).await;
    if jobs.is_empty() {
        return;
    }
    debug!(count = jobs.len(), "refresh sweep starting");

    for job in jobs {
        let outcome = match token_client.refresh(&job.refresh_token).await {
            Ok(token) => {
                info!(account = %job.name, "token refresh succeeded");
                RefreshOutcome::Success(token)
            }
            Err(claude_accounts::Error::InvalidGrant(detail)) => {
                warn!(
                    account = %job.name,
                    error = %detail,
                    "refresh token rejected, operator re-authentication required"
                );
                RefreshOutcome::Terminal(detail)
            }
            Err(e) => {
                warn!(account = %job.name, error = %e, "refresh failed, will retry after backoff");
                RefreshOutcome::Transient(e.to_string())
            }
        };

        let persist = matches!(outcome, RefreshOutcome::Success(_));
        pool.complete_refresh(&job.name, outcome).await;

        if persist {
            let document = pool.document().await;
            if let Err(e) = store.save(&document).await {
                warn!(account = %job.name, error = %e, "failed to persist refreshed tokens");
            }
        }
    }
}
