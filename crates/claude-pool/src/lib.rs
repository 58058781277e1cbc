//! Rotation pool for Claude OAuth accounts
//!
//! The pool multiplexes client requests across independently-authenticated
//! accounts: round-robin selection with failover, a per-account state
//! machine (available / rate_limited / auth_error / disabled), a proactive
//! token refresh scheduler with single-flight guarantees, and a file
//! watcher that keeps the pool in sync with the on-disk credentials
//! document.
//!
//! Account lifecycle:
//! 1. The credentials store loads `accounts.json` → accounts enter the pool
//!    in document order as `available`
//! 2. The dispatcher acquires accounts round-robin and reports outcomes;
//!    429 puts an account into cooldown, 401/403 into `auth_error`
//! 3. Cooldowns expire lazily at the next selection
//! 4. The refresh scheduler rotates access tokens before expiry and
//!    persists them; the watcher suppresses the resulting self-write event
//! 5. Operator edits to the document hot-reload the pool, preserving
//!    runtime state for surviving accounts
//!
//! All pool state lives behind a single mutex held only for
//! read-modify-write; token refreshes and upstream calls never run under it.

pub mod account;
pub mod clock;
pub mod error;
pub mod pool;
pub mod refresh;
pub mod retry_after;
pub mod watcher;

pub use account::{Account, AccountState};
pub use clock::{Clock, SystemClock};
pub use error::{Error, PoolCounts, Result};
pub use pool::{Lease, Outcome, Pool, PoolConfig, PoolView, RefreshJob, RefreshOutcome};
pub use refresh::{RefreshConfig, spawn_refresh_task};
pub use retry_after::cooldown_from_headers;
pub use watcher::{WatcherConfig, spawn_watcher};
