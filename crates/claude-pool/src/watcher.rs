//! Hot reload of the credentials document
//!
//! Watches the document's parent directory for filesystem events, filters
//! to the document itself, debounces bursts (editors and atomic renames
//! produce several events per save), and reloads the pool. Two event
//! classes are dropped: events for unrelated files, and our own writes —
//! identified by content hash through the store's self-write marker, so a
//! refresh persisting rotated tokens does not bounce back as a reload.
//!
//! A load that fails to parse or validate logs a warning and leaves the
//! current pool untouched.

use std::ffi::OsString;
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecursiveMode, Watcher};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pool::Pool;
use claude_accounts::CredentialsStore;

/// Watcher settings.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Quiet period after the first event before reloading; further events
    /// inside the window are coalesced.
    pub debounce: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(250),
        }
    }
}

/// Spawn the file watcher task.
///
/// Fails if the platform watcher cannot be created or the document's
/// parent directory cannot be watched. The watcher is optional: without it
/// on-disk changes are picked up only at process restart.
pub fn spawn_watcher(
    pool: Arc<Pool>,
    store: Arc<CredentialsStore>,
    config: WatcherConfig,
    shutdown: CancellationToken,
) -> notify::Result<tokio::task::JoinHandle<()>> {
    let path = store.path().to_path_buf();
    let watch_dir = path
        .parent()
        .map(|p| p.to_path_buf())
        .ok_or_else(|| notify::Error::generic("credentials path has no parent directory"))?;
    let file_name: OsString = path
        .file_name()
        .map(|n| n.to_os_string())
        .ok_or_else(|| notify::Error::generic("credentials path has no file name"))?;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher = notify::recommended_watcher(move |event| {
        let _ = tx.send(event);
    })?;
    watcher.watch(&watch_dir, RecursiveMode::NonRecursive)?;

    Ok(tokio::spawn(async move {
        // Owns the watcher so the OS subscription lives as long as the task
        let _watcher = watcher;
        info!(path = %path.display(), "credentials watcher started");

        loop {
            let event = tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                _ = shutdown.cancelled() => break,
            };

            match event {
                Ok(event) if is_document_event(&event, &file_name) => {}
                Ok(_) => continue,
                Err(e) => {
                    warn!(error = %e, "filesystem watch error");
                    continue;
                }
            }

            // Debounce: wait out the burst, then drop whatever queued up
            tokio::time::sleep(config.debounce).await;
            while rx.try_recv().is_ok() {}

            reload(&pool, &store).await;
        }

        info!("credentials watcher stopped");
    }))
}

/// Whether an event concerns the credentials document itself.
fn is_document_event(event: &Event, file_name: &OsString) -> bool {
    if !matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Any
    ) {
        return false;
    }
    event
        .paths
        .iter()
        .any(|p| p.file_name() == Some(file_name.as_os_str()))
}

/// Read, suppress self-writes, parse, and apply.
async fn reload(pool: &Pool, store: &CredentialsStore) {
    let bytes = match tokio::fs::read(store.path()).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "credentials document unreadable after change event");
            return;
        }
    };

    if store.is_recent_self_write(&bytes).await {
        debug!("ignoring self-induced credentials change");
        return;
    }

    match CredentialsStore::parse(&bytes) {
        Ok(document) => {
            let summary = pool.apply_reload(&document).await;
            info!(
                added = summary.added,
                removed = summary.removed,
                total = summary.total,
                generation = summary.generation,
                "credentials hot-reloaded"
            );
        }
        Err(e) => {
            warn!(error = %e, "credentials reload failed, keeping current pool");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::ManualClock;
    use crate::pool::PoolConfig;
    use claude_accounts::{AccountsDocument, StoredCredentials};

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

    async fn wait_for_generation(pool: &Pool, at_least: u64) -> bool {
        for _ in 0..100 {
            if pool.generation().await >= at_least {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    struct Fixture {
        pool: Arc<Pool>,
        store: Arc<CredentialsStore>,
        shutdown: CancellationToken,
        handle: tokio::task::JoinHandle<()>,
        _dir: tempfile::TempDir,
    }

    async fn fixture(names: &[&str]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CredentialsStore::new(dir.path().join("accounts.json")));
        let doc = document(names);
        store.save(&doc).await.unwrap();

        let clock = Arc::new(ManualClock::at(NOW));
        let pool = Arc::new(Pool::new(&doc, PoolConfig::default(), clock));

        let shutdown = CancellationToken::new();
        let handle = spawn_watcher(
            pool.clone(),
            store.clone(),
            WatcherConfig {
                debounce: Duration::from_millis(50),
            },
            shutdown.clone(),
        )
        .unwrap();

        // Let the platform watcher settle before mutating the directory
        tokio::time::sleep(Duration::from_millis(100)).await;

        Fixture {
            pool,
            store,
            shutdown,
            handle,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn foreign_edit_triggers_reload() {
        let fx = fixture(&["a"]).await;

        // Operator appends an account by rewriting the file directly
        let edited = serde_json::to_vec_pretty(&document(&["a", "b"])).unwrap();
        tokio::fs::write(fx.store.path(), &edited).await.unwrap();

        assert!(wait_for_generation(&fx.pool, 1).await, "reload never happened");
        assert_eq!(fx.pool.len().await, 2);

        fx.shutdown.cancel();
        let _ = fx.handle.await;
    }

    #[tokio::test]
    async fn self_write_is_suppressed() {
        let fx = fixture(&["a"]).await;

        // A save through the store (as the refresh scheduler does) must
        // not bounce back into a reload
        fx.store.save(&document(&["a"])).await.unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fx.pool.generation().await, 0);

        fx.shutdown.cancel();
        let _ = fx.handle.await;
    }

    #[tokio::test]
    async fn malformed_edit_keeps_current_pool() {
        let fx = fixture(&["a"]).await;

        tokio::fs::write(fx.store.path(), b"{ definitely not json")
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fx.pool.generation().await, 0);
        assert_eq!(fx.pool.len().await, 1);

        // A subsequent valid edit still reloads
        let fixed = serde_json::to_vec_pretty(&document(&["a", "b", "c"])).unwrap();
        tokio::fs::write(fx.store.path(), &fixed).await.unwrap();
        assert!(wait_for_generation(&fx.pool, 1).await);
        assert_eq!(fx.pool.len().await, 3);

        fx.shutdown.cancel();
        let _ = fx.handle.await;
    }

    #[tokio::test]
    async fn unrelated_files_are_ignored() {
        let fx = fixture(&["a"]).await;

        tokio::fs::write(fx._dir.path().join("notes.txt"), b"unrelated")
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fx.pool.generation().await, 0);

        fx.shutdown.cancel();
        let _ = fx.handle.await;
    }

    #[tokio::test]
    async fn shutdown_stops_the_task() {
        let fx = fixture(&["a"]).await;
        fx.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), fx.handle)
            .await
            .expect("watcher should stop on cancellation")
            .unwrap();
    }
}
