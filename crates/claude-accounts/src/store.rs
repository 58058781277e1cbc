//! On-disk credentials store
//!
//! Reads and writes the credentials document. All writes are atomic
//! (temp file in the same directory, fsync, rename over the target) with
//! 0600 permissions since the file contains OAuth tokens. The file is
//! never held open between operations.
//!
//! Every successful write records a SHA-256 content hash as a short-lived
//! marker. The file watcher consults `is_recent_self_write` to drop change
//! events caused by the refresh scheduler persisting rotated tokens —
//! without it, every refresh would trigger a spurious reload.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::document::AccountsDocument;
use crate::error::{Error, Result};

/// How long a self-write marker stays valid. Anything older is treated as a
/// foreign edit — operators win ties.
const SELF_WRITE_TTL: Duration = Duration::from_secs(10);

struct WriteMarker {
    digest: [u8; 32],
    at: Instant,
}

/// Credentials document manager bound to one path.
pub struct CredentialsStore {
    path: PathBuf,
    last_self_write: Mutex<Option<WriteMarker>>,
}

impl CredentialsStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            last_self_write: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the document exists on disk.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Read, parse, and validate the document.
    ///
    /// Any failure leaves the caller's current state untouched — a corrupt
    /// document must never disturb a running pool.
    pub async fn load(&self) -> Result<AccountsDocument> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|e| Error::Io(format!("reading {}: {e}", self.path.display())))?;
        let document = Self::parse(&bytes)?;
        info!(
            path = %self.path.display(),
            accounts = document.accounts.len(),
            "loaded credentials document"
        );
        Ok(document)
    }

    /// Parse and validate raw document bytes.
    pub fn parse(bytes: &[u8]) -> Result<AccountsDocument> {
        let document: AccountsDocument = serde_json::from_slice(bytes)
            .map_err(|e| Error::DocumentInvalid(format!("parse error: {e}")))?;
        document.validate()?;
        Ok(document)
    }

    /// Persist the document atomically and record the self-write marker.
    pub async fn save(&self, document: &AccountsDocument) -> Result<()> {
        let json = serde_json::to_vec_pretty(document)
            .map_err(|e| Error::DocumentInvalid(format!("serialize error: {e}")))?;

        write_atomic(&self.path, &json).await?;

        let mut marker = self.last_self_write.lock().await;
        *marker = Some(WriteMarker {
            digest: content_digest(&json),
            at: Instant::now(),
        });

        debug!(
            path = %self.path.display(),
            accounts = document.accounts.len(),
            "persisted credentials document"
        );
        Ok(())
    }

    /// Whether `content` matches a write this process made recently.
    ///
    /// Only an exact content match within the TTL is suppressed; any other
    /// change — including an operator edit racing one of our writes — is
    /// treated as foreign and reloaded.
    pub async fn is_recent_self_write(&self, content: &[u8]) -> bool {
        let marker = self.last_self_write.lock().await;
        match &*marker {
            Some(m) => m.at.elapsed() <= SELF_WRITE_TTL && m.digest == content_digest(content),
            None => false,
        }
    }
}

fn content_digest(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

/// Write bytes to a file atomically.
///
/// Writes to a temporary sibling file, sets 0600 permissions, fsyncs, then
/// renames over the target so a crash mid-write cannot leave a corrupt or
/// partially-flushed document.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("credentials path has no parent directory".into()))?;

    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| Error::Io(format!("creating {}: {e}", dir.display())))?;

    let tmp_path = dir.join(format!(".accounts.tmp.{}", std::process::id()));

    let mut file = tokio::fs::File::create(&tmp_path)
        .await
        .map_err(|e| Error::Io(format!("creating temp credentials file: {e}")))?;
    file.write_all(bytes)
        .await
        .map_err(|e| Error::Io(format!("writing temp credentials file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        file.set_permissions(perms)
            .await
            .map_err(|e| Error::Io(format!("setting credentials file permissions: {e}")))?;
    }

    file.sync_all()
        .await
        .map_err(|e| Error::Io(format!("syncing temp credentials file: {e}")))?;
    drop(file);

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp credentials file: {e}")))?;

    Ok(())
}
