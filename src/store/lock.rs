//! Lock Manager - per-record advisory locks backed by marker files
//!
//! A lock is held while `{record}.json.lock` exists. Acquisition creates the
//! marker with `create_new`, polling at a short interval until the bound
//! elapses. Markers older than `stale_after` are treated as abandoned by a
//! crashed holder and force-cleared.
//!
//! Markers are only removed while holding an `fd-lock` on the companion
//! `{record}.json.lock.guard` file. Creation needs no guard: `create_new`
//! succeeds only on an empty path.

use chrono::{DateTime, Utc};
use fd_lock::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::{RecordKey, StoreError};
use crate::config::StoreConfig;

/// Timing policy for lock acquisition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockSettings {
    /// Upper bound on how long `acquire` waits before failing
    pub timeout: Duration,
    /// Delay between attempts to create the marker
    pub poll_interval: Duration,
    /// Marker age after which the holder is presumed dead
    pub stale_after: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(50),
            stale_after: Duration::from_secs(30),
        }
    }
}

impl From<&StoreConfig> for LockSettings {
    fn from(config: &StoreConfig) -> Self {
        Self {
            timeout: config.lock_timeout(),
            poll_interval: config.lock_poll_interval(),
            stale_after: config.stale_lock_after(),
        }
    }
}

/// Contents of a lock marker, kept for diagnostics and safe release
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockMarker {
    token: String,
    holder: String,
    pid: u32,
    hostname: String,
    acquired_at: DateTime<Utc>,
}

/// Proof of a held lock. Release it through [`LockManager::release`];
/// dropping an unreleased handle removes the marker best-effort.
#[derive(Debug)]
pub struct LockHandle {
    record: RecordKey,
    path: PathBuf,
    token: String,
    acquired: Instant,
    released: bool,
}

impl LockHandle {
    pub fn record(&self) -> &RecordKey {
        &self.record
    }

    pub fn held_for(&self) -> Duration {
        self.acquired.elapsed()
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let _ = with_reclaim_guard(&self.path, || remove_if_owned(&self.path, &self.token));
    }
}

/// Companion file whose `fd-lock` serializes every removal of a marker.
/// The OS drops the lock with its holder, so this guard never goes stale.
fn guard_path(marker: &Path) -> PathBuf {
    marker.with_extension("lock.guard")
}

/// Run `f` while holding the record's reclaim guard. Markers are only ever
/// removed inside `f`, so whatever `f` observes about the marker still holds
/// when it removes it.
fn with_reclaim_guard<R>(
    marker: &Path,
    f: impl FnOnce() -> std::io::Result<R>,
) -> std::io::Result<R> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(guard_path(marker))?;
    let mut lock = RwLock::new(file);
    let _guard = lock.write()?;
    f()
}

/// A marker whose contents could not be written is removed at once instead
/// of lingering until it goes stale. Nobody else deletes a fresh marker.
async fn discard_unwritten_marker(
    path: &Path,
    written: std::io::Result<()>,
) -> std::io::Result<()> {
    if let Err(e) = written {
        if let Err(cleanup) = fs::remove_file(path).await {
            warn!(path = %path.display(), error = %cleanup, "Failed to remove half-written lock marker");
        }
        return Err(e);
    }
    Ok(())
}

async fn guarded<R, F>(marker: &Path, f: F) -> Result<R, StoreError>
where
    R: Send + 'static,
    F: FnOnce(&Path) -> std::io::Result<R> + Send + 'static,
{
    let path = marker.to_path_buf();
    let task_path = path.clone();
    tokio::task::spawn_blocking(move || with_reclaim_guard(&task_path, || f(&task_path)))
        .await
        .map_err(|e| StoreError::io(&path, std::io::Error::other(e)))?
        .map_err(|e| StoreError::io(&path, e))
}

/// Delete the marker if it still carries `token`. Call under the guard.
fn remove_if_owned(path: &Path, token: &str) -> std::io::Result<bool> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    let owned = serde_json::from_str::<LockMarker>(&contents)
        .map(|marker| marker.token == token)
        .unwrap_or(false);
    if !owned {
        return Ok(false);
    }
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[derive(Debug)]
enum Reclaim {
    /// No marker left; retry at once
    Vanished,
    /// Marker is fresh; keep waiting
    Live,
    Cleared {
        age: Duration,
        previous: Option<LockMarker>,
    },
}

/// Remove the marker if it is older than `stale_after`. Call under the guard.
fn reclaim_if_stale(path: &Path, stale_after: Duration) -> std::io::Result<Reclaim> {
    let modified = match std::fs::metadata(path) {
        Ok(metadata) => metadata.modified()?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Reclaim::Vanished),
        Err(e) => return Err(e),
    };
    let age = SystemTime::now()
        .duration_since(modified)
        .unwrap_or_default();
    if age <= stale_after {
        return Ok(Reclaim::Live);
    }

    let previous = std::fs::read_to_string(path)
        .ok()
        .and_then(|contents| serde_json::from_str::<LockMarker>(&contents).ok());
    match std::fs::remove_file(path) {
        Ok(()) => Ok(Reclaim::Cleared { age, previous }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Reclaim::Vanished),
        Err(e) => Err(e),
    }
}

#[derive(Debug, Clone)]
pub struct LockManager {
    root: PathBuf,
    settings: LockSettings,
    holder: String,
}

impl LockManager {
    pub fn new(root: impl Into<PathBuf>, settings: LockSettings) -> Self {
        Self {
            root: root.into(),
            settings,
            holder: format!("pid-{}", std::process::id()),
        }
    }

    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    pub fn settings(&self) -> &LockSettings {
        &self.settings
    }

    pub fn marker_path(&self, record: &RecordKey) -> PathBuf {
        self.root.join(format!("{}.lock", record.file_name()))
    }

    /// Acquire the lock for `record`, waiting at most `timeout`.
    ///
    /// Fails with [`StoreError::LockTimeout`] once the bound elapses; callers
    /// surface that instead of retrying forever.
    pub async fn acquire(
        &self,
        record: &RecordKey,
        timeout: Duration,
    ) -> Result<LockHandle, StoreError> {
        let path = self.marker_path(record);
        let started = Instant::now();
        let token = uuid::Uuid::new_v4().to_string();

        loop {
            match self.try_create_marker(&path, &token).await {
                Ok(()) => {
                    debug!(record = %record, holder = %self.holder, "Lock acquired");
                    return Ok(LockHandle {
                        record: record.clone(),
                        path,
                        token,
                        acquired: Instant::now(),
                        released: false,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if self.clear_if_stale(record, &path).await? {
                        continue;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    fs::create_dir_all(&self.root)
                        .await
                        .map_err(|e| StoreError::io(&self.root, e))?;
                    continue;
                }
                Err(e) => return Err(StoreError::io(path, e)),
            }

            let waited = started.elapsed();
            if waited >= timeout {
                warn!(
                    record = %record,
                    holder = %self.holder,
                    waited_ms = waited.as_millis() as u64,
                    "Lock acquisition timed out"
                );
                return Err(StoreError::LockTimeout {
                    record: record.clone(),
                    waited,
                });
            }

            tokio::time::sleep(self.next_poll_delay()).await;
        }
    }

    /// Release a held lock. A marker that no longer carries this handle's
    /// token belongs to someone else and is left in place.
    pub async fn release(&self, mut handle: LockHandle) -> Result<(), StoreError> {
        handle.released = true;

        let token = handle.token.clone();
        let removed = guarded(&handle.path, move |path| remove_if_owned(path, &token)).await?;
        if removed {
            debug!(
                record = %handle.record,
                held_ms = handle.held_for().as_millis() as u64,
                "Lock released"
            );
        } else {
            warn!(
                record = %handle.record,
                holder = %self.holder,
                "Lock marker was cleared by another process while held"
            );
        }
        Ok(())
    }

    fn next_poll_delay(&self) -> Duration {
        let base = self.settings.poll_interval.as_millis() as u64;
        let jitter = rand::rng().random_range(0..=base / 2);
        Duration::from_millis(base + jitter)
    }

    async fn try_create_marker(&self, path: &Path, token: &str) -> std::io::Result<()> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await?;

        let marker = LockMarker {
            token: token.to_string(),
            holder: self.holder.clone(),
            pid: std::process::id(),
            hostname: hostname::get()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string(),
            acquired_at: Utc::now(),
        };
        let written = match serde_json::to_vec(&marker) {
            Ok(serialized) => match file.write_all(&serialized).await {
                Ok(()) => file.flush().await,
                Err(e) => Err(e),
            },
            Err(e) => Err(std::io::Error::other(e)),
        };
        drop(file);
        discard_unwritten_marker(path, written).await
    }

    /// Returns `true` when the marker is gone (or was removed) and the caller
    /// should retry immediately.
    async fn clear_if_stale(&self, record: &RecordKey, path: &Path) -> Result<bool, StoreError> {
        let stale_after = self.settings.stale_after;
        match guarded(path, move |path| reclaim_if_stale(path, stale_after)).await? {
            Reclaim::Vanished => Ok(true),
            Reclaim::Live => Ok(false),
            Reclaim::Cleared { age, previous } => {
                warn!(
                    record = %record,
                    age_ms = age.as_millis() as u64,
                    previous_holder = ?previous.as_ref().map(|m| m.holder.as_str()),
                    previous_pid = ?previous.as_ref().map(|m| m.pid),
                    "Force-cleared abandoned lock marker"
                );
                Ok(true)
            }
        }
    }
}
