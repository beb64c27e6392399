//! Watchdog
//!
//! Periodic, read-only liveness scan over every registry partition. A
//! non-idle agent whose heartbeat is older than the liveness timeout is
//! reported as suspect. The watchdog never writes a record and never tries to
//! restart anything.

use chrono::{DateTime, Utc};
use fd_lock::{RwLock, RwLockWriteGuard};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::FleetConfig;
use crate::registry::{AgentRegistry, AgentStatus, AgentStatusRecord, Layer};
use crate::store::{CoordinationStore, StoreError};

#[derive(Debug, Error)]
pub enum WatchdogError {
    #[error("Another watchdog is already running (lock held on {path})")]
    AlreadyRunning { path: PathBuf },

    #[error("IO error on watchdog lock {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// An agent whose heartbeat has gone stale
#[derive(Debug, Clone, PartialEq)]
pub struct SuspectAgent {
    pub name: String,
    pub layer: Layer,
    pub pid: u32,
    pub status: AgentStatus,
    pub last_task: Option<String>,
    pub last_heartbeat: DateTime<Utc>,
    pub elapsed: Duration,
}

/// Suspects among `records` at instant `now`: agents whose heartbeat is
/// older than `timeout`.
///
/// Idle agents are never suspects. An agent that shut down gracefully stops
/// heartbeating on purpose, so its age says nothing about liveness.
pub fn scan_records(
    records: &[AgentStatusRecord],
    now: DateTime<Utc>,
    timeout: Duration,
) -> Vec<SuspectAgent> {
    records
        .iter()
        .filter(|record| record.status != AgentStatus::Idle)
        .filter_map(|record| {
            let elapsed = record.heartbeat_age(now);
            (elapsed > timeout).then(|| SuspectAgent {
                name: record.name.clone(),
                layer: record.layer,
                pid: record.pid,
                status: record.status,
                last_task: record.current_task.clone(),
                last_heartbeat: record.last_heartbeat,
                elapsed,
            })
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct Watchdog {
    registry: AgentRegistry,
    interval: Duration,
    timeout: Duration,
}

impl Watchdog {
    pub fn new(store: CoordinationStore, interval: Duration, timeout: Duration) -> Self {
        Self {
            registry: AgentRegistry::new(store),
            interval,
            timeout,
        }
    }

    pub fn from_config(config: &FleetConfig) -> Self {
        Self::new(
            CoordinationStore::from_config(&config.store),
            config.watchdog.interval(),
            config.watchdog.liveness_timeout(),
        )
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn scan(&self) -> Result<Vec<SuspectAgent>, StoreError> {
        self.scan_at(Utc::now()).await
    }

    pub async fn scan_at(&self, now: DateTime<Utc>) -> Result<Vec<SuspectAgent>, StoreError> {
        let records = self.registry.snapshot().await?;
        let suspects = scan_records(&records, now, self.timeout);
        debug!(agents = records.len(), suspects = suspects.len(), "Liveness scan complete");
        Ok(suspects)
    }

    /// Scan every interval until `cancel` fires. Returns the number of scans.
    pub async fn run(&self, cancel: CancellationToken) -> u64 {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            timeout_ms = self.timeout.as_millis() as u64,
            "Watchdog started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut scans = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    scans += 1;
                    match self.scan().await {
                        Ok(suspects) => suspects.iter().for_each(report_suspect),
                        Err(e) => warn!(error = %e, "Liveness scan failed"),
                    }
                }
            }
        }

        info!(scans, "Watchdog stopped");
        scans
    }
}

pub fn report_suspect(suspect: &SuspectAgent) {
    warn!(
        agent = %suspect.name,
        layer = %suspect.layer,
        pid = suspect.pid,
        status = %suspect.status,
        last_task = suspect.last_task.as_deref().unwrap_or("-"),
        elapsed_secs = suspect.elapsed.as_secs(),
        "Agent heartbeat is stale; process may have crashed"
    );
}

/// Process-wide singleton guard for the watchdog
pub struct WatchdogLock {
    path: PathBuf,
    lock: RwLock<File>,
}

impl WatchdogLock {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, WatchdogError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| WatchdogError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| WatchdogError::Io {
                path: path.clone(),
                source,
            })?;
        Ok(Self {
            path,
            lock: RwLock::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hold the guard for as long as the watchdog runs
    pub fn try_guard(&mut self) -> Result<RwLockWriteGuard<'_, File>, WatchdogError> {
        let path = self.path.clone();
        self.lock
            .try_write()
            .map_err(|_| WatchdogError::AlreadyRunning { path })
    }
}
