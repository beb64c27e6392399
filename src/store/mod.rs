//! Coordination Store
//!
//! A directory of JSON records shared by every agent process. Writers go through
//! the lock manager and replace records with a tmp-file + rename, so readers
//! that skip the lock still observe either the previous or the next complete
//! record, never a torn one.

pub mod lock;

pub use lock::{LockHandle, LockManager, LockSettings};

use serde::{de::DeserializeOwned, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

use crate::config::StoreConfig;
use crate::registry::Layer;

/// Errors raised by the coordination store and its lock manager
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed record {record}: {source}")]
    Serialization {
        record: RecordKey,
        #[source]
        source: serde_json::Error,
    },

    #[error("Timed out after {waited:?} waiting for lock on {record} (contention or crashed holder)")]
    LockTimeout { record: RecordKey, waited: Duration },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, StoreError::LockTimeout { .. })
    }
}

/// Identifies one record in the store
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecordKey {
    /// Agent status list for one layer (owner-only writers)
    Status(Layer),
    /// Failure queue for one layer (append + single claim)
    Failures(Layer),
    /// Merge/audit log (append-only)
    MergeLog,
    /// Agent name -> leased port
    PortLeases,
}

impl RecordKey {
    pub fn file_name(&self) -> String {
        format!("{self}.json")
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKey::Status(layer) => write!(f, "status-{layer}"),
            RecordKey::Failures(layer) => write!(f, "failures-{layer}"),
            RecordKey::MergeLog => write!(f, "merge-log"),
            RecordKey::PortLeases => write!(f, "port-leases"),
        }
    }
}

/// Handle to the shared record directory
#[derive(Debug, Clone)]
pub struct CoordinationStore {
    root: PathBuf,
    locks: LockManager,
}

impl CoordinationStore {
    pub fn new(root: impl Into<PathBuf>, settings: LockSettings) -> Self {
        let root = root.into();
        let locks = LockManager::new(root.clone(), settings);
        Self { root, locks }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(&config.root, LockSettings::from(config))
    }

    /// Tag lock markers written through this store with an agent name
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.locks = self.locks.with_holder(holder);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn record_path(&self, key: &RecordKey) -> PathBuf {
        self.root.join(key.file_name())
    }

    /// Point-in-time snapshot of a record without taking its lock.
    ///
    /// A missing or empty file resolves to the record type's seed value.
    pub async fn read<T>(&self, key: &RecordKey) -> Result<T, StoreError>
    where
        T: DeserializeOwned + Default,
    {
        let path = self.record_path(key);
        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
            Err(e) => return Err(StoreError::io(path, e)),
        };

        if contents.trim().is_empty() {
            return Ok(T::default());
        }

        serde_json::from_str(&contents).map_err(|source| StoreError::Serialization {
            record: key.clone(),
            source,
        })
    }

    async fn write<T>(&self, key: &RecordKey, value: &T) -> Result<(), StoreError>
    where
        T: Serialize,
    {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| StoreError::io(&self.root, e))?;

        let path = self.record_path(key);
        let serialized =
            serde_json::to_string_pretty(value).map_err(|source| StoreError::Serialization {
                record: key.clone(),
                source,
            })?;

        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", key.file_name(), uuid::Uuid::new_v4()));
        fs::write(&temp_path, serialized)
            .await
            .map_err(|e| StoreError::io(&temp_path, e))?;
        if let Err(e) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::io(path, e));
        }

        debug!(record = %key, "Record written");
        Ok(())
    }

    /// Read-modify-write inside the record's lock.
    ///
    /// `apply` receives the current state (or the seed value) and may mutate it.
    /// The state is written back only when `apply` returns `Ok`; the lock is
    /// released on every path.
    pub async fn transact<T, R, E, F>(&self, key: &RecordKey, apply: F) -> Result<R, E>
    where
        T: Serialize + DeserializeOwned + Default,
        E: From<StoreError>,
        F: FnOnce(&mut T) -> Result<R, E>,
    {
        let handle = self.locks.acquire(key, self.locks.settings().timeout).await?;
        let outcome = self.apply_locked(key, apply).await;

        if let Err(e) = self.locks.release(handle).await {
            warn!(record = %key, error = %e, "Failed to release lock marker");
        }

        outcome
    }

    async fn apply_locked<T, R, E, F>(&self, key: &RecordKey, apply: F) -> Result<R, E>
    where
        T: Serialize + DeserializeOwned + Default,
        E: From<StoreError>,
        F: FnOnce(&mut T) -> Result<R, E>,
    {
        let mut state: T = self.read(key).await?;
        let result = apply(&mut state)?;
        self.write(key, &state).await?;
        Ok(result)
    }

    /// Replace a record with `update(current)` and return the new state.
    pub async fn atomic_update<T, F>(&self, key: &RecordKey, update: F) -> Result<T, StoreError>
    where
        T: Serialize + DeserializeOwned + Default + Clone,
        F: FnOnce(T) -> T,
    {
        self.transact(key, |state: &mut T| {
            *state = update(std::mem::take(state));
            Ok::<T, StoreError>(state.clone())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn test_store(dir: &TempDir) -> CoordinationStore {
        CoordinationStore::new(
            dir.path().join("coordination"),
            LockSettings {
                timeout: Duration::from_millis(500),
                poll_interval: Duration::from_millis(5),
                stale_after: Duration::from_secs(30),
            },
        )
    }

    #[test]
    fn test_record_file_names() {
        assert_eq!(RecordKey::Status(Layer::Ui).file_name(), "status-ui.json");
        assert_eq!(
            RecordKey::Failures(Layer::Integration).file_name(),
            "failures-integration.json"
        );
        assert_eq!(RecordKey::MergeLog.file_name(), "merge-log.json");
        assert_eq!(RecordKey::PortLeases.file_name(), "port-leases.json");
    }

    #[tokio::test]
    async fn test_missing_record_reads_as_seed_value() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        let queue: Vec<String> = store.read(&RecordKey::MergeLog).await.unwrap();
        assert!(queue.is_empty());

        let leases: BTreeMap<String, u16> = store.read(&RecordKey::PortLeases).await.unwrap();
        assert!(leases.is_empty());
    }

    #[tokio::test]
    async fn test_atomic_update_persists_new_state() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        let state = store
            .atomic_update(&RecordKey::MergeLog, |mut entries: Vec<String>| {
                entries.push("first".to_string());
                entries
            })
            .await
            .unwrap();
        assert_eq!(state, vec!["first".to_string()]);

        let state = store
            .atomic_update(&RecordKey::MergeLog, |mut entries: Vec<String>| {
                entries.push("second".to_string());
                entries
            })
            .await
            .unwrap();
        assert_eq!(state, vec!["first".to_string(), "second".to_string()]);

        let persisted: Vec<String> = store.read(&RecordKey::MergeLog).await.unwrap();
        assert_eq!(persisted, state);
        assert!(!store.locks().marker_path(&RecordKey::MergeLog).exists());
    }

    #[tokio::test]
    async fn test_failed_transaction_leaves_record_untouched() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        store
            .atomic_update(&RecordKey::PortLeases, |mut leases: BTreeMap<String, u16>| {
                leases.insert("ui-core".to_string(), 9222);
                leases
            })
            .await
            .unwrap();

        #[derive(Debug)]
        enum Rejected {
            Store(StoreError),
            Refused,
        }
        impl From<StoreError> for Rejected {
            fn from(e: StoreError) -> Self {
                Rejected::Store(e)
            }
        }

        let result = store
            .transact(&RecordKey::PortLeases, |leases: &mut BTreeMap<String, u16>| {
                leases.clear();
                Err::<(), _>(Rejected::Refused)
            })
            .await;
        assert!(matches!(result, Err(Rejected::Refused)));

        let leases: BTreeMap<String, u16> = store.read(&RecordKey::PortLeases).await.unwrap();
        assert_eq!(leases.get("ui-core"), Some(&9222));
        assert!(!store.locks().marker_path(&RecordKey::PortLeases).exists());
    }

    #[tokio::test]
    async fn test_malformed_record_is_reported() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        std::fs::create_dir_all(store.root()).unwrap();
        std::fs::write(store.record_path(&RecordKey::MergeLog), "{not json").unwrap();

        let result: Result<Vec<String>, _> = store.read(&RecordKey::MergeLog).await;
        assert!(matches!(result, Err(StoreError::Serialization { .. })));
    }
}
