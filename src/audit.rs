// Append-only merge log: one entry per fix an agent committed or rolled back

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::store::{CoordinationStore, RecordKey, StoreError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeLogEntry {
    pub entry_id: String,
    pub commit_id: String,
    pub agent: String,
    #[serde(default)]
    pub failure_id: Option<String>,
    #[serde(default)]
    pub rollback: bool,
    #[serde(default)]
    pub rollback_reason: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl MergeLogEntry {
    pub fn merged(agent: &str, commit_id: &str, failure_id: Option<&str>) -> Self {
        Self {
            entry_id: uuid::Uuid::new_v4().to_string(),
            commit_id: commit_id.to_string(),
            agent: agent.to_string(),
            failure_id: failure_id.map(str::to_string),
            rollback: false,
            rollback_reason: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn rolled_back(
        agent: &str,
        commit_id: &str,
        failure_id: Option<&str>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            rollback: true,
            rollback_reason: Some(reason.into()),
            ..Self::merged(agent, commit_id, failure_id)
        }
    }
}

#[derive(Debug, Clone)]
pub struct MergeLog {
    store: CoordinationStore,
}

impl MergeLog {
    pub fn new(store: CoordinationStore) -> Self {
        Self { store }
    }

    pub async fn append(&self, entry: MergeLogEntry) -> Result<(), StoreError> {
        let commit_id = entry.commit_id.clone();
        let rollback = entry.rollback;
        let agent = entry.agent.clone();

        self.store
            .transact(&RecordKey::MergeLog, |entries: &mut Vec<MergeLogEntry>| {
                entries.push(entry);
                Ok::<_, StoreError>(())
            })
            .await?;

        info!(commit_id = %commit_id, agent = %agent, rollback, "Merge log entry appended");
        Ok(())
    }

    /// Newest first
    pub async fn recent(&self, limit: usize) -> Result<Vec<MergeLogEntry>, StoreError> {
        let entries = self.all().await?;
        Ok(entries.into_iter().rev().take(limit).collect())
    }

    pub async fn all(&self) -> Result<Vec<MergeLogEntry>, StoreError> {
        self.store.read(&RecordKey::MergeLog).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LockSettings;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_append_and_recent_newest_first() {
        let dir = TempDir::new().unwrap();
        let log = MergeLog::new(CoordinationStore::new(dir.path(), LockSettings::default()));

        log.append(MergeLogEntry::merged("ui-core", "c1", Some("F-1")))
            .await
            .unwrap();
        log.append(MergeLogEntry::rolled_back("api-core", "c2", None, "tests regressed"))
            .await
            .unwrap();
        log.append(MergeLogEntry::merged("api-core", "c3", None))
            .await
            .unwrap();

        let recent = log.recent(2).await.unwrap();
        let commits: Vec<&str> = recent.iter().map(|e| e.commit_id.as_str()).collect();
        assert_eq!(commits, vec!["c3", "c2"]);
        assert!(recent[1].rollback);
        assert_eq!(recent[1].rollback_reason.as_deref(), Some("tests regressed"));

        assert_eq!(log.all().await.unwrap().len(), 3);
        assert_eq!(log.recent(10).await.unwrap().len(), 3);
    }
}
