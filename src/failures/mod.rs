//! Failure Queue
//!
//! One append + single-claim queue per layer. Reporting appends inside the
//! record lock; claiming scans for the first unclaimed record and stamps the
//! claimant in the same locked transaction, so two claimants racing for one
//! record cannot both win.

pub mod classifier;

pub use classifier::{FailureContext, FailureKind, KeywordClassifier, SeverityClassifier};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::info;

use crate::registry::Layer;
use crate::store::{CoordinationStore, RecordKey, StoreError};

#[derive(Debug, Error)]
pub enum FailureQueueError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Failure {failure_id} not found in the {layer} queue")]
    NotFound { layer: Layer, failure_id: String },

    #[error("Failure {failure_id} is claimed by {claimant:?}, not {agent}")]
    NotClaimant {
        failure_id: String,
        claimant: Option<String>,
        agent: String,
    },

    #[error("Failure {failure_id} is already resolved")]
    AlreadyResolved { failure_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::Critical => "CRITICAL",
            Severity::High => "HIGH",
            Severity::Medium => "MEDIUM",
            Severity::Low => "LOW",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionState {
    Open,
    Resolved,
    RolledBack,
    Abandoned,
}

/// Where a failure was discovered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureOrigin {
    pub agent: String,
    pub workflow_id: String,
    pub layer: Layer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub failure_id: String,
    #[serde(flatten)]
    pub origin: FailureOrigin,
    pub severity: Severity,
    pub root_cause: String,
    #[serde(default)]
    pub reproduction_steps: Vec<String>,
    pub discovered_at: DateTime<Utc>,
    #[serde(default)]
    pub claimed_by: Option<String>,
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    pub resolution: ResolutionState,
    #[serde(default)]
    pub resolution_note: Option<String>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl FailureRecord {
    pub fn new(
        origin: FailureOrigin,
        severity: Severity,
        root_cause: impl Into<String>,
        reproduction_steps: Vec<String>,
    ) -> Self {
        Self {
            failure_id: format!("F-{}", uuid::Uuid::new_v4()),
            origin,
            severity,
            root_cause: root_cause.into(),
            reproduction_steps,
            discovered_at: Utc::now(),
            claimed_by: None,
            claimed_at: None,
            resolution: ResolutionState::Open,
            resolution_note: None,
            resolved_at: None,
        }
    }

    pub fn with_id(mut self, failure_id: impl Into<String>) -> Self {
        self.failure_id = failure_id.into();
        self
    }

    pub fn is_claimable(&self) -> bool {
        self.claimed_by.is_none() && self.resolution == ResolutionState::Open
    }
}

#[derive(Debug, Clone)]
pub struct FailureQueue {
    store: CoordinationStore,
}

impl FailureQueue {
    pub fn new(store: CoordinationStore) -> Self {
        Self { store }
    }

    /// Append a failure to its origin layer's queue
    pub async fn report(&self, record: FailureRecord) -> Result<(), StoreError> {
        let layer = record.origin.layer;
        let failure_id = record.failure_id.clone();
        let severity = record.severity;

        self.store
            .transact(&RecordKey::Failures(layer), |queue: &mut Vec<FailureRecord>| {
                queue.push(record);
                Ok::<_, StoreError>(())
            })
            .await?;

        info!(
            failure_id = %failure_id,
            layer = %layer,
            severity = %severity,
            "Failure reported"
        );
        Ok(())
    }

    /// Take ownership of the oldest unclaimed failure in `layer`.
    ///
    /// Returns `None` when nothing is claimable.
    pub async fn claim(
        &self,
        layer: Layer,
        agent: &str,
    ) -> Result<Option<FailureRecord>, StoreError> {
        let now = Utc::now();
        let claimed = self
            .store
            .transact(&RecordKey::Failures(layer), |queue: &mut Vec<FailureRecord>| {
                let claimed = queue.iter_mut().find(|f| f.is_claimable()).map(|f| {
                    f.claimed_by = Some(agent.to_string());
                    f.claimed_at = Some(now);
                    f.clone()
                });
                Ok::<_, StoreError>(claimed)
            })
            .await?;

        if let Some(failure) = &claimed {
            info!(
                failure_id = %failure.failure_id,
                layer = %layer,
                agent = %agent,
                "Failure claimed"
            );
        }
        Ok(claimed)
    }

    /// Close out a claimed failure. Only the claimant may resolve it.
    pub async fn resolve(
        &self,
        layer: Layer,
        failure_id: &str,
        agent: &str,
        resolution: ResolutionState,
        note: Option<String>,
    ) -> Result<FailureRecord, FailureQueueError> {
        let now = Utc::now();
        self.store
            .transact(&RecordKey::Failures(layer), |queue: &mut Vec<FailureRecord>| {
                let failure = queue
                    .iter_mut()
                    .find(|f| f.failure_id == failure_id)
                    .ok_or_else(|| FailureQueueError::NotFound {
                        layer,
                        failure_id: failure_id.to_string(),
                    })?;

                if failure.claimed_by.as_deref() != Some(agent) {
                    return Err(FailureQueueError::NotClaimant {
                        failure_id: failure_id.to_string(),
                        claimant: failure.claimed_by.clone(),
                        agent: agent.to_string(),
                    });
                }
                if failure.resolution != ResolutionState::Open {
                    return Err(FailureQueueError::AlreadyResolved {
                        failure_id: failure_id.to_string(),
                    });
                }

                failure.resolution = resolution;
                failure.resolution_note = note;
                failure.resolved_at = Some(now);
                Ok(failure.clone())
            })
            .await
    }

    pub async fn list(&self, layer: Layer) -> Result<Vec<FailureRecord>, StoreError> {
        self.store.read(&RecordKey::Failures(layer)).await
    }

    pub async fn list_all(&self) -> Result<Vec<FailureRecord>, StoreError> {
        let mut all = Vec::new();
        for layer in Layer::ALL {
            all.extend(self.list(layer).await?);
        }
        Ok(all)
    }
}
