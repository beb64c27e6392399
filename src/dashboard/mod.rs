//! Dashboard / query aggregation
//!
//! Read-only views over the coordination store. Every view is built from
//! independent point-in-time snapshots; nothing here takes a lock or writes.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::audit::{MergeLog, MergeLogEntry};
use crate::config::FleetConfig;
use crate::failures::{FailureQueue, FailureRecord, ResolutionState, Severity};
use crate::registry::{effective_status, AgentCounters, AgentRegistry, AgentStatus, AgentStatusRecord};
use crate::store::{CoordinationStore, StoreError};

/// One agent as an observer sees it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentView {
    #[serde(flatten)]
    pub record: AgentStatusRecord,
    /// Stored status, or `crashed` when the heartbeat is stale
    pub effective_status: AgentStatus,
    pub heartbeat_age_secs: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FailureCounts {
    pub total: usize,
    pub by_severity: BTreeMap<Severity, usize>,
    pub unclaimed: usize,
    pub claimed: usize,
    pub resolved: usize,
}

impl FailureCounts {
    pub fn tally(failures: &[FailureRecord]) -> Self {
        let mut counts = Self {
            total: failures.len(),
            ..Self::default()
        };
        for failure in failures {
            *counts.by_severity.entry(failure.severity).or_default() += 1;
            match (failure.resolution, failure.claimed_by.is_some()) {
                (ResolutionState::Open, false) => counts.unclaimed += 1,
                (ResolutionState::Open, true) => counts.claimed += 1,
                _ => counts.resolved += 1,
            }
        }
        counts
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureQueueView {
    pub failures: Vec<FailureRecord>,
    pub counts: FailureCounts,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FleetSummary {
    pub generated_at: DateTime<Utc>,
    pub agents: usize,
    pub status_counts: BTreeMap<AgentStatus, usize>,
    pub failures: FailureCounts,
    pub totals: AgentCounters,
    pub recent_merges: usize,
    pub rollbacks: usize,
}

impl FleetSummary {
    pub fn format_status(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "Fleet status at {} ({} agents)\n",
            self.generated_at.format("%Y-%m-%d %H:%M:%S UTC"),
            self.agents
        ));

        let statuses: Vec<String> = self
            .status_counts
            .iter()
            .map(|(status, count)| format!("{status}={count}"))
            .collect();
        out.push_str(&format!(
            "  Agents:   {}\n",
            if statuses.is_empty() {
                "none registered".to_string()
            } else {
                statuses.join(" ")
            }
        ));

        out.push_str(&format!(
            "  Failures: {} total, {} unclaimed, {} claimed, {} resolved\n",
            self.failures.total, self.failures.unclaimed, self.failures.claimed, self.failures.resolved
        ));
        for (severity, count) in self.failures.by_severity.iter().rev() {
            out.push_str(&format!("    {severity:<8} {count}\n"));
        }

        out.push_str(&format!(
            "  Work:     {} tested, {} found, {} fixed\n",
            self.totals.tested, self.totals.found, self.totals.fixed
        ));
        out.push_str(&format!(
            "  Merges:   {} recent ({} rolled back)\n",
            self.recent_merges, self.rollbacks
        ));
        out
    }
}

#[derive(Debug, Clone)]
pub struct DashboardService {
    registry: AgentRegistry,
    failures: FailureQueue,
    merge_log: MergeLog,
    liveness_timeout: Duration,
    recent_merges: usize,
}

impl DashboardService {
    pub fn new(store: CoordinationStore, liveness_timeout: Duration, recent_merges: usize) -> Self {
        Self {
            registry: AgentRegistry::new(store.clone()),
            failures: FailureQueue::new(store.clone()),
            merge_log: MergeLog::new(store),
            liveness_timeout,
            recent_merges,
        }
    }

    pub fn from_config(config: &FleetConfig) -> Self {
        Self::new(
            CoordinationStore::from_config(&config.store),
            config.watchdog.liveness_timeout(),
            config.dashboard.recent_merges,
        )
    }

    pub async fn agent_statuses(&self) -> Result<Vec<AgentView>, StoreError> {
        self.agent_statuses_at(Utc::now()).await
    }

    pub async fn agent_statuses_at(&self, now: DateTime<Utc>) -> Result<Vec<AgentView>, StoreError> {
        let records = self.registry.snapshot().await?;
        Ok(records
            .into_iter()
            .map(|record| AgentView {
                effective_status: effective_status(&record, now, self.liveness_timeout),
                heartbeat_age_secs: record.heartbeat_age(now).as_secs(),
                record,
            })
            .collect())
    }

    /// All layers' failures, most severe first, oldest first within a severity
    pub async fn failure_queue(&self) -> Result<FailureQueueView, StoreError> {
        let mut failures = self.failures.list_all().await?;
        failures.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| a.discovered_at.cmp(&b.discovered_at))
        });
        let counts = FailureCounts::tally(&failures);
        Ok(FailureQueueView { failures, counts })
    }

    pub async fn recent_merges(&self, limit: usize) -> Result<Vec<MergeLogEntry>, StoreError> {
        self.merge_log.recent(limit).await
    }

    pub async fn fleet_summary(&self) -> Result<FleetSummary, StoreError> {
        let now = Utc::now();
        let agents = self.agent_statuses_at(now).await?;
        let failures = self.failures.list_all().await?;
        let merges = self.recent_merges(self.recent_merges).await?;

        let mut status_counts = BTreeMap::new();
        let mut totals = AgentCounters::default();
        for agent in &agents {
            *status_counts.entry(agent.effective_status).or_default() += 1;
            totals.tested += agent.record.counters.tested;
            totals.found += agent.record.counters.found;
            totals.fixed += agent.record.counters.fixed;
        }

        Ok(FleetSummary {
            generated_at: now,
            agents: agents.len(),
            status_counts,
            failures: FailureCounts::tally(&failures),
            totals,
            recent_merges: merges.len(),
            rollbacks: merges.iter().filter(|m| m.rollback).count(),
        })
    }
}
