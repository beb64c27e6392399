use anyhow::Result;
use serde::Serialize;

use crate::audit::MergeLogEntry;
use crate::config::FleetConfig;
use crate::dashboard::{AgentView, DashboardService, FailureQueueView, FleetSummary};
use crate::registry::AgentStatus;

pub struct StatusCommand {
    pub json: bool,
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub summary: FleetSummary,
    pub agents: Vec<AgentView>,
    pub failures: FailureQueueView,
    pub merges: Vec<MergeLogEntry>,
}

impl StatusCommand {
    pub fn new() -> Self {
        Self { json: false }
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    pub async fn gather(&self, config: &FleetConfig) -> Result<StatusReport> {
        let dashboard = DashboardService::from_config(config);
        Ok(StatusReport {
            summary: dashboard.fleet_summary().await?,
            agents: dashboard.agent_statuses().await?,
            failures: dashboard.failure_queue().await?,
            merges: dashboard.recent_merges(config.dashboard.recent_merges).await?,
        })
    }

    pub async fn execute(&self, config: &FleetConfig) -> Result<()> {
        let report = self.gather(config).await?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
            return Ok(());
        }

        println!("🤖 AGENT FLEET STATUS");
        println!("=====================");
        println!();
        print!("{}", report.summary.format_status());
        println!();

        println!("📊 AGENTS:");
        println!("──────────");
        if report.agents.is_empty() {
            println!("   No agents registered in {}", config.store.root.display());
        }
        for agent in &report.agents {
            let record = &agent.record;
            println!(
                "{} {:<20} {:<12} {:<12} heartbeat {}s ago  task: {}",
                status_icon(agent.effective_status),
                record.name,
                record.layer.to_string(),
                agent.effective_status.to_string(),
                agent.heartbeat_age_secs,
                record.current_task.as_deref().unwrap_or("-")
            );
        }
        println!();

        println!("🐛 FAILURE QUEUE:");
        println!("─────────────────");
        if report.failures.failures.is_empty() {
            println!("   Queue is empty");
        }
        for failure in &report.failures.failures {
            let claim = match &failure.claimed_by {
                Some(agent) => format!("claimed by {agent}"),
                None => "unclaimed".to_string(),
            };
            println!(
                "   [{}] {} {} ({}/{}) - {}, {:?}",
                failure.severity,
                failure.failure_id,
                failure.root_cause,
                failure.origin.layer,
                failure.origin.workflow_id,
                claim,
                failure.resolution
            );
        }
        println!();

        println!("🔀 RECENT MERGES:");
        println!("─────────────────");
        if report.merges.is_empty() {
            println!("   None recorded");
        }
        for merge in &report.merges {
            let marker = if merge.rollback { "↩️ " } else { "✅" };
            println!(
                "   {} {} by {} at {}{}",
                marker,
                merge.commit_id,
                merge.agent,
                merge.recorded_at.format("%Y-%m-%d %H:%M:%S"),
                merge
                    .rollback_reason
                    .as_ref()
                    .map(|reason| format!(" ({reason})"))
                    .unwrap_or_default()
            );
        }
        Ok(())
    }
}

impl Default for StatusCommand {
    fn default() -> Self {
        Self::new()
    }
}

fn status_icon(status: AgentStatus) -> &'static str {
    match status {
        AgentStatus::Initializing => "🟡",
        AgentStatus::Active => "🟢",
        AgentStatus::Testing => "🧪",
        AgentStatus::Fixing => "🔧",
        AgentStatus::Idle => "💤",
        AgentStatus::Crashed => "🔴",
    }
}
