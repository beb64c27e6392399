use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

use crate::agent_lifecycle::{
    AgentRuntime, FixSummary, LoggingFailureFixer, LoggingStepExecutor, RunSummary,
};
use crate::config::FleetConfig;
use crate::registry::{AgentIdentity, Layer};
use crate::shutdown::ShutdownCoordinator;

pub struct AgentCommand {
    pub name: String,
    pub layer: Option<Layer>,
    pub repeat: Option<Duration>,
    pub fix: bool,
}

impl AgentCommand {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            layer: None,
            repeat: None,
            fix: false,
        }
    }

    pub fn with_layer(mut self, layer: Option<Layer>) -> Self {
        self.layer = layer;
        self
    }

    pub fn with_repeat(mut self, repeat: Option<Duration>) -> Self {
        self.repeat = repeat;
        self
    }

    /// Run the dry-run fix cycle after each workflow run
    pub fn with_fix(mut self, fix: bool) -> Self {
        self.fix = fix;
        self
    }

    pub fn identity(&self) -> Result<AgentIdentity> {
        let identity = match self.layer {
            Some(layer) => AgentIdentity::with_layer(&self.name, layer)?,
            None => AgentIdentity::parse(&self.name)?,
        };
        Ok(identity)
    }

    pub async fn execute(&self, config: &FleetConfig, shutdown: &ShutdownCoordinator) -> Result<()> {
        let identity = self.identity()?;
        println!("🤖 Starting agent {} (pid {})", identity, std::process::id());

        let mut runtime = AgentRuntime::from_config(identity, config, Arc::new(LoggingStepExecutor))
            .with_cancellation(shutdown.token());
        runtime
            .initialize()
            .await
            .with_context(|| format!("Agent {} failed to start", self.name))?;

        let workflows = runtime.workflows().len();
        match runtime.state().port {
            Some(port) => println!("✅ Registered with {workflows} workflows, port {port}"),
            None => println!("✅ Registered with {workflows} workflows"),
        }

        let outcome = self.run(&mut runtime, shutdown).await;
        let stopped = runtime.shutdown().await;

        outcome?;
        stopped.context("Agent did not shut down cleanly")?;
        println!("💤 Agent {} is idle", self.name);
        Ok(())
    }

    async fn run(&self, runtime: &mut AgentRuntime, shutdown: &ShutdownCoordinator) -> Result<()> {
        loop {
            let summary = runtime.run_all_workflows().await?;
            print_summary(&summary);
            if self.fix && !summary.interrupted {
                let fixes = runtime.run_fix_cycle(&LoggingFailureFixer).await?;
                print_fix_summary(&fixes);
            }

            let Some(period) = self.repeat else {
                return Ok(());
            };
            if summary.interrupted {
                return Ok(());
            }

            println!("⏳ Next run in {}s (ctrl-c to stop)", period.as_secs());
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                _ = shutdown.wait_for_shutdown() => return Ok(()),
            }
        }
    }
}

fn print_summary(summary: &RunSummary) {
    println!(
        "📋 {} workflows run: {} passed, {} failed",
        summary.executed, summary.passed, summary.failed
    );
    if summary.interrupted {
        println!("🛑 Interrupted; remaining workflows skipped");
    }
}

fn print_fix_summary(summary: &FixSummary) {
    println!(
        "🔧 {} failures claimed: {} fixed, {} rolled back, {} left for triage",
        summary.attempted, summary.fixed, summary.rolled_back, summary.unresolved
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failures::{FailureOrigin, FailureQueue, FailureRecord, ResolutionState, Severity};
    use crate::registry::AgentRegistry;
    use crate::registry::AgentStatus;
    use crate::store::CoordinationStore;
    use tempfile::TempDir;

    #[test]
    fn test_identity_honours_layer_override() {
        let derived = AgentCommand::new("api-core-agent").identity().unwrap();
        assert_eq!(derived.layer, Layer::Api);
        assert_eq!(derived.name, "api-core");

        assert!(AgentCommand::new("pricing-bot").identity().is_err());
        let explicit = AgentCommand::new("pricing-bot")
            .with_layer(Some(Layer::Integration))
            .identity()
            .unwrap();
        assert_eq!(explicit.layer, Layer::Integration);
    }

    #[tokio::test]
    async fn test_execute_runs_and_leaves_agent_idle() {
        let dir = TempDir::new().unwrap();
        let workflows = dir.path().join("workflows");
        std::fs::create_dir_all(&workflows).unwrap();
        std::fs::write(
            workflows.join("api.json"),
            r#"{"id": "wf-health", "assigned_agent": "api-core",
                "steps": [{"kind": "api", "payload": {"get": "/health"}}]}"#,
        )
        .unwrap();

        let mut config = FleetConfig::default();
        config.store.root = dir.path().join("coordination");
        config.workflows.dir = workflows;

        AgentCommand::new("api-core")
            .execute(&config, &ShutdownCoordinator::new())
            .await
            .unwrap();

        let registry = AgentRegistry::new(CoordinationStore::from_config(&config.store));
        let record = registry
            .find(&AgentIdentity::parse("api-core").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, AgentStatus::Idle);
        assert_eq!(record.counters.tested, 1);
    }

    #[tokio::test]
    async fn test_fix_flag_settles_claimed_failures() {
        let dir = TempDir::new().unwrap();
        let mut config = FleetConfig::default();
        config.store.root = dir.path().join("coordination");
        config.workflows.dir = dir.path().join("workflows");

        let queue = FailureQueue::new(CoordinationStore::from_config(&config.store));
        queue
            .report(
                FailureRecord::new(
                    FailureOrigin {
                        agent: "api-checkout".to_string(),
                        workflow_id: "wf-rates".to_string(),
                        layer: Layer::Api,
                    },
                    Severity::Medium,
                    "rates endpoint returned 502",
                    vec!["[api] {\"get\":\"/rates\"}".to_string()],
                )
                .with_id("F-rates"),
            )
            .await
            .unwrap();

        AgentCommand::new("api-core")
            .with_fix(true)
            .execute(&config, &ShutdownCoordinator::new())
            .await
            .unwrap();

        let failures = queue.list(Layer::Api).await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].claimed_by.as_deref(), Some("api-core"));
        assert_eq!(failures[0].resolution, ResolutionState::Abandoned);
    }
}
