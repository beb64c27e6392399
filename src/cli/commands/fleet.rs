use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::config::FleetConfig;
use crate::shutdown::ShutdownCoordinator;

/// Grace period for children to go idle after a shutdown signal
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

pub struct FleetCommand {
    pub agents: Vec<String>,
    pub config_path: Option<PathBuf>,
}

impl FleetCommand {
    pub fn new(agents: Vec<String>, config_path: Option<PathBuf>) -> Self {
        Self {
            agents,
            config_path,
        }
    }

    /// Agents to launch: the explicit list, else the configured one
    pub fn roster(&self, config: &FleetConfig) -> Vec<String> {
        if self.agents.is_empty() {
            config.fleet.agents.clone()
        } else {
            self.agents.clone()
        }
    }

    pub async fn execute(&self, config: &FleetConfig, shutdown: &ShutdownCoordinator) -> Result<()> {
        let roster = self.roster(config);
        if roster.is_empty() {
            bail!("No agents configured; set [fleet] agents or pass --agents");
        }

        let exe = std::env::current_exe().context("Cannot locate the agent-fleet executable")?;
        let stagger = config.fleet.stagger();
        println!("🚢 Launching {} agents ({}ms apart)", roster.len(), stagger.as_millis());

        let children = self.launch(&exe, &roster, stagger, shutdown).await?;

        let mut failed = Vec::new();
        for (name, mut child) in children {
            match reap(&name, &mut child, shutdown).await {
                Ok(status) if status.success() => println!("  ✅ {name} exited cleanly"),
                Ok(status) => {
                    println!("  ❌ {name} exited with {status}");
                    failed.push(name);
                }
                Err(e) => {
                    warn!(agent = %name, error = %e, "Lost track of agent process");
                    println!("  ❌ {name}: {e}");
                    failed.push(name);
                }
            }
        }

        if !failed.is_empty() {
            bail!("{} agent(s) failed: {}", failed.len(), failed.join(", "));
        }
        Ok(())
    }

    /// Spawn one child per agent. If any spawn fails, the agents already
    /// started are killed and reaped before the error is returned.
    async fn launch(
        &self,
        exe: &Path,
        roster: &[String],
        stagger: Duration,
        shutdown: &ShutdownCoordinator,
    ) -> Result<Vec<(String, Child)>> {
        let mut children: Vec<(String, Child)> = Vec::with_capacity(roster.len());
        for (index, name) in roster.iter().enumerate() {
            if index > 0 {
                tokio::select! {
                    _ = tokio::time::sleep(stagger) => {}
                    _ = shutdown.wait_for_shutdown() => break,
                }
            }

            let mut command = Command::new(exe);
            if let Some(path) = &self.config_path {
                command.arg("--config").arg(path);
            }
            command
                .arg("agent")
                .arg(name)
                .stdin(Stdio::null())
                .kill_on_drop(true);

            let child = match command.spawn() {
                Ok(child) => child,
                Err(e) => {
                    abort_launch(&mut children).await;
                    return Err(e).with_context(|| format!("Failed to spawn agent {name}"));
                }
            };
            info!(agent = %name, pid = child.id(), "Agent process spawned");
            println!("  🚀 {name} (pid {})", child.id().unwrap_or_default());
            children.push((name.clone(), child));
        }
        Ok(children)
    }
}

/// Wait for one agent. After a shutdown signal it gets [`SHUTDOWN_GRACE`] to
/// go idle before it is killed.
async fn reap(
    name: &str,
    child: &mut Child,
    shutdown: &ShutdownCoordinator,
) -> std::io::Result<ExitStatus> {
    tokio::select! {
        status = child.wait() => return status,
        _ = shutdown.wait_for_shutdown() => {}
    }

    match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!(agent = %name, "Agent did not stop within the grace period; killing");
            child.kill().await?;
            child.wait().await
        }
    }
}

async fn abort_launch(children: &mut [(String, Child)]) {
    for (name, child) in children.iter_mut() {
        warn!(agent = %name, "Stopping agent after a failed fleet launch");
        if let Err(e) = child.kill().await {
            warn!(agent = %name, error = %e, "Failed to stop agent process");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roster_prefers_explicit_agents() {
        let config = FleetConfig::default();
        assert_eq!(
            FleetCommand::new(vec![], None).roster(&config),
            vec!["ui-core", "api-core", "integration-core"]
        );
        assert_eq!(
            FleetCommand::new(vec!["api-core".to_string()], None).roster(&config),
            vec!["api-core"]
        );
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let shutdown = ShutdownCoordinator::new();
        let roster = vec!["ui-core".to_string()];

        let launched = FleetCommand::new(vec![], None)
            .launch(
                Path::new("/nonexistent/agent-fleet"),
                &roster,
                Duration::ZERO,
                &shutdown,
            )
            .await;

        let err = launched.err().unwrap();
        assert!(err.to_string().contains("Failed to spawn agent ui-core"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_aborted_launch_leaves_no_running_agents() {
        let mut children: Vec<(String, Child)> = ["ui-core", "api-core"]
            .into_iter()
            .map(|name| {
                let child = Command::new("sleep")
                    .arg("30")
                    .kill_on_drop(true)
                    .spawn()
                    .unwrap();
                (name.to_string(), child)
            })
            .collect();

        abort_launch(&mut children).await;

        for (_, child) in children.iter_mut() {
            assert!(child.try_wait().unwrap().is_some());
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reap_after_shutdown_waits_for_exit() {
        let shutdown = ShutdownCoordinator::new();
        shutdown.trigger();
        let mut child = Command::new("true").kill_on_drop(true).spawn().unwrap();

        let status = reap("ui-core", &mut child, &shutdown).await.unwrap();
        assert!(status.success());
    }
}
