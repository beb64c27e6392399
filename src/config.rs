use anyhow::{bail, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::registry::Layer;

/// Main configuration for an agent fleet sharing one coordination store
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct FleetConfig {
    pub store: StoreConfig,
    pub workflows: WorkflowConfig,
    pub heartbeat: HeartbeatConfig,
    pub watchdog: WatchdogConfig,
    pub ports: PortConfig,
    pub fleet: FleetLaunchConfig,
    pub dashboard: DashboardConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding the shared records
    pub root: PathBuf,
    /// Upper bound on waiting for a record lock
    pub lock_timeout_ms: u64,
    /// Poll period while a lock marker is present
    pub lock_poll_interval_ms: u64,
    /// Markers older than this are treated as abandoned
    pub stale_lock_after_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".agent-fleet/coordination"),
            lock_timeout_ms: 5000,
            lock_poll_interval_ms: 50,
            stale_lock_after_ms: 30_000,
        }
    }
}

impl StoreConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms)
    }

    pub fn stale_lock_after(&self) -> Duration {
        Duration::from_millis(self.stale_lock_after_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Directory of workflow definition files
    pub dir: PathBuf,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".agent-fleet/workflows"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { interval_ms: 10_000 }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Scan period
    pub interval_ms: u64,
    /// Heartbeat age beyond which an agent is reported as suspect
    pub liveness_timeout_ms: u64,
    /// File locked by the running watchdog
    pub lock_file: PathBuf,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval_ms: 15_000,
            liveness_timeout_ms: 30_000, // 3x heartbeat
            lock_file: PathBuf::from(".agent-fleet/watchdog.lock"),
        }
    }
}

impl WatchdogConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PortConfig {
    /// First port of the pool
    pub base: u16,
    pub pool_size: u16,
    /// Agents in these layers lease a port at startup
    pub lease_for_layers: Vec<Layer>,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            base: 9222,
            pool_size: 10,
            lease_for_layers: vec![Layer::Ui],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FleetLaunchConfig {
    /// Agents started by `fleet`
    pub agents: Vec<String>,
    /// Delay between consecutive agent starts
    pub stagger_ms: u64,
}

impl Default for FleetLaunchConfig {
    fn default() -> Self {
        Self {
            agents: vec![
                "ui-core".to_string(),
                "api-core".to_string(),
                "integration-core".to_string(),
            ],
            stagger_ms: 2000,
        }
    }
}

impl FleetLaunchConfig {
    pub fn stagger(&self) -> Duration {
        Duration::from_millis(self.stagger_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DashboardConfig {
    /// Merge log entries shown by `status`
    pub recent_merges: usize,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self { recent_merges: 20 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl FleetConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values (serde defaults on every section)
    /// 2. agent-fleet.toml in the working directory
    /// 3. The file passed with --config
    /// 4. Environment variables (AGENT_FLEET_STORE__ROOT, ...)
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if Path::new("agent-fleet.toml").exists() {
            builder = builder.add_source(File::with_name("agent-fleet"));
        }

        if let Some(path) = explicit {
            if !path.exists() {
                bail!("Configuration file {} does not exist", path.display());
            }
            builder = builder.add_source(File::from(path));
        }

        builder = builder.add_source(
            Environment::with_prefix("AGENT_FLEET")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("fleet.agents")
                .with_list_parse_key("ports.lease_for_layers"),
        );

        let config: FleetConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the coordination layer cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.store.lock_timeout_ms == 0 || self.store.lock_poll_interval_ms == 0 {
            bail!("store.lock_timeout_ms and store.lock_poll_interval_ms must be positive");
        }
        if self.store.stale_lock_after_ms <= self.store.lock_poll_interval_ms {
            bail!("store.stale_lock_after_ms must exceed store.lock_poll_interval_ms");
        }
        if self.heartbeat.interval_ms == 0 || self.watchdog.interval_ms == 0 {
            bail!("heartbeat.interval_ms and watchdog.interval_ms must be positive");
        }
        if self.watchdog.liveness_timeout_ms < self.heartbeat.interval_ms {
            bail!(
                "watchdog.liveness_timeout_ms ({}) must not be shorter than heartbeat.interval_ms ({})",
                self.watchdog.liveness_timeout_ms,
                self.heartbeat.interval_ms
            );
        }
        if self.ports.pool_size == 0 {
            bail!("ports.pool_size must be positive");
        }
        if self.ports.base as u32 + self.ports.pool_size as u32 > u16::MAX as u32 + 1 {
            bail!(
                "Port pool {}+{} overflows the port range",
                self.ports.base,
                self.ports.pool_size
            );
        }
        Ok(())
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}
