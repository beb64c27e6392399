//! Agent Registry
//!
//! Per-layer lists of agent status records. Each record is written only by the
//! agent it names; everyone else reads snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::store::{CoordinationStore, RecordKey, StoreError};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Unknown layer '{0}' (expected ui, api, integration or oversight)")]
    UnknownLayer(String),

    #[error("Cannot derive a layer from agent name '{0}'; pass one explicitly")]
    UnresolvedLayer(String),

    #[error("Agent name must not be empty")]
    EmptyName,
}

/// Partition of the fleet an agent belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    Ui,
    Api,
    Integration,
    Oversight,
}

impl Layer {
    pub const ALL: [Layer; 4] = [Layer::Ui, Layer::Api, Layer::Integration, Layer::Oversight];

    pub fn as_str(self) -> &'static str {
        match self {
            Layer::Ui => "ui",
            Layer::Api => "api",
            Layer::Integration => "integration",
            Layer::Oversight => "oversight",
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Layer {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ui" => Ok(Layer::Ui),
            "api" => Ok(Layer::Api),
            "integration" => Ok(Layer::Integration),
            "oversight" => Ok(Layer::Oversight),
            other => Err(RegistryError::UnknownLayer(other.to_string())),
        }
    }
}

/// Lifecycle status as stored in the registry.
///
/// `Crashed` is never written by an agent about itself; it is derived from
/// heartbeat staleness by observers (see [`effective_status`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Initializing,
    Active,
    Testing,
    Fixing,
    Idle,
    Crashed,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AgentStatus::Initializing => "initializing",
            AgentStatus::Active => "active",
            AgentStatus::Testing => "testing",
            AgentStatus::Fixing => "fixing",
            AgentStatus::Idle => "idle",
            AgentStatus::Crashed => "crashed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCounters {
    pub tested: u64,
    pub found: u64,
    pub fixed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatusRecord {
    pub name: String,
    pub layer: Layer,
    pub status: AgentStatus,
    pub pid: u32,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub current_task: Option<String>,
    #[serde(default)]
    pub counters: AgentCounters,
    #[serde(default)]
    pub port: Option<u16>,
}

impl AgentStatusRecord {
    /// Record written the first time an agent registers
    pub fn seed(identity: &AgentIdentity, now: DateTime<Utc>) -> Self {
        Self {
            name: identity.name.clone(),
            layer: identity.layer,
            status: AgentStatus::Initializing,
            pid: std::process::id(),
            last_heartbeat: now,
            current_task: None,
            counters: AgentCounters::default(),
            port: None,
        }
    }

    /// Advance the heartbeat; never moves it backwards.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_heartbeat {
            self.last_heartbeat = now;
        }
    }

    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_heartbeat).to_std().unwrap_or_default()
    }
}

/// Status an observer should display for a record: a non-idle agent whose
/// heartbeat is older than `timeout` is reported as crashed.
pub fn effective_status(
    record: &AgentStatusRecord,
    now: DateTime<Utc>,
    timeout: Duration,
) -> AgentStatus {
    if record.status != AgentStatus::Idle && record.heartbeat_age(now) > timeout {
        AgentStatus::Crashed
    } else {
        record.status
    }
}

/// Short name plus layer of one agent
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AgentIdentity {
    pub name: String,
    pub layer: Layer,
}

impl AgentIdentity {
    /// Derive identity from a process name such as `ui-core` or
    /// `api-core-agent`: a trailing `-agent` is dropped and the leading
    /// segment names the layer.
    pub fn parse(name: &str) -> Result<Self, RegistryError> {
        let short = Self::short_name(name)?;
        let prefix = short.split(['-', '_']).next().unwrap_or_default();
        let layer = match prefix {
            "watchdog" => Layer::Oversight,
            other => other
                .parse::<Layer>()
                .map_err(|_| RegistryError::UnresolvedLayer(short.clone()))?,
        };
        Ok(Self { name: short, layer })
    }

    pub fn with_layer(name: &str, layer: Layer) -> Result<Self, RegistryError> {
        Ok(Self {
            name: Self::short_name(name)?,
            layer,
        })
    }

    fn short_name(name: &str) -> Result<String, RegistryError> {
        let trimmed = name.trim().to_ascii_lowercase();
        let short = trimmed.strip_suffix("-agent").unwrap_or(&trimmed);
        if short.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        Ok(short.to_string())
    }
}

impl fmt::Display for AgentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.layer, self.name)
    }
}

#[derive(Debug, Clone)]
pub struct AgentRegistry {
    store: CoordinationStore,
}

impl AgentRegistry {
    pub fn new(store: CoordinationStore) -> Self {
        Self { store }
    }

    /// Mutate this agent's own record inside the layer lock, creating it on
    /// first write. Returns the record as stored.
    pub async fn update_own<F>(
        &self,
        identity: &AgentIdentity,
        update: F,
    ) -> Result<AgentStatusRecord, StoreError>
    where
        F: FnOnce(&mut AgentStatusRecord),
    {
        let now = Utc::now();
        self.store
            .transact(
                &RecordKey::Status(identity.layer),
                |records: &mut Vec<AgentStatusRecord>| {
                    let index = match records.iter().position(|r| r.name == identity.name) {
                        Some(index) => index,
                        None => {
                            records.push(AgentStatusRecord::seed(identity, now));
                            records.len() - 1
                        }
                    };
                    let record = &mut records[index];
                    update(record);
                    Ok::<_, StoreError>(record.clone())
                },
            )
            .await
    }

    /// Refresh only the heartbeat; status and task are left as the runtime
    /// last wrote them.
    pub async fn heartbeat(&self, identity: &AgentIdentity) -> Result<DateTime<Utc>, StoreError> {
        let now = Utc::now();
        let record = self
            .update_own(identity, |record| {
                record.pid = std::process::id();
                record.touch(now);
            })
            .await?;
        Ok(record.last_heartbeat)
    }

    pub async fn layer_snapshot(&self, layer: Layer) -> Result<Vec<AgentStatusRecord>, StoreError> {
        self.store.read(&RecordKey::Status(layer)).await
    }

    /// Every layer's records, layer by layer. Each layer is an independent
    /// snapshot.
    pub async fn snapshot(&self) -> Result<Vec<AgentStatusRecord>, StoreError> {
        let mut all = Vec::new();
        for layer in Layer::ALL {
            all.extend(self.layer_snapshot(layer).await?);
        }
        Ok(all)
    }

    pub async fn find(
        &self,
        identity: &AgentIdentity,
    ) -> Result<Option<AgentStatusRecord>, StoreError> {
        Ok(self
            .layer_snapshot(identity.layer)
            .await?
            .into_iter()
            .find(|r| r.name == identity.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LockSettings;
    use tempfile::TempDir;

    fn registry(dir: &TempDir) -> AgentRegistry {
        AgentRegistry::new(CoordinationStore::new(dir.path(), LockSettings::default()))
    }

    #[test]
    fn test_identity_derivation() {
        let id = AgentIdentity::parse("ui-core").unwrap();
        assert_eq!(id.name, "ui-core");
        assert_eq!(id.layer, Layer::Ui);

        let id = AgentIdentity::parse("API-Core-agent").unwrap();
        assert_eq!(id.name, "api-core");
        assert_eq!(id.layer, Layer::Api);

        let id = AgentIdentity::parse("integration_checkout").unwrap();
        assert_eq!(id.layer, Layer::Integration);

        let id = AgentIdentity::parse("watchdog").unwrap();
        assert_eq!(id.layer, Layer::Oversight);

        assert!(matches!(
            AgentIdentity::parse("pricing-bot"),
            Err(RegistryError::UnresolvedLayer(_))
        ));
        assert!(matches!(AgentIdentity::parse("-agent"), Err(RegistryError::EmptyName)));

        let id = AgentIdentity::with_layer("pricing-bot", Layer::Api).unwrap();
        assert_eq!(id.to_string(), "api/pricing-bot");
    }

    #[test]
    fn test_layer_parsing() {
        assert_eq!("UI".parse::<Layer>().unwrap(), Layer::Ui);
        assert_eq!(" oversight ".parse::<Layer>().unwrap(), Layer::Oversight);
        assert!("database".parse::<Layer>().is_err());
    }

    #[test]
    fn test_touch_never_moves_heartbeat_backwards() {
        let identity = AgentIdentity::parse("ui-core").unwrap();
        let now = Utc::now();
        let mut record = AgentStatusRecord::seed(&identity, now);

        record.touch(now - chrono::Duration::seconds(10));
        assert_eq!(record.last_heartbeat, now);

        let later = now + chrono::Duration::seconds(1);
        record.touch(later);
        assert_eq!(record.last_heartbeat, later);
    }

    #[test]
    fn test_effective_status_derives_crashed() {
        let identity = AgentIdentity::parse("api-core").unwrap();
        let now = Utc::now();
        let mut record = AgentStatusRecord::seed(&identity, now - chrono::Duration::seconds(45));
        record.status = AgentStatus::Testing;

        let timeout = Duration::from_secs(30);
        assert_eq!(effective_status(&record, now, timeout), AgentStatus::Crashed);
        assert_eq!(
            effective_status(&record, now, Duration::from_secs(60)),
            AgentStatus::Testing
        );

        record.status = AgentStatus::Idle;
        assert_eq!(effective_status(&record, now, timeout), AgentStatus::Idle);
    }

    #[tokio::test]
    async fn test_update_own_creates_then_mutates_record() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let ui = AgentIdentity::parse("ui-core").unwrap();
        let ui_two = AgentIdentity::parse("ui-checkout").unwrap();

        let record = registry
            .update_own(&ui, |r| r.status = AgentStatus::Active)
            .await
            .unwrap();
        assert_eq!(record.status, AgentStatus::Active);
        assert_eq!(record.pid, std::process::id());

        registry
            .update_own(&ui_two, |r| r.current_task = Some("wf-login".to_string()))
            .await
            .unwrap();
        registry
            .update_own(&ui, |r| r.counters.tested += 1)
            .await
            .unwrap();

        let layer = registry.layer_snapshot(Layer::Ui).await.unwrap();
        assert_eq!(layer.len(), 2);
        let stored = registry.find(&ui).await.unwrap().unwrap();
        assert_eq!(stored.status, AgentStatus::Active);
        assert_eq!(stored.counters.tested, 1);

        assert!(registry.layer_snapshot(Layer::Api).await.unwrap().is_empty());
        assert_eq!(registry.snapshot().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_heartbeat_preserves_status() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let agent = AgentIdentity::parse("api-core").unwrap();

        let before = registry
            .update_own(&agent, |r| {
                r.status = AgentStatus::Testing;
                r.current_task = Some("wf-quote".to_string());
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let beat = registry.heartbeat(&agent).await.unwrap();
        assert!(beat > before.last_heartbeat);

        let after = registry.find(&agent).await.unwrap().unwrap();
        assert_eq!(after.status, AgentStatus::Testing);
        assert_eq!(after.current_task.as_deref(), Some("wf-quote"));
    }
}
