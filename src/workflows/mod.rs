// Workflow definitions and the loader that hands each agent its partition

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("IO error reading workflows from {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid workflow JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid workflow TOML in {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// One step of a workflow. The payload is opaque to the coordination layer;
/// only the step executor interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "lowercase")]
pub enum WorkflowStep {
    Ui(serde_json::Value),
    Api(serde_json::Value),
    Assertion(serde_json::Value),
}

impl WorkflowStep {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkflowStep::Ui(_) => "ui",
            WorkflowStep::Api(_) => "api",
            WorkflowStep::Assertion(_) => "assertion",
        }
    }

    pub fn payload(&self) -> &serde_json::Value {
        match self {
            WorkflowStep::Ui(payload)
            | WorkflowStep::Api(payload)
            | WorkflowStep::Assertion(payload) => payload,
        }
    }
}

impl fmt::Display for WorkflowStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind(), self.payload())
    }
}

/// Immutable description of one test workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub critical_path: bool,
    pub assigned_agent: String,
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub expected_duration_ms: Option<u64>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// A workflow file holds either one definition or a list of them
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum JsonWorkflowFile {
    Many(Vec<WorkflowDefinition>),
    One(Box<WorkflowDefinition>),
}

#[derive(Debug, Deserialize)]
struct TomlWorkflowFile {
    #[serde(default)]
    workflows: Vec<WorkflowDefinition>,
}

/// Order for execution: critical-path workflows first, ties broken by id.
pub fn sort_by_priority(workflows: &mut [WorkflowDefinition]) {
    workflows.sort_by(|a, b| {
        b.critical_path
            .cmp(&a.critical_path)
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Workflows assigned to `agent`, in execution order.
pub fn partition_for(workflows: Vec<WorkflowDefinition>, agent: &str) -> Vec<WorkflowDefinition> {
    let mut assigned: Vec<WorkflowDefinition> = workflows
        .into_iter()
        .filter(|w| w.assigned_agent == agent)
        .collect();
    sort_by_priority(&mut assigned);
    assigned
}

/// Reads `*.json` and `*.toml` workflow files from one directory
#[derive(Debug, Clone)]
pub struct WorkflowLoader {
    dir: PathBuf,
}

impl WorkflowLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Every definition in the directory. A missing directory yields none.
    pub async fn load_all(&self) -> Result<Vec<WorkflowDefinition>, WorkflowError> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(dir = ?self.dir, "Workflow directory not found; no workflows loaded");
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(WorkflowError::Io {
                    path: self.dir.clone(),
                    source,
                })
            }
        };

        let mut files = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => files.push(entry.path()),
                Ok(None) => break,
                Err(source) => {
                    return Err(WorkflowError::Io {
                        path: self.dir.clone(),
                        source,
                    })
                }
            }
        }
        files.sort();

        let mut workflows = Vec::new();
        for path in files {
            let parsed = match path.extension().and_then(|e| e.to_str()) {
                Some("json") => Self::parse_json(&path).await?,
                Some("toml") => Self::parse_toml(&path).await?,
                _ => continue,
            };
            debug!(file = ?path, count = parsed.len(), "Loaded workflow file");
            workflows.extend(parsed);
        }

        Ok(workflows)
    }

    /// The partition owned by `agent`, sorted for execution
    pub async fn load_for(&self, agent: &str) -> Result<Vec<WorkflowDefinition>, WorkflowError> {
        let assigned = partition_for(self.load_all().await?, agent);
        info!(
            agent = %agent,
            count = assigned.len(),
            critical = assigned.iter().filter(|w| w.critical_path).count(),
            "Workflow partition loaded"
        );
        Ok(assigned)
    }

    async fn read(path: &Path) -> Result<String, WorkflowError> {
        fs::read_to_string(path)
            .await
            .map_err(|source| WorkflowError::Io {
                path: path.to_path_buf(),
                source,
            })
    }

    async fn parse_json(path: &Path) -> Result<Vec<WorkflowDefinition>, WorkflowError> {
        let contents = Self::read(path).await?;
        let file: JsonWorkflowFile =
            serde_json::from_str(&contents).map_err(|source| WorkflowError::Json {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(match file {
            JsonWorkflowFile::Many(many) => many,
            JsonWorkflowFile::One(one) => vec![*one],
        })
    }

    async fn parse_toml(path: &Path) -> Result<Vec<WorkflowDefinition>, WorkflowError> {
        let contents = Self::read(path).await?;
        let file: TomlWorkflowFile =
            toml::from_str(&contents).map_err(|source| WorkflowError::Toml {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(file.workflows)
    }
}
