// Boundaries to the external collaborators an agent delegates to: the step
// executor that runs one workflow step, and the fixer that attempts a claimed
// failure. The runtime only inspects success/error and the fix outcome.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

#[cfg(test)]
use mockall::automock;

use crate::failures::FailureRecord;
use crate::workflows::WorkflowStep;

/// Result of one step. `evidence` is opaque to the coordination layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<serde_json::Value>,
}

impl StepOutcome {
    pub fn passed() -> Self {
        Self {
            success: true,
            error: None,
            evidence: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            evidence: None,
        }
    }

    pub fn with_evidence(mut self, evidence: serde_json::Value) -> Self {
        self.evidence = Some(evidence);
        self
    }
}

/// Runs a single workflow step (browser action, HTTP call, assertion...)
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, step: &WorkflowStep) -> StepOutcome;
}

/// Dry-run executor: logs every step and reports success
#[derive(Debug, Clone, Default)]
pub struct LoggingStepExecutor;

#[async_trait]
impl StepExecutor for LoggingStepExecutor {
    async fn execute(&self, step: &WorkflowStep) -> StepOutcome {
        info!(kind = step.kind(), payload = %step.payload(), "Executing step (dry run)");
        StepOutcome::passed().with_evidence(serde_json::json!({ "dry_run": true }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixOutcome {
    /// A fix was committed
    Fixed { commit_id: String },
    /// A fix was committed and then reverted
    RolledBack { commit_id: String, reason: String },
    /// No fix could be produced
    Unresolved { reason: String },
}

/// Attempts a fix for a claimed failure
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FailureFixer: Send + Sync {
    async fn attempt(&self, failure: &FailureRecord) -> FixOutcome;
}

/// Dry-run fixer: logs the claimed failure and hands it back unresolved, so
/// it is closed as abandoned for manual triage rather than held forever
#[derive(Debug, Clone, Default)]
pub struct LoggingFailureFixer;

#[async_trait]
impl FailureFixer for LoggingFailureFixer {
    async fn attempt(&self, failure: &FailureRecord) -> FixOutcome {
        info!(
            failure_id = %failure.failure_id,
            severity = %failure.severity,
            root_cause = %failure.root_cause,
            "Attempting fix (dry run)"
        );
        FixOutcome::Unresolved {
            reason: "dry run: no fixer configured, left for manual triage".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failures::{FailureOrigin, Severity};
    use crate::registry::Layer;

    #[tokio::test]
    async fn test_logging_executor_always_passes() {
        let executor = LoggingStepExecutor;
        let outcome = executor
            .execute(&WorkflowStep::Api(serde_json::json!({"get": "/health"})))
            .await;
        assert!(outcome.success);
        assert!(outcome.error.is_none());
        assert_eq!(outcome.evidence.unwrap()["dry_run"], true);
    }

    #[tokio::test]
    async fn test_logging_fixer_leaves_failure_for_triage() {
        let failure = FailureRecord::new(
            FailureOrigin {
                agent: "ui-core".to_string(),
                workflow_id: "wf-quote".to_string(),
                layer: Layer::Ui,
            },
            Severity::High,
            "submit button missing",
            Vec::new(),
        );

        match LoggingFailureFixer.attempt(&failure).await {
            FixOutcome::Unresolved { reason } => assert!(reason.contains("dry run")),
            other => panic!("dry-run fixer must not claim a fix, got {other:?}"),
        }
    }

    #[test]
    fn test_outcome_wire_format() {
        let outcome: StepOutcome =
            serde_json::from_str(r#"{"success": false, "error": "selector missing"}"#).unwrap();
        assert_eq!(outcome, StepOutcome::failed("selector missing"));

        let json = serde_json::to_value(StepOutcome::passed()).unwrap();
        assert_eq!(json, serde_json::json!({"success": true}));
    }
}
