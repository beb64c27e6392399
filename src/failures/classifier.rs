// Severity classification for newly discovered failures.
// The queue's single-claim guarantee does not depend on which classifier is used.

use super::Severity;
use crate::workflows::{WorkflowDefinition, WorkflowStep};

/// What a classifier gets to look at
#[derive(Debug, Clone, Copy)]
pub struct FailureContext<'a> {
    pub workflow: &'a WorkflowDefinition,
    pub step: Option<&'a WorkflowStep>,
    pub error: &'a str,
}

pub trait SeverityClassifier: Send + Sync {
    fn classify(&self, context: &FailureContext<'_>) -> Severity;
}

/// Broad failure families recognised by [`KeywordClassifier`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    MissingElement,
    AssertionMismatch,
    Transport,
    Other,
}

/// Keyword heuristic: a missing UI element on a critical-path workflow is
/// the most severe outcome, generic transport errors the least.
#[derive(Debug, Clone)]
pub struct KeywordClassifier {
    missing_element: Vec<String>,
    assertion: Vec<String>,
    transport: Vec<String>,
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        let words = |list: &[&str]| list.iter().map(|w| w.to_string()).collect();
        Self {
            missing_element: words(&[
                "element not found",
                "no such element",
                "not visible",
                "selector",
                "missing",
                "could not find",
            ]),
            assertion: words(&["assert", "expected", "mismatch", "incorrect", "should be"]),
            transport: words(&[
                "timeout",
                "timed out",
                "connection",
                "econnrefused",
                "network",
                "502",
                "503",
                "504",
            ]),
        }
    }
}

impl KeywordClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind_of(&self, error: &str) -> FailureKind {
        let error = error.to_ascii_lowercase();
        let matches = |keywords: &[String]| keywords.iter().any(|k| error.contains(k.as_str()));

        if matches(&self.missing_element) {
            FailureKind::MissingElement
        } else if matches(&self.assertion) {
            FailureKind::AssertionMismatch
        } else if matches(&self.transport) {
            FailureKind::Transport
        } else {
            FailureKind::Other
        }
    }
}

impl SeverityClassifier for KeywordClassifier {
    fn classify(&self, context: &FailureContext<'_>) -> Severity {
        let critical = context.workflow.critical_path;
        let ui_step = matches!(context.step, Some(WorkflowStep::Ui(_)));

        match (self.kind_of(context.error), critical) {
            (FailureKind::MissingElement, true) => Severity::Critical,
            (FailureKind::MissingElement, false) if ui_step => Severity::High,
            (FailureKind::MissingElement, false) => Severity::Medium,
            (FailureKind::AssertionMismatch, true) => Severity::High,
            (FailureKind::AssertionMismatch, false) => Severity::Medium,
            (FailureKind::Transport, true) => Severity::Medium,
            (FailureKind::Transport, false) => Severity::Low,
            (FailureKind::Other, true) => Severity::Medium,
            (FailureKind::Other, false) => Severity::Low,
        }
    }
}
