// agent-fleet - file-coordinated fleet of autonomous test agents
// This exposes the coordination layer for the binary, tests and embedders

pub mod agent_lifecycle;
pub mod allocator;
pub mod audit;
pub mod cli;
pub mod config;
pub mod dashboard;
pub mod failures;
pub mod registry;
pub mod shutdown;
pub mod store;
pub mod telemetry;
pub mod watchdog;
pub mod workflows;

// Re-export key types for easy access
pub use agent_lifecycle::{
    AgentRuntime, FailureFixer, FixOutcome, LoggingFailureFixer, LoggingStepExecutor, RunSummary,
    RuntimeError, RuntimeOptions, StepExecutor, StepOutcome,
};
pub use allocator::{AllocationError, PortAllocator, PortPool};
pub use audit::{MergeLog, MergeLogEntry};
pub use config::FleetConfig;
pub use dashboard::{DashboardService, FleetSummary};
pub use failures::{
    FailureQueue, FailureQueueError, FailureRecord, KeywordClassifier, ResolutionState, Severity,
    SeverityClassifier,
};
pub use registry::{effective_status, AgentIdentity, AgentRegistry, AgentStatus, AgentStatusRecord, Layer};
pub use shutdown::ShutdownCoordinator;
pub use store::{CoordinationStore, LockManager, LockSettings, RecordKey, StoreError};
pub use telemetry::{create_coordination_span, generate_correlation_id, init_telemetry};
pub use watchdog::{SuspectAgent, Watchdog, WatchdogError, WatchdogLock};
pub use workflows::{WorkflowDefinition, WorkflowError, WorkflowLoader, WorkflowStep};
