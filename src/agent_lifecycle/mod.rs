// Agent Lifecycle Module
//
// The per-process agent runtime: lifecycle state machine, the executor and
// fixer boundaries it delegates to, and the runtime that ties them to the
// coordination store.

pub mod executor;
pub mod runtime;
pub mod state_machine;

pub use executor::{
    FailureFixer, FixOutcome, LoggingFailureFixer, LoggingStepExecutor, StepExecutor, StepOutcome,
};
pub use runtime::{AgentRuntime, AgentState, FixSummary, RunSummary, RuntimeError, RuntimeOptions};
pub use state_machine::{LifecycleEvent, LifecycleMachine};
