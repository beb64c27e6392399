//! Agent Runtime
//!
//! One runtime per agent process. It owns the lifecycle state machine, the
//! explicit [`AgentState`] (partition, counters, leased port) and the
//! heartbeat task. All sharing with other agents goes through the
//! coordination store.

use chrono::Utc;
use serde::Serialize;
use statig::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use super::executor::{FailureFixer, FixOutcome, StepExecutor};
use super::state_machine::{LifecycleEvent, LifecycleMachine};
use crate::allocator::{AllocationError, PortAllocator, PortPool};
use crate::audit::{MergeLog, MergeLogEntry};
use crate::config::FleetConfig;
use crate::failures::{
    FailureContext, FailureOrigin, FailureQueue, FailureQueueError, FailureRecord,
    KeywordClassifier, ResolutionState, SeverityClassifier,
};
use crate::registry::{AgentCounters, AgentIdentity, AgentRegistry, AgentStatus, AgentStatusRecord};
use crate::store::{CoordinationStore, StoreError};
use crate::telemetry::{create_coordination_span, generate_correlation_id};
use crate::workflows::{WorkflowDefinition, WorkflowError, WorkflowLoader, WorkflowStep};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Agent {agent} could not register its status: {source}")]
    Registration {
        agent: String,
        #[source]
        source: StoreError,
    },

    #[error("Agent {agent} is not running (not initialized or already shut down)")]
    NotRunning { agent: String },

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error(transparent)]
    Workflows(#[from] WorkflowError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Failures(#[from] FailureQueueError),
}

#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub heartbeat_interval: Duration,
    /// Lease a port from the pool during initialization
    pub lease_port: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            lease_port: false,
        }
    }
}

impl RuntimeOptions {
    pub fn from_config(config: &FleetConfig, identity: &AgentIdentity) -> Self {
        Self {
            heartbeat_interval: config.heartbeat.interval(),
            lease_port: config.ports.lease_for_layers.contains(&identity.layer),
        }
    }
}

/// Everything the runtime knows about its own agent
#[derive(Debug, Clone, Default)]
pub struct AgentState {
    pub workflows: Vec<WorkflowDefinition>,
    pub counters: AgentCounters,
    pub port: Option<u16>,
    pub initialized: bool,
    pub shut_down: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub executed: usize,
    pub passed: usize,
    pub failed: usize,
    /// Shutdown was requested before every workflow ran
    pub interrupted: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FixSummary {
    pub attempted: usize,
    pub fixed: usize,
    pub rolled_back: usize,
    pub unresolved: usize,
}

enum WorkflowResult {
    Passed,
    Failed { step: usize, error: String },
    Interrupted,
}

struct HeartbeatTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct AgentRuntime {
    identity: AgentIdentity,
    registry: AgentRegistry,
    failures: FailureQueue,
    allocator: PortAllocator,
    merge_log: MergeLog,
    loader: WorkflowLoader,
    executor: Arc<dyn StepExecutor>,
    classifier: Arc<dyn SeverityClassifier>,
    machine: StateMachine<LifecycleMachine>,
    state: AgentState,
    options: RuntimeOptions,
    cancel: CancellationToken,
    heartbeat: Option<HeartbeatTask>,
}

impl AgentRuntime {
    pub fn new(
        identity: AgentIdentity,
        store: CoordinationStore,
        loader: WorkflowLoader,
        pool: PortPool,
        options: RuntimeOptions,
        executor: Arc<dyn StepExecutor>,
    ) -> Self {
        let store = store.with_holder(identity.name.clone());
        Self {
            registry: AgentRegistry::new(store.clone()),
            failures: FailureQueue::new(store.clone()),
            allocator: PortAllocator::new(store.clone(), pool),
            merge_log: MergeLog::new(store),
            loader,
            executor,
            classifier: Arc::new(KeywordClassifier::new()),
            machine: LifecycleMachine::new(identity.name.clone()).state_machine(),
            state: AgentState::default(),
            options,
            cancel: CancellationToken::new(),
            heartbeat: None,
            identity,
        }
    }

    pub fn from_config(
        identity: AgentIdentity,
        config: &FleetConfig,
        executor: Arc<dyn StepExecutor>,
    ) -> Self {
        let options = RuntimeOptions::from_config(config, &identity);
        Self::new(
            identity,
            CoordinationStore::from_config(&config.store),
            WorkflowLoader::new(&config.workflows.dir),
            PortPool::from(&config.ports),
            options,
            executor,
        )
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn SeverityClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Observe an external shutdown signal between workflow steps
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    pub fn status(&self) -> AgentStatus {
        self.machine.inner().status()
    }

    pub fn workflows(&self) -> &[WorkflowDefinition] {
        &self.state.workflows
    }

    /// Register, lease resources, load the partition, go active and start
    /// heartbeating.
    pub async fn initialize(&mut self) -> Result<(), RuntimeError> {
        if self.state.shut_down {
            return Err(self.not_running());
        }
        if self.state.initialized {
            return Ok(());
        }
        let span = create_coordination_span(
            "initialize",
            Some(&self.identity.name),
            Some(&generate_correlation_id()),
        );
        self.register_and_activate().instrument(span).await
    }

    async fn register_and_activate(&mut self) -> Result<(), RuntimeError> {
        let existing = self
            .registry
            .find(&self.identity)
            .await
            .map_err(|source| self.registration_error(source))?;
        if let Some(existing) = existing {
            self.state.counters = existing.counters;
        }
        self.publish()
            .await
            .map_err(|source| self.registration_error(source))?;

        if let Err(e) = self.acquire_resources().await {
            error!(agent = %self.identity.name, error = %e, "Agent startup failed");
            self.abort_startup().await;
            return Err(e);
        }

        self.transition(LifecycleEvent::Activate).await;
        self.start_heartbeat();
        self.state.initialized = true;

        info!(
            agent = %self.identity.name,
            layer = %self.identity.layer,
            pid = std::process::id(),
            workflows = self.state.workflows.len(),
            port = ?self.state.port,
            "Agent initialized"
        );
        Ok(())
    }

    async fn acquire_resources(&mut self) -> Result<(), RuntimeError> {
        if self.options.lease_port {
            self.state.port = Some(self.allocator.lease(&self.identity.name).await?);
        }
        self.state.workflows = self.loader.load_for(&self.identity.name).await?;
        Ok(())
    }

    async fn abort_startup(&mut self) {
        self.state.shut_down = true;
        self.machine.handle(&LifecycleEvent::Shutdown);
        if let Err(e) = self.publish().await {
            warn!(agent = %self.identity.name, error = %e, "Failed to mark agent idle after startup failure");
        }
        if self.state.port.take().is_some() {
            if let Err(e) = self.allocator.release(&self.identity.name).await {
                warn!(agent = %self.identity.name, error = %e, "Failed to release port after startup failure");
            }
        }
    }

    fn registration_error(&self, source: StoreError) -> RuntimeError {
        RuntimeError::Registration {
            agent: self.identity.name.clone(),
            source,
        }
    }

    fn not_running(&self) -> RuntimeError {
        RuntimeError::NotRunning {
            agent: self.identity.name.clone(),
        }
    }

    fn ensure_running(&self) -> Result<(), RuntimeError> {
        if !self.state.initialized || self.state.shut_down {
            return Err(self.not_running());
        }
        Ok(())
    }

    /// Execute the loaded partition in order.
    ///
    /// Step failures become failure records and the loop moves on. A
    /// shutdown request is honoured before the next step starts.
    pub async fn run_all_workflows(&mut self) -> Result<RunSummary, RuntimeError> {
        self.ensure_running()?;
        let span = create_coordination_span(
            "run_all_workflows",
            Some(&self.identity.name),
            Some(&generate_correlation_id()),
        );
        self.run_partition().instrument(span).await
    }

    async fn run_partition(&mut self) -> Result<RunSummary, RuntimeError> {
        let workflows = self.state.workflows.clone();
        let mut summary = RunSummary::default();

        for workflow in &workflows {
            if self.cancel.is_cancelled() {
                summary.interrupted = true;
                break;
            }

            self.transition(LifecycleEvent::BeginTesting {
                workflow_id: workflow.id.clone(),
            })
            .await;

            match self.execute_workflow(workflow).await {
                WorkflowResult::Passed => {
                    self.state.counters.tested += 1;
                    summary.executed += 1;
                    summary.passed += 1;
                    info!(agent = %self.identity.name, workflow = %workflow.id, "Workflow passed");
                }
                WorkflowResult::Failed { step, error } => {
                    self.state.counters.tested += 1;
                    self.state.counters.found += 1;
                    summary.executed += 1;
                    summary.failed += 1;
                    if let Err(e) = self.report_failure(workflow, step, &error).await {
                        self.transition(LifecycleEvent::Finish).await;
                        return Err(e.into());
                    }
                }
                WorkflowResult::Interrupted => summary.interrupted = true,
            }

            self.transition(LifecycleEvent::Finish).await;
            if summary.interrupted {
                break;
            }
        }

        if summary.interrupted {
            info!(
                agent = %self.identity.name,
                executed = summary.executed,
                remaining = workflows.len() - summary.executed,
                "Shutdown requested; stopped between steps"
            );
        }
        info!(
            agent = %self.identity.name,
            executed = summary.executed,
            passed = summary.passed,
            failed = summary.failed,
            "Workflow run complete"
        );
        Ok(summary)
    }

    async fn execute_workflow(&self, workflow: &WorkflowDefinition) -> WorkflowResult {
        for (index, step) in workflow.steps.iter().enumerate() {
            if index > 0 && self.cancel.is_cancelled() {
                return WorkflowResult::Interrupted;
            }

            let outcome = self.executor.execute(step).await;
            if !outcome.success {
                let error = outcome
                    .error
                    .unwrap_or_else(|| format!("{} step failed without an error message", step.kind()));
                warn!(
                    agent = %self.identity.name,
                    workflow = %workflow.id,
                    step = index,
                    error = %error,
                    "Workflow step failed"
                );
                return WorkflowResult::Failed { step: index, error };
            }
            debug!(workflow = %workflow.id, step = index, "Step passed");
        }
        WorkflowResult::Passed
    }

    async fn report_failure(
        &self,
        workflow: &WorkflowDefinition,
        step: usize,
        error: &str,
    ) -> Result<(), StoreError> {
        let failing_step = workflow.steps.get(step);
        let severity = self.classifier.classify(&FailureContext {
            workflow,
            step: failing_step,
            error,
        });
        let reproduction_steps = workflow
            .steps
            .iter()
            .take(step + 1)
            .map(WorkflowStep::to_string)
            .collect();

        let record = FailureRecord::new(
            FailureOrigin {
                agent: self.identity.name.clone(),
                workflow_id: workflow.id.clone(),
                layer: self.identity.layer,
            },
            severity,
            error,
            reproduction_steps,
        );
        self.failures.report(record).await
    }

    /// Claim and attempt failures from this agent's layer until the queue
    /// has nothing left to claim.
    pub async fn run_fix_cycle(
        &mut self,
        fixer: &dyn FailureFixer,
    ) -> Result<FixSummary, RuntimeError> {
        self.ensure_running()?;
        let mut summary = FixSummary::default();

        while !self.cancel.is_cancelled() {
            let Some(failure) = self
                .failures
                .claim(self.identity.layer, &self.identity.name)
                .await?
            else {
                break;
            };

            self.transition(LifecycleEvent::BeginFixing {
                failure_id: failure.failure_id.clone(),
            })
            .await;
            summary.attempted += 1;

            let outcome = fixer.attempt(&failure).await;
            let settled = self.settle(&failure, outcome, &mut summary).await;
            self.transition(LifecycleEvent::Finish).await;
            settled?;
        }

        info!(
            agent = %self.identity.name,
            attempted = summary.attempted,
            fixed = summary.fixed,
            rolled_back = summary.rolled_back,
            unresolved = summary.unresolved,
            "Fix cycle complete"
        );
        Ok(summary)
    }

    async fn settle(
        &mut self,
        failure: &FailureRecord,
        outcome: FixOutcome,
        summary: &mut FixSummary,
    ) -> Result<(), RuntimeError> {
        let agent = self.identity.name.clone();
        let failure_id = failure.failure_id.as_str();

        let (resolution, note, entry) = match outcome {
            FixOutcome::Fixed { commit_id } => {
                summary.fixed += 1;
                self.state.counters.fixed += 1;
                (
                    ResolutionState::Resolved,
                    format!("fixed in {commit_id}"),
                    Some(MergeLogEntry::merged(&agent, &commit_id, Some(failure_id))),
                )
            }
            FixOutcome::RolledBack { commit_id, reason } => {
                summary.rolled_back += 1;
                let entry =
                    MergeLogEntry::rolled_back(&agent, &commit_id, Some(failure_id), reason.clone());
                (ResolutionState::RolledBack, reason, Some(entry))
            }
            FixOutcome::Unresolved { reason } => {
                summary.unresolved += 1;
                (ResolutionState::Abandoned, reason, None)
            }
        };

        self.failures
            .resolve(failure.origin.layer, failure_id, &agent, resolution, Some(note))
            .await?;
        if let Some(entry) = entry {
            self.merge_log.append(entry).await?;
        }
        Ok(())
    }

    /// Stop heartbeating, go idle and release the port. Safe to call more
    /// than once; later calls do nothing.
    pub async fn shutdown(&mut self) -> Result<(), RuntimeError> {
        if self.state.shut_down {
            return Ok(());
        }
        self.state.shut_down = true;
        self.stop_heartbeat().await;

        self.machine.handle(&LifecycleEvent::Shutdown);
        let published = self.publish().await;

        let released = match self.state.port.take() {
            Some(_) => self.allocator.release(&self.identity.name).await.map(|_| ()),
            None => Ok(()),
        };

        info!(
            agent = %self.identity.name,
            tested = self.state.counters.tested,
            found = self.state.counters.found,
            fixed = self.state.counters.fixed,
            "Agent shut down"
        );
        published?;
        released?;
        Ok(())
    }

    /// Apply a lifecycle event and publish the result. A failed status write
    /// is logged; the next write or heartbeat will catch up.
    async fn transition(&mut self, event: LifecycleEvent) {
        self.machine.handle(&event);
        if let Err(e) = self.publish().await {
            warn!(
                agent = %self.identity.name,
                status = %self.status(),
                error = %e,
                "Failed to publish status"
            );
        }
    }

    async fn publish(&self) -> Result<AgentStatusRecord, StoreError> {
        let machine = self.machine.inner();
        let status = machine.status();
        let task = machine.current_task().map(str::to_string);
        let counters = self.state.counters;
        let port = self.state.port;
        let now = Utc::now();

        self.registry
            .update_own(&self.identity, |record| {
                record.status = status;
                record.current_task = task;
                record.counters = counters;
                record.port = port;
                record.pid = std::process::id();
                record.touch(now);
            })
            .await
    }

    fn start_heartbeat(&mut self) {
        let registry = self.registry.clone();
        let identity = self.identity.clone();
        let period = self.options.heartbeat_interval;
        let cancel = CancellationToken::new();
        let stop = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        match registry.heartbeat(&identity).await {
                            Ok(at) => debug!(agent = %identity.name, at = %at, "Heartbeat"),
                            Err(e) => warn!(
                                agent = %identity.name,
                                error = %e,
                                "Heartbeat write failed; retrying next interval"
                            ),
                        }
                    }
                }
            }
            debug!(agent = %identity.name, "Heartbeat task stopped");
        });

        self.heartbeat = Some(HeartbeatTask { cancel, handle });
    }

    async fn stop_heartbeat(&mut self) {
        if let Some(task) = self.heartbeat.take() {
            task.cancel.cancel();
            if let Err(e) = task.handle.await {
                warn!(agent = %self.identity.name, error = %e, "Heartbeat task ended abnormally");
            }
        }
    }
}

impl Drop for AgentRuntime {
    fn drop(&mut self) {
        if let Some(task) = &self.heartbeat {
            task.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_lifecycle::executor::{MockFailureFixer, MockStepExecutor, StepOutcome};
    use crate::failures::Severity;
    use crate::registry::Layer;
    use crate::store::LockSettings;
    use serde_json::json;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: CoordinationStore,
        loader: WorkflowLoader,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let workflows = dir.path().join("workflows");
        std::fs::create_dir_all(&workflows).unwrap();
        std::fs::write(
            workflows.join("ui.json"),
            json!([
                {"id": "wf-a", "assigned_agent": "ui-core", "critical_path": false,
                 "steps": [
                    {"kind": "ui", "payload": {"open": "/quote"}},
                    {"kind": "ui", "payload": {"click": "#submit"}}
                 ]},
                {"id": "wf-b", "assigned_agent": "ui-core", "critical_path": true,
                 "steps": [{"kind": "api", "payload": {"get": "/health"}}]},
                {"id": "wf-other", "assigned_agent": "api-core",
                 "steps": [{"kind": "api", "payload": {"get": "/rates"}}]}
            ])
            .to_string(),
        )
        .unwrap();

        let store = CoordinationStore::new(
            dir.path().join("coordination"),
            LockSettings {
                timeout: Duration::from_secs(2),
                poll_interval: Duration::from_millis(5),
                stale_after: Duration::from_secs(30),
            },
        );
        Fixture {
            loader: WorkflowLoader::new(workflows),
            store,
            _dir: dir,
        }
    }

    fn runtime(fixture: &Fixture, executor: MockStepExecutor, lease_port: bool) -> AgentRuntime {
        AgentRuntime::new(
            AgentIdentity::parse("ui-core").unwrap(),
            fixture.store.clone(),
            fixture.loader.clone(),
            PortPool::new(9222, 2),
            RuntimeOptions {
                heartbeat_interval: Duration::from_millis(20),
                lease_port,
            },
            Arc::new(executor),
        )
    }

    fn passing_executor() -> MockStepExecutor {
        let mut executor = MockStepExecutor::new();
        executor
            .expect_execute()
            .returning(|_| StepOutcome::passed());
        executor
    }

    async fn stored(fixture: &Fixture) -> AgentStatusRecord {
        AgentRegistry::new(fixture.store.clone())
            .find(&AgentIdentity::parse("ui-core").unwrap())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_initialize_registers_active_with_sorted_partition() {
        let fixture = fixture();
        let mut runtime = runtime(&fixture, passing_executor(), true);

        runtime.initialize().await.unwrap();

        let ids: Vec<&str> = runtime.workflows().iter().map(|w| w.id.as_str()).collect();
        assert_eq!(ids, vec!["wf-b", "wf-a"]);
        assert_eq!(runtime.state().port, Some(9222));

        let record = stored(&fixture).await;
        assert_eq!(record.status, AgentStatus::Active);
        assert_eq!(record.layer, Layer::Ui);
        assert_eq!(record.port, Some(9222));
        assert_eq!(record.pid, std::process::id());

        runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_run_reports_failures_and_keeps_going() {
        let fixture = fixture();
        let mut executor = MockStepExecutor::new();
        executor.expect_execute().returning(|step| match step {
            WorkflowStep::Ui(payload) if payload.get("click").is_some() => {
                StepOutcome::failed("Element not found: #submit")
            }
            _ => StepOutcome::passed(),
        });
        let mut runtime = runtime(&fixture, executor, false);
        runtime.initialize().await.unwrap();

        let summary = runtime.run_all_workflows().await.unwrap();
        assert_eq!(
            summary,
            RunSummary {
                executed: 2,
                passed: 1,
                failed: 1,
                interrupted: false
            }
        );

        let record = stored(&fixture).await;
        assert_eq!(record.status, AgentStatus::Active);
        assert_eq!(record.current_task, None);
        assert_eq!(record.counters.tested, 2);
        assert_eq!(record.counters.found, 1);

        let queue = FailureQueue::new(fixture.store.clone())
            .list(Layer::Ui)
            .await
            .unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].origin.workflow_id, "wf-a");
        assert_eq!(queue[0].severity, Severity::High);
        assert_eq!(queue[0].reproduction_steps.len(), 2);
        assert!(queue[0].claimed_by.is_none());

        runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancellation_stops_before_next_workflow() {
        let fixture = fixture();
        let cancel = CancellationToken::new();
        let mut executor = MockStepExecutor::new();
        executor.expect_execute().times(0);
        let mut runtime = runtime(&fixture, executor, false).with_cancellation(cancel.clone());
        runtime.initialize().await.unwrap();

        cancel.cancel();
        let summary = runtime.run_all_workflows().await.unwrap();
        assert!(summary.interrupted);
        assert_eq!(summary.executed, 0);

        runtime.shutdown().await.unwrap();
        assert_eq!(stored(&fixture).await.status, AgentStatus::Idle);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_releases_port() {
        let fixture = fixture();
        let mut runtime = runtime(&fixture, passing_executor(), true);
        runtime.initialize().await.unwrap();

        runtime.shutdown().await.unwrap();
        let first = stored(&fixture).await;
        assert_eq!(first.status, AgentStatus::Idle);
        assert!(PortAllocator::new(fixture.store.clone(), PortPool::new(9222, 2))
            .leases()
            .await
            .unwrap()
            .is_empty());

        runtime.shutdown().await.unwrap();
        let second = stored(&fixture).await;
        assert_eq!(second.last_heartbeat, first.last_heartbeat);
        assert!(matches!(
            runtime.run_all_workflows().await,
            Err(RuntimeError::NotRunning { .. })
        ));
    }

    #[tokio::test]
    async fn test_heartbeat_advances_without_workflow_progress() {
        let fixture = fixture();
        let mut runtime = runtime(&fixture, passing_executor(), false);
        runtime.initialize().await.unwrap();
        let before = stored(&fixture).await;

        tokio::time::sleep(Duration::from_millis(120)).await;
        let after = stored(&fixture).await;
        assert!(after.last_heartbeat > before.last_heartbeat);
        assert_eq!(after.status, AgentStatus::Active);

        runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_registration_failure_is_fatal() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-directory");
        std::fs::write(&blocker, "").unwrap();

        let mut runtime = AgentRuntime::new(
            AgentIdentity::parse("api-core").unwrap(),
            CoordinationStore::new(&blocker, LockSettings::default()),
            WorkflowLoader::new(dir.path()),
            PortPool::new(9222, 1),
            RuntimeOptions::default(),
            Arc::new(passing_executor()),
        );
        assert!(matches!(
            runtime.initialize().await,
            Err(RuntimeError::Registration { .. })
        ));
    }

    #[tokio::test]
    async fn test_port_exhaustion_aborts_startup_and_goes_idle() {
        let fixture = fixture();
        let allocator = PortAllocator::new(fixture.store.clone(), PortPool::new(9222, 2));
        allocator.lease("ui-checkout").await.unwrap();
        allocator.lease("ui-export").await.unwrap();

        let mut runtime = runtime(&fixture, passing_executor(), true);
        assert!(matches!(
            runtime.initialize().await,
            Err(RuntimeError::Allocation(AllocationError::ResourceExhausted { .. }))
        ));
        assert_eq!(stored(&fixture).await.status, AgentStatus::Idle);
        assert_eq!(allocator.leases().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_fix_cycle_resolves_and_logs_merges() {
        let fixture = fixture();
        let queue = FailureQueue::new(fixture.store.clone());
        for id in ["F-1", "F-2", "F-3"] {
            queue
                .report(
                    FailureRecord::new(
                        FailureOrigin {
                            agent: "ui-checkout".to_string(),
                            workflow_id: "wf-a".to_string(),
                            layer: Layer::Ui,
                        },
                        Severity::Medium,
                        "expected total 42",
                        vec![],
                    )
                    .with_id(id),
                )
                .await
                .unwrap();
        }

        let mut fixer = MockFailureFixer::new();
        fixer
            .expect_attempt()
            .returning(|failure| match failure.failure_id.as_str() {
                "F-1" => FixOutcome::Fixed {
                    commit_id: "c1".to_string(),
                },
                "F-2" => FixOutcome::RolledBack {
                    commit_id: "c2".to_string(),
                    reason: "regressed wf-b".to_string(),
                },
                _ => FixOutcome::Unresolved {
                    reason: "cannot reproduce".to_string(),
                },
            });

        let mut runtime = runtime(&fixture, passing_executor(), false);
        runtime.initialize().await.unwrap();
        let summary = runtime.run_fix_cycle(&fixer).await.unwrap();
        assert_eq!(
            summary,
            FixSummary {
                attempted: 3,
                fixed: 1,
                rolled_back: 1,
                unresolved: 1
            }
        );

        let failures = queue.list(Layer::Ui).await.unwrap();
        let states: Vec<ResolutionState> = failures.iter().map(|f| f.resolution).collect();
        assert_eq!(
            states,
            vec![
                ResolutionState::Resolved,
                ResolutionState::RolledBack,
                ResolutionState::Abandoned
            ]
        );
        assert!(failures
            .iter()
            .all(|f| f.claimed_by.as_deref() == Some("ui-core")));

        let merges = MergeLog::new(fixture.store.clone()).all().await.unwrap();
        assert_eq!(merges.len(), 2);
        assert!(!merges[0].rollback);
        assert!(merges[1].rollback);

        let record = stored(&fixture).await;
        assert_eq!(record.counters.fixed, 1);
        assert_eq!(record.status, AgentStatus::Active);

        runtime.shutdown().await.unwrap();
    }
}
