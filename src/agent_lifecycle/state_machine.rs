use statig::prelude::*;

use crate::registry::AgentStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Activate,
    BeginTesting { workflow_id: String },
    BeginFixing { failure_id: String },
    Finish,
    Shutdown,
}

/// Lifecycle of one agent process.
///
/// `initializing -> active -> {testing | fixing} -> active -> idle`. Idle is
/// terminal. Crashed never appears here; observers derive it from heartbeat
/// staleness.
#[derive(Debug)]
pub struct LifecycleMachine {
    agent: String,
    status: AgentStatus,
    current_task: Option<String>,
}

impl LifecycleMachine {
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            status: AgentStatus::Initializing,
            current_task: None,
        }
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub fn status(&self) -> AgentStatus {
        self.status
    }

    pub fn current_task(&self) -> Option<&str> {
        self.current_task.as_deref()
    }

    pub fn is_idle(&self) -> bool {
        self.status == AgentStatus::Idle
    }

    fn enter(&mut self, status: AgentStatus, task: Option<String>) {
        tracing::debug!(
            agent = %self.agent,
            from = %self.status,
            to = %status,
            task = ?task,
            "Lifecycle transition"
        );
        self.status = status;
        self.current_task = task;
    }
}

#[state_machine(initial = "State::initializing()")]
impl LifecycleMachine {
    #[state]
    fn initializing(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Activate => {
                self.enter(AgentStatus::Active, None);
                Transition(State::active())
            }
            LifecycleEvent::Shutdown => {
                self.enter(AgentStatus::Idle, None);
                Transition(State::idle())
            }
            _ => Handled,
        }
    }

    #[state]
    fn active(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::BeginTesting { workflow_id } => {
                self.enter(AgentStatus::Testing, Some(workflow_id.clone()));
                Transition(State::testing())
            }
            LifecycleEvent::BeginFixing { failure_id } => {
                self.enter(AgentStatus::Fixing, Some(failure_id.clone()));
                Transition(State::fixing())
            }
            LifecycleEvent::Shutdown => {
                self.enter(AgentStatus::Idle, None);
                Transition(State::idle())
            }
            _ => Handled,
        }
    }

    #[state]
    fn testing(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Finish => {
                self.enter(AgentStatus::Active, None);
                Transition(State::active())
            }
            LifecycleEvent::Shutdown => {
                self.enter(AgentStatus::Idle, None);
                Transition(State::idle())
            }
            _ => Handled,
        }
    }

    #[state]
    fn fixing(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Finish => {
                self.enter(AgentStatus::Active, None);
                Transition(State::active())
            }
            LifecycleEvent::Shutdown => {
                self.enter(AgentStatus::Idle, None);
                Transition(State::idle())
            }
            _ => Handled,
        }
    }

    #[state]
    fn idle(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        tracing::debug!(agent = %self.agent, event = ?event, "Ignoring event after shutdown");
        Handled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_testing_round_trip() {
        let mut sm = LifecycleMachine::new("api-core").state_machine();
        assert_eq!(sm.inner().status(), AgentStatus::Initializing);

        sm.handle(&LifecycleEvent::Activate);
        assert_eq!(sm.inner().status(), AgentStatus::Active);

        sm.handle(&LifecycleEvent::BeginTesting {
            workflow_id: "wf-b".to_string(),
        });
        assert_eq!(sm.inner().status(), AgentStatus::Testing);
        assert_eq!(sm.inner().current_task(), Some("wf-b"));

        sm.handle(&LifecycleEvent::Finish);
        assert_eq!(sm.inner().status(), AgentStatus::Active);
        assert_eq!(sm.inner().current_task(), None);
    }

    #[test]
    fn test_cannot_test_before_activation() {
        let mut sm = LifecycleMachine::new("ui-core").state_machine();
        sm.handle(&LifecycleEvent::BeginTesting {
            workflow_id: "wf-a".to_string(),
        });
        assert_eq!(sm.inner().status(), AgentStatus::Initializing);
        assert_eq!(sm.inner().current_task(), None);
    }

    #[test]
    fn test_fixing_cannot_start_while_testing() {
        let mut sm = LifecycleMachine::new("ui-core").state_machine();
        sm.handle(&LifecycleEvent::Activate);
        sm.handle(&LifecycleEvent::BeginTesting {
            workflow_id: "wf-a".to_string(),
        });
        sm.handle(&LifecycleEvent::BeginFixing {
            failure_id: "F-1".to_string(),
        });
        assert_eq!(sm.inner().status(), AgentStatus::Testing);
        assert_eq!(sm.inner().current_task(), Some("wf-a"));
    }

    #[test]
    fn test_idle_is_terminal() {
        let mut sm = LifecycleMachine::new("integration-core").state_machine();
        sm.handle(&LifecycleEvent::Activate);
        sm.handle(&LifecycleEvent::BeginFixing {
            failure_id: "F-7".to_string(),
        });
        sm.handle(&LifecycleEvent::Shutdown);
        assert!(sm.inner().is_idle());

        sm.handle(&LifecycleEvent::Activate);
        sm.handle(&LifecycleEvent::BeginTesting {
            workflow_id: "wf-a".to_string(),
        });
        assert!(sm.inner().is_idle());
        assert_eq!(sm.inner().current_task(), None);
    }
}
