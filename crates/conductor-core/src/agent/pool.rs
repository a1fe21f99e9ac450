use std::sync::Arc;

use serde::Serialize;

use super::executor::AgentExecutor;
use crate::error::{Result, SchedulerError};

/// Whether an agent can take a new task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    Idle,
    Busy,
}

/// How an agent's last task ended, for its counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Failed,
    Cancelled,
}

/// A registered worker identity.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    pub capabilities: Vec<String>,
    pub availability: Availability,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<String>,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub registered_at_ms: i64,
}

impl Agent {
    pub fn is_idle(&self) -> bool {
        self.availability == Availability::Idle
    }

    /// Every required tag must be offered. No requirements match any agent.
    pub fn can_run(&self, required: &[String]) -> bool {
        required.iter().all(|cap| self.capabilities.contains(cap))
    }
}

struct AgentSlot {
    agent: Agent,
    executor: Arc<dyn AgentExecutor>,
}

/// Registry of agents in registration order.
#[derive(Default)]
pub struct AgentPool {
    slots: Vec<AgentSlot>,
}

impl AgentPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        id: &str,
        capabilities: Vec<String>,
        executor: Arc<dyn AgentExecutor>,
        now_ms: i64,
    ) -> Result<&Agent> {
        if self.slots.iter().any(|s| s.agent.id == id) {
            return Err(SchedulerError::AgentAlreadyRegistered { id: id.to_string() });
        }
        let mut capabilities = capabilities;
        capabilities.sort();
        capabilities.dedup();
        self.slots.push(AgentSlot {
            agent: Agent {
                id: id.to_string(),
                capabilities,
                availability: Availability::Idle,
                current_task_id: None,
                tasks_completed: 0,
                tasks_failed: 0,
                registered_at_ms: now_ms,
            },
            executor,
        });
        Ok(&self.slots[self.slots.len() - 1].agent)
    }

    pub fn get(&self, id: &str) -> Option<&Agent> {
        self.slots.iter().map(|s| &s.agent).find(|a| a.id == id)
    }

    pub fn agents(&self) -> impl Iterator<Item = &Agent> {
        self.slots.iter().map(|s| &s.agent)
    }

    pub fn total(&self) -> usize {
        self.slots.len()
    }

    pub fn idle_count(&self) -> usize {
        self.agents().filter(|a| a.is_idle()).count()
    }

    /// Index of the first idle agent able to run a task with `required` tags.
    pub(crate) fn find_idle(&self, required: &[String]) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.agent.is_idle() && s.agent.can_run(required))
    }

    /// Whether any registered agent, busy or not, could ever run `required`.
    pub fn any_capable(&self, required: &[String]) -> bool {
        self.agents().any(|a| a.can_run(required))
    }

    /// Mark the agent at `idx` busy with `task_id`.
    pub(crate) fn claim(&mut self, idx: usize, task_id: &str) -> (String, Arc<dyn AgentExecutor>) {
        let slot = &mut self.slots[idx];
        debug_assert!(slot.agent.is_idle());
        slot.agent.availability = Availability::Busy;
        slot.agent.current_task_id = Some(task_id.to_string());
        (slot.agent.id.clone(), Arc::clone(&slot.executor))
    }

    /// Return a busy agent to idle. Returns false if it was not busy.
    pub(crate) fn release(&mut self, agent_id: &str, outcome: TaskOutcome) -> bool {
        let Some(slot) = self.slots.iter_mut().find(|s| s.agent.id == agent_id) else {
            return false;
        };
        if slot.agent.is_idle() {
            return false;
        }
        slot.agent.availability = Availability::Idle;
        slot.agent.current_task_id = None;
        match outcome {
            TaskOutcome::Completed => slot.agent.tasks_completed += 1,
            TaskOutcome::Failed => slot.agent.tasks_failed += 1,
            TaskOutcome::Cancelled => {}
        }
        true
    }
}
