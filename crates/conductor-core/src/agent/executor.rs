use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::phase::Phase;

/// Everything an agent receives when a task is dispatched to it.
#[derive(Debug, Clone)]
pub struct TaskAssignment {
    pub task_id: String,
    pub workflow_id: String,
    pub agent_id: String,
    pub title: String,
    pub phase: Phase,
    pub payload: serde_json::Value,
}

impl TaskAssignment {
    /// The payload as plain text: a string payload verbatim, otherwise its
    /// `command` or `prompt` field, otherwise the task title.
    pub fn instructions(&self) -> String {
        match &self.payload {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Object(map) => map
                .get("command")
                .or_else(|| map.get("prompt"))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .unwrap_or_else(|| self.title.clone()),
            _ => self.title.clone(),
        }
    }
}

/// Runs task payloads on behalf of an agent.
///
/// Cancellation is cooperative: implementations should watch `cancel` and
/// return early once it fires. The scheduler never aborts an execution.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(&self, assignment: TaskAssignment, cancel: CancellationToken)
        -> Result<String>;
}

/// Echoes the task instructions back without running anything.
pub struct EchoExecutor;

#[async_trait]
impl AgentExecutor for EchoExecutor {
    async fn execute(
        &self,
        assignment: TaskAssignment,
        cancel: CancellationToken,
    ) -> Result<String> {
        if cancel.is_cancelled() {
            anyhow::bail!("cancelled before start");
        }
        Ok(format!(
            "[{}] {}: {}",
            assignment.phase,
            assignment.title,
            assignment.instructions()
        ))
    }
}
