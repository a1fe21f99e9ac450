use serde::{Deserialize, Serialize};

use crate::phase::Phase;

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "completed" | "done" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Caller-supplied description of a task to enqueue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    pub title: String,
    /// Opaque work instructions handed to the executing agent.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Capability tags an agent must offer to run this task.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
}

impl NewTask {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn requires(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }
}

/// A unit of work owned by exactly one workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub workflow_id: String,
    pub title: String,
    /// Phase the owning workflow was in when the task was appended.
    pub phase: Phase,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_agent_id: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub enqueued_at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at_ms: Option<i64>,
}

impl Task {
    pub(crate) fn new(workflow_id: &str, phase: Phase, new_task: NewTask, now_ms: i64) -> Self {
        let mut capabilities = new_task.capabilities;
        capabilities.sort();
        capabilities.dedup();
        Self {
            id: uuid::Uuid::new_v4().to_string()[..8].to_string(),
            workflow_id: workflow_id.to_string(),
            title: new_task.title,
            phase,
            status: TaskStatus::Queued,
            required_capabilities: capabilities,
            assigned_agent_id: None,
            payload: new_task.payload,
            result: None,
            error: None,
            enqueued_at_ms: now_ms,
            started_at_ms: None,
            ended_at_ms: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// queued -> running. Returns false if the task was not queued.
    pub(crate) fn start(&mut self, agent_id: &str, now_ms: i64) -> bool {
        if self.status != TaskStatus::Queued {
            return false;
        }
        self.status = TaskStatus::Running;
        self.assigned_agent_id = Some(agent_id.to_string());
        self.started_at_ms = Some(now_ms);
        true
    }

    /// running -> completed/failed. A task cancelled while its agent was
    /// still working keeps its cancelled status.
    pub(crate) fn finish(&mut self, outcome: Result<String, String>, now_ms: i64) -> bool {
        if self.status != TaskStatus::Running {
            return false;
        }
        match outcome {
            Ok(output) => {
                self.status = TaskStatus::Completed;
                self.result = Some(output);
            }
            Err(error) => {
                self.status = TaskStatus::Failed;
                self.error = Some(error);
            }
        }
        self.ended_at_ms = Some(now_ms);
        true
    }

    /// queued/running -> cancelled. No-op on terminal tasks.
    pub(crate) fn cancel(&mut self, now_ms: i64) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = TaskStatus::Cancelled;
        self.ended_at_ms = Some(now_ms);
        true
    }
}
