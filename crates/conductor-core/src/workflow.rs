use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};
use crate::phase::{validate_transition, Phase, PhaseTransition};
use crate::task::{Task, TaskStatus};

/// Workflow lifecycle status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Active,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &str {
        match self {
            WorkflowStatus::Active => "active",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options for creating a workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWorkflowOptions {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Version-control branch the workflow is bound to.
    #[serde(default)]
    pub branch: Option<String>,
}

impl CreateWorkflowOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }
}

/// A phase-ordered session of orchestrated work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    pub status: WorkflowStatus,
    pub current_phase: Phase,
    pub phase_history: Vec<PhaseTransition>,
    pub tasks: Vec<Task>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl Workflow {
    fn new(options: CreateWorkflowOptions, now_ms: i64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string()[..8].to_string(),
            name: options.name.trim().to_string(),
            description: options.description.unwrap_or_default(),
            branch: options.branch.filter(|b| !b.trim().is_empty()),
            status: WorkflowStatus::Active,
            current_phase: Phase::INITIAL,
            phase_history: Vec::new(),
            tasks: Vec::new(),
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            ended_at_ms: None,
            failure_reason: None,
        }
    }

    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub(crate) fn task_mut(&mut self, task_id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == task_id)
    }

    pub fn count_tasks(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    /// Tasks still queued or running.
    pub fn outstanding_tasks(&self) -> usize {
        self.tasks.iter().filter(|t| !t.is_terminal()).count()
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(SchedulerError::WorkflowClosed {
                id: self.id.clone(),
                status: self.status,
            });
        }
        Ok(())
    }

    /// Advance to `target`, which must be the immediate successor of the
    /// current phase. The workflow is untouched on error.
    pub(crate) fn transition(&mut self, target: Phase, now_ms: i64) -> Result<PhaseTransition> {
        self.ensure_open()?;
        validate_transition(self.current_phase, target)?;
        let record = PhaseTransition {
            from: self.current_phase,
            to: target,
            timestamp_ms: now_ms,
        };
        self.phase_history.push(record.clone());
        self.current_phase = target;
        self.updated_at_ms = now_ms;
        Ok(record)
    }

    pub(crate) fn set_status(&mut self, status: WorkflowStatus, now_ms: i64) {
        self.status = status;
        self.updated_at_ms = now_ms;
        if status.is_terminal() {
            self.ended_at_ms = Some(now_ms);
        }
    }
}

/// Owns every workflow created in this process, in creation order.
#[derive(Debug, Default)]
pub struct WorkflowStore {
    workflows: Vec<Workflow>,
    index: HashMap<String, usize>,
}

impl WorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, options: CreateWorkflowOptions, now_ms: i64) -> Result<&Workflow> {
        if options.name.trim().is_empty() {
            return Err(SchedulerError::InvalidWorkflow {
                reason: "name must not be empty".into(),
            });
        }
        let mut workflow = Workflow::new(options, now_ms);
        while self.index.contains_key(&workflow.id) {
            workflow.id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        }
        let idx = self.workflows.len();
        self.index.insert(workflow.id.clone(), idx);
        self.workflows.push(workflow);
        Ok(&self.workflows[idx])
    }

    pub fn list(&self) -> &[Workflow] {
        &self.workflows
    }

    pub fn get(&self, id: &str) -> Option<&Workflow> {
        self.index.get(id).map(|&idx| &self.workflows[idx])
    }

    pub(crate) fn get_mut(&mut self, id: &str) -> Option<&mut Workflow> {
        match self.index.get(id) {
            Some(&idx) => Some(&mut self.workflows[idx]),
            None => None,
        }
    }

    pub(crate) fn require_mut(&mut self, id: &str) -> Result<&mut Workflow> {
        self.get_mut(id)
            .ok_or_else(|| SchedulerError::WorkflowNotFound { id: id.to_string() })
    }

    pub fn find_task(&self, task_id: &str) -> Option<&Task> {
        self.workflows.iter().find_map(|w| w.task(task_id))
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.workflows.clear();
        self.index.clear();
    }
}
