use crate::phase::Phase;
use crate::workflow::WorkflowStatus;

/// Errors returned by scheduler and workflow operations.
///
/// Every variant is raised before any state is touched, so a failed call
/// leaves workflows, tasks and agents exactly as they were.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("Invalid phase transition: {from} -> {to}")]
    InvalidTransition { from: Phase, to: Phase },

    #[error("Workflow is already in the final phase ({phase})")]
    AlreadyAtFinalPhase { phase: Phase },

    #[error("Workflow not found: {id}")]
    WorkflowNotFound { id: String },

    #[error("Task not found: {id}")]
    TaskNotFound { id: String },

    #[error("No registered agent offers {required:?} (task {task_id})")]
    CapabilityMismatch {
        task_id: String,
        required: Vec<String>,
    },

    #[error("Workflow {id} is {status} and accepts no further changes")]
    WorkflowClosed { id: String, status: WorkflowStatus },

    #[error("Workflow {id} is in phase {phase}; completion requires finishing")]
    WorkflowNotFinished { id: String, phase: Phase },

    #[error("Workflow {id} still has {count} outstanding task(s)")]
    OutstandingTasks { id: String, count: usize },

    #[error("Agent already registered: {id}")]
    AgentAlreadyRegistered { id: String },

    #[error("Invalid workflow: {reason}")]
    InvalidWorkflow { reason: String },
}

impl SchedulerError {
    /// Stable machine-readable kind for presentation layers.
    pub fn kind(&self) -> &'static str {
        match self {
            SchedulerError::InvalidTransition { .. } => "invalid_transition",
            SchedulerError::AlreadyAtFinalPhase { .. } => "already_at_final_phase",
            SchedulerError::WorkflowNotFound { .. } => "workflow_not_found",
            SchedulerError::TaskNotFound { .. } => "task_not_found",
            SchedulerError::CapabilityMismatch { .. } => "capability_mismatch",
            SchedulerError::WorkflowClosed { .. } => "workflow_closed",
            SchedulerError::WorkflowNotFinished { .. } => "workflow_not_finished",
            SchedulerError::OutstandingTasks { .. } => "outstanding_tasks",
            SchedulerError::AgentAlreadyRegistered { .. } => "agent_already_registered",
            SchedulerError::InvalidWorkflow { .. } => "invalid_workflow",
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
