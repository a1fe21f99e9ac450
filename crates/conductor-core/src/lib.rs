pub mod agent;
pub mod error;
pub mod phase;
pub mod plan;
pub mod scheduler;
pub mod task;
pub mod tools;
pub mod workflow;

// Re-export key types
pub use agent::{Agent, AgentExecutor, EchoExecutor, ShellExecutor, TaskAssignment};
pub use error::SchedulerError;
pub use phase::{Phase, PhaseTransition};
pub use plan::{load_plan, PlanRunner, PlannedTask, RunReport, WorkflowPlan};
pub use scheduler::{CancelSummary, Scheduler, SchedulerEvent, SchedulerStats};
pub use task::{NewTask, Task, TaskStatus};
pub use tools::{Tool, ToolRegistry, WorkflowTool};
pub use workflow::{CreateWorkflowOptions, Workflow, WorkflowStatus};
