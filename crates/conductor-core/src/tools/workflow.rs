use anyhow::Result;
use async_trait::async_trait;

use crate::error::SchedulerError;
use crate::phase::Phase;
use crate::scheduler::Scheduler;
use crate::task::NewTask;
use crate::tools::Tool;
use crate::workflow::CreateWorkflowOptions;

/// Tool for driving phased workflows on the shared scheduler.
pub struct WorkflowTool {
    scheduler: Scheduler,
}

impl WorkflowTool {
    pub fn new(scheduler: Scheduler) -> Self {
        Self { scheduler }
    }
}

fn required_str<'a>(params: &'a serde_json::Value, key: &str) -> Result<&'a str> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("missing required parameter: {key}"))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}

/// Scheduler rejections are reported to the caller, not raised.
fn rejected(err: SchedulerError) -> String {
    format!("Error ({}): {err}", err.kind())
}

#[async_trait]
impl Tool for WorkflowTool {
    fn name(&self) -> &str {
        "workflow"
    }

    fn description(&self) -> &str {
        "Manage phased development workflows. Create, list, inspect, advance, and cancel workflows, \
         enqueue tasks for agents, pause or resume dispatch, and read scheduler stats.\n\
         Phases run in order: brainstorming, planning, implementation, review, finishing."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["create", "list", "get", "transition", "enqueue", "pause", "resume", "cancel", "complete", "stats"],
                    "description": "The action to perform"
                },
                "workflow_id": {
                    "type": "string",
                    "description": "Workflow ID (required for get/transition/enqueue/cancel/complete)"
                },
                "name": {
                    "type": "string",
                    "minLength": 1,
                    "description": "Workflow name (required for 'create')"
                },
                "description": {
                    "type": "string",
                    "description": "Workflow description (for 'create')"
                },
                "branch": {
                    "type": "string",
                    "description": "Branch the workflow works on (for 'create')"
                },
                "phase": {
                    "type": "string",
                    "enum": ["brainstorming", "planning", "implementation", "review", "finishing"],
                    "description": "Target phase (required for 'transition')"
                },
                "title": {
                    "type": "string",
                    "minLength": 1,
                    "description": "Task title (required for 'enqueue')"
                },
                "payload": {
                    "description": "Opaque task payload handed to the agent (for 'enqueue')"
                },
                "capabilities": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Capability tags the agent must offer (for 'enqueue')"
                }
            },
            "required": ["action"]
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<String> {
        let action = required_str(&params, "action")?;

        match action {
            "create" => self.handle_create(&params).await,
            "list" => self.handle_list().await,
            "get" => self.handle_get(&params).await,
            "transition" => self.handle_transition(&params).await,
            "enqueue" => self.handle_enqueue(&params).await,
            "pause" => self.handle_pause(&params).await,
            "resume" => self.handle_resume(&params).await,
            "cancel" => self.handle_cancel(&params).await,
            "complete" => self.handle_complete(&params).await,
            "stats" => to_json(&self.scheduler.get_stats().await),
            _ => Ok(format!(
                "Unknown action: {action}. Use 'create', 'list', 'get', 'transition', 'enqueue', \
                 'pause', 'resume', 'cancel', 'complete', or 'stats'."
            )),
        }
    }
}

impl WorkflowTool {
    async fn handle_create(&self, params: &serde_json::Value) -> Result<String> {
        let mut options = CreateWorkflowOptions::new(required_str(params, "name")?);
        if let Some(description) = params.get("description").and_then(|v| v.as_str()) {
            options = options.description(description);
        }
        if let Some(branch) = params.get("branch").and_then(|v| v.as_str()) {
            options = options.branch(branch);
        }

        match self.scheduler.create_workflow(options).await {
            Ok(wf) => Ok(format!(
                "Workflow '{}' created (ID: {}, phase: {})",
                wf.name, wf.id, wf.current_phase
            )),
            Err(e) => Ok(rejected(e)),
        }
    }

    async fn handle_list(&self) -> Result<String> {
        let workflows = self.scheduler.list_workflows().await;
        if workflows.is_empty() {
            return Ok("No workflows.".into());
        }
        let lines: Vec<String> = workflows
            .iter()
            .map(|wf| {
                format!(
                    "- [{}] {} ({}, {}, {} task(s), {} outstanding)",
                    wf.id,
                    wf.name,
                    wf.current_phase,
                    wf.status,
                    wf.tasks.len(),
                    wf.outstanding_tasks()
                )
            })
            .collect();
        Ok(lines.join("\n"))
    }

    async fn handle_get(&self, params: &serde_json::Value) -> Result<String> {
        let id = required_str(params, "workflow_id")?;
        match self.scheduler.get_workflow_state(id).await {
            Some(wf) => to_json(&wf),
            None => Ok(rejected(SchedulerError::WorkflowNotFound { id: id.into() })),
        }
    }

    async fn handle_transition(&self, params: &serde_json::Value) -> Result<String> {
        let id = required_str(params, "workflow_id")?;
        let raw = required_str(params, "phase")?;
        let Some(phase) = Phase::from_str(raw) else {
            return Ok(format!("Unknown phase: {raw}"));
        };
        match self.scheduler.transition_workflow(id, phase).await {
            Ok(wf) => Ok(format!("Workflow {id} is now in {}", wf.current_phase)),
            Err(e) => Ok(rejected(e)),
        }
    }

    async fn handle_enqueue(&self, params: &serde_json::Value) -> Result<String> {
        let id = required_str(params, "workflow_id")?;
        let mut new_task = NewTask::new(required_str(params, "title")?);
        if let Some(payload) = params.get("payload") {
            new_task = new_task.with_payload(payload.clone());
        }
        let capabilities = params
            .get("capabilities")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str()).collect::<Vec<_>>())
            .unwrap_or_default();
        for cap in capabilities {
            new_task = new_task.requires(cap);
        }

        match self.scheduler.enqueue_task(id, new_task).await {
            Ok(task) => Ok(format!(
                "Task '{}' queued (ID: {}, phase: {})",
                task.title, task.id, task.phase
            )),
            Err(e) => Ok(rejected(e)),
        }
    }

    /// Without a workflow id, pauses the whole scheduler.
    async fn handle_pause(&self, params: &serde_json::Value) -> Result<String> {
        match params.get("workflow_id").and_then(|v| v.as_str()) {
            Some(id) => match self.scheduler.pause_workflow(id).await {
                Ok(wf) => Ok(format!("Workflow {id} is {}", wf.status)),
                Err(e) => Ok(rejected(e)),
            },
            None if self.scheduler.pause().await => Ok("Scheduler paused".into()),
            None => Ok("Scheduler already paused".into()),
        }
    }

    async fn handle_resume(&self, params: &serde_json::Value) -> Result<String> {
        match params.get("workflow_id").and_then(|v| v.as_str()) {
            Some(id) => match self.scheduler.resume_workflow(id).await {
                Ok(wf) => Ok(format!("Workflow {id} is {}", wf.status)),
                Err(e) => Ok(rejected(e)),
            },
            None if self.scheduler.resume().await => Ok("Scheduler resumed".into()),
            None => Ok("Scheduler was not paused".into()),
        }
    }

    async fn handle_cancel(&self, params: &serde_json::Value) -> Result<String> {
        let id = required_str(params, "workflow_id")?;
        match self.scheduler.cancel_all_tasks(id).await {
            Ok(summary) => Ok(format!(
                "Workflow {id} cancelled ({} queued, {} running task(s) cancelled)",
                summary.queued, summary.running
            )),
            Err(e) => Ok(rejected(e)),
        }
    }

    async fn handle_complete(&self, params: &serde_json::Value) -> Result<String> {
        let id = required_str(params, "workflow_id")?;
        match self.scheduler.complete_workflow(id).await {
            Ok(_) => Ok(format!("Workflow {id} completed")),
            Err(e) => Ok(rejected(e)),
        }
    }
}
