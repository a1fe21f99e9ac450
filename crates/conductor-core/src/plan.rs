//! Declarative workflow plans.
//!
//! A plan lists the tasks to run in each phase. [`PlanRunner`] walks the
//! phases in order on a running [`Scheduler`], only advancing once every
//! task of the current phase has settled.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::agent::Agent;
use crate::error::SchedulerError;
use crate::phase::Phase;
use crate::scheduler::Scheduler;
use crate::task::{NewTask, TaskStatus};
use crate::workflow::{CreateWorkflowOptions, Workflow, WorkflowStatus};

/// One task in a plan. `command` is shorthand for `{"command": ...}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedTask {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
}

impl PlannedTask {
    pub fn to_new_task(&self) -> NewTask {
        let payload = match (&self.command, &self.payload) {
            (None, payload) => payload.clone(),
            (Some(cmd), serde_json::Value::Object(map)) => {
                let mut map = map.clone();
                map.insert("command".into(), serde_json::Value::String(cmd.clone()));
                serde_json::Value::Object(map)
            }
            (Some(cmd), _) => serde_json::json!({ "command": cmd }),
        };
        let mut task = NewTask::new(self.title.clone()).with_payload(payload);
        for cap in &self.capabilities {
            task = task.requires(cap.clone());
        }
        task
    }

    fn covered_by(&self, offered: &[Vec<String>]) -> bool {
        offered
            .iter()
            .any(|tags| self.capabilities.iter().all(|c| tags.contains(c)))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowPlan {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default)]
    pub phases: BTreeMap<Phase, Vec<PlannedTask>>,
}

impl WorkflowPlan {
    /// Tasks of `phase`, empty when the plan skips it.
    pub fn tasks(&self, phase: Phase) -> &[PlannedTask] {
        self.phases.get(&phase).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn task_count(&self) -> usize {
        self.phases.values().map(Vec::len).sum()
    }

    /// Structural checks: a name, and a non-blank title and command for
    /// every task.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("plan has no name");
        }
        for phase in Phase::ALL {
            for (i, task) in self.tasks(phase).iter().enumerate() {
                if task.title.trim().is_empty() {
                    anyhow::bail!("{phase} task #{} has no title", i + 1);
                }
                if task.command.as_deref().is_some_and(|c| c.trim().is_empty()) {
                    anyhow::bail!("{phase} task '{}' has an empty command", task.title);
                }
            }
        }
        Ok(())
    }

    /// Tasks no agent with the `offered` capability sets could run.
    pub fn uncovered_tasks(&self, offered: &[Vec<String>]) -> Vec<(Phase, &PlannedTask)> {
        Phase::ALL
            .iter()
            .flat_map(|phase| self.tasks(*phase).iter().map(move |t| (*phase, t)))
            .filter(|(_, task)| !task.covered_by(offered))
            .collect()
    }
}

/// Read and validate a plan file.
pub fn load_plan(path: &Path) -> Result<WorkflowPlan> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read plan {}", path.display()))?;
    let plan: WorkflowPlan = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse plan {}", path.display()))?;
    plan.validate()
        .with_context(|| format!("invalid plan {}", path.display()))?;
    Ok(plan)
}

/// Outcome of a plan run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub workflow: Workflow,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.workflow.status == WorkflowStatus::Completed
    }
}

/// Drives a [`WorkflowPlan`] through its phases. The scheduler's dispatch
/// loop must be running.
pub struct PlanRunner {
    scheduler: Scheduler,
}

impl PlanRunner {
    pub fn new(scheduler: Scheduler) -> Self {
        Self { scheduler }
    }

    pub async fn run(&self, plan: &WorkflowPlan) -> Result<RunReport, SchedulerError> {
        let started = Instant::now();
        let mut options = CreateWorkflowOptions::new(plan.name.clone());
        if let Some(description) = &plan.description {
            options = options.description(description.clone());
        }
        if let Some(branch) = &plan.branch {
            options = options.branch(branch.clone());
        }
        let id = self.scheduler.create_workflow(options).await?.id;

        let offered: Vec<Vec<String>> = self
            .scheduler
            .list_agents()
            .await
            .into_iter()
            .map(|a: Agent| a.capabilities)
            .collect();

        for phase in Phase::ALL {
            if phase != Phase::INITIAL {
                self.scheduler.transition_workflow(&id, phase).await?;
            }

            let tasks = plan.tasks(phase);
            if let Some(task) = tasks.iter().find(|t| !t.covered_by(&offered)) {
                let reason = format!(
                    "no agent offers {:?} for {phase} task '{}'",
                    task.capabilities, task.title
                );
                self.scheduler.fail_workflow(&id, &reason).await?;
                break;
            }

            info!("Workflow {id}: running {} {phase} task(s)", tasks.len());
            for task in tasks {
                self.scheduler.enqueue_task(&id, task.to_new_task()).await?;
            }

            let state = self.scheduler.wait_for_workflow_idle(&id).await?;
            if state.status.is_terminal() {
                break;
            }
            let failed = state
                .tasks
                .iter()
                .filter(|t| t.phase == phase && t.status == TaskStatus::Failed)
                .count();
            if failed > 0 {
                let reason = format!("{failed} {phase} task(s) failed");
                warn!("Workflow {id}: {reason}");
                self.scheduler.fail_workflow(&id, &reason).await?;
                break;
            }
        }

        let state = self
            .scheduler
            .get_workflow_state(&id)
            .await
            .ok_or_else(|| SchedulerError::WorkflowNotFound { id: id.clone() })?;
        let workflow = if state.status.is_terminal() {
            state
        } else {
            self.scheduler.complete_workflow(&id).await?
        };

        Ok(RunReport {
            workflow,
            elapsed: started.elapsed(),
        })
    }
}
