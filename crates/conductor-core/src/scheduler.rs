//! Subagent workflow scheduler.
//!
//! [`Scheduler`] owns every workflow, the shared queue of queued tasks and the
//! agent pool behind a single mutex. A dispatch pass matches queued tasks to
//! idle agents and spawns their executions; completions return the agent to
//! the pool and wake the dispatch loop again.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use conductor_config::{Config, FairnessPolicy, SchedulerConfig};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{build_executor, Agent, AgentExecutor, AgentPool, TaskAssignment, TaskOutcome};
use crate::error::{Result, SchedulerError};
use crate::phase::Phase;
use crate::task::{NewTask, Task, TaskStatus};
use crate::workflow::{CreateWorkflowOptions, Workflow, WorkflowStatus, WorkflowStore};

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Point-in-time aggregate counts, computed under the scheduler lock.
///
/// `busy_agents` can exceed `running_tasks`: a cancelled task leaves the
/// running count at once, but its agent stays busy until the executor
/// returns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStats {
    pub active_workflows: usize,
    pub paused_workflows: usize,
    pub queued_tasks: usize,
    pub running_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub cancelled_tasks: usize,
    pub total_agents: usize,
    pub idle_agents: usize,
    pub busy_agents: usize,
    pub paused: bool,
    pub uptime_ms: u64,
}

/// Tasks withdrawn by a cancellation sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CancelSummary {
    pub queued: usize,
    pub running: usize,
}

impl CancelSummary {
    pub fn total(&self) -> usize {
        self.queued + self.running
    }
}

/// State changes broadcast to subscribers such as dashboards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerEvent {
    WorkflowCreated {
        workflow_id: String,
    },
    PhaseChanged {
        workflow_id: String,
        from: Phase,
        to: Phase,
    },
    WorkflowStatusChanged {
        workflow_id: String,
        status: WorkflowStatus,
    },
    TaskQueued {
        workflow_id: String,
        task_id: String,
    },
    TaskStarted {
        workflow_id: String,
        task_id: String,
        agent_id: String,
    },
    TaskCompleted {
        workflow_id: String,
        task_id: String,
        agent_id: String,
    },
    TaskFailed {
        workflow_id: String,
        task_id: String,
        agent_id: String,
        error: String,
    },
    TaskCancelled {
        workflow_id: String,
        task_id: String,
    },
    AgentReleased {
        agent_id: String,
        task_id: String,
    },
    Paused,
    Resumed,
}

impl SchedulerEvent {
    pub fn workflow_id(&self) -> Option<&str> {
        match self {
            SchedulerEvent::WorkflowCreated { workflow_id }
            | SchedulerEvent::PhaseChanged { workflow_id, .. }
            | SchedulerEvent::WorkflowStatusChanged { workflow_id, .. }
            | SchedulerEvent::TaskQueued { workflow_id, .. }
            | SchedulerEvent::TaskStarted { workflow_id, .. }
            | SchedulerEvent::TaskCompleted { workflow_id, .. }
            | SchedulerEvent::TaskFailed { workflow_id, .. }
            | SchedulerEvent::TaskCancelled { workflow_id, .. } => Some(workflow_id),
            SchedulerEvent::AgentReleased { .. }
            | SchedulerEvent::Paused
            | SchedulerEvent::Resumed => None,
        }
    }
}

struct QueueEntry {
    workflow_id: String,
    task_id: String,
}

/// An execution in flight. Kept until the executor returns, so the agent
/// stays busy even if the task was cancelled underneath it.
struct RunningTask {
    workflow_id: String,
    agent_id: String,
    cancel: CancellationToken,
}

struct Launch {
    assignment: TaskAssignment,
    executor: Arc<dyn AgentExecutor>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct SchedulerState {
    workflows: WorkflowStore,
    queue: VecDeque<QueueEntry>,
    agents: AgentPool,
    running: HashMap<String, RunningTask>,
    paused: bool,
    /// Dispatch sequence number at which each workflow was last served.
    last_served: HashMap<String, u64>,
    dispatch_seq: u64,
}

impl SchedulerState {
    /// Queue position and agent slot of the next task to dispatch.
    fn pick_next(&self, fairness: FairnessPolicy) -> Option<(usize, usize)> {
        let mut best: Option<(usize, usize, u64)> = None;
        for (qi, entry) in self.queue.iter().enumerate() {
            let Some(wf) = self.workflows.get(&entry.workflow_id) else {
                continue;
            };
            if wf.status != WorkflowStatus::Active {
                continue;
            }
            let Some(task) = wf.task(&entry.task_id) else {
                continue;
            };
            let Some(ai) = self.agents.find_idle(&task.required_capabilities) else {
                continue;
            };
            match fairness {
                FairnessPolicy::Fifo => return Some((qi, ai)),
                FairnessPolicy::RoundRobin => {
                    let rank = self
                        .last_served
                        .get(&entry.workflow_id)
                        .copied()
                        .unwrap_or(0);
                    if best.map_or(true, |(_, _, r)| rank < r) {
                        best = Some((qi, ai, rank));
                    }
                }
            }
        }
        best.map(|(qi, ai, _)| (qi, ai))
    }

    fn dispatch(
        &mut self,
        fairness: FairnessPolicy,
        shutdown: &CancellationToken,
        now: i64,
        events: &mut Vec<SchedulerEvent>,
    ) -> Vec<Launch> {
        let mut launches = Vec::new();
        if self.paused {
            return launches;
        }
        while let Some((qi, ai)) = self.pick_next(fairness) {
            let Some(entry) = self.queue.remove(qi) else {
                break;
            };
            let Some(task) = self
                .workflows
                .get_mut(&entry.workflow_id)
                .and_then(|wf| wf.task_mut(&entry.task_id))
            else {
                continue;
            };
            let (agent_id, executor) = self.agents.claim(ai, &entry.task_id);
            task.start(&agent_id, now);

            let assignment = TaskAssignment {
                task_id: task.id.clone(),
                workflow_id: task.workflow_id.clone(),
                agent_id: agent_id.clone(),
                title: task.title.clone(),
                phase: task.phase,
                payload: task.payload.clone(),
            };
            let cancel = shutdown.child_token();
            self.running.insert(
                entry.task_id.clone(),
                RunningTask {
                    workflow_id: entry.workflow_id.clone(),
                    agent_id: agent_id.clone(),
                    cancel: cancel.clone(),
                },
            );
            self.dispatch_seq += 1;
            self.last_served
                .insert(entry.workflow_id.clone(), self.dispatch_seq);

            info!(
                "Dispatched task {} ({}) to agent {agent_id}",
                entry.task_id, assignment.title
            );
            events.push(SchedulerEvent::TaskStarted {
                workflow_id: entry.workflow_id,
                task_id: entry.task_id,
                agent_id,
            });
            launches.push(Launch {
                assignment,
                executor,
                cancel,
            });
        }
        launches
    }
}

/// Cancel every outstanding task of `wf`, signalling running executions.
fn withdraw_tasks(
    wf: &mut Workflow,
    running: &HashMap<String, RunningTask>,
    now: i64,
    events: &mut Vec<SchedulerEvent>,
) -> CancelSummary {
    let mut summary = CancelSummary::default();
    for task in wf.tasks.iter_mut() {
        let was = task.status;
        if !task.cancel(now) {
            continue;
        }
        if was == TaskStatus::Running {
            summary.running += 1;
            if let Some(run) = running.get(&task.id) {
                run.cancel.cancel();
            }
        } else {
            summary.queued += 1;
        }
        events.push(SchedulerEvent::TaskCancelled {
            workflow_id: wf.id.clone(),
            task_id: task.id.clone(),
        });
    }
    summary
}

/// Settle a workflow sitting in the final phase with nothing outstanding.
fn settle_if_finished(wf: &mut Workflow, now: i64) -> Option<SchedulerEvent> {
    let has_final_tasks = wf.tasks.iter().any(|t| t.phase.is_final());
    if wf.status != WorkflowStatus::Active
        || !wf.current_phase.is_final()
        || !has_final_tasks
        || wf.outstanding_tasks() > 0
    {
        return None;
    }
    let status = if wf.count_tasks(TaskStatus::Failed) > 0 {
        wf.failure_reason = Some("one or more tasks failed".into());
        WorkflowStatus::Failed
    } else {
        WorkflowStatus::Completed
    };
    wf.set_status(status, now);
    info!("Workflow {} settled as {status}", wf.id);
    Some(SchedulerEvent::WorkflowStatusChanged {
        workflow_id: wf.id.clone(),
        status,
    })
}

struct Inner {
    state: Mutex<SchedulerState>,
    wake: Notify,
    events: broadcast::Sender<SchedulerEvent>,
    config: SchedulerConfig,
    started_at: Instant,
    shutdown: CancellationToken,
}

/// Handle to the process-wide scheduler. Cheap to clone; all clones share
/// the same state.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(SchedulerState::default()),
                wake: Notify::new(),
                events,
                config,
                started_at: Instant::now(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Build a scheduler and register the configured agent roster.
    pub async fn from_config(config: &Config, dry_run: bool) -> Result<Self> {
        let scheduler = Self::new(config.scheduler.clone());
        let workspace = conductor_config::resolve_workspace(&config.workspace);
        for agent in &config.agents {
            let executor = build_executor(agent, &workspace, dry_run);
            scheduler
                .register_agent(&agent.id, agent.capabilities.clone(), executor)
                .await?;
        }
        Ok(scheduler)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, events: Vec<SchedulerEvent>) {
        for event in events {
            // No subscribers is fine.
            let _ = self.inner.events.send(event);
        }
    }

    fn wake(&self) {
        self.inner.wake.notify_one();
    }

    // ------------------------------------------------------------------
    // Agents
    // ------------------------------------------------------------------

    pub async fn register_agent(
        &self,
        id: &str,
        capabilities: Vec<String>,
        executor: Arc<dyn AgentExecutor>,
    ) -> Result<Agent> {
        let agent = {
            let mut state = self.inner.state.lock().await;
            state
                .agents
                .register(id, capabilities, executor, now_ms())?
                .clone()
        };
        info!(
            "Registered agent {} with capabilities {:?}",
            agent.id, agent.capabilities
        );
        self.wake();
        Ok(agent)
    }

    pub async fn list_agents(&self) -> Vec<Agent> {
        let state = self.inner.state.lock().await;
        state.agents.agents().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Workflows
    // ------------------------------------------------------------------

    pub async fn create_workflow(&self, options: CreateWorkflowOptions) -> Result<Workflow> {
        let workflow = {
            let mut state = self.inner.state.lock().await;
            state.workflows.create(options, now_ms())?.clone()
        };
        info!("Created workflow '{}' (id: {})", workflow.name, workflow.id);
        self.emit(vec![SchedulerEvent::WorkflowCreated {
            workflow_id: workflow.id.clone(),
        }]);
        Ok(workflow)
    }

    /// All workflows in creation order.
    pub async fn list_workflows(&self) -> Vec<Workflow> {
        let state = self.inner.state.lock().await;
        state.workflows.list().to_vec()
    }

    pub async fn get_workflow_state(&self, id: &str) -> Option<Workflow> {
        let state = self.inner.state.lock().await;
        state.workflows.get(id).cloned()
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Task> {
        let state = self.inner.state.lock().await;
        state
            .workflows
            .find_task(task_id)
            .cloned()
            .ok_or_else(|| SchedulerError::TaskNotFound {
                id: task_id.to_string(),
            })
    }

    /// Advance a workflow to `target`, its immediate successor phase.
    pub async fn transition_workflow(&self, id: &str, target: Phase) -> Result<Workflow> {
        let (workflow, record) = {
            let mut state = self.inner.state.lock().await;
            let wf = state.workflows.require_mut(id)?;
            let record = wf.transition(target, now_ms())?;
            (wf.clone(), record)
        };
        info!("Workflow {id} moved {} -> {}", record.from, record.to);
        self.emit(vec![SchedulerEvent::PhaseChanged {
            workflow_id: id.to_string(),
            from: record.from,
            to: record.to,
        }]);
        Ok(workflow)
    }

    /// Stop dispatching this workflow's tasks; running tasks continue.
    pub async fn pause_workflow(&self, id: &str) -> Result<Workflow> {
        self.set_workflow_paused(id, true).await
    }

    pub async fn resume_workflow(&self, id: &str) -> Result<Workflow> {
        let workflow = self.set_workflow_paused(id, false).await?;
        self.wake();
        Ok(workflow)
    }

    async fn set_workflow_paused(&self, id: &str, paused: bool) -> Result<Workflow> {
        let (from, to) = if paused {
            (WorkflowStatus::Active, WorkflowStatus::Paused)
        } else {
            (WorkflowStatus::Paused, WorkflowStatus::Active)
        };
        let mut events = Vec::new();
        let workflow = {
            let mut state = self.inner.state.lock().await;
            let wf = state.workflows.require_mut(id)?;
            wf.ensure_open()?;
            if wf.status == from {
                wf.set_status(to, now_ms());
                events.push(SchedulerEvent::WorkflowStatusChanged {
                    workflow_id: id.to_string(),
                    status: to,
                });
                info!("Workflow {id} is now {to}");
            }
            wf.clone()
        };
        self.emit(events);
        Ok(workflow)
    }

    /// Mark a workflow completed. It must be in the final phase with no
    /// queued or running tasks.
    pub async fn complete_workflow(&self, id: &str) -> Result<Workflow> {
        let workflow = {
            let mut state = self.inner.state.lock().await;
            let wf = state.workflows.require_mut(id)?;
            wf.ensure_open()?;
            if !wf.current_phase.is_final() {
                return Err(SchedulerError::WorkflowNotFinished {
                    id: id.to_string(),
                    phase: wf.current_phase,
                });
            }
            let outstanding = wf.outstanding_tasks();
            if outstanding > 0 {
                return Err(SchedulerError::OutstandingTasks {
                    id: id.to_string(),
                    count: outstanding,
                });
            }
            wf.set_status(WorkflowStatus::Completed, now_ms());
            wf.clone()
        };
        info!("Workflow {id} completed");
        self.emit(vec![SchedulerEvent::WorkflowStatusChanged {
            workflow_id: id.to_string(),
            status: WorkflowStatus::Completed,
        }]);
        Ok(workflow)
    }

    /// Mark a workflow failed, withdrawing its outstanding tasks as cancelled.
    pub async fn fail_workflow(&self, id: &str, reason: &str) -> Result<Workflow> {
        let now = now_ms();
        let mut events = Vec::new();
        let workflow = {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            let wf = state.workflows.require_mut(id)?;
            wf.ensure_open()?;
            let summary = withdraw_tasks(wf, &state.running, now, &mut events);
            state.queue.retain(|e| e.workflow_id != id);
            wf.failure_reason = Some(reason.to_string());
            wf.set_status(WorkflowStatus::Failed, now);
            if summary.total() > 0 {
                debug!("Withdrew {} task(s) from failed workflow {id}", summary.total());
            }
            wf.clone()
        };
        warn!("Workflow {id} failed: {reason}");
        events.push(SchedulerEvent::WorkflowStatusChanged {
            workflow_id: id.to_string(),
            status: WorkflowStatus::Failed,
        });
        self.emit(events);
        Ok(workflow)
    }

    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------

    /// Append a queued task to a workflow and the shared queue.
    ///
    /// A task no registered agent can run is still accepted; it stays queued
    /// until a capable agent registers.
    pub async fn enqueue_task(&self, workflow_id: &str, new_task: NewTask) -> Result<Task> {
        let now = now_ms();
        let task = {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            let phase = {
                let wf = state.workflows.get(workflow_id).ok_or_else(|| {
                    SchedulerError::WorkflowNotFound {
                        id: workflow_id.to_string(),
                    }
                })?;
                wf.ensure_open()?;
                wf.current_phase
            };

            let mut task = Task::new(workflow_id, phase, new_task, now);
            while state.workflows.find_task(&task.id).is_some() {
                task.id = uuid::Uuid::new_v4().to_string()[..8].to_string();
            }
            if !state.agents.any_capable(&task.required_capabilities) {
                let gap = SchedulerError::CapabilityMismatch {
                    task_id: task.id.clone(),
                    required: task.required_capabilities.clone(),
                };
                warn!("{gap}; task stays queued");
            }

            let wf = state.workflows.require_mut(workflow_id)?;
            wf.tasks.push(task.clone());
            wf.updated_at_ms = now;
            state.queue.push_back(QueueEntry {
                workflow_id: workflow_id.to_string(),
                task_id: task.id.clone(),
            });
            // Sent before unlocking so no dispatch event can overtake it.
            self.emit(vec![SchedulerEvent::TaskQueued {
                workflow_id: workflow_id.to_string(),
                task_id: task.id.clone(),
            }]);
            task
        };
        debug!("Queued task {} ({}) for workflow {workflow_id}", task.id, task.title);
        self.wake();
        Ok(task)
    }

    /// Cancel every queued or running task of a workflow and mark the
    /// workflow cancelled. Other workflows are untouched. Running executions
    /// are signalled through their cancellation token, never aborted.
    pub async fn cancel_all_tasks(&self, workflow_id: &str) -> Result<CancelSummary> {
        let now = now_ms();
        let mut events = Vec::new();
        let summary = {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            let wf = state.workflows.require_mut(workflow_id)?;
            if wf.status.is_terminal() {
                debug!("Workflow {workflow_id} already {}; nothing to cancel", wf.status);
                return Ok(CancelSummary::default());
            }
            let summary = withdraw_tasks(wf, &state.running, now, &mut events);
            state.queue.retain(|e| e.workflow_id != workflow_id);
            wf.set_status(WorkflowStatus::Cancelled, now);
            events.push(SchedulerEvent::WorkflowStatusChanged {
                workflow_id: workflow_id.to_string(),
                status: WorkflowStatus::Cancelled,
            });
            summary
        };
        info!(
            "Cancelled workflow {workflow_id} ({} queued, {} running)",
            summary.queued, summary.running
        );
        self.emit(events);
        Ok(summary)
    }

    /// Queued tasks that no registered agent can ever run.
    pub async fn capability_gaps(&self) -> Vec<SchedulerError> {
        let state = self.inner.state.lock().await;
        state
            .queue
            .iter()
            .filter_map(|e| {
                let task = state.workflows.get(&e.workflow_id)?.task(&e.task_id)?;
                if state.agents.any_capable(&task.required_capabilities) {
                    None
                } else {
                    Some(SchedulerError::CapabilityMismatch {
                        task_id: task.id.clone(),
                        required: task.required_capabilities.clone(),
                    })
                }
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Stop assigning new tasks. Returns false if already paused.
    pub async fn pause(&self) -> bool {
        let changed = {
            let mut state = self.inner.state.lock().await;
            !std::mem::replace(&mut state.paused, true)
        };
        if changed {
            info!("Scheduler paused");
            self.emit(vec![SchedulerEvent::Paused]);
        }
        changed
    }

    /// Re-enable dispatch. Returns false if not paused.
    pub async fn resume(&self) -> bool {
        let changed = {
            let mut state = self.inner.state.lock().await;
            std::mem::replace(&mut state.paused, false)
        };
        if changed {
            info!("Scheduler resumed");
            self.emit(vec![SchedulerEvent::Resumed]);
            self.wake();
        }
        changed
    }

    pub async fn is_paused(&self) -> bool {
        self.inner.state.lock().await.paused
    }

    /// Run one scheduling pass: assign as many queued tasks as there are
    /// matching idle agents. Returns the number of tasks dispatched.
    pub async fn dispatch_pending(&self) -> usize {
        if self.inner.shutdown.is_cancelled() {
            return 0;
        }
        let mut events = Vec::new();
        let launches = {
            let mut state = self.inner.state.lock().await;
            state.dispatch(
                self.inner.config.fairness,
                &self.inner.shutdown,
                now_ms(),
                &mut events,
            )
        };
        self.emit(events);
        let count = launches.len();
        for launch in launches {
            self.launch(launch);
        }
        count
    }

    fn launch(&self, launch: Launch) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let Launch {
                assignment,
                executor,
                cancel,
            } = launch;
            let task_id = assignment.task_id.clone();
            // Run on its own task so a panicking executor still releases its agent.
            let handle = tokio::spawn(async move { executor.execute(assignment, cancel).await });
            let outcome = match handle.await {
                Ok(Ok(output)) => Ok(output),
                Ok(Err(e)) => Err(format!("{e:#}")),
                Err(e) => Err(format!("agent execution aborted: {e}")),
            };
            scheduler.finish_task(&task_id, outcome).await;
        });
    }

    async fn finish_task(&self, task_id: &str, outcome: std::result::Result<String, String>) {
        let now = now_ms();
        let mut events = Vec::new();
        {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            let Some(run) = state.running.remove(task_id) else {
                debug!("Ignoring completion for untracked task {task_id}");
                return;
            };

            let mut agent_outcome = TaskOutcome::Cancelled;
            if let Some(wf) = state.workflows.get_mut(&run.workflow_id) {
                if let Some(task) = wf.task_mut(task_id) {
                    let error = outcome.as_ref().err().cloned();
                    if task.finish(outcome, now) {
                        wf.updated_at_ms = now;
                        match error {
                            None => {
                                agent_outcome = TaskOutcome::Completed;
                                info!("Task {task_id} completed by agent {}", run.agent_id);
                                events.push(SchedulerEvent::TaskCompleted {
                                    workflow_id: run.workflow_id.clone(),
                                    task_id: task_id.to_string(),
                                    agent_id: run.agent_id.clone(),
                                });
                            }
                            Some(error) => {
                                agent_outcome = TaskOutcome::Failed;
                                warn!("Task {task_id} failed on agent {}: {error}", run.agent_id);
                                events.push(SchedulerEvent::TaskFailed {
                                    workflow_id: run.workflow_id.clone(),
                                    task_id: task_id.to_string(),
                                    agent_id: run.agent_id.clone(),
                                    error,
                                });
                            }
                        }
                    } else {
                        debug!("Task {task_id} returned after cancellation");
                    }
                }
                if self.inner.config.auto_complete_workflows {
                    events.extend(settle_if_finished(wf, now));
                }
            }

            state.agents.release(&run.agent_id, agent_outcome);
            events.push(SchedulerEvent::AgentReleased {
                agent_id: run.agent_id,
                task_id: task_id.to_string(),
            });
        }
        self.emit(events);
        self.wake();
    }

    /// Spawn the background dispatch loop. It sleeps until woken by an
    /// enqueue, a completion or a resume, and exits on [`shutdown`].
    ///
    /// [`shutdown`]: Scheduler::shutdown
    pub fn start(&self) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            info!("Scheduler dispatch loop started");
            loop {
                scheduler.dispatch_pending().await;
                tokio::select! {
                    _ = scheduler.inner.wake.notified() => {}
                    _ = scheduler.inner.shutdown.cancelled() => break,
                }
            }
            info!("Scheduler dispatch loop stopped");
        })
    }

    /// Stop the dispatch loop and signal every running execution.
    ///
    /// Running tasks are marked cancelled before their tokens fire, so an
    /// executor that bails out on the signal is not counted as a failure.
    /// Queued tasks stay queued.
    pub async fn shutdown(&self) {
        let now = now_ms();
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        let mut events = Vec::new();
        for (task_id, run) in &state.running {
            let Some(wf) = state.workflows.get_mut(&run.workflow_id) else {
                continue;
            };
            if let Some(task) = wf.task_mut(task_id) {
                if task.cancel(now) {
                    wf.updated_at_ms = now;
                    events.push(SchedulerEvent::TaskCancelled {
                        workflow_id: run.workflow_id.clone(),
                        task_id: task_id.clone(),
                    });
                }
            }
        }
        if !events.is_empty() {
            info!("Shutting down; cancelled {} running task(s)", events.len());
        }
        self.inner.shutdown.cancel();
        self.emit(events);
    }

    /// Wait until the workflow has no queued or running tasks.
    ///
    /// Needs the dispatch loop (or another caller driving
    /// [`dispatch_pending`](Scheduler::dispatch_pending)) to make progress.
    pub async fn wait_for_workflow_idle(&self, id: &str) -> Result<Workflow> {
        let mut rx = self.subscribe();
        loop {
            let wf = self
                .get_workflow_state(id)
                .await
                .ok_or_else(|| SchedulerError::WorkflowNotFound { id: id.to_string() })?;
            if wf.outstanding_tasks() == 0 {
                return Ok(wf);
            }
            match rx.recv().await {
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return Ok(wf),
            }
        }
    }

    // ------------------------------------------------------------------
    // Stats
    // ------------------------------------------------------------------

    pub async fn get_stats(&self) -> SchedulerStats {
        let state = self.inner.state.lock().await;
        let mut stats = SchedulerStats {
            total_agents: state.agents.total(),
            idle_agents: state.agents.idle_count(),
            paused: state.paused,
            uptime_ms: self.inner.started_at.elapsed().as_millis() as u64,
            ..SchedulerStats::default()
        };
        stats.busy_agents = stats.total_agents - stats.idle_agents;
        for wf in state.workflows.list() {
            match wf.status {
                WorkflowStatus::Active => stats.active_workflows += 1,
                WorkflowStatus::Paused => stats.paused_workflows += 1,
                _ => {}
            }
            for task in &wf.tasks {
                match task.status {
                    TaskStatus::Queued => stats.queued_tasks += 1,
                    TaskStatus::Running => stats.running_tasks += 1,
                    TaskStatus::Completed => stats.completed_tasks += 1,
                    TaskStatus::Failed => stats.failed_tasks += 1,
                    TaskStatus::Cancelled => stats.cancelled_tasks += 1,
                }
            }
        }
        stats
    }

    /// Drop every workflow and queued task. Test support only: agents stay
    /// registered, and running executions are signalled and release their
    /// agents when they return.
    pub async fn reset(&self) {
        let mut state = self.inner.state.lock().await;
        for run in state.running.values() {
            run.cancel.cancel();
        }
        state.workflows.clear();
        state.queue.clear();
        state.last_served.clear();
        state.dispatch_seq = 0;
        state.paused = false;
        info!("Scheduler state reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Semaphore;

    use crate::agent::EchoExecutor;

    const WAIT: Duration = Duration::from_secs(5);

    /// Holds every task until a permit is added or the task is cancelled.
    struct GateExecutor {
        permits: Arc<Semaphore>,
    }

    #[async_trait]
    impl AgentExecutor for GateExecutor {
        async fn execute(
            &self,
            assignment: TaskAssignment,
            cancel: CancellationToken,
        ) -> anyhow::Result<String> {
            tokio::select! {
                permit = self.permits.acquire() => {
                    permit?.forget();
                    Ok(format!("done {}", assignment.title))
                }
                _ = cancel.cancelled() => anyhow::bail!("cancelled"),
            }
        }
    }

    /// Records task titles in execution order.
    struct RecordingExecutor {
        seen: Arc<std::sync::Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl AgentExecutor for RecordingExecutor {
        async fn execute(
            &self,
            assignment: TaskAssignment,
            _cancel: CancellationToken,
        ) -> anyhow::Result<String> {
            self.seen.lock().unwrap().push(assignment.title.clone());
            Ok(assignment.title)
        }
    }

    struct FailingExecutor;

    #[async_trait]
    impl AgentExecutor for FailingExecutor {
        async fn execute(
            &self,
            _assignment: TaskAssignment,
            _cancel: CancellationToken,
        ) -> anyhow::Result<String> {
            anyhow::bail!("exploded")
        }
    }

    struct PanickingExecutor;

    #[async_trait]
    impl AgentExecutor for PanickingExecutor {
        async fn execute(
            &self,
            _assignment: TaskAssignment,
            _cancel: CancellationToken,
        ) -> anyhow::Result<String> {
            panic!("agent crashed")
        }
    }

    /// Ignores its cancellation token and returns only when a permit arrives.
    struct StubbornExecutor {
        permits: Arc<Semaphore>,
    }

    #[async_trait]
    impl AgentExecutor for StubbornExecutor {
        async fn execute(
            &self,
            assignment: TaskAssignment,
            _cancel: CancellationToken,
        ) -> anyhow::Result<String> {
            self.permits.acquire().await?.forget();
            Ok(format!("done {}", assignment.title))
        }
    }

    fn caps(tags: &[&str]) -> Vec<String> {
        tags.iter().map(|t| t.to_string()).collect()
    }

    async fn gated(agents: usize) -> (Scheduler, Arc<Semaphore>) {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let permits = Arc::new(Semaphore::new(0));
        for n in 0..agents {
            scheduler
                .register_agent(
                    &format!("agent-{n}"),
                    vec![],
                    Arc::new(GateExecutor {
                        permits: permits.clone(),
                    }),
                )
                .await
                .unwrap();
        }
        (scheduler, permits)
    }

    async fn recording(
        config: SchedulerConfig,
    ) -> (Scheduler, Arc<std::sync::Mutex<Vec<String>>>) {
        let scheduler = Scheduler::new(config);
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        scheduler
            .register_agent(
                "solo",
                vec![],
                Arc::new(RecordingExecutor { seen: seen.clone() }),
            )
            .await
            .unwrap();
        (scheduler, seen)
    }

    async fn workflow(scheduler: &Scheduler, name: &str) -> String {
        scheduler
            .create_workflow(CreateWorkflowOptions::new(name))
            .await
            .unwrap()
            .id
    }

    async fn settle(scheduler: &Scheduler, id: &str) -> Workflow {
        tokio::time::timeout(WAIT, scheduler.wait_for_workflow_idle(id))
            .await
            .expect("workflow did not settle")
            .unwrap()
    }

    async fn wait_for_idle_agents(scheduler: &Scheduler, expected: usize) {
        tokio::time::timeout(WAIT, async {
            while scheduler.get_stats().await.idle_agents != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("agents were not released");
    }

    async fn wait_for_status(scheduler: &Scheduler, task_id: &str, expected: TaskStatus) {
        tokio::time::timeout(WAIT, async {
            while scheduler.get_task(task_id).await.unwrap().status != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("task never reached the expected status");
    }

    fn assert_stats_match(stats: &SchedulerStats, workflows: &[Workflow]) {
        let count = |status| {
            workflows
                .iter()
                .map(|w| w.count_tasks(status))
                .sum::<usize>()
        };
        assert_eq!(stats.queued_tasks, count(TaskStatus::Queued));
        assert_eq!(stats.running_tasks, count(TaskStatus::Running));
        assert_eq!(stats.completed_tasks, count(TaskStatus::Completed));
        assert_eq!(stats.failed_tasks, count(TaskStatus::Failed));
        assert_eq!(stats.cancelled_tasks, count(TaskStatus::Cancelled));
    }

    #[tokio::test]
    async fn test_create_workflow_initial_state() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let wf = scheduler
            .create_workflow(CreateWorkflowOptions::new("wf-1"))
            .await
            .unwrap();
        assert_eq!(wf.current_phase, Phase::Brainstorming);
        assert_eq!(wf.status, WorkflowStatus::Active);
        assert!(wf.tasks.is_empty());
        assert!(wf.phase_history.is_empty());
        assert_eq!(scheduler.list_workflows().await.len(), 1);
        assert!(scheduler.get_workflow_state("nope").await.is_none());
    }

    #[tokio::test]
    async fn test_transition_and_rejected_skip() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let id = workflow(&scheduler, "wf-1").await;

        let wf = scheduler
            .transition_workflow(&id, Phase::Planning)
            .await
            .unwrap();
        assert_eq!(wf.current_phase, Phase::Planning);
        assert_eq!(wf.phase_history.len(), 1);
        assert_eq!(wf.phase_history[0].from, Phase::Brainstorming);
        assert_eq!(wf.phase_history[0].to, Phase::Planning);

        let err = scheduler
            .transition_workflow(&id, Phase::Review)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            SchedulerError::InvalidTransition {
                from: Phase::Planning,
                to: Phase::Review
            }
        );
        let wf = scheduler.get_workflow_state(&id).await.unwrap();
        assert_eq!(wf.current_phase, Phase::Planning);
        assert_eq!(wf.phase_history.len(), 1);

        let err = scheduler
            .transition_workflow("missing", Phase::Planning)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "workflow_not_found");
    }

    #[tokio::test]
    async fn test_paused_scheduler_dispatches_nothing() {
        let (scheduler, _permits) = gated(2).await;
        let id = workflow(&scheduler, "wf-1").await;
        assert!(scheduler.pause().await);
        for n in 0..3 {
            scheduler
                .enqueue_task(&id, NewTask::new(format!("task-{n}")))
                .await
                .unwrap();
        }
        assert_eq!(scheduler.dispatch_pending().await, 0);
        let wf = scheduler.get_workflow_state(&id).await.unwrap();
        assert_eq!(wf.count_tasks(TaskStatus::Queued), 3);
        assert_eq!(scheduler.get_stats().await.idle_agents, 2);

        assert!(scheduler.resume().await);
        assert_eq!(scheduler.dispatch_pending().await, 2);
    }

    #[tokio::test]
    async fn test_cancel_all_queued_tasks() {
        let (scheduler, _permits) = gated(2).await;
        let id = workflow(&scheduler, "wf-1").await;
        scheduler.pause().await;
        for n in 0..3 {
            scheduler
                .enqueue_task(&id, NewTask::new(format!("task-{n}")))
                .await
                .unwrap();
        }
        let failed_before = scheduler.get_stats().await.failed_tasks;

        let summary = scheduler.cancel_all_tasks(&id).await.unwrap();
        assert_eq!(summary, CancelSummary { queued: 3, running: 0 });

        let wf = scheduler.get_workflow_state(&id).await.unwrap();
        assert_eq!(wf.status, WorkflowStatus::Cancelled);
        assert!(wf.tasks.iter().all(|t| t.status == TaskStatus::Cancelled));

        let stats = scheduler.get_stats().await;
        assert_eq!(stats.queued_tasks, 0);
        assert_eq!(stats.cancelled_tasks, 3);
        assert_eq!(stats.failed_tasks, failed_before);

        scheduler.resume().await;
        assert_eq!(scheduler.dispatch_pending().await, 0);
    }

    #[tokio::test]
    async fn test_pause_resume_idempotent() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let mut rx = scheduler.subscribe();
        assert!(scheduler.pause().await);
        assert!(!scheduler.pause().await);
        assert!(scheduler.is_paused().await);
        assert!(scheduler.resume().await);
        assert!(!scheduler.resume().await);
        assert!(!scheduler.is_paused().await);

        assert_eq!(rx.recv().await.unwrap(), SchedulerEvent::Paused);
        assert_eq!(rx.recv().await.unwrap(), SchedulerEvent::Resumed);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_agent_never_holds_two_tasks() {
        let (scheduler, permits) = gated(1).await;
        let id = workflow(&scheduler, "wf").await;
        let first = scheduler.enqueue_task(&id, NewTask::new("a")).await.unwrap();
        let second = scheduler.enqueue_task(&id, NewTask::new("b")).await.unwrap();

        assert_eq!(scheduler.dispatch_pending().await, 1);
        assert_eq!(scheduler.dispatch_pending().await, 0);
        let running = scheduler.get_task(&first.id).await.unwrap();
        assert_eq!(running.status, TaskStatus::Running);
        assert_eq!(running.assigned_agent_id.as_deref(), Some("agent-0"));
        assert!(running.started_at_ms.is_some());
        assert_eq!(
            scheduler.get_task(&second.id).await.unwrap().status,
            TaskStatus::Queued
        );
        let stats = scheduler.get_stats().await;
        assert_eq!(stats.busy_agents, 1);
        assert_eq!(stats.running_tasks, 1);

        let loop_handle = scheduler.start();
        permits.add_permits(2);
        let wf = settle(&scheduler, &id).await;
        assert_eq!(wf.count_tasks(TaskStatus::Completed), 2);
        assert_eq!(
            scheduler.get_task(&first.id).await.unwrap().result.as_deref(),
            Some("done a")
        );
        wait_for_idle_agents(&scheduler, 1).await;
        assert_eq!(scheduler.list_agents().await[0].tasks_completed, 2);

        scheduler.shutdown().await;
        loop_handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_fifo_order_within_single_agent() {
        let (scheduler, seen) = recording(SchedulerConfig::default()).await;
        let a = workflow(&scheduler, "a").await;
        let b = workflow(&scheduler, "b").await;
        for title in ["a1", "a2", "a3"] {
            scheduler.enqueue_task(&a, NewTask::new(title)).await.unwrap();
        }
        scheduler.enqueue_task(&b, NewTask::new("b1")).await.unwrap();

        let handle = scheduler.start();
        settle(&scheduler, &a).await;
        settle(&scheduler, &b).await;
        assert_eq!(*seen.lock().unwrap(), vec!["a1", "a2", "a3", "b1"]);
        scheduler.shutdown().await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_round_robin_alternates_workflows() {
        let config = SchedulerConfig {
            fairness: FairnessPolicy::RoundRobin,
            ..SchedulerConfig::default()
        };
        let (scheduler, seen) = recording(config).await;
        let a = workflow(&scheduler, "a").await;
        let b = workflow(&scheduler, "b").await;
        for title in ["a1", "a2", "a3"] {
            scheduler.enqueue_task(&a, NewTask::new(title)).await.unwrap();
        }
        scheduler.enqueue_task(&b, NewTask::new("b1")).await.unwrap();

        let handle = scheduler.start();
        settle(&scheduler, &a).await;
        settle(&scheduler, &b).await;
        assert_eq!(*seen.lock().unwrap(), vec!["a1", "b1", "a2", "a3"]);
        scheduler.shutdown().await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_capability_matching_skips_to_eligible_task() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let permits = Arc::new(Semaphore::new(0));
        scheduler
            .register_agent(
                "coder",
                caps(&["code"]),
                Arc::new(GateExecutor {
                    permits: permits.clone(),
                }),
            )
            .await
            .unwrap();
        let id = workflow(&scheduler, "wf").await;
        let review = scheduler
            .enqueue_task(&id, NewTask::new("review").requires("review"))
            .await
            .unwrap();
        let code = scheduler
            .enqueue_task(&id, NewTask::new("code").requires("code"))
            .await
            .unwrap();

        assert_eq!(scheduler.dispatch_pending().await, 1);
        assert_eq!(
            scheduler.get_task(&review.id).await.unwrap().status,
            TaskStatus::Queued
        );
        assert_eq!(
            scheduler.get_task(&code.id).await.unwrap().status,
            TaskStatus::Running
        );

        let gaps = scheduler.capability_gaps().await;
        assert_eq!(
            gaps,
            vec![SchedulerError::CapabilityMismatch {
                task_id: review.id.clone(),
                required: caps(&["review"]),
            }]
        );

        scheduler
            .register_agent("reviewer", caps(&["review"]), Arc::new(EchoExecutor))
            .await
            .unwrap();
        assert!(scheduler.capability_gaps().await.is_empty());
        assert_eq!(scheduler.dispatch_pending().await, 1);
    }

    #[tokio::test]
    async fn test_cancel_running_tasks_is_cooperative_and_scoped() {
        let (scheduler, _permits) = gated(2).await;
        let target = workflow(&scheduler, "target").await;
        let other = workflow(&scheduler, "other").await;
        let doomed = scheduler
            .enqueue_task(&target, NewTask::new("doomed"))
            .await
            .unwrap();
        let survivor = scheduler
            .enqueue_task(&other, NewTask::new("survivor"))
            .await
            .unwrap();
        let queued = scheduler
            .enqueue_task(&target, NewTask::new("queued"))
            .await
            .unwrap();
        assert_eq!(scheduler.dispatch_pending().await, 2);

        let summary = scheduler.cancel_all_tasks(&target).await.unwrap();
        assert_eq!(summary, CancelSummary { queued: 1, running: 1 });
        assert_eq!(
            scheduler.get_task(&doomed.id).await.unwrap().status,
            TaskStatus::Cancelled
        );
        assert_eq!(
            scheduler.get_task(&queued.id).await.unwrap().status,
            TaskStatus::Cancelled
        );
        assert_eq!(
            scheduler.get_task(&survivor.id).await.unwrap().status,
            TaskStatus::Running
        );
        assert_eq!(
            scheduler.get_workflow_state(&other).await.unwrap().status,
            WorkflowStatus::Active
        );

        // The gate observes its token, returns, and the agent comes back.
        wait_for_idle_agents(&scheduler, 1).await;
        let doomed = scheduler.get_task(&doomed.id).await.unwrap();
        assert_eq!(doomed.status, TaskStatus::Cancelled);
        assert!(doomed.error.is_none());

        // Cancelling again is a no-op.
        let again = scheduler.cancel_all_tasks(&target).await.unwrap();
        assert_eq!(again.total(), 0);
    }

    #[tokio::test]
    async fn test_failures_are_recorded_not_fatal() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        scheduler
            .register_agent("flaky", caps(&["flaky"]), Arc::new(FailingExecutor))
            .await
            .unwrap();
        scheduler
            .register_agent("crashy", caps(&["crashy"]), Arc::new(PanickingExecutor))
            .await
            .unwrap();
        scheduler
            .register_agent("steady", caps(&["steady"]), Arc::new(EchoExecutor))
            .await
            .unwrap();
        let id = workflow(&scheduler, "wf").await;
        let failed = scheduler
            .enqueue_task(&id, NewTask::new("fails").requires("flaky"))
            .await
            .unwrap();
        let panicked = scheduler
            .enqueue_task(&id, NewTask::new("panics").requires("crashy"))
            .await
            .unwrap();
        scheduler
            .enqueue_task(&id, NewTask::new("works").requires("steady"))
            .await
            .unwrap();

        let handle = scheduler.start();
        let wf = settle(&scheduler, &id).await;
        assert_eq!(wf.count_tasks(TaskStatus::Failed), 2);
        assert_eq!(wf.count_tasks(TaskStatus::Completed), 1);

        let failed = scheduler.get_task(&failed.id).await.unwrap();
        assert_eq!(failed.error.as_deref(), Some("exploded"));
        assert!(failed.ended_at_ms.is_some());
        let panicked = scheduler.get_task(&panicked.id).await.unwrap();
        assert!(panicked.error.unwrap().contains("aborted"));

        wait_for_idle_agents(&scheduler, 3).await;
        let agents = scheduler.list_agents().await;
        assert_eq!(agents[0].tasks_failed, 1);
        assert_eq!(agents[1].tasks_failed, 1);

        // The scheduler keeps dispatching after failures.
        let ok = scheduler
            .enqueue_task(&id, NewTask::new("after").requires("steady"))
            .await
            .unwrap();
        settle(&scheduler, &id).await;
        assert_eq!(
            scheduler.get_task(&ok.id).await.unwrap().status,
            TaskStatus::Completed
        );

        scheduler.shutdown().await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_stats_match_task_statuses() {
        let (scheduler, permits) = gated(2).await;
        let a = workflow(&scheduler, "a").await;
        let b = workflow(&scheduler, "b").await;
        for n in 0..3 {
            scheduler
                .enqueue_task(&a, NewTask::new(format!("a{n}")))
                .await
                .unwrap();
            scheduler
                .enqueue_task(&b, NewTask::new(format!("b{n}")))
                .await
                .unwrap();
        }
        scheduler.dispatch_pending().await;
        permits.add_permits(1);
        wait_for_idle_agents(&scheduler, 1).await;
        scheduler.cancel_all_tasks(&b).await.unwrap();

        let stats = scheduler.get_stats().await;
        let workflows = scheduler.list_workflows().await;
        assert_stats_match(&stats, &workflows);
        assert_eq!(stats.active_workflows, 1);
        assert_eq!(stats.total_agents, 2);
        assert_eq!(stats.completed_tasks, 1);
        assert_eq!(
            stats.queued_tasks + stats.running_tasks + stats.completed_tasks + stats.cancelled_tasks,
            6
        );
    }

    #[tokio::test]
    async fn test_paused_workflow_is_skipped() {
        let (scheduler, _permits) = gated(1).await;
        let held = workflow(&scheduler, "held").await;
        let free = workflow(&scheduler, "free").await;
        scheduler.pause_workflow(&held).await.unwrap();
        let held_task = scheduler.enqueue_task(&held, NewTask::new("h")).await.unwrap();
        let free_task = scheduler.enqueue_task(&free, NewTask::new("f")).await.unwrap();

        assert_eq!(scheduler.dispatch_pending().await, 1);
        assert_eq!(
            scheduler.get_task(&free_task.id).await.unwrap().status,
            TaskStatus::Running
        );
        assert_eq!(
            scheduler.get_task(&held_task.id).await.unwrap().status,
            TaskStatus::Queued
        );
        assert_eq!(scheduler.get_stats().await.paused_workflows, 1);

        let wf = scheduler.resume_workflow(&held).await.unwrap();
        assert_eq!(wf.status, WorkflowStatus::Active);
    }

    #[tokio::test]
    async fn test_complete_requires_final_phase_and_idle() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        scheduler.pause().await;
        let id = workflow(&scheduler, "wf").await;
        let err = scheduler.complete_workflow(&id).await.unwrap_err();
        assert_eq!(err.kind(), "workflow_not_finished");

        for phase in Phase::ALL.iter().skip(1) {
            scheduler.transition_workflow(&id, *phase).await.unwrap();
        }
        let err = scheduler
            .transition_workflow(&id, Phase::Finishing)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "already_at_final_phase");

        scheduler.enqueue_task(&id, NewTask::new("wrap up")).await.unwrap();
        let err = scheduler.complete_workflow(&id).await.unwrap_err();
        assert_eq!(
            err,
            SchedulerError::OutstandingTasks {
                id: id.clone(),
                count: 1
            }
        );

        let wf = scheduler.fail_workflow(&id, "gave up").await.unwrap();
        assert_eq!(wf.status, WorkflowStatus::Failed);
        assert_eq!(wf.failure_reason.as_deref(), Some("gave up"));
        assert_eq!(wf.count_tasks(TaskStatus::Cancelled), 1);
        assert!(wf.ended_at_ms.is_some());

        let err = scheduler.complete_workflow(&id).await.unwrap_err();
        assert_eq!(err.kind(), "workflow_closed");
    }

    #[tokio::test]
    async fn test_auto_complete_when_enabled() {
        let config = SchedulerConfig {
            auto_complete_workflows: true,
            ..SchedulerConfig::default()
        };
        let scheduler = Scheduler::new(config);
        scheduler
            .register_agent("echo", vec![], Arc::new(EchoExecutor))
            .await
            .unwrap();
        let id = workflow(&scheduler, "wf").await;
        for phase in Phase::ALL.iter().skip(1) {
            scheduler.transition_workflow(&id, *phase).await.unwrap();
        }
        scheduler.enqueue_task(&id, NewTask::new("ship")).await.unwrap();
        let handle = scheduler.start();
        settle(&scheduler, &id).await;
        tokio::time::timeout(WAIT, async {
            loop {
                let wf = scheduler.get_workflow_state(&id).await.unwrap();
                if wf.status == WorkflowStatus::Completed {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("workflow was not auto-completed");
        scheduler.shutdown().await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_and_unknown_workflows_reject_tasks() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let id = workflow(&scheduler, "wf").await;
        scheduler.cancel_all_tasks(&id).await.unwrap();

        let err = scheduler
            .enqueue_task(&id, NewTask::new("late"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "workflow_closed");
        let err = scheduler
            .enqueue_task("missing", NewTask::new("x"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "workflow_not_found");
        let err = scheduler.get_task("missing").await.unwrap_err();
        assert_eq!(err.kind(), "task_not_found");
        let err = scheduler.cancel_all_tasks("missing").await.unwrap_err();
        assert_eq!(err.kind(), "workflow_not_found");
        let err = scheduler
            .transition_workflow(&id, Phase::Planning)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "workflow_closed");
    }

    #[tokio::test]
    async fn test_events_follow_task_lifecycle() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        scheduler
            .register_agent("echo", vec![], Arc::new(EchoExecutor))
            .await
            .unwrap();
        let mut rx = scheduler.subscribe();
        let id = workflow(&scheduler, "wf").await;
        let task = scheduler.enqueue_task(&id, NewTask::new("t")).await.unwrap();
        scheduler.dispatch_pending().await;

        let mut kinds = Vec::new();
        tokio::time::timeout(WAIT, async {
            loop {
                let event = rx.recv().await.unwrap();
                let done = matches!(event, SchedulerEvent::AgentReleased { .. });
                kinds.push(event);
                if done {
                    break;
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(
            kinds[0],
            SchedulerEvent::WorkflowCreated {
                workflow_id: id.clone()
            }
        );
        assert_eq!(
            kinds[1],
            SchedulerEvent::TaskQueued {
                workflow_id: id.clone(),
                task_id: task.id.clone()
            }
        );
        assert!(matches!(kinds[2], SchedulerEvent::TaskStarted { .. }));
        assert!(matches!(kinds[3], SchedulerEvent::TaskCompleted { .. }));
        assert_eq!(kinds[3].workflow_id(), Some(id.as_str()));
    }

    #[tokio::test]
    async fn test_reset_clears_workflows() {
        let (scheduler, _permits) = gated(1).await;
        let id = workflow(&scheduler, "wf").await;
        scheduler.enqueue_task(&id, NewTask::new("a")).await.unwrap();
        scheduler.enqueue_task(&id, NewTask::new("b")).await.unwrap();
        scheduler.dispatch_pending().await;
        scheduler.pause().await;

        scheduler.reset().await;
        assert!(scheduler.list_workflows().await.is_empty());
        assert!(!scheduler.is_paused().await);
        wait_for_idle_agents(&scheduler, 1).await;
        let stats = scheduler.get_stats().await;
        assert_eq!(stats.queued_tasks, 0);
        assert_eq!(stats.total_agents, 1);
    }

    #[tokio::test]
    async fn test_from_config_registers_roster() {
        let mut config = Config::default();
        config.agents[1].capabilities.push("review".into());
        let scheduler = Scheduler::from_config(&config, true).await.unwrap();
        let agents = scheduler.list_agents().await;
        assert_eq!(agents.len(), 2);
        assert_eq!(agents[1].capabilities, caps(&["review", "shell"]));

        config.agents[1].id = config.agents[0].id.clone();
        let err = Scheduler::from_config(&config, true).await.err().unwrap();
        assert_eq!(err.kind(), "agent_already_registered");
    }

    #[tokio::test]
    async fn test_pause_lets_running_task_finish_and_holds_queue() {
        let (scheduler, permits) = gated(1).await;
        let id = workflow(&scheduler, "wf").await;
        let handle = scheduler.start();
        let first = scheduler.enqueue_task(&id, NewTask::new("first")).await.unwrap();
        wait_for_status(&scheduler, &first.id, TaskStatus::Running).await;

        assert!(scheduler.pause().await);
        let second = scheduler.enqueue_task(&id, NewTask::new("second")).await.unwrap();
        permits.add_permits(1);
        wait_for_idle_agents(&scheduler, 1).await;
        // The completion wakes the loop; it must stay idle while paused.
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            scheduler.get_task(&first.id).await.unwrap().status,
            TaskStatus::Completed
        );
        assert_eq!(
            scheduler.get_task(&second.id).await.unwrap().status,
            TaskStatus::Queued
        );
        let stats = scheduler.get_stats().await;
        assert!(stats.paused);
        assert_eq!(stats.running_tasks, 0);
        assert_eq!(stats.queued_tasks, 1);

        assert!(scheduler.resume().await);
        permits.add_permits(1);
        settle(&scheduler, &id).await;
        assert_eq!(
            scheduler.get_task(&second.id).await.unwrap().status,
            TaskStatus::Completed
        );
        scheduler.shutdown().await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_agent_stays_busy_until_executor_returns() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let permits = Arc::new(Semaphore::new(0));
        scheduler
            .register_agent(
                "slow",
                vec![],
                Arc::new(StubbornExecutor {
                    permits: permits.clone(),
                }),
            )
            .await
            .unwrap();
        let a = workflow(&scheduler, "a").await;
        let b = workflow(&scheduler, "b").await;
        let long = scheduler.enqueue_task(&a, NewTask::new("long")).await.unwrap();
        assert_eq!(scheduler.dispatch_pending().await, 1);
        scheduler.cancel_all_tasks(&a).await.unwrap();

        let stats = scheduler.get_stats().await;
        assert_eq!(stats.running_tasks, 0);
        assert_eq!(stats.cancelled_tasks, 1);
        assert_eq!(stats.busy_agents, 1);
        assert_eq!(stats.idle_agents, 0);

        let next = scheduler.enqueue_task(&b, NewTask::new("next")).await.unwrap();
        assert_eq!(scheduler.dispatch_pending().await, 0);

        permits.add_permits(1);
        wait_for_idle_agents(&scheduler, 1).await;
        assert_eq!(
            scheduler.get_task(&long.id).await.unwrap().status,
            TaskStatus::Cancelled
        );
        assert_eq!(scheduler.get_stats().await.busy_agents, 0);

        assert_eq!(scheduler.dispatch_pending().await, 1);
        permits.add_permits(1);
        settle(&scheduler, &b).await;
        assert_eq!(
            scheduler.get_task(&next.id).await.unwrap().status,
            TaskStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_task_queued_always_precedes_task_started() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        for name in ["echo-0", "echo-1"] {
            scheduler
                .register_agent(name, vec![], Arc::new(EchoExecutor))
                .await
                .unwrap();
        }
        let id = workflow(&scheduler, "wf").await;
        let mut rx = scheduler.subscribe();
        let handle = scheduler.start();

        let mut ids = Vec::new();
        for n in 0..20 {
            let task = scheduler
                .enqueue_task(&id, NewTask::new(format!("t{n}")))
                .await
                .unwrap();
            ids.push(task.id);
        }
        settle(&scheduler, &id).await;
        scheduler.shutdown().await;
        handle.await.unwrap();

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        for task_id in &ids {
            let queued = events.iter().position(|e| {
                matches!(e, SchedulerEvent::TaskQueued { task_id: t, .. } if t == task_id)
            });
            let started = events.iter().position(|e| {
                matches!(e, SchedulerEvent::TaskStarted { task_id: t, .. } if t == task_id)
            });
            let (queued, started) = (queued.unwrap(), started.unwrap());
            assert!(queued < started, "task {task_id} started before it was queued");
        }
    }

    #[tokio::test]
    async fn test_shutdown_cancels_running_tasks_instead_of_failing_them() {
        let (scheduler, _permits) = gated(1).await;
        let id = workflow(&scheduler, "wf").await;
        let handle = scheduler.start();
        let running = scheduler.enqueue_task(&id, NewTask::new("running")).await.unwrap();
        let queued = scheduler.enqueue_task(&id, NewTask::new("queued")).await.unwrap();
        wait_for_status(&scheduler, &running.id, TaskStatus::Running).await;

        let mut rx = scheduler.subscribe();
        scheduler.shutdown().await;
        handle.await.unwrap();
        wait_for_idle_agents(&scheduler, 1).await;

        assert_eq!(
            scheduler.get_task(&running.id).await.unwrap().status,
            TaskStatus::Cancelled
        );
        assert_eq!(
            scheduler.get_task(&queued.id).await.unwrap().status,
            TaskStatus::Queued
        );
        let stats = scheduler.get_stats().await;
        assert_eq!(stats.failed_tasks, 0);
        assert_eq!(stats.cancelled_tasks, 1);
        assert_eq!(scheduler.list_agents().await[0].tasks_failed, 0);

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(events
            .iter()
            .any(|e| matches!(e, SchedulerEvent::TaskCancelled { .. })));
        assert!(!events
            .iter()
            .any(|e| matches!(e, SchedulerEvent::TaskFailed { .. })));
        assert_eq!(scheduler.dispatch_pending().await, 0);
    }
}
