use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Default working directory for shell agents.
    pub workspace: String,
    pub scheduler: SchedulerConfig,
    /// Agent roster registered at startup.
    pub agents: Vec<AgentConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace: "~/.conductor/workspace".into(),
            scheduler: SchedulerConfig::default(),
            agents: default_agents(),
        }
    }
}

/// How queued tasks from competing workflows share the agent pool.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FairnessPolicy {
    /// Strict enqueue order across all workflows.
    #[default]
    Fifo,
    /// Alternate between workflows, FIFO within each workflow.
    RoundRobin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerConfig {
    pub fairness: FairnessPolicy,
    /// Mark a workflow completed (or failed) once it sits in the final phase
    /// with no outstanding tasks. Off by default: callers finish workflows
    /// explicitly.
    pub auto_complete_workflows: bool,
    /// Capacity of the scheduler event broadcast channel.
    pub event_buffer: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            fairness: FairnessPolicy::Fifo,
            auto_complete_workflows: false,
            event_buffer: 256,
        }
    }
}

/// Which executor backs an agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    /// Run the task's `command` through `sh -c`.
    #[default]
    Shell,
    /// Return the payload without running anything (dry runs).
    Echo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    pub id: String,
    pub capabilities: Vec<String>,
    pub executor: ExecutorKind,
    pub timeout_secs: u64,
    /// Overrides the top-level workspace for this agent.
    pub working_dir: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            capabilities: Vec::new(),
            executor: ExecutorKind::Shell,
            timeout_secs: 300,
            working_dir: None,
        }
    }
}

fn default_agents() -> Vec<AgentConfig> {
    (1..=2)
        .map(|n| AgentConfig {
            id: format!("worker-{n}"),
            capabilities: vec!["shell".into()],
            ..AgentConfig::default()
        })
        .collect()
}
