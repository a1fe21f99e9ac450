pub mod executor;
pub mod pool;
pub mod shell;

use std::path::Path;
use std::sync::Arc;

use conductor_config::{resolve_workspace, AgentConfig, ExecutorKind};

pub use executor::{AgentExecutor, EchoExecutor, TaskAssignment};
pub use pool::{Agent, AgentPool, Availability, TaskOutcome};
pub use shell::ShellExecutor;

/// Build the executor described by an agent's config entry.
///
/// `dry_run` swaps every executor for [`EchoExecutor`].
pub fn build_executor(
    agent: &AgentConfig,
    workspace: &Path,
    dry_run: bool,
) -> Arc<dyn AgentExecutor> {
    if dry_run {
        return Arc::new(EchoExecutor);
    }
    match agent.executor {
        ExecutorKind::Echo => Arc::new(EchoExecutor),
        ExecutorKind::Shell => {
            let dir = agent
                .working_dir
                .as_deref()
                .map(resolve_workspace)
                .unwrap_or_else(|| workspace.to_path_buf());
            Arc::new(ShellExecutor::new(dir, agent.timeout_secs))
        }
    }
}
