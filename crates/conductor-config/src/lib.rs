pub mod loader;
pub mod schema;

pub use loader::{default_config_path, find_config_path, load_config, resolve_workspace, save_config};
pub use schema::{AgentConfig, Config, ExecutorKind, FairnessPolicy, SchedulerConfig};
