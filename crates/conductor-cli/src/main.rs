use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use conductor_config::{
    default_config_path, find_config_path, load_config, resolve_workspace, save_config, Config,
};
use conductor_core::{
    load_plan, Phase, PlanRunner, RunReport, Scheduler, Task, ToolRegistry, WorkflowStatus,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "conductor", about = "Phased workflow scheduler for subagents", version)]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config and create the workspace
    Onboard {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },
    /// Show configuration and the agent roster
    Status,
    /// Run a workflow plan through every phase
    Run {
        /// Path to the plan JSON file
        plan: PathBuf,
        /// Echo task payloads instead of executing them
        #[arg(long)]
        dry_run: bool,
        /// Print the final workflow state as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check a plan file against the configured agents
    Validate {
        /// Path to the plan JSON file
        plan: PathBuf,
    },
    /// Drive a live scheduler with JSON actions, e.g. '{"action":"create","name":"auth"}'
    Tool {
        /// Action objects; read from stdin, one per line, when none are given
        actions: Vec<String>,
        /// Tool that receives the actions
        #[arg(long, default_value = "workflow")]
        name: String,
        /// Echo task payloads instead of executing them
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Onboard { force } => run_onboard(cli.config, force),
        Commands::Status => {
            let config_path = cli.config.unwrap_or_else(find_config_path);
            run_status(&config_path)
        }
        Commands::Run {
            plan,
            dry_run,
            json,
        } => {
            let config_path = cli.config.unwrap_or_else(find_config_path);
            let config = load_config(&config_path)?;
            run_plan(&config, &plan, dry_run, json).await
        }
        Commands::Validate { plan } => {
            let config_path = cli.config.unwrap_or_else(find_config_path);
            let config = load_config(&config_path)?;
            run_validate(&config, &plan)
        }
        Commands::Tool {
            actions,
            name,
            dry_run,
        } => {
            let config_path = cli.config.unwrap_or_else(find_config_path);
            let config = load_config(&config_path)?;
            run_tool(&config, &name, actions, dry_run).await
        }
    }
}

/// Write the default config and create the workspace directory.
fn run_onboard(config_arg: Option<PathBuf>, force: bool) -> Result<()> {
    let config_path = config_arg.unwrap_or_else(default_config_path);
    if config_path.exists() && !force {
        println!("Config already exists: {}", config_path.display());
        println!("To reset, run `conductor onboard --force`.");
    } else {
        save_config(&config_path, &Config::default())?;
        println!("Created config: {}", config_path.display());
    }

    let config = load_config(&config_path)?;
    let workspace = resolve_workspace(&config.workspace);
    std::fs::create_dir_all(&workspace)
        .with_context(|| format!("failed to create workspace {}", workspace.display()))?;
    println!("Workspace: {}", workspace.display());
    println!();
    println!("Setup complete! Next steps:");
    println!("  1. Edit the agent roster in {}", config_path.display());
    println!("  2. Run `conductor validate <plan.json>` to check a plan");
    println!("  3. Run `conductor run <plan.json>` to execute it");
    Ok(())
}

fn run_status(config_path: &Path) -> Result<()> {
    println!("conductor status");
    println!();

    if config_path.exists() {
        println!("  Config:    {} (found)", config_path.display());
    } else {
        println!(
            "  Config:    {} (not found, run `conductor onboard`)",
            config_path.display()
        );
        return Ok(());
    }

    let config = load_config(config_path)?;
    let workspace = resolve_workspace(&config.workspace);
    if workspace.exists() {
        println!("  Workspace: {} (found)", workspace.display());
    } else {
        println!("  Workspace: {} (not found)", workspace.display());
    }
    println!("  Fairness:  {:?}", config.scheduler.fairness);
    println!(
        "  Auto-complete workflows: {}",
        if config.scheduler.auto_complete_workflows {
            "yes"
        } else {
            "no"
        }
    );
    println!();

    if config.agents.is_empty() {
        println!("  No agents configured.");
        return Ok(());
    }
    println!(
        "  {:<16} {:<8} {:<8} Capabilities",
        "Agent", "Executor", "Timeout"
    );
    println!("  {}", "-".repeat(60));
    for agent in &config.agents {
        let caps = if agent.capabilities.is_empty() {
            "(any)".to_string()
        } else {
            agent.capabilities.join(", ")
        };
        println!(
            "  {:<16} {:<8} {:<8} {caps}",
            agent.id,
            format!("{:?}", agent.executor).to_lowercase(),
            format!("{}s", agent.timeout_secs),
        );
    }
    Ok(())
}

fn run_validate(config: &Config, plan_path: &Path) -> Result<()> {
    let plan = load_plan(plan_path)?;
    println!("Plan '{}' ({} task(s))", plan.name, plan.task_count());
    for phase in Phase::ALL {
        println!("  {:<16} {} task(s)", phase.as_str(), plan.tasks(phase).len());
    }

    let offered: Vec<Vec<String>> = config
        .agents
        .iter()
        .map(|a| a.capabilities.clone())
        .collect();
    let uncovered = plan.uncovered_tasks(&offered);
    if uncovered.is_empty() {
        println!("All tasks can be served by the configured agents.");
        return Ok(());
    }
    for (phase, task) in &uncovered {
        println!(
            "  ! {phase} task '{}' needs {:?}, which no agent offers",
            task.title, task.capabilities
        );
    }
    anyhow::bail!("{} task(s) cannot be scheduled", uncovered.len())
}

async fn run_plan(config: &Config, plan_path: &Path, dry_run: bool, json: bool) -> Result<()> {
    let plan = load_plan(plan_path)?;
    let workspace = resolve_workspace(&config.workspace);
    std::fs::create_dir_all(&workspace)
        .with_context(|| format!("failed to create workspace {}", workspace.display()))?;

    let scheduler = Scheduler::from_config(config, dry_run).await?;
    if scheduler.list_agents().await.is_empty() {
        anyhow::bail!("no agents configured; add some to the config or run `conductor onboard`");
    }
    info!(
        "Running plan '{}' ({} task(s)){}",
        plan.name,
        plan.task_count(),
        if dry_run { " as a dry run" } else { "" }
    );
    let dispatch = scheduler.start();
    let runner = PlanRunner::new(scheduler.clone());

    let outcome = tokio::select! {
        res = runner.run(&plan) => Some(res),
        _ = tokio::signal::ctrl_c() => None,
    };

    let report = match outcome {
        Some(res) => res?,
        None => {
            warn!("Interrupted; cancelling outstanding tasks");
            for wf in scheduler.list_workflows().await {
                if !wf.status.is_terminal() {
                    scheduler.cancel_all_tasks(&wf.id).await?;
                }
            }
            scheduler.shutdown().await;
            let _ = dispatch.await;
            return Ok(());
        }
    };

    scheduler.shutdown().await;
    let _ = dispatch.await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report.workflow)?);
    } else {
        print_report(&report);
    }

    if report.succeeded() {
        Ok(())
    } else {
        anyhow::bail!(
            "workflow {} {}",
            report.workflow.status,
            report.workflow.failure_reason.as_deref().unwrap_or("")
        )
    }
}

async fn run_tool(config: &Config, name: &str, actions: Vec<String>, dry_run: bool) -> Result<()> {
    let scheduler = Scheduler::from_config(config, dry_run).await?;
    let registry = ToolRegistry::for_scheduler(scheduler.clone());
    let dispatch = scheduler.start();

    let result = tokio::select! {
        res = feed_actions(&registry, name, actions) => res,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; stopping without waiting for tasks");
            Ok(())
        }
    };
    let result = match result {
        Ok(()) => tokio::select! {
            res = settle_outstanding(&scheduler) => res,
            _ = tokio::signal::ctrl_c() => Ok(()),
        },
        Err(e) => Err(e),
    };

    scheduler.shutdown().await;
    let _ = dispatch.await;
    result
}

/// Run each action in turn, from the arguments or else from stdin.
async fn feed_actions(registry: &ToolRegistry, name: &str, actions: Vec<String>) -> Result<()> {
    if !actions.is_empty() {
        for line in &actions {
            if let Some(reply) = run_action(registry, name, line).await? {
                println!("{reply}");
            }
        }
        return Ok(());
    }
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if let Some(reply) = run_action(registry, name, &line).await? {
            println!("{reply}");
        }
    }
    Ok(())
}

/// Parse one JSON action and hand it to the tool. Blank lines are skipped.
async fn run_action(registry: &ToolRegistry, name: &str, line: &str) -> Result<Option<String>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let params: serde_json::Value =
        serde_json::from_str(line).with_context(|| format!("invalid action JSON: {line}"))?;
    Ok(Some(registry.execute(name, params).await?))
}

/// Wait for the tasks the actions left behind, unless nothing can run them.
async fn settle_outstanding(scheduler: &Scheduler) -> Result<()> {
    if scheduler.is_paused().await {
        warn!("Scheduler is paused; leaving queued tasks unfinished");
        return Ok(());
    }
    let gaps = scheduler.capability_gaps().await;
    if !gaps.is_empty() {
        for gap in &gaps {
            warn!("{gap}");
        }
        warn!("Not waiting for tasks no agent can run");
        return Ok(());
    }
    for wf in scheduler.list_workflows().await {
        if wf.status == WorkflowStatus::Active && wf.outstanding_tasks() > 0 {
            info!(
                "Waiting for {} task(s) of workflow {}",
                wf.outstanding_tasks(),
                wf.id
            );
            scheduler.wait_for_workflow_idle(&wf.id).await?;
        }
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    let wf = &report.workflow;
    println!();
    println!(
        "Workflow '{}' (id: {}) {} in {:.1}s",
        wf.name,
        wf.id,
        wf.status,
        report.elapsed.as_secs_f64()
    );
    if wf.status == WorkflowStatus::Failed {
        if let Some(reason) = &wf.failure_reason {
            println!("Reason: {reason}");
        }
    }
    if wf.tasks.is_empty() {
        println!("No tasks ran.");
        return;
    }
    println!();
    println!(
        "{:<10} {:<15} {:<10} {:<10} {:<9} {:<8} Output",
        "ID", "Phase", "Status", "Agent", "Started", "Took"
    );
    println!("{}", "-".repeat(90));
    for task in &wf.tasks {
        println!(
            "{:<10} {:<15} {:<10} {:<10} {:<9} {:<8} {}",
            task.id,
            task.phase.as_str(),
            task.status.as_str(),
            task.assigned_agent_id.as_deref().unwrap_or("-"),
            started_at(task),
            duration(task),
            one_line(task.error.as_deref().or(task.result.as_deref()).unwrap_or(""), 40),
        );
    }
}

fn started_at(task: &Task) -> String {
    task.started_at_ms
        .and_then(chrono::DateTime::from_timestamp_millis)
        .map(|dt| dt.with_timezone(&chrono::Local).format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "-".into())
}

fn duration(task: &Task) -> String {
    match (task.started_at_ms, task.ended_at_ms) {
        (Some(start), Some(end)) => format!("{:.1}s", (end - start) as f64 / 1000.0),
        _ => "-".into(),
    }
}

/// First line of `text`, cut to `max` chars.
fn one_line(text: &str, max: usize) -> String {
    let line = text.lines().next().unwrap_or("").trim();
    if line.chars().count() <= max {
        return line.to_string();
    }
    let cut: String = line.chars().take(max.saturating_sub(3)).collect();
    format!("{cut}...")
}
