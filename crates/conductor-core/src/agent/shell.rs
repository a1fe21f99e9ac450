use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::executor::{AgentExecutor, TaskAssignment};

const MAX_OUTPUT_LEN: usize = 10_000;

/// Runs a task's command through `sh -c` with safety guards.
///
/// The payload is either the command string itself or an object with a
/// `command` field and an optional `workingDir`.
pub struct ShellExecutor {
    timeout: Duration,
    working_dir: PathBuf,
    deny_patterns: Vec<Regex>,
}

impl ShellExecutor {
    pub fn new(working_dir: PathBuf, timeout_secs: u64) -> Self {
        let deny_patterns: Vec<Regex> = [
            r"\brm\s+-[rf]{1,2}\b",
            r"\bdel\s+/[fq]\b",
            r"\brmdir\s+/s\b",
            r"\b(format|mkfs|diskpart)\b",
            r"\bdd\s+if=",
            r">\s*/dev/sd",
            r"\b(shutdown|reboot|poweroff)\b",
            r":\(\)\s*\{.*\};\s*:",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect();

        Self {
            timeout: Duration::from_secs(timeout_secs),
            working_dir,
            deny_patterns,
        }
    }

    fn guard_command(&self, command: &str) -> Option<&'static str> {
        let lower = command.to_lowercase();
        if self.deny_patterns.iter().any(|re| re.is_match(&lower)) {
            return Some("command blocked by safety guard (dangerous pattern detected)");
        }
        None
    }

    fn resolve_cwd(&self, assignment: &TaskAssignment) -> PathBuf {
        assignment
            .payload
            .get("workingDir")
            .and_then(|v| v.as_str())
            .map(PathBuf::from)
            .unwrap_or_else(|| self.working_dir.clone())
    }
}

#[async_trait]
impl AgentExecutor for ShellExecutor {
    async fn execute(
        &self,
        assignment: TaskAssignment,
        cancel: CancellationToken,
    ) -> Result<String> {
        let command = assignment.instructions();
        if command.trim().is_empty() {
            anyhow::bail!("task {} has no command to run", assignment.task_id);
        }
        if let Some(reason) = self.guard_command(&command) {
            anyhow::bail!("{reason}");
        }

        let cwd = self.resolve_cwd(&assignment);
        debug!(
            "Agent {} running `{command}` in {}",
            assignment.agent_id,
            cwd.display()
        );

        // kill_on_drop reaps the child when a cancel or timeout branch wins.
        let child = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .current_dir(&cwd)
            .kill_on_drop(true)
            .output();

        let output = tokio::select! {
            _ = cancel.cancelled() => anyhow::bail!("cancelled"),
            res = tokio::time::timeout(self.timeout, child) => match res {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => anyhow::bail!("failed to run command: {e}"),
                Err(_) => anyhow::bail!(
                    "command timed out after {} seconds",
                    self.timeout.as_secs()
                ),
            },
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            let detail = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            anyhow::bail!("exit code {code}: {}", truncate(&detail));
        }

        let mut parts = Vec::new();
        if !stdout.is_empty() {
            parts.push(stdout);
        }
        if !stderr.trim().is_empty() {
            parts.push(format!("STDERR:\n{stderr}"));
        }
        let result = if parts.is_empty() {
            "(no output)".to_string()
        } else {
            parts.join("\n")
        };
        Ok(truncate(&result))
    }
}

fn truncate(text: &str) -> String {
    if text.len() <= MAX_OUTPUT_LEN {
        return text.to_string();
    }
    let mut end = MAX_OUTPUT_LEN;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!(
        "{}\n... (truncated, {} more chars)",
        &text[..end],
        text.len() - end
    )
}
