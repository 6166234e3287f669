//! Action Executor - one bounded, side-effecting command invocation.
//!
//! Knows nothing about retries, verification, or fault history. A non-zero
//! exit is a normal, expected result; only the inability to invoke the
//! action at all surfaces as an error.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use remedy_common::ActionDefinition;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{info, warn};

/// Cap on captured command output kept in diagnostics.
const MAX_OUTPUT_LEN: usize = 4096;

/// Executor-internal fault: the action could not be invoked at all.
/// Distinct from a remediation command that runs and fails.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("action '{0}' has an empty command after substitution")]
    EmptyCommand(String),

    #[error("failed to spawn action '{action}': {source}")]
    Spawn {
        action: String,
        #[source]
        source: std::io::Error,
    },
}

/// Outcome of a single execution.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Exit code; None when killed by signal or timed out
    pub exit_code: Option<i32>,
    /// Combined stdout/stderr, bounded
    pub output: String,
    pub duration: Duration,
    pub timed_out: bool,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Seam between the orchestrator and the real command runner, so scenario
/// tests can script outcomes.
#[async_trait]
pub trait ActionRunner: Send + Sync {
    async fn run(
        &self,
        action: &ActionDefinition,
        resource: &str,
        params: &HashMap<String, String>,
    ) -> Result<ExecutionResult, ExecError>;
}

/// Runs remediation commands through the shell with a hard timeout.
pub struct CommandExecutor;

#[async_trait]
impl ActionRunner for CommandExecutor {
    async fn run(
        &self,
        action: &ActionDefinition,
        resource: &str,
        params: &HashMap<String, String>,
    ) -> Result<ExecutionResult, ExecError> {
        let command = render_command(action, resource, params);
        if command.trim().is_empty() {
            return Err(ExecError::EmptyCommand(action.name.clone()));
        }

        info!(
            "Executing action '{}' for {}: {}",
            action.name, resource, command
        );

        let started = Instant::now();
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(&command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the output future on timeout must terminate the child
            .kill_on_drop(true);

        match timeout(action.timeout(), cmd.output()).await {
            Ok(Ok(output)) => {
                let duration = started.elapsed();
                let mut text = String::from_utf8_lossy(&output.stdout).to_string();
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stderr.trim().is_empty() {
                    if !text.is_empty() {
                        text.push('\n');
                    }
                    text.push_str(stderr.trim_end());
                }
                text.truncate(floor_char_boundary(&text, MAX_OUTPUT_LEN));

                let exit_code = output.status.code();
                if output.status.success() {
                    info!(
                        "Action '{}' completed in {:.1}s",
                        action.name,
                        duration.as_secs_f64()
                    );
                } else {
                    warn!(
                        "Action '{}' exited with {:?} after {:.1}s",
                        action.name,
                        exit_code,
                        duration.as_secs_f64()
                    );
                }

                Ok(ExecutionResult {
                    exit_code,
                    output: text,
                    duration,
                    timed_out: false,
                })
            }
            Ok(Err(e)) => Err(ExecError::Spawn {
                action: action.name.clone(),
                source: e,
            }),
            Err(_) => {
                warn!(
                    "Action '{}' timed out after {}s, terminated",
                    action.name, action.timeout_secs
                );
                Ok(ExecutionResult {
                    exit_code: None,
                    output: format!("timed out after {}s", action.timeout_secs),
                    duration: started.elapsed(),
                    timed_out: true,
                })
            }
        }
    }
}

/// Substitute `{resource}` and parameter placeholders into the command
/// template. Invocation params override the action's declared defaults, and
/// param values may themselves reference `{resource}`.
pub fn render_command(
    action: &ActionDefinition,
    resource: &str,
    params: &HashMap<String, String>,
) -> String {
    let mut command = action.command.replace("{resource}", resource);
    for (key, default) in &action.params {
        let value = params
            .get(key)
            .unwrap_or(default)
            .replace("{resource}", resource);
        command = command.replace(&format!("{{{}}}", key), &value);
    }
    for (key, value) in params {
        if !action.params.contains_key(key) {
            let value = value.replace("{resource}", resource);
            command = command.replace(&format!("{{{}}}", key), &value);
        }
    }
    command
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}
