//! Input simulation seam and bundled executors.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use crate::actions::Action;

pub const DEFAULT_EXECUTOR_TIMEOUT_SECS: u64 = 15;

/// Executor errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("Input simulation rejected: {0}")]
    Rejected(String),
    #[error("Executor unavailable: {0}")]
    Unavailable(String),
    #[error("Unsupported action: {0}")]
    Unsupported(String),
    #[error("Executor timed out")]
    Timeout,
}

/// Performs primitive actions against the target.
///
/// Implementations only receive primitives; terminal markers and script
/// invocations are resolved before execution.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, action: &Action) -> Result<(), ExecutionError>;
}

/// Perform one primitive: sleeps and waits are timed locally, everything else goes
/// to the executor.
pub async fn perform(
    executor: &dyn ActionExecutor,
    action: &Action,
    wait: Duration,
) -> Result<(), ExecutionError> {
    match action {
        Action::Sleep { ms } => {
            tokio::time::sleep(Duration::from_millis(*ms)).await;
            Ok(())
        }
        Action::Wait => {
            tokio::time::sleep(wait).await;
            Ok(())
        }
        Action::Finished { .. } | Action::CallUser { .. } | Action::RunScript { .. } => {
            Err(ExecutionError::Unsupported(action.name().to_string()))
        }
        _ => executor.execute(action).await,
    }
}

/// Logs actions without touching the target.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunExecutor;

#[async_trait]
impl ActionExecutor for DryRunExecutor {
    async fn execute(&self, action: &Action) -> Result<(), ExecutionError> {
        info!("[dry-run] {}", action);
        Ok(())
    }
}

/// Runs an external helper per action, passing the action JSON as the last argument.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: Duration::from_secs(DEFAULT_EXECUTOR_TIMEOUT_SECS),
        }
    }

    /// Build from a full command line (`program arg...`). Returns `None` when empty.
    pub fn from_command_line(parts: &[String]) -> Option<Self> {
        let (program, args) = parts.split_first()?;
        Some(Self::new(program.clone()).with_args(args.iter().cloned()))
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl ActionExecutor for CommandExecutor {
    async fn execute(&self, action: &Action) -> Result<(), ExecutionError> {
        let payload = serde_json::to_string(action)
            .map_err(|e| ExecutionError::Rejected(e.to_string()))?;
        debug!("Executing {} via {}", action, self.program);

        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.program)
                .args(&self.args)
                .arg(&payload)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| ExecutionError::Timeout)?
        .map_err(|e| ExecutionError::Unavailable(format!("{}: {}", self.program, e)))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(ExecutionError::Rejected(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )))
        }
    }
}
