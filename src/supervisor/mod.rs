//! Supervisor control surface: an in-process handle and its HTTP/SSE front.

mod server;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::actions::Action;
use crate::agent::{
    AgentState, AgentStatus, ControlError, ConversationRound, ErrorKind, EventRecord, RunControl,
    ScriptRunRecord, StepFailure, SupervisorEvent,
};
use crate::executor::{perform, ActionExecutor};
use crate::script::{ScriptEngine, ScriptError};

pub use server::{router, serve, SupervisorConfig, DEFAULT_SUPERVISOR_PORT, MAX_BODY_BYTES};

/// Most primitives one supervisor request may execute.
pub const DEFAULT_MAX_ACTIONS: usize = 50;

/// Name recorded for raw action runs.
pub const EXEC_RUN_NAME: &str = "exec";

/// Supervisor errors.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error("Actions run only while paused (agent is {0})")]
    NotPaused(AgentState),
    #[error(transparent)]
    Script(#[from] ScriptError),
    #[error("No actions given")]
    NoActions,
}

/// Body of an inject request. Text and each flag apply independently.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct InjectRequest {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub apply_before_next_call: bool,
    /// Pause after queueing the guidance.
    #[serde(default)]
    pub pause: bool,
    /// Resume after queueing the guidance.
    #[serde(default)]
    pub resume: bool,
}

/// Outcome of an out-of-band run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScriptRunReport {
    pub name: String,
    pub executed: Vec<Action>,
    /// Primitives the request expanded to, including any beyond the action limit.
    pub total: usize,
    pub completed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StepFailure>,
}

/// Controller-side view of a run. Cheap to clone.
#[derive(Clone)]
pub struct SupervisorHandle {
    control: Arc<RunControl>,
    executor: Arc<dyn ActionExecutor>,
    scripts: ScriptEngine,
    wait_duration: Duration,
    max_actions: usize,
}

impl SupervisorHandle {
    pub fn new(
        control: Arc<RunControl>,
        executor: Arc<dyn ActionExecutor>,
        scripts: ScriptEngine,
        wait_duration: Duration,
    ) -> Self {
        Self {
            control,
            executor,
            scripts,
            wait_duration,
            max_actions: DEFAULT_MAX_ACTIONS,
        }
    }

    /// Cap the primitives executed per script or exec request.
    pub fn with_max_actions(mut self, max_actions: usize) -> Self {
        self.max_actions = max_actions.max(1);
        self
    }

    pub fn get_status(&self) -> AgentStatus {
        self.control.status()
    }

    pub fn get_context(&self, tail_rounds: usize) -> Vec<ConversationRound> {
        self.control.context(tail_rounds)
    }

    pub fn pause(&self) -> Result<AgentState, SupervisorError> {
        Ok(self.control.pause()?)
    }

    pub fn resume(&self) -> Result<AgentState, SupervisorError> {
        Ok(self.control.resume()?)
    }

    pub fn stop(&self) -> Result<AgentState, SupervisorError> {
        Ok(self.control.stop()?)
    }

    pub fn inject(
        &self,
        text: &str,
        apply_before_next_call: bool,
    ) -> Result<AgentStatus, SupervisorError> {
        Ok(self.control.inject(text, apply_before_next_call)?)
    }

    /// Queue guidance, then apply the optional pause and resume flags.
    ///
    /// A pause on a hung run is a no-op: it already holds, and the queued
    /// guidance is kept for the resume.
    pub fn inject_with(&self, request: &InjectRequest) -> Result<AgentStatus, SupervisorError> {
        let has_text = !request.text.trim().is_empty();
        if !has_text && !request.pause && !request.resume {
            return Err(ControlError::EmptyGuidance.into());
        }
        if has_text {
            self.control
                .inject(&request.text, request.apply_before_next_call)?;
        }
        if request.pause {
            match self.control.pause() {
                Ok(_)
                | Err(ControlError::InvalidTransition {
                    from: AgentState::Hung,
                    ..
                }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        if request.resume {
            self.control.resume()?;
        }
        Ok(self.control.status())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.control.subscribe()
    }

    /// Expand and execute a registered script while the run is paused.
    ///
    /// Nothing executes if expansion fails. Execution stops at the first
    /// failing primitive or at the action limit.
    pub async fn run_script(
        &self,
        name: &str,
        vars: &BTreeMap<String, String>,
    ) -> Result<ScriptRunReport, SupervisorError> {
        self.ensure_paused()?;
        let expanded = self.scripts.expand_invocation(name, vars);
        self.execute(name, vars, expanded).await
    }

    /// Execute raw action calls (or script statements) while the run is paused.
    pub async fn exec(&self, actions: &[String]) -> Result<ScriptRunReport, SupervisorError> {
        self.ensure_paused()?;
        let source = actions
            .iter()
            .map(|a| a.trim())
            .filter(|a| !a.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        if source.is_empty() {
            return Err(SupervisorError::NoActions);
        }
        let vars = BTreeMap::new();
        let expanded = self.scripts.expand_source(&source, &vars);
        self.execute(EXEC_RUN_NAME, &vars, expanded).await
    }

    fn ensure_paused(&self) -> Result<(), SupervisorError> {
        match self.control.state() {
            AgentState::Paused => Ok(()),
            state => Err(SupervisorError::NotPaused(state)),
        }
    }

    async fn execute(
        &self,
        name: &str,
        vars: &BTreeMap<String, String>,
        expanded: Result<Vec<Action>, ScriptError>,
    ) -> Result<ScriptRunReport, SupervisorError> {
        let primitives = match expanded {
            Ok(primitives) => primitives,
            Err(e) => {
                warn!("Supervisor run {} failed to expand: {}", name, e);
                let failure = StepFailure::new(ErrorKind::from(&e), e.to_string());
                self.log_run(name, vars, Vec::new(), false, Some(failure));
                return Err(e.into());
            }
        };

        let _screen = self.control.screen_lock().lock().await;
        self.ensure_paused()?;

        info!(
            "Supervisor running {} ({} actions)",
            name,
            primitives.len()
        );
        let mut executed = Vec::with_capacity(primitives.len().min(self.max_actions));
        let mut error = None;
        for primitive in primitives.iter().take(self.max_actions) {
            match perform(self.executor.as_ref(), primitive, self.wait_duration).await {
                Ok(()) => executed.push(primitive.clone()),
                Err(e) => {
                    warn!("Supervisor run {} stopped at {}: {}", name, primitive, e);
                    error = Some(StepFailure::new(
                        ErrorKind::ExecutionError,
                        format!("{}: {}", primitive, e),
                    ));
                    break;
                }
            }
        }
        if error.is_none() && primitives.len() > self.max_actions {
            warn!(
                "Supervisor run {} stopped at the limit of {} actions",
                name, self.max_actions
            );
            error = Some(StepFailure::new(
                ErrorKind::ActionLimitExceeded,
                format!(
                    "{} actions requested, limit is {}",
                    primitives.len(),
                    self.max_actions
                ),
            ));
        }

        let report = ScriptRunReport {
            name: name.to_string(),
            total: primitives.len(),
            completed: error.is_none(),
            executed,
            error,
        };
        self.log_run(
            name,
            vars,
            report.executed.clone(),
            report.completed,
            report.error.clone(),
        );
        Ok(report)
    }

    fn log_run(
        &self,
        name: &str,
        vars: &BTreeMap<String, String>,
        executed: Vec<Action>,
        completed: bool,
        error: Option<StepFailure>,
    ) {
        if let Some(log) = self.control.event_log() {
            log.append_or_warn(&EventRecord::ScriptRun(ScriptRunRecord {
                at: Utc::now(),
                name: name.to_string(),
                vars: vars.clone(),
                executed,
                completed,
                error,
            }));
        }
    }
}
