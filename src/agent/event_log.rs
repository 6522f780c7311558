//! Append-only JSON-lines log of a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use super::conversation::Verification;
use super::state::{AgentState, StateReason, StepFailure};
use crate::actions::Action;
use crate::capture::Fingerprint;
use crate::script::Script;

pub const EVENT_LOG_FILE: &str = "events.jsonl";

/// Agent errors.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Event log I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Event log serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One completed loop step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_index: u32,
    pub at: DateTime<Utc>,
    pub fingerprint: Option<Fingerprint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_fingerprint: Option<Fingerprint>,
    /// The decided action, before script expansion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    /// Primitives actually performed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub executed: Vec<Action>,
    pub cache_hit: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<Verification>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepFailure>,
}

/// Out-of-band actions run by the supervisor, either a named script or raw calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptRunRecord {
    pub at: DateTime<Utc>,
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vars: BTreeMap<String, String>,
    pub executed: Vec<Action>,
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    pub at: DateTime<Utc>,
    pub from: AgentState,
    pub to: AgentState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<StateReason>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventRecord {
    Step(StepRecord),
    ScriptRun(ScriptRunRecord),
    State(StateRecord),
}

/// Writer for one run's `events.jsonl`.
#[derive(Debug)]
pub struct EventLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Create a fresh run directory `<timestamp>_<uuid>` under `record_dir`.
    pub fn for_new_run(record_dir: impl AsRef<Path>) -> Result<Self, AgentError> {
        let run_id = format!(
            "{}_{}",
            Utc::now().format("%Y%m%d_%H%M%S"),
            Uuid::new_v4().simple()
        );
        let dir = record_dir.as_ref().join(run_id);
        fs::create_dir_all(&dir)?;
        debug!("Recording run to {}", dir.display());
        Ok(Self::new(dir.join(EVENT_LOG_FILE)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &EventRecord) -> Result<(), AgentError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Append, logging instead of failing. The log never stops a run.
    pub fn append_or_warn(&self, record: &EventRecord) {
        if let Err(e) = self.append(record) {
            warn!("Failed to write event log {}: {}", self.path.display(), e);
        }
    }

    /// All records written so far. Unreadable lines are skipped.
    pub fn read(&self) -> Result<Vec<EventRecord>, AgentError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)?;
        Ok(content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!("Skipping malformed event log line: {}", e);
                    None
                }
            })
            .collect())
    }

    /// Turn the successful on-screen work of the run into a literal script.
    ///
    /// Failed and terminal steps are dropped, as are steps that only slept or
    /// waited between decisions.
    pub fn export_script(&self) -> Result<Script, AgentError> {
        let mut actions = Vec::new();
        for record in self.read()? {
            match record {
                EventRecord::Step(step) => {
                    let failed = step.error.is_some()
                        || step.verification == Some(Verification::Failed);
                    let skip = match &step.action {
                        None => true,
                        Some(action) => action.is_terminal() || action.is_pause(),
                    };
                    if !failed && !skip {
                        actions.extend(step.executed);
                    }
                }
                EventRecord::ScriptRun(run) if run.completed => actions.extend(run.executed),
                _ => {}
            }
        }
        Ok(Script::from_actions(&actions))
    }
}
