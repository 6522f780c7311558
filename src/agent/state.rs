//! Agent run states, the transitions between them and failure kinds.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::script::ScriptError;

/// Lifecycle state of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Running,
    Paused,
    /// A terminal action was reached; waiting for stop or guidance.
    Hung,
    Ended,
    Errored,
    UserStopped,
}

impl AgentState {
    /// No transition leaves a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AgentState::Ended | AgentState::Errored | AgentState::UserStopped
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AgentState::Running => "running",
            AgentState::Paused => "paused",
            AgentState::Hung => "hung",
            AgentState::Ended => "ended",
            AgentState::Errored => "errored",
            AgentState::UserStopped => "user_stopped",
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events that move the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    StepCompleted,
    TerminalAction,
    Pause,
    Resume,
    /// Resume with guidance queued; the only way out of `hung`.
    ResumeWithGuidance,
    Stop,
    /// Close a hung run whose terminal action is configured not to hold.
    Conclude,
    Fault,
}

/// The allowed edges. `None` means the transition is not permitted from `from`.
pub fn next_state(from: AgentState, transition: Transition) -> Option<AgentState> {
    use AgentState::*;
    use Transition::*;
    match (from, transition) {
        (Running, StepCompleted) => Some(Running),
        (Running, TerminalAction) => Some(Hung),
        (Running, Pause) => Some(Paused),
        (Running, Stop) => Some(UserStopped),
        (Running, Fault) => Some(Errored),
        (Paused, Resume) | (Paused, ResumeWithGuidance) => Some(Running),
        (Paused, Stop) => Some(Ended),
        (Hung, ResumeWithGuidance) => Some(Running),
        (Hung, Stop) | (Hung, Conclude) => Some(Ended),
        _ => None,
    }
}

/// Why the run is in its current state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StateReason {
    Finished {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    NeedsHuman {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    UserRequest,
    CaptureUnavailable {
        detail: String,
    },
    ModelUnreachable {
        detail: String,
    },
    UnparseableReplyStreak,
    MaxStepsExceeded,
    /// The same action was executed `streak` times in a row.
    RepeatedAction {
        action: String,
        streak: u32,
    },
}

impl StateReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateReason::Finished { .. } => "finished",
            StateReason::NeedsHuman { .. } => "needs-human",
            StateReason::UserRequest => "user-request",
            StateReason::CaptureUnavailable { .. } => "capture-unavailable",
            StateReason::ModelUnreachable { .. } => "model-unreachable",
            StateReason::UnparseableReplyStreak => "unparseable-reply-streak",
            StateReason::MaxStepsExceeded => "max-steps-exceeded",
            StateReason::RepeatedAction { .. } => "repeated-action",
        }
    }
}

/// Failure kinds recorded in rounds and the event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    CaptureUnavailable,
    ModelUnreachable,
    ModelTimeout,
    UnparseableReply,
    ExecutionError,
    VerificationMismatch,
    ScriptSyntaxError,
    UnknownScript,
    CyclicScript,
    MaxStepsExceeded,
    ActionLimitExceeded,
}

impl From<&ScriptError> for ErrorKind {
    fn from(err: &ScriptError) -> Self {
        match err {
            ScriptError::CyclicScript(_) => ErrorKind::CyclicScript,
            ScriptError::UnknownScript(_)
            | ScriptError::MissingScriptFile { .. }
            | ScriptError::Registry(_)
            | ScriptError::Io(_) => ErrorKind::UnknownScript,
            ScriptError::Syntax { .. }
            | ScriptError::TooDeep(_)
            | ScriptError::UnboundVariable(_)
            | ScriptError::InvalidAction(_) => ErrorKind::ScriptSyntaxError,
        }
    }
}

/// A step failure as recorded in history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl StepFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}
