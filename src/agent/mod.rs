//! Agent module: the step loop, its run state and its records.

mod control;
mod conversation;
mod event_log;
mod screen_agent;
mod state;
mod verify;

pub use control::{AgentStatus, ControlError, RunControl, StepOutcome, SupervisorEvent};
pub use conversation::{ActionSource, Conversation, ConversationRound, Role, Verification};
pub use event_log::{
    AgentError, EventLog, EventRecord, ScriptRunRecord, StateRecord, StepRecord, EVENT_LOG_FILE,
};
pub use screen_agent::{AgentConfig, RunOutcome, ScreenAgent};
pub use state::{next_state, AgentState, ErrorKind, StateReason, StepFailure, Transition};
pub use verify::{verify, VerifyConfig};
