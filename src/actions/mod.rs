//! Actions module: the action vocabulary and the parsers that produce it.

pub mod parser;
mod types;

use thiserror::Error;

pub use parser::{
    build_action, is_known_action, parse_call, parse_point, parse_reply, CallArg, CallArgs,
    ParsedReply,
};
pub use types::{
    quote, render_call, Action, Direction, Expectation, Point, DEFAULT_SLEEP_MS, MODEL_COORD_MAX,
};

/// Action parsing errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActionError {
    #[error("Unknown action: {0}")]
    UnknownAction(String),
    #[error("Missing required parameter: {0}")]
    MissingParameter(String),
    #[error("Invalid value for {param}: {value}")]
    InvalidParameter { param: String, value: String },
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("No action found in reply")]
    MissingAction,
}
