//! Vision-language model seam and the OpenAI-compatible client.

mod client;

use async_trait::async_trait;
use thiserror::Error;

use crate::agent::ConversationRound;
use crate::capture::Frame;

pub use client::{
    MessageBuilder, ModelClient, ModelConfig, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY_SECS,
};

/// Model client errors.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),
    #[error("Failed to parse response: {0}")]
    ParseError(String),
    #[error("API error {status}: {body}")]
    ApiError { status: u16, body: String },
    #[error("Model request timed out")]
    Timeout,
    #[error("Failed to encode screenshot: {0}")]
    Encode(String),
    #[error("Max retries exceeded after {0} attempts: {1}")]
    MaxRetriesExceeded(u32, String),
}

impl ModelError {
    /// The endpoint could not be reached at all. Fatal to the run; every other
    /// failure counts toward the reply failure streak.
    pub fn is_unreachable(&self) -> bool {
        match self {
            ModelError::MaxRetriesExceeded(..) => true,
            ModelError::RequestFailed(e) => e.is_connect(),
            _ => false,
        }
    }
}

/// Everything the model sees for one decision.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub task: String,
    pub frame: Frame,
    /// Recent rounds, oldest first; always starts with the task instruction.
    pub history: Vec<ConversationRound>,
    pub guidance: Option<String>,
}

/// Decides the next action from a screenshot. Returns the raw reply text.
#[async_trait]
pub trait VisionModel: Send + Sync {
    async fn infer(&self, request: ModelRequest) -> Result<String, ModelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unreachable_classification() {
        assert!(ModelError::MaxRetriesExceeded(3, "connection refused".into()).is_unreachable());
        assert!(!ModelError::Timeout.is_unreachable());
        assert!(!ModelError::ParseError("empty".into()).is_unreachable());
        assert!(!ModelError::ApiError {
            status: 400,
            body: "bad request".into()
        }
        .is_unreachable());
    }
}
