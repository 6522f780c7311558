//! Append-only conversation history of a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::StepFailure;
use crate::actions::Action;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Where the step's action came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionSource {
    Model,
    Cache,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verification {
    Passed,
    Failed,
    /// Sleep, wait and anything that never executed.
    Skipped,
}

/// One round of the conversation. Step 0 is the task instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRound {
    pub step_index: u32,
    pub role: Role,
    /// Reasoning for assistant rounds, the task text for the instruction.
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ActionSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<Verification>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepFailure>,
    /// Supervisor guidance consumed by this step's model call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidance: Option<String>,
    pub at: DateTime<Utc>,
}

impl ConversationRound {
    pub fn instruction(task: impl Into<String>) -> Self {
        Self {
            step_index: 0,
            role: Role::User,
            text: task.into(),
            source: None,
            action: None,
            verification: None,
            error: None,
            guidance: None,
            at: Utc::now(),
        }
    }

    pub fn assistant(step_index: u32, text: impl Into<String>) -> Self {
        Self {
            step_index,
            role: Role::Assistant,
            text: text.into(),
            source: None,
            action: None,
            verification: None,
            error: None,
            guidance: None,
            at: Utc::now(),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some() || self.verification == Some(Verification::Failed)
    }
}

/// Rounds ordered by strictly increasing step index.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    rounds: Vec<ConversationRound>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a round. Rounds that would break the ordering are refused.
    pub fn push(&mut self, round: ConversationRound) -> bool {
        if let Some(last) = self.rounds.last() {
            if round.step_index <= last.step_index {
                return false;
            }
        }
        self.rounds.push(round);
        true
    }

    pub fn rounds(&self) -> &[ConversationRound] {
        &self.rounds
    }

    /// The most recent `n` rounds, oldest first.
    pub fn tail(&self, n: usize) -> Vec<ConversationRound> {
        let start = self.rounds.len().saturating_sub(n);
        self.rounds[start..].to_vec()
    }

    pub fn last_step(&self) -> Option<u32> {
        self.rounds.last().map(|r| r.step_index)
    }

    pub fn len(&self) -> usize {
        self.rounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rounds_strictly_increase() {
        let mut conversation = Conversation::new();
        assert!(conversation.push(ConversationRound::instruction("open settings")));
        assert!(conversation.push(ConversationRound::assistant(1, "tap")));
        assert!(!conversation.push(ConversationRound::assistant(1, "again")));
        assert!(!conversation.push(ConversationRound::assistant(0, "older")));
        assert!(conversation.push(ConversationRound::assistant(3, "skip ahead")));
        assert_eq!(conversation.len(), 3);
        assert_eq!(conversation.last_step(), Some(3));
    }

    #[test]
    fn test_tail_is_oldest_first() {
        let mut conversation = Conversation::new();
        conversation.push(ConversationRound::instruction("task"));
        for step in 1..=4 {
            conversation.push(ConversationRound::assistant(step, format!("step {}", step)));
        }
        let tail = conversation.tail(2);
        assert_eq!(
            tail.iter().map(|r| r.step_index).collect::<Vec<_>>(),
            vec![3, 4]
        );
        assert_eq!(conversation.tail(50).len(), 5);
        assert!(conversation.tail(0).is_empty());
    }

    #[test]
    fn test_round_serialization_skips_empty_fields() {
        let round = ConversationRound::instruction("task");
        let json = serde_json::to_value(&round).unwrap();
        assert_eq!(json["role"], "user");
        assert!(json.get("action").is_none());
        assert!(json.get("error").is_none());
    }
}
