//! Run state shared between the loop and its supervisor.
//!
//! All state, the conversation and the guidance slot sit behind one mutex. The
//! loop owns step boundaries: pause and stop requests that arrive mid-step are
//! flagged and applied when the step finishes or the next one begins.

use chrono::Utc;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use super::conversation::{Conversation, ConversationRound};
use super::event_log::{EventLog, EventRecord, StateRecord};
use super::state::{next_state, AgentState, StateReason, Transition};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Control errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("Cannot {request} while {from}")]
    InvalidTransition {
        from: AgentState,
        request: &'static str,
    },
    #[error("Guidance text is empty")]
    EmptyGuidance,
}

/// Snapshot returned by status queries and pushed on every state change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentStatus {
    pub state: AgentState,
    /// Paused, or a pause is pending at the next step boundary.
    pub paused: bool,
    /// Stopped, or a stop is pending at the next step boundary.
    pub stopped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<StateReason>,
    pub step: u32,
    pub in_step: bool,
    pub pending_guidance: bool,
}

/// Pushed to subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SupervisorEvent {
    Step(ConversationRound),
    Status(AgentStatus),
}

/// How a finished step moves the run.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Continue,
    /// Hold for the supervisor, e.g. after a run of identical actions.
    Pause(StateReason),
    /// Terminal action; the run hangs until stopped or guided.
    Terminal(StateReason),
    /// Terminal action that does not hold; the run ends.
    Conclude(StateReason),
    Fault(StateReason),
}

#[derive(Debug, Clone)]
struct PendingGuidance {
    text: String,
    eligible_from_step: u32,
}

#[derive(Debug)]
struct RunInner {
    state: AgentState,
    reason: Option<StateReason>,
    pause_requested: bool,
    stop_requested: bool,
    in_step: bool,
    current_step: u32,
    conversation: Conversation,
    guidance: Option<PendingGuidance>,
    /// State records waiting to be written once the lock is released.
    unlogged: Vec<StateRecord>,
}

pub struct RunControl {
    inner: Mutex<RunInner>,
    state_tx: watch::Sender<AgentState>,
    events: broadcast::Sender<SupervisorEvent>,
    screen: tokio::sync::Mutex<()>,
    event_log: Option<Arc<EventLog>>,
}

impl RunControl {
    pub fn new(event_log: Option<Arc<EventLog>>) -> Self {
        let (state_tx, _) = watch::channel(AgentState::Running);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Mutex::new(RunInner {
                state: AgentState::Running,
                reason: None,
                pause_requested: false,
                stop_requested: false,
                in_step: false,
                current_step: 0,
                conversation: Conversation::new(),
                guidance: None,
                unlogged: Vec::new(),
            }),
            state_tx,
            events,
            screen: tokio::sync::Mutex::new(()),
            event_log,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RunInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop the guard, then write the state records buffered under it.
    fn release(&self, mut inner: MutexGuard<'_, RunInner>) {
        let records = std::mem::take(&mut inner.unlogged);
        drop(inner);
        if let Some(log) = &self.event_log {
            for record in records {
                log.append_or_warn(&EventRecord::State(record));
            }
        }
    }

    pub fn event_log(&self) -> Option<&Arc<EventLog>> {
        self.event_log.as_ref()
    }

    /// Serialises on-screen work between the loop and supervisor script runs.
    pub fn screen_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.screen
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    pub fn watch_state(&self) -> watch::Receiver<AgentState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> AgentState {
        self.lock().state
    }

    pub fn status(&self) -> AgentStatus {
        Self::snapshot(&self.lock())
    }

    fn snapshot(inner: &RunInner) -> AgentStatus {
        AgentStatus {
            state: inner.state,
            paused: inner.state == AgentState::Paused || inner.pause_requested,
            stopped: matches!(inner.state, AgentState::Ended | AgentState::UserStopped)
                || inner.stop_requested,
            reason: inner.reason.clone(),
            step: inner.current_step,
            in_step: inner.in_step,
            pending_guidance: inner.guidance.is_some(),
        }
    }

    /// The most recent `n` rounds.
    pub fn context(&self, n: usize) -> Vec<ConversationRound> {
        self.lock().conversation.tail(n)
    }

    pub fn conversation(&self) -> Vec<ConversationRound> {
        self.lock().conversation.rounds().to_vec()
    }

    /// Apply `transition` if it is an allowed edge. Returns the resulting state.
    fn transition(
        &self,
        inner: &mut RunInner,
        transition: Transition,
        reason: Option<StateReason>,
    ) -> Option<AgentState> {
        let from = inner.state;
        let to = next_state(from, transition)?;
        if to == from {
            return Some(to);
        }
        inner.state = to;
        inner.reason = reason;
        info!("Agent state {} -> {}", from, to);
        self.state_tx.send_replace(to);
        let _ = self
            .events
            .send(SupervisorEvent::Status(Self::snapshot(inner)));
        if self.event_log.is_some() {
            let reason = inner.reason.clone();
            inner.unlogged.push(StateRecord {
                at: Utc::now(),
                from,
                to,
                reason,
            });
        }
        Some(to)
    }

    /// Apply pause/stop requests flagged during a step.
    fn apply_pending(&self, inner: &mut RunInner) {
        if inner.stop_requested {
            inner.stop_requested = false;
            inner.pause_requested = false;
            self.transition(inner, Transition::Stop, Some(StateReason::UserRequest));
        } else if inner.pause_requested {
            inner.pause_requested = false;
            if inner.state == AgentState::Running {
                self.transition(inner, Transition::Pause, Some(StateReason::UserRequest));
            }
        }
    }

    pub fn pause(&self) -> Result<AgentState, ControlError> {
        let mut inner = self.lock();
        let result = match inner.state {
            AgentState::Paused => Ok(AgentState::Paused),
            AgentState::Running if inner.in_step => {
                inner.pause_requested = true;
                Ok(AgentState::Running)
            }
            AgentState::Running => Ok(self
                .transition(&mut inner, Transition::Pause, Some(StateReason::UserRequest))
                .unwrap_or(AgentState::Paused)),
            from => Err(ControlError::InvalidTransition {
                from,
                request: "pause",
            }),
        };
        self.release(inner);
        result
    }

    /// Resume a paused run, or a hung run that has guidance queued.
    pub fn resume(&self) -> Result<AgentState, ControlError> {
        let mut inner = self.lock();
        let transition = if inner.guidance.is_some() {
            Transition::ResumeWithGuidance
        } else {
            Transition::Resume
        };
        let result = match inner.state {
            AgentState::Running => {
                inner.pause_requested = false;
                Ok(AgentState::Running)
            }
            from => self
                .transition(&mut inner, transition, None)
                .ok_or(ControlError::InvalidTransition {
                    from,
                    request: "resume",
                }),
        };
        self.release(inner);
        result
    }

    pub fn stop(&self) -> Result<AgentState, ControlError> {
        let mut inner = self.lock();
        let result = match inner.state {
            AgentState::Running if inner.in_step => {
                inner.stop_requested = true;
                Ok(AgentState::Running)
            }
            state if state.is_terminal() => Ok(state),
            from => self
                .transition(&mut inner, Transition::Stop, Some(StateReason::UserRequest))
                .ok_or(ControlError::InvalidTransition {
                    from,
                    request: "stop",
                }),
        };
        self.release(inner);
        result
    }

    /// Queue guidance for the next eligible model call. Repeated injections
    /// before consumption are joined.
    ///
    /// With `apply_before_next_call`, guidance injected mid-step is still taken by
    /// that step if its model call has not happened yet; otherwise it waits for
    /// the following step.
    pub fn inject(
        &self,
        text: &str,
        apply_before_next_call: bool,
    ) -> Result<AgentStatus, ControlError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ControlError::EmptyGuidance);
        }
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return Err(ControlError::InvalidTransition {
                from: inner.state,
                request: "inject",
            });
        }
        let eligible_from_step = if inner.in_step && apply_before_next_call {
            inner.current_step
        } else {
            inner.current_step + 1
        };
        let pending = match inner.guidance.take() {
            Some(existing) => PendingGuidance {
                text: format!("{}\n{}", existing.text, text),
                eligible_from_step: existing.eligible_from_step.min(eligible_from_step),
            },
            None => PendingGuidance {
                text: text.to_string(),
                eligible_from_step,
            },
        };
        info!("Guidance queued for step {}", pending.eligible_from_step);
        inner.guidance = Some(pending);
        Ok(Self::snapshot(&inner))
    }

    /// Start a run: record the instruction as step 0.
    pub fn start(&self, task: &str) {
        let mut inner = self.lock();
        inner.conversation.push(ConversationRound::instruction(task));
        inner.current_step = 0;
    }

    /// Wait until the run may take a step. Returns the new step index, or `None`
    /// once the run has reached a terminal state.
    pub async fn begin_step(&self) -> Option<u32> {
        loop {
            let mut rx = match self.try_begin_step() {
                Ok(step) => return step,
                Err(rx) => rx,
            };
            if rx.changed().await.is_err() {
                return None;
            }
        }
    }

    /// `Ok` with the step decision, or `Err` with a receiver to wait on while
    /// the run is paused or hung.
    fn try_begin_step(&self) -> Result<Option<u32>, watch::Receiver<AgentState>> {
        let mut inner = self.lock();
        self.apply_pending(&mut inner);
        let decided = match inner.state {
            AgentState::Running => {
                inner.in_step = true;
                inner.current_step += 1;
                Ok(Some(inner.current_step))
            }
            state if state.is_terminal() => Ok(None),
            _ => {
                let mut rx = self.state_tx.subscribe();
                rx.borrow_and_update();
                Err(rx)
            }
        };
        self.release(inner);
        decided
    }

    /// Take queued guidance if it is eligible for `step`.
    pub fn take_guidance(&self, step: u32) -> Option<String> {
        let mut inner = self.lock();
        match &inner.guidance {
            Some(pending) if step >= pending.eligible_from_step => {
                inner.guidance.take().map(|g| g.text)
            }
            _ => None,
        }
    }

    /// The instruction plus the most recent `tail` rounds after it.
    pub fn history(&self, tail: usize) -> Vec<ConversationRound> {
        let inner = self.lock();
        let rounds = inner.conversation.rounds();
        let mut history: Vec<ConversationRound> = rounds
            .iter()
            .take_while(|r| r.step_index == 0)
            .cloned()
            .collect();
        let rest = &rounds[history.len()..];
        history.extend_from_slice(&rest[rest.len().saturating_sub(tail)..]);
        history
    }

    /// Close the current step: append its round, then apply the outcome and any
    /// pending requests. Returns the resulting state.
    pub fn finish_step(&self, round: ConversationRound, outcome: StepOutcome) -> AgentState {
        let mut inner = self.lock();
        inner.in_step = false;
        if !inner.conversation.push(round.clone()) {
            warn!("Dropping out-of-order round {}", round.step_index);
        }
        let _ = self.events.send(SupervisorEvent::Step(round));

        match outcome {
            StepOutcome::Continue => {
                self.transition(&mut inner, Transition::StepCompleted, None);
            }
            StepOutcome::Pause(reason) => {
                warn!("Pausing for the supervisor: {}", reason.as_str());
                self.transition(&mut inner, Transition::Pause, Some(reason));
            }
            StepOutcome::Terminal(reason) => {
                self.transition(&mut inner, Transition::TerminalAction, Some(reason));
            }
            StepOutcome::Conclude(reason) => {
                self.transition(&mut inner, Transition::TerminalAction, Some(reason.clone()));
                self.transition(&mut inner, Transition::Conclude, Some(reason));
            }
            StepOutcome::Fault(reason) => {
                self.transition(&mut inner, Transition::Fault, Some(reason));
            }
        }
        self.apply_pending(&mut inner);
        let state = inner.state;
        self.release(inner);
        state
    }
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new(None)
    }
}
