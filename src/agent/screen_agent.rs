//! The screen agent loop.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::control::{RunControl, StepOutcome};
use super::conversation::{ActionSource, ConversationRound, Verification};
use super::event_log::{EventLog, EventRecord, StepRecord};
use super::state::{AgentState, ErrorKind, StateReason, StepFailure};
use super::verify::{verify, VerifyConfig};
use crate::actions::{parse_reply, Action, Expectation};
use crate::cache::{ActionCache, CacheConfig, CacheStats};
use crate::capture::{CaptureSource, Fingerprint, Fingerprinter, DEFAULT_MASK_TOP_RATIO};
use crate::executor::{perform, ActionExecutor};
use crate::model::{ModelError, ModelRequest, VisionModel};
use crate::script::ScriptEngine;
use crate::supervisor::SupervisorHandle;

/// Configuration for the ScreenAgent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Maximum number of steps before the run errors out.
    pub max_steps: u32,
    /// Consecutive model failures (timeouts, unparseable replies) tolerated.
    pub max_consecutive_failures: u32,
    /// Delay between steps.
    pub loop_interval: Duration,
    /// Delay before the verification capture.
    pub settle_delay: Duration,
    /// How long a `wait` action pauses.
    pub wait_duration: Duration,
    pub model_timeout: Duration,
    /// Assistant rounds sent to the model besides the instruction.
    pub history_rounds: usize,
    pub mask_top_ratio: f32,
    /// Keep waiting for guidance after a terminal action instead of returning.
    pub hold_when_hung: bool,
    /// Hang on `finished` (otherwise the run ends).
    pub hang_on_finished: bool,
    /// Hang on `call_user` (otherwise the run ends).
    pub hang_on_call_user: bool,
    /// Pause when the same action is executed `repeat_action_threshold` times in a row.
    pub pause_on_repeat: bool,
    pub repeat_action_threshold: u32,
    pub cache: CacheConfig,
    pub verify: VerifyConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: 100,
            max_consecutive_failures: 3,
            loop_interval: Duration::from_millis(1000),
            settle_delay: Duration::from_millis(500),
            wait_duration: Duration::from_secs(5),
            model_timeout: Duration::from_secs(120),
            history_rounds: 10,
            mask_top_ratio: DEFAULT_MASK_TOP_RATIO,
            hold_when_hung: true,
            hang_on_finished: true,
            hang_on_call_user: true,
            pause_on_repeat: true,
            repeat_action_threshold: 4,
            cache: CacheConfig::default(),
            verify: VerifyConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Create a new AgentConfig with custom max steps.
    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_loop_interval(mut self, interval: Duration) -> Self {
        self.loop_interval = interval;
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn with_wait_duration(mut self, duration: Duration) -> Self {
        self.wait_duration = duration;
        self
    }

    pub fn with_model_timeout(mut self, timeout: Duration) -> Self {
        self.model_timeout = timeout;
        self
    }

    pub fn with_hold_when_hung(mut self, hold: bool) -> Self {
        self.hold_when_hung = hold;
        self
    }

    pub fn with_hang_on_finished(mut self, hang: bool) -> Self {
        self.hang_on_finished = hang;
        self
    }

    pub fn with_hang_on_call_user(mut self, hang: bool) -> Self {
        self.hang_on_call_user = hang;
        self
    }

    pub fn with_pause_on_repeat(mut self, pause: bool) -> Self {
        self.pause_on_repeat = pause;
        self
    }

    pub fn with_repeat_action_threshold(mut self, threshold: u32) -> Self {
        self.repeat_action_threshold = threshold;
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_verify(mut self, verify: VerifyConfig) -> Self {
        self.verify = verify;
        self
    }
}

/// Result of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub state: AgentState,
    pub reason: Option<StateReason>,
    pub steps: u32,
    pub cache: CacheStats,
}

/// The action chosen for a step, with its provenance.
struct Decision {
    thought: String,
    action: Action,
    source: ActionSource,
    /// Key of the replayed cache entry.
    cache_key: Option<Fingerprint>,
    expected_post: Option<Fingerprint>,
}

/// Drives one task: capture, decide, act, verify, record.
pub struct ScreenAgent {
    config: AgentConfig,
    capture: Arc<dyn CaptureSource>,
    executor: Arc<dyn ActionExecutor>,
    model: Arc<dyn VisionModel>,
    scripts: ScriptEngine,
    cache: ActionCache,
    fingerprinter: Fingerprinter,
    control: Arc<RunControl>,
    failure_streak: u32,
    last_executed: Option<Action>,
    repeat_streak: u32,
}

impl ScreenAgent {
    pub fn new(
        config: AgentConfig,
        capture: Arc<dyn CaptureSource>,
        executor: Arc<dyn ActionExecutor>,
        model: Arc<dyn VisionModel>,
        scripts: ScriptEngine,
    ) -> Self {
        Self {
            cache: ActionCache::new(&config.cache),
            fingerprinter: Fingerprinter::new(config.mask_top_ratio),
            config,
            capture,
            executor,
            model,
            scripts,
            control: Arc::new(RunControl::new(None)),
            failure_streak: 0,
            last_executed: None,
            repeat_streak: 0,
        }
    }

    /// Record the run to `log`. Call before handing out supervisor handles.
    pub fn with_event_log(mut self, log: EventLog) -> Self {
        self.control = Arc::new(RunControl::new(Some(Arc::new(log))));
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn control(&self) -> Arc<RunControl> {
        self.control.clone()
    }

    pub fn supervisor(&self) -> SupervisorHandle {
        SupervisorHandle::new(
            self.control.clone(),
            self.executor.clone(),
            self.scripts.clone(),
            self.config.wait_duration,
        )
    }

    pub fn cache(&self) -> &ActionCache {
        &self.cache
    }

    /// Run `task` until the run reaches a terminal state, or until it hangs when
    /// `hold_when_hung` is off.
    pub async fn run(&mut self, task: &str) -> RunOutcome {
        info!("Starting task: {}", task);
        self.control.start(task);
        let mut steps = 0;

        while let Some(step) = self.control.begin_step().await {
            steps = step;
            let (round, outcome) = {
                let control = self.control.clone();
                let _screen = control.screen_lock().lock().await;
                self.step(task, step).await
            };
            let state = self.control.finish_step(round, outcome);
            match state {
                AgentState::Running => {
                    if !self.config.loop_interval.is_zero() {
                        tokio::time::sleep(self.config.loop_interval).await;
                    }
                }
                AgentState::Hung if !self.config.hold_when_hung => break,
                state if state.is_terminal() => break,
                _ => {}
            }
        }

        let status = self.control.status();
        let stats = self.cache.stats();
        info!(
            "Run finished in state {} after {} steps (cache hits {}, misses {})",
            status.state, steps, stats.hits, stats.misses
        );
        RunOutcome {
            state: status.state,
            reason: status.reason,
            steps,
            cache: stats,
        }
    }

    /// One step. Always produces a round; the outcome decides the next state.
    async fn step(&mut self, task: &str, step: u32) -> (ConversationRound, StepOutcome) {
        let mut round = ConversationRound::assistant(step, "");
        let mut record = StepRecord {
            step_index: step,
            at: Utc::now(),
            fingerprint: None,
            post_fingerprint: None,
            action: None,
            executed: Vec::new(),
            cache_hit: false,
            verification: None,
            error: None,
        };
        let outcome = self.run_step(task, step, &mut round, &mut record).await;

        record.action = round.action.clone();
        record.verification = round.verification;
        record.error = round.error.clone();
        if let Some(log) = self.control.event_log() {
            log.append_or_warn(&EventRecord::Step(record));
        }
        (round, outcome)
    }

    async fn run_step(
        &mut self,
        task: &str,
        step: u32,
        round: &mut ConversationRound,
        record: &mut StepRecord,
    ) -> StepOutcome {
        if step > self.config.max_steps {
            warn!("Step ceiling of {} reached", self.config.max_steps);
            round.error = Some(StepFailure::new(
                ErrorKind::MaxStepsExceeded,
                format!("exceeded {} steps", self.config.max_steps),
            ));
            return StepOutcome::Fault(StateReason::MaxStepsExceeded);
        }

        let pre = match self.capture.capture().await {
            Ok(frame) => frame,
            Err(e) => return Self::capture_fault(round, e.to_string()),
        };
        let pre_fp = self.fingerprinter.fingerprint(&pre);
        record.fingerprint = Some(pre_fp);

        let cached = if self.config.cache.enabled {
            self.cache.lookup(pre_fp)
        } else {
            None
        };
        let decision = match cached {
            Some(entry) => {
                let count = self.cache.mark_used(entry.fingerprint);
                info!(
                    "Step {}: replaying cached {} ({}/{})",
                    step,
                    entry.action,
                    count.unwrap_or(entry.reuse_count + 1),
                    entry.max_reuse
                );
                Decision {
                    thought: String::new(),
                    action: entry.action,
                    source: ActionSource::Cache,
                    cache_key: Some(entry.fingerprint),
                    expected_post: entry.expected_post,
                }
            }
            None => {
                let guidance = self.control.take_guidance(step);
                round.guidance = guidance.clone();
                let request = ModelRequest {
                    task: task.to_string(),
                    frame: pre,
                    history: self.control.history(self.config.history_rounds),
                    guidance,
                };
                match self.ask_model(step, request).await {
                    Ok(decision) => decision,
                    Err((failure, outcome)) => {
                        round.error = Some(failure);
                        return outcome;
                    }
                }
            }
        };

        record.cache_hit = decision.source == ActionSource::Cache;
        round.text = decision.thought.clone();
        round.source = Some(decision.source);
        round.action = Some(decision.action.clone());

        if decision.action.is_terminal() {
            round.verification = Some(Verification::Skipped);
            let (reason, hang) = match &decision.action {
                Action::CallUser { message } => (
                    StateReason::NeedsHuman {
                        message: message.clone(),
                    },
                    self.config.hang_on_call_user,
                ),
                Action::Finished { message } => (
                    StateReason::Finished {
                        message: message.clone(),
                    },
                    self.config.hang_on_finished,
                ),
                _ => (
                    StateReason::Finished { message: None },
                    self.config.hang_on_finished,
                ),
            };
            info!("Step {}: {}", step, decision.action);
            return if hang {
                StepOutcome::Terminal(reason)
            } else {
                StepOutcome::Conclude(reason)
            };
        }

        let primitives = match self.scripts.expand_action(&decision.action) {
            Ok(primitives) => primitives,
            Err(e) => {
                warn!("Step {}: script expansion failed: {}", step, e);
                self.drop_replayed(&decision);
                round.verification = Some(Verification::Skipped);
                round.error = Some(StepFailure::new(ErrorKind::from(&e), e.to_string()));
                return StepOutcome::Continue;
            }
        };

        for primitive in &primitives {
            debug!("Step {}: performing {}", step, primitive);
            let performed =
                perform(self.executor.as_ref(), primitive, self.config.wait_duration).await;
            if let Err(e) = performed {
                warn!("Step {}: {} failed: {}", step, primitive, e);
                self.drop_replayed(&decision);
                round.verification = Some(Verification::Skipped);
                round.error = Some(StepFailure::new(ErrorKind::ExecutionError, e.to_string()));
                return StepOutcome::Continue;
            }
            record.executed.push(primitive.clone());
        }
        let settled = self.note_executed(step, &decision.action);

        let expectation = Self::expectation_for(&decision.action, &primitives);
        if expectation == Expectation::Unverifiable {
            round.verification = Some(Verification::Skipped);
            return settled;
        }

        if !self.config.settle_delay.is_zero() {
            tokio::time::sleep(self.config.settle_delay).await;
        }
        let post = match self.capture.capture().await {
            Ok(frame) => frame,
            Err(e) => return Self::capture_fault(round, e.to_string()),
        };
        let post_fp = self.fingerprinter.fingerprint(&post);
        record.post_fingerprint = Some(post_fp);

        let verification = verify(
            expectation,
            pre_fp,
            post_fp,
            decision.expected_post,
            &self.config.verify,
        );
        round.verification = Some(verification);

        match (verification, decision.source) {
            (Verification::Failed, _) => {
                info!("Step {}: {} did not verify", step, decision.action);
                self.drop_replayed(&decision);
                round.error = Some(StepFailure::new(
                    ErrorKind::VerificationMismatch,
                    format!("screen {} -> {} after {}", pre_fp, post_fp, decision.action),
                ));
            }
            (Verification::Passed, ActionSource::Model) if self.config.cache.enabled => {
                if self.cache.record(pre_fp, decision.action.clone(), Some(post_fp)) {
                    debug!("Step {}: cached {} for {}", step, decision.action, pre_fp);
                }
            }
            _ => {}
        }
        info!("Step {}: {} ({:?})", step, decision.action, verification);
        settled
    }

    /// Call the model and parse its reply. Failures count toward the streak.
    async fn ask_model(
        &mut self,
        step: u32,
        request: ModelRequest,
    ) -> Result<Decision, (StepFailure, StepOutcome)> {
        let reply =
            tokio::time::timeout(self.config.model_timeout, self.model.infer(request)).await;
        let failure = match reply {
            Err(_) => StepFailure::new(ErrorKind::ModelTimeout, "model call timed out"),
            Ok(Err(e)) if e.is_unreachable() => {
                error!("Step {}: model unreachable: {}", step, e);
                return Err((
                    StepFailure::new(ErrorKind::ModelUnreachable, e.to_string()),
                    StepOutcome::Fault(StateReason::ModelUnreachable {
                        detail: e.to_string(),
                    }),
                ));
            }
            Ok(Err(ModelError::Timeout)) => {
                StepFailure::new(ErrorKind::ModelTimeout, "model call timed out")
            }
            Ok(Err(ModelError::ParseError(message))) => {
                StepFailure::new(ErrorKind::UnparseableReply, message)
            }
            Ok(Err(e)) => StepFailure::new(ErrorKind::ModelUnreachable, e.to_string()),
            Ok(Ok(text)) => match parse_reply(&text) {
                Ok(parsed) => {
                    self.failure_streak = 0;
                    return Ok(Decision {
                        thought: parsed.thought,
                        action: parsed.action,
                        source: ActionSource::Model,
                        cache_key: None,
                        expected_post: None,
                    });
                }
                Err(e) => StepFailure::new(
                    ErrorKind::UnparseableReply,
                    format!("{}: {}", e, text.trim()),
                ),
            },
        };

        self.failure_streak += 1;
        warn!(
            "Step {}: model failure {}/{}: {}",
            step, self.failure_streak, self.config.max_consecutive_failures, failure.message
        );
        let outcome = if self.failure_streak >= self.config.max_consecutive_failures {
            StepOutcome::Fault(StateReason::UnparseableReplyStreak)
        } else {
            StepOutcome::Continue
        };
        Err((failure, outcome))
    }

    /// Track runs of identical executed actions. A run reaching the threshold
    /// pauses the agent and starts a fresh count.
    fn note_executed(&mut self, step: u32, action: &Action) -> StepOutcome {
        if !self.config.pause_on_repeat {
            return StepOutcome::Continue;
        }
        if self.last_executed.as_ref() == Some(action) {
            self.repeat_streak += 1;
        } else {
            self.repeat_streak = 1;
            self.last_executed = Some(action.clone());
        }
        if self.repeat_streak < self.config.repeat_action_threshold {
            return StepOutcome::Continue;
        }
        let streak = std::mem::take(&mut self.repeat_streak);
        self.last_executed = None;
        warn!("Step {}: {} executed {} times in a row", step, action, streak);
        StepOutcome::Pause(StateReason::RepeatedAction {
            action: action.to_string(),
            streak,
        })
    }

    fn capture_fault(round: &mut ConversationRound, detail: String) -> StepOutcome {
        error!("Capture unavailable: {}", detail);
        round.error = Some(StepFailure::new(ErrorKind::CaptureUnavailable, detail.clone()));
        StepOutcome::Fault(StateReason::CaptureUnavailable { detail })
    }

    /// Scripts count as screen-changing unless they only pause.
    fn expectation_for(action: &Action, primitives: &[Action]) -> Expectation {
        match action {
            Action::RunScript { .. } if primitives.iter().all(Action::is_pause) => {
                Expectation::Unverifiable
            }
            Action::RunScript { .. } => Expectation::ScreenChanged,
            other => other.expectation(),
        }
    }

    fn drop_replayed(&mut self, decision: &Decision) {
        if let Some(key) = decision.cache_key {
            self.cache.invalidate(key);
        }
    }
}
