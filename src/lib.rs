// Copyright 2025 Zhipu AI (Original Python implementation)
// Copyright 2025 ModerRAS (Rust implementation)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # Screen Pilot
//!
//! A screen automation agent driven by a vision-language model.
//!
//! Each step captures the target, fingerprints it, and either replays an action
//! that already worked on a similar screen or asks the model for the next one.
//! Actions are executed, verified against a fresh capture and recorded. A
//! supervisor can pause, resume, stop, inspect and guide a running agent, and
//! run registered action scripts while it is paused.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use screen_pilot::{
//!     AgentConfig, CommandCapture, DryRunExecutor, ModelClient, ModelConfig, ScreenAgent,
//!     ScriptEngine,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let capture = CommandCapture::new("screencapture-png");
//!     let model = ModelClient::new(ModelConfig::default());
//!     let mut agent = ScreenAgent::new(
//!         AgentConfig::default().with_hold_when_hung(false),
//!         Arc::new(capture),
//!         Arc::new(DryRunExecutor),
//!         Arc::new(model),
//!         ScriptEngine::new("scripts/registry.json"),
//!     );
//!
//!     let outcome = agent.run("Open the settings app").await;
//!     println!("Run ended as {}", outcome.state);
//!     Ok(())
//! }
//! ```

pub mod actions;
pub mod agent;
pub mod cache;
pub mod capture;
pub mod config;
pub mod executor;
pub mod model;
pub mod script;
pub mod settings;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod test_support;

pub use actions::{parse_reply, Action, ActionError, Direction, Point, MODEL_COORD_MAX};
pub use agent::{
    AgentConfig, AgentError, AgentState, AgentStatus, ConversationRound, EventLog, RunOutcome,
    ScreenAgent, StateReason,
};
pub use cache::{ActionCache, CacheConfig, CacheEntry};
pub use capture::{CaptureError, CaptureSource, CommandCapture, Fingerprint, Frame};
pub use executor::{ActionExecutor, CommandExecutor, DryRunExecutor, ExecutionError};
pub use model::{ModelClient, ModelConfig, ModelError, VisionModel};
pub use script::{Script, ScriptEngine, ScriptError, ScriptRegistry};
pub use settings::AppSettings;
pub use supervisor::{SupervisorConfig, SupervisorError, SupervisorHandle};
