//! Configuration for the screen agent.

mod prompts;

pub use prompts::{get_system_prompt, SYSTEM_PROMPT_EN, SYSTEM_PROMPT_ZH};
