//! Shared settings for the screen-pilot binary.
//! Persisted in the platform-specific config directory via `directories::ProjectDirs`,
//! with `SCREEN_PILOT_*` environment variables taking precedence.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::agent::{AgentConfig, VerifyConfig};
use crate::cache::CacheConfig;
use crate::model::ModelConfig;
use crate::script::{ScriptEngine, DEFAULT_MAX_DEPTH};
use crate::supervisor::SupervisorConfig;

const ENV_PREFIX: &str = "SCREEN_PILOT_";

/// Application settings that can be saved and loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Model API base URL
    pub base_url: String,
    /// Model API key
    pub api_key: String,
    /// Model name
    pub model_name: String,
    /// Prompt language ("en" or "cn")
    pub lang: String,
    /// Maximum retries for model requests
    pub max_retries: u32,
    /// Retry delay in seconds
    pub retry_delay: u64,
    pub request_timeout_secs: u64,
    /// Maximum steps for agent
    pub max_steps: u32,
    pub max_consecutive_failures: u32,
    pub loop_interval_ms: u64,
    pub settle_delay_ms: u64,
    pub wait_ms: u64,
    pub model_timeout_secs: u64,
    pub history_rounds: usize,
    pub mask_top_ratio: f32,
    /// Hold the run after `finished()` instead of ending it
    pub hang_on_finished: bool,
    /// Hold the run after `call_user()` instead of ending it
    pub hang_on_call_user: bool,
    /// Pause when the same action repeats `repeat_action_threshold` times in a row
    pub pause_on_repeat: bool,
    pub repeat_action_threshold: u32,
    pub cache_enabled: bool,
    pub hash_threshold: u32,
    pub max_reuse: u32,
    pub cache_capacity: usize,
    pub change_threshold: u32,
    pub replay_tolerance: u32,
    /// Script registry file; empty means `scripts/registry.json` in the config dir
    pub script_registry: String,
    pub max_script_depth: usize,
    /// Program (and arguments) printing a PNG of the target on stdout
    pub capture_command: Vec<String>,
    /// Program (and arguments) receiving each action as JSON
    pub executor_command: Vec<String>,
    /// Log actions instead of executing them
    pub dry_run: bool,
    /// Run recordings directory; empty means the platform data dir
    pub record_dir: String,
    pub supervisor_enabled: bool,
    pub supervisor_host: String,
    pub supervisor_port: u16,
    pub supervisor_token: String,
    /// Allow the supervisor's script and raw-action routes
    pub supervisor_exec: bool,
    pub supervisor_exec_max_actions: usize,
}

impl Default for AppSettings {
    fn default() -> Self {
        let model = ModelConfig::default();
        let agent = AgentConfig::default();
        let cache = CacheConfig::default();
        let verify = VerifyConfig::default();
        let supervisor = SupervisorConfig::default();
        Self {
            base_url: model.base_url,
            api_key: model.api_key,
            model_name: model.model_name,
            lang: model.lang,
            max_retries: model.max_retries,
            retry_delay: model.retry_delay_secs,
            request_timeout_secs: model.request_timeout_secs,
            max_steps: agent.max_steps,
            max_consecutive_failures: agent.max_consecutive_failures,
            loop_interval_ms: agent.loop_interval.as_millis() as u64,
            settle_delay_ms: agent.settle_delay.as_millis() as u64,
            wait_ms: agent.wait_duration.as_millis() as u64,
            model_timeout_secs: agent.model_timeout.as_secs(),
            history_rounds: agent.history_rounds,
            mask_top_ratio: agent.mask_top_ratio,
            hang_on_finished: agent.hang_on_finished,
            hang_on_call_user: agent.hang_on_call_user,
            pause_on_repeat: agent.pause_on_repeat,
            repeat_action_threshold: agent.repeat_action_threshold,
            cache_enabled: cache.enabled,
            hash_threshold: cache.hash_threshold,
            max_reuse: cache.max_reuse,
            cache_capacity: cache.capacity,
            change_threshold: verify.change_threshold,
            replay_tolerance: verify.replay_tolerance,
            script_registry: String::new(),
            max_script_depth: DEFAULT_MAX_DEPTH,
            capture_command: Vec::new(),
            executor_command: Vec::new(),
            dry_run: false,
            record_dir: String::new(),
            supervisor_enabled: supervisor.enabled,
            supervisor_host: supervisor.host,
            supervisor_port: supervisor.port,
            supervisor_token: String::new(),
            supervisor_exec: supervisor.exec_enabled,
            supervisor_exec_max_actions: supervisor.max_actions,
        }
    }
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("dev", "screen-pilot", "screen-pilot")
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn set_parsed<T: FromStr>(target: &mut T, value: Option<String>) {
    if let Some(parsed) = value.and_then(|v| v.trim().parse().ok()) {
        *target = parsed;
    }
}

impl AppSettings {
    /// Get the config directory path.
    pub fn config_dir() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the settings file path.
    pub fn settings_path() -> Option<PathBuf> {
        Self::config_dir().map(|dir| dir.join("settings.json"))
    }

    /// Load settings from the config file, then apply environment overrides.
    pub fn load() -> Self {
        let mut loaded: Self = Self::settings_path()
            .and_then(|path| fs::read_to_string(&path).ok())
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default();
        loaded.apply_overrides(|key| std::env::var(key).ok());
        loaded
    }

    /// Save settings to the config file.
    pub fn save(&self) -> Result<(), String> {
        let dir = Self::config_dir().ok_or("Cannot determine config directory")?;

        fs::create_dir_all(&dir)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;

        let path = dir.join("settings.json");
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize settings: {}", e))?;

        fs::write(&path, content)
            .map_err(|e| format!("Failed to write settings file: {}", e))?;

        Ok(())
    }

    /// Apply `SCREEN_PILOT_*` overrides read through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));
        let command = |name: &str| {
            var(name).map(|v| v.split_whitespace().map(str::to_string).collect::<Vec<_>>())
        };

        if let Some(v) = var("BASE_URL") {
            self.base_url = v;
        }
        if let Some(v) = var("API_KEY") {
            self.api_key = v;
        }
        if let Some(v) = var("MODEL") {
            self.model_name = v;
        }
        if let Some(v) = var("LANG") {
            self.lang = v;
        }
        set_parsed(&mut self.max_retries, var("MAX_RETRIES"));
        set_parsed(&mut self.retry_delay, var("RETRY_DELAY"));
        set_parsed(&mut self.request_timeout_secs, var("REQUEST_TIMEOUT"));
        set_parsed(&mut self.max_steps, var("MAX_STEPS"));
        set_parsed(&mut self.loop_interval_ms, var("LOOP_INTERVAL_MS"));
        set_parsed(&mut self.settle_delay_ms, var("SETTLE_DELAY_MS"));
        set_parsed(&mut self.model_timeout_secs, var("MODEL_TIMEOUT"));
        set_parsed(&mut self.hash_threshold, var("HASH_THRESHOLD"));
        set_parsed(&mut self.max_reuse, var("MAX_REUSE"));
        set_parsed(&mut self.mask_top_ratio, var("MASK_TOP_RATIO"));
        if let Some(flag) = var("HANG_ON_FINISHED").as_deref().and_then(parse_flag) {
            self.hang_on_finished = flag;
        }
        if let Some(flag) = var("HANG_ON_CALL_USER").as_deref().and_then(parse_flag) {
            self.hang_on_call_user = flag;
        }
        if let Some(flag) = var("PAUSE_ON_REPEAT").as_deref().and_then(parse_flag) {
            self.pause_on_repeat = flag;
        }
        set_parsed(&mut self.repeat_action_threshold, var("REPEAT_THRESHOLD"));
        if let Some(flag) = var("CACHE").as_deref().and_then(parse_flag) {
            self.cache_enabled = flag;
        }
        if let Some(v) = var("SCRIPT_REGISTRY") {
            self.script_registry = v;
        }
        if let Some(v) = command("CAPTURE_CMD") {
            self.capture_command = v;
        }
        if let Some(v) = command("EXECUTOR_CMD") {
            self.executor_command = v;
        }
        if let Some(flag) = var("DRY_RUN").as_deref().and_then(parse_flag) {
            self.dry_run = flag;
        }
        if let Some(v) = var("RECORD_DIR") {
            self.record_dir = v;
        }
        if let Some(flag) = var("SUPERVISOR").as_deref().and_then(parse_flag) {
            self.supervisor_enabled = flag;
        }
        if let Some(v) = var("SUPERVISOR_HOST") {
            self.supervisor_host = v;
        }
        set_parsed(&mut self.supervisor_port, var("SUPERVISOR_PORT"));
        if let Some(v) = var("SUPERVISOR_TOKEN") {
            self.supervisor_token = v;
        }
        if let Some(flag) = var("SUPERVISOR_EXEC").as_deref().and_then(parse_flag) {
            self.supervisor_exec = flag;
        }
        set_parsed(
            &mut self.supervisor_exec_max_actions,
            var("SUPERVISOR_EXEC_MAX_ACTIONS"),
        );
    }

    pub fn model_config(&self) -> ModelConfig {
        ModelConfig::default()
            .with_base_url(&self.base_url)
            .with_api_key(&self.api_key)
            .with_model_name(&self.model_name)
            .with_lang(&self.lang)
            .with_max_retries(self.max_retries)
            .with_retry_delay(self.retry_delay)
            .with_request_timeout(self.request_timeout_secs)
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig::default()
            .with_enabled(self.cache_enabled)
            .with_hash_threshold(self.hash_threshold)
            .with_max_reuse(self.max_reuse)
            .with_capacity(self.cache_capacity)
    }

    pub fn verify_config(&self) -> VerifyConfig {
        VerifyConfig::default()
            .with_change_threshold(self.change_threshold)
            .with_replay_tolerance(self.replay_tolerance)
    }

    pub fn agent_config(&self) -> AgentConfig {
        let mut config = AgentConfig::default()
            .with_max_steps(self.max_steps)
            .with_loop_interval(Duration::from_millis(self.loop_interval_ms))
            .with_settle_delay(Duration::from_millis(self.settle_delay_ms))
            .with_wait_duration(Duration::from_millis(self.wait_ms))
            .with_model_timeout(Duration::from_secs(self.model_timeout_secs.max(1)))
            .with_cache(self.cache_config())
            .with_verify(self.verify_config())
            .with_hang_on_finished(self.hang_on_finished)
            .with_hang_on_call_user(self.hang_on_call_user)
            .with_pause_on_repeat(self.pause_on_repeat)
            .with_repeat_action_threshold(self.repeat_action_threshold.max(2));
        config.max_consecutive_failures = self.max_consecutive_failures.max(1);
        config.history_rounds = self.history_rounds;
        config.mask_top_ratio = self.mask_top_ratio;
        config
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            enabled: self.supervisor_enabled,
            host: self.supervisor_host.clone(),
            port: self.supervisor_port,
            token: Some(self.supervisor_token.clone()).filter(|t| !t.is_empty()),
            exec_enabled: self.supervisor_exec,
            max_actions: self.supervisor_exec_max_actions.max(1),
        }
    }

    pub fn script_registry_path(&self) -> PathBuf {
        if !self.script_registry.is_empty() {
            return PathBuf::from(&self.script_registry);
        }
        Self::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("scripts")
            .join("registry.json")
    }

    pub fn script_engine(&self) -> ScriptEngine {
        ScriptEngine::new(self.script_registry_path()).with_max_depth(self.max_script_depth)
    }

    /// Directory that receives one subdirectory per run.
    pub fn record_dir(&self) -> PathBuf {
        if !self.record_dir.is_empty() {
            return PathBuf::from(&self.record_dir);
        }
        project_dirs()
            .map(|dirs| dirs.data_dir().join("runs"))
            .unwrap_or_else(|| PathBuf::from("runs"))
    }

    /// Get logs directory path.
    pub fn logs_dir() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.data_dir().join("logs"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::DEFAULT_SUPERVISOR_PORT;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_match_typed_configs() {
        let settings = AppSettings::default();
        assert_eq!(settings.agent_config().max_steps, AgentConfig::default().max_steps);
        assert_eq!(settings.cache_config(), CacheConfig::default());
        assert_eq!(settings.verify_config(), VerifyConfig::default());
        assert!(!settings.supervisor_config().enabled);
        assert!(settings.supervisor_config().token.is_none());
        assert_eq!(settings.supervisor_config(), SupervisorConfig::default());
        let agent = settings.agent_config();
        assert!(agent.hang_on_finished && agent.hang_on_call_user && agent.pause_on_repeat);
        assert_eq!(agent.repeat_action_threshold, 4);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("SCREEN_PILOT_MODEL", "local-vlm"),
            ("SCREEN_PILOT_MAX_REUSE", "7"),
            ("SCREEN_PILOT_MAX_STEPS", "not a number"),
            ("SCREEN_PILOT_CACHE", "off"),
            ("SCREEN_PILOT_CAPTURE_CMD", "grab --window Notes"),
            ("SCREEN_PILOT_SUPERVISOR", "1"),
            ("SCREEN_PILOT_SUPERVISOR_TOKEN", "t0k"),
        ]);
        let mut settings = AppSettings::default();
        settings.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(settings.model_config().model_name, "local-vlm");
        assert_eq!(settings.cache_config().max_reuse, 7);
        assert!(!settings.cache_config().enabled);
        assert_eq!(settings.max_steps, AppSettings::default().max_steps);
        assert_eq!(settings.capture_command, vec!["grab", "--window", "Notes"]);
        let supervisor = settings.supervisor_config();
        assert!(supervisor.enabled);
        assert_eq!(supervisor.token.as_deref(), Some("t0k"));
    }

    #[test]
    fn test_hold_repeat_and_exec_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("SCREEN_PILOT_HANG_ON_FINISHED", "false"),
            ("SCREEN_PILOT_PAUSE_ON_REPEAT", "no"),
            ("SCREEN_PILOT_REPEAT_THRESHOLD", "1"),
            ("SCREEN_PILOT_SUPERVISOR_EXEC", "on"),
            ("SCREEN_PILOT_SUPERVISOR_EXEC_MAX_ACTIONS", "0"),
        ]);
        let mut settings = AppSettings::default();
        settings.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        let agent = settings.agent_config();
        assert!(!agent.hang_on_finished);
        assert!(agent.hang_on_call_user);
        assert!(!agent.pause_on_repeat);
        assert_eq!(agent.repeat_action_threshold, 2);
        let supervisor = settings.supervisor_config();
        assert!(supervisor.exec_enabled);
        assert_eq!(supervisor.max_actions, 1);
    }

    #[test]
    fn test_partial_settings_file_uses_defaults() {
        let settings: AppSettings = serde_json::from_str(r#"{"max_steps": 12}"#).unwrap();
        assert_eq!(settings.max_steps, 12);
        assert_eq!(settings.supervisor_port, DEFAULT_SUPERVISOR_PORT);
    }

    #[test]
    fn test_explicit_paths() {
        let settings = AppSettings {
            script_registry: "/tmp/scripts.json".to_string(),
            record_dir: "/tmp/runs".to_string(),
            ..Default::default()
        };
        assert_eq!(settings.script_registry_path(), PathBuf::from("/tmp/scripts.json"));
        assert_eq!(settings.record_dir(), PathBuf::from("/tmp/runs"));
    }
}
