//! Model client for AI inference using OpenAI-compatible API.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::{ModelError, ModelRequest, VisionModel};
use crate::agent::{ConversationRound, Role};
use crate::config::get_system_prompt;

/// Default number of retry attempts for failed requests.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay between retry attempts in seconds.
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 2;

/// Default per-request HTTP timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Configuration for the AI model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub base_url: String,
    pub api_key: String,
    pub model_name: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub frequency_penalty: f32,
    pub extra_body: HashMap<String, Value>,
    /// Maximum number of retry attempts for failed requests.
    pub max_retries: u32,
    /// Delay between retry attempts in seconds.
    pub retry_delay_secs: u64,
    pub request_timeout_secs: u64,
    /// Prompt language ("en" or "cn").
    pub lang: String,
    /// Replaces the built-in system prompt when set.
    pub system_prompt: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/v1".to_string(),
            api_key: "EMPTY".to_string(),
            model_name: "ui-tars-1.5-7b".to_string(),
            max_tokens: 3000,
            temperature: 0.0,
            top_p: 0.85,
            frequency_penalty: 0.2,
            extra_body: HashMap::new(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_secs: DEFAULT_RETRY_DELAY_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            lang: "en".to_string(),
            system_prompt: None,
        }
    }
}

impl ModelConfig {
    /// Create a new ModelConfig with custom base URL.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Create a new ModelConfig with custom API key.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    /// Create a new ModelConfig with custom model name.
    pub fn with_model_name(mut self, model_name: impl Into<String>) -> Self {
        self.model_name = model_name.into();
        self
    }

    /// Set the maximum number of retry attempts for failed requests.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the delay between retry attempts in seconds.
    pub fn with_retry_delay(mut self, delay_secs: u64) -> Self {
        self.retry_delay_secs = delay_secs;
        self
    }

    pub fn with_request_timeout(mut self, timeout_secs: u64) -> Self {
        self.request_timeout_secs = timeout_secs;
        self
    }

    pub fn with_lang(mut self, lang: impl Into<String>) -> Self {
        self.lang = lang.into();
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }
}

/// OpenAI API response structures.
#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Deserialize)]
struct Message {
    #[serde(default)]
    content: Option<String>,
}

/// Client for interacting with OpenAI-compatible vision-language models.
pub struct ModelClient {
    config: ModelConfig,
    client: Client,
}

impl ModelClient {
    /// Create a new ModelClient with the given configuration.
    pub fn new(config: ModelConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    /// Create a new ModelClient with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ModelConfig::default())
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn system_prompt(&self) -> String {
        self.config
            .system_prompt
            .clone()
            .unwrap_or_else(|| get_system_prompt(&self.config.lang))
    }

    /// Build the chat messages for one decision.
    pub fn build_messages(&self, request: &ModelRequest) -> Result<Vec<Value>, ModelError> {
        let mut messages = vec![MessageBuilder::create_system_message(&self.system_prompt())];

        for round in &request.history {
            match round.role {
                Role::Assistant => {
                    messages.push(MessageBuilder::create_assistant_message(
                        &MessageBuilder::render_round(round),
                    ));
                    if let Some(error) = &round.error {
                        messages.push(MessageBuilder::create_user_message(
                            &format!(
                                "[Step {} failed: {}] {}",
                                round.step_index,
                                serde_json::to_value(error.kind)
                                    .ok()
                                    .and_then(|v| v.as_str().map(str::to_string))
                                    .unwrap_or_default(),
                                error.message
                            ),
                            None,
                        ));
                    }
                }
                Role::User | Role::System if round.step_index == 0 => {
                    messages.push(MessageBuilder::create_user_message(
                        &format!("Task: {}", round.text),
                        None,
                    ));
                }
                Role::User | Role::System => {
                    messages.push(MessageBuilder::create_user_message(&round.text, None));
                }
            }
        }

        if let Some(guidance) = request.guidance.as_deref().filter(|g| !g.trim().is_empty()) {
            messages.push(MessageBuilder::create_user_message(
                &format!("[Supervisor Guidance]\n{}", guidance.trim()),
                None,
            ));
        }

        let image = request
            .frame
            .to_base64_png()
            .map_err(|e| ModelError::Encode(e.to_string()))?;
        messages.push(MessageBuilder::create_user_message(
            &format!("Task: {}\nCurrent screenshot attached.", request.task),
            Some(&image),
        ));
        Ok(messages)
    }

    /// Send a request to the model and return the raw reply content.
    pub async fn request(&self, messages: &[Value]) -> Result<String, ModelError> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));

        let mut body = json!({
            "messages": messages,
            "model": self.config.model_name,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
            "top_p": self.config.top_p,
            "frequency_penalty": self.config.frequency_penalty,
        });

        // Merge extra_body
        if let Value::Object(ref mut map) = body {
            for (key, value) in &self.config.extra_body {
                map.insert(key.clone(), value.clone());
            }
        }

        let mut last_error: Option<ModelError> = None;
        let max_attempts = self.config.max_retries + 1;

        for attempt in 1..=max_attempts {
            match self.send_request(&url, &body).await {
                Ok(content) => return Ok(content),
                Err(e) if !Self::is_retryable_error(&e) => return Err(e),
                Err(e) => {
                    if attempt < max_attempts {
                        warn!(
                            "Model request failed (attempt {}/{}): {}. Retrying in {}s",
                            attempt, max_attempts, e, self.config.retry_delay_secs
                        );
                        sleep(Duration::from_secs(self.config.retry_delay_secs)).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(ModelError::MaxRetriesExceeded(
            max_attempts,
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "Unknown error".to_string()),
        ))
    }

    /// Network failures, server errors and rate limits are retried.
    fn is_retryable_error(error: &ModelError) -> bool {
        match error {
            ModelError::RequestFailed(e) => !e.is_timeout() && !e.is_decode(),
            ModelError::ApiError { status, .. } => *status == 429 || *status >= 500,
            ModelError::ParseError(_)
            | ModelError::Timeout
            | ModelError::Encode(_)
            | ModelError::MaxRetriesExceeded(..) => false,
        }
    }

    /// Send a single request to the API.
    async fn send_request(&self, url: &str, body: &Value) -> Result<String, ModelError> {
        let response = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(Self::classify)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::ApiError {
                status: status.as_u16(),
                body,
            });
        }

        let completion: ChatCompletionResponse = response.json().await.map_err(Self::classify)?;
        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| ModelError::ParseError("No content in response".to_string()))?;
        debug!("Model reply: {}", content);
        Ok(content)
    }

    fn classify(error: reqwest::Error) -> ModelError {
        if error.is_timeout() {
            ModelError::Timeout
        } else if error.is_decode() {
            ModelError::ParseError(error.to_string())
        } else {
            ModelError::RequestFailed(error)
        }
    }
}

#[async_trait]
impl VisionModel for ModelClient {
    async fn infer(&self, request: ModelRequest) -> Result<String, ModelError> {
        let messages = self.build_messages(&request)?;
        self.request(&messages).await
    }
}

/// Helper for building conversation messages.
pub struct MessageBuilder;

impl MessageBuilder {
    /// Create a system message.
    pub fn create_system_message(content: &str) -> Value {
        json!({
            "role": "system",
            "content": content
        })
    }

    /// Create a user message with optional image.
    pub fn create_user_message(text: &str, image_base64: Option<&str>) -> Value {
        let mut content = Vec::new();

        if let Some(img_data) = image_base64 {
            content.push(json!({
                "type": "image_url",
                "image_url": {
                    "url": format!("data:image/png;base64,{}", img_data)
                }
            }));
        }

        content.push(json!({
            "type": "text",
            "text": text
        }));

        json!({
            "role": "user",
            "content": content
        })
    }

    /// Create an assistant message.
    pub fn create_assistant_message(content: &str) -> Value {
        json!({
            "role": "assistant",
            "content": content
        })
    }

    /// Render a past assistant round the way the model would have written it.
    pub fn render_round(round: &ConversationRound) -> String {
        let action = round
            .action
            .as_ref()
            .map(|a| a.to_call())
            .unwrap_or_default();
        if round.text.trim().is_empty() {
            format!("Action: {}", action)
        } else {
            format!("Thought: {}\nAction: {}", round.text.trim(), action)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{Action, Point};
    use crate::agent::{ErrorKind, StepFailure};
    use crate::test_support::gradient_frame;
    use axum::{http::StatusCode, routing::post, Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn request_with_history() -> ModelRequest {
        let mut click = ConversationRound::assistant(1, "The button is visible");
        click.action = Some(Action::Click {
            point: Point::new(10, 20),
        });
        click.error = Some(StepFailure::new(ErrorKind::ExecutionError, "input rejected"));
        ModelRequest {
            task: "open settings".to_string(),
            frame: gradient_frame(true),
            history: vec![ConversationRound::instruction("open settings"), click],
            guidance: Some("use the gear icon".to_string()),
        }
    }

    async fn spawn_server(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}/v1", addr)
    }

    #[test]
    fn test_model_config_default() {
        let config = ModelConfig::default();
        assert_eq!(config.base_url, "http://localhost:8000/v1");
        assert_eq!(config.max_retries, DEFAULT_MAX_RETRIES);
        assert!(config.system_prompt.is_none());
    }

    #[test]
    fn test_build_messages_layout() {
        let client = ModelClient::new(ModelConfig::default().with_system_prompt("sys"));
        let messages = client.build_messages(&request_with_history()).unwrap();

        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[0]["content"], "sys");
        assert_eq!(messages[1]["content"][0]["text"], "Task: open settings");
        assert_eq!(messages[2]["role"], "assistant");
        assert_eq!(
            messages[2]["content"],
            "Thought: The button is visible\nAction: click(start_box='(10,20)')"
        );
        assert_eq!(
            messages[3]["content"][0]["text"],
            "[Step 1 failed: execution_error] input rejected"
        );
        assert_eq!(
            messages[4]["content"][0]["text"],
            "[Supervisor Guidance]\nuse the gear icon"
        );
        let last = messages.last().unwrap();
        assert_eq!(last["content"][0]["type"], "image_url");
        assert!(last["content"][0]["image_url"]["url"]
            .as_str()
            .unwrap()
            .starts_with("data:image/png;base64,"));
    }

    #[test]
    fn test_retry_classification() {
        assert!(ModelClient::is_retryable_error(&ModelError::ApiError {
            status: 503,
            body: String::new()
        }));
        assert!(ModelClient::is_retryable_error(&ModelError::ApiError {
            status: 429,
            body: String::new()
        }));
        assert!(!ModelClient::is_retryable_error(&ModelError::ApiError {
            status: 400,
            body: String::new()
        }));
        assert!(!ModelClient::is_retryable_error(&ModelError::Timeout));
    }

    #[tokio::test]
    async fn test_infer_returns_reply_content() {
        let router = Router::new().route(
            "/v1/chat/completions",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["model"], "ui-tars-1.5-7b");
                Json(json!({
                    "choices": [{"message": {"content": "Action: home()"}}]
                }))
            }),
        );
        let base_url = spawn_server(router).await;
        let client = ModelClient::new(ModelConfig::default().with_base_url(base_url));
        let reply = client.infer(request_with_history()).await.unwrap();
        assert_eq!(reply, "Action: home()");
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let router = Router::new().route(
            "/v1/chat/completions",
            post(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    (StatusCode::BAD_REQUEST, "bad request")
                }
            }),
        );
        let base_url = spawn_server(router).await;
        let client = ModelClient::new(
            ModelConfig::default()
                .with_base_url(base_url)
                .with_retry_delay(0),
        );
        let err = client.infer(request_with_history()).await.unwrap_err();
        assert!(matches!(err, ModelError::ApiError { status: 400, .. }));
        assert!(!err.is_unreachable());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_server_errors_exhaust_retries() {
        let router = Router::new().route(
            "/v1/chat/completions",
            post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "overloaded") }),
        );
        let base_url = spawn_server(router).await;
        let client = ModelClient::new(
            ModelConfig::default()
                .with_base_url(base_url)
                .with_max_retries(1)
                .with_retry_delay(0),
        );
        let err = client.infer(request_with_history()).await.unwrap_err();
        assert!(matches!(err, ModelError::MaxRetriesExceeded(2, _)));
        assert!(err.is_unreachable());
    }
}
