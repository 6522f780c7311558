//! HTTP and Server-Sent Events front for the supervisor handle.

use axum::{
    extract::{DefaultBodyLimit, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::{InjectRequest, SupervisorError, SupervisorHandle, DEFAULT_MAX_ACTIONS};
use crate::agent::{AgentState, AgentStatus, ControlError, SupervisorEvent};
use crate::script::ScriptError;

pub const DEFAULT_SUPERVISOR_PORT: u16 = 17334;
pub const MAX_BODY_BYTES: usize = 1024 * 1024;
const DEFAULT_TAIL_ROUNDS: usize = 5;

/// Where and how the supervisor listens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    /// Bearer token required on every `/v1` route when set.
    pub token: Option<String>,
    /// Allow the script and raw-action routes.
    pub exec_enabled: bool,
    /// Most primitives one script or exec request may run.
    pub max_actions: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".to_string(),
            port: DEFAULT_SUPERVISOR_PORT,
            token: None,
            exec_enabled: false,
            max_actions: DEFAULT_MAX_ACTIONS,
        }
    }
}

impl SupervisorConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Clone)]
struct AppState {
    handle: SupervisorHandle,
    token: Option<Arc<str>>,
    exec_enabled: bool,
}

struct ApiError(StatusCode, String);

impl From<SupervisorError> for ApiError {
    fn from(err: SupervisorError) -> Self {
        let status = match &err {
            SupervisorError::Control(ControlError::EmptyGuidance) | SupervisorError::NoActions => {
                StatusCode::BAD_REQUEST
            }
            SupervisorError::Control(ControlError::InvalidTransition { .. })
            | SupervisorError::NotPaused(_) => StatusCode::CONFLICT,
            SupervisorError::Script(ScriptError::UnknownScript(_))
            | SupervisorError::Script(ScriptError::MissingScriptFile { .. }) => {
                StatusCode::NOT_FOUND
            }
            SupervisorError::Script(ScriptError::Io(_))
            | SupervisorError::Script(ScriptError::Registry(_)) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            SupervisorError::Script(_) => StatusCode::UNPROCESSABLE_ENTITY,
        };
        ApiError(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

#[derive(Debug, Serialize)]
struct TransitionResponse {
    state: AgentState,
    status: AgentStatus,
}

#[derive(Debug, Deserialize)]
struct ContextQuery {
    #[serde(rename = "tailRounds")]
    tail_rounds: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ScriptRunRequest {
    name: String,
    #[serde(default)]
    vars: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ActionList {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize)]
struct ExecRequest {
    actions: ActionList,
}

/// Build the supervisor router. `/health` is always open; `/v1` routes require
/// `Authorization: Bearer <token>` when a token is set.
pub fn router(handle: SupervisorHandle, config: &SupervisorConfig) -> Router {
    let state = AppState {
        handle: handle.with_max_actions(config.max_actions),
        token: config
            .token
            .clone()
            .filter(|t| !t.is_empty())
            .map(Arc::from),
        exec_enabled: config.exec_enabled,
    };

    let api = Router::new()
        .route("/v1/agent/status", get(status))
        .route("/v1/agent/context", get(context))
        .route("/v1/agent/pause", post(pause))
        .route("/v1/agent/resume", post(resume))
        .route("/v1/agent/stop", post(stop))
        .route("/v1/agent/inject", post(inject))
        .route("/v1/agent/script/run", post(run_script))
        .route("/v1/agent/exec", post(exec))
        .route("/v1/agent/events", get(events))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .route("/health", get(health))
        .merge(api)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

/// Bind and serve until the listener fails.
pub async fn serve(handle: SupervisorHandle, config: &SupervisorConfig) -> std::io::Result<()> {
    let listener = TcpListener::bind(config.addr()).await?;
    if config.token.is_none() {
        warn!("Supervisor API has no token; bind it to a trusted interface only");
    }
    info!("Supervisor listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(handle, config)).await
}

async fn require_token(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(expected) = &state.token {
        let provided = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim);
        if provided != Some(expected.as_ref()) {
            return ApiError(StatusCode::UNAUTHORIZED, "invalid or missing token".to_string())
                .into_response();
        }
    }
    next.run(request).await
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn status(State(state): State<AppState>) -> Json<AgentStatus> {
    Json(state.handle.get_status())
}

async fn context(
    State(state): State<AppState>,
    Query(query): Query<ContextQuery>,
) -> Json<serde_json::Value> {
    let tail = query.tail_rounds.unwrap_or(DEFAULT_TAIL_ROUNDS);
    Json(json!({
        "status": state.handle.get_status(),
        "rounds": state.handle.get_context(tail),
    }))
}

fn transition_response(
    state: &AppState,
    result: Result<AgentState, SupervisorError>,
) -> Result<Json<TransitionResponse>, ApiError> {
    let resulting = result?;
    Ok(Json(TransitionResponse {
        state: resulting,
        status: state.handle.get_status(),
    }))
}

async fn pause(State(state): State<AppState>) -> Result<Json<TransitionResponse>, ApiError> {
    transition_response(&state, state.handle.pause())
}

async fn resume(State(state): State<AppState>) -> Result<Json<TransitionResponse>, ApiError> {
    transition_response(&state, state.handle.resume())
}

async fn stop(State(state): State<AppState>) -> Result<Json<TransitionResponse>, ApiError> {
    transition_response(&state, state.handle.stop())
}

async fn inject(
    State(state): State<AppState>,
    Json(request): Json<InjectRequest>,
) -> Result<Json<AgentStatus>, ApiError> {
    Ok(Json(state.handle.inject_with(&request)?))
}

fn ensure_exec_enabled(state: &AppState) -> Result<(), ApiError> {
    if state.exec_enabled {
        Ok(())
    } else {
        Err(ApiError(StatusCode::FORBIDDEN, "exec disabled".to_string()))
    }
}

async fn run_script(
    State(state): State<AppState>,
    Json(request): Json<ScriptRunRequest>,
) -> Result<Response, ApiError> {
    ensure_exec_enabled(&state)?;
    let report = state.handle.run_script(&request.name, &request.vars).await?;
    Ok(Json(report).into_response())
}

async fn exec(
    State(state): State<AppState>,
    Json(request): Json<ExecRequest>,
) -> Result<Response, ApiError> {
    ensure_exec_enabled(&state)?;
    let actions = match request.actions {
        ActionList::One(action) => vec![action],
        ActionList::Many(actions) => actions,
    };
    let report = state.handle.exec(&actions).await?;
    Ok(Json(report).into_response())
}

fn to_sse(event: &SupervisorEvent) -> Option<Event> {
    let (name, data) = match event {
        SupervisorEvent::Step(round) => ("step", serde_json::to_string(round)),
        SupervisorEvent::Status(status) => ("status", serde_json::to_string(status)),
    };
    match data {
        Ok(data) => Some(Event::default().event(name).data(data)),
        Err(e) => {
            warn!("Dropping unserializable supervisor event: {}", e);
            None
        }
    }
}

async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.handle.subscribe();
    let event_stream = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(sse) = to_sse(&event) {
                        return Some((Ok(sse), rx));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Supervisor stream lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(event_stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::RunControl;
    use crate::script::ScriptEngine;
    use crate::test_support::RecordingExecutor;
    use axum::body::{to_bytes, Body};
    use axum::http::Request as HttpRequest;
    use serde_json::Value;
    use std::fs;
    use tower::ServiceExt;

    struct Fixture {
        app: Router,
        control: Arc<RunControl>,
        executor: Arc<RecordingExecutor>,
        _dir: tempfile::TempDir,
    }

    fn fixture(token: Option<&str>) -> Fixture {
        fixture_with(SupervisorConfig {
            token: token.map(str::to_string),
            exec_enabled: true,
            ..Default::default()
        })
    }

    fn fixture_with(config: SupervisorConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("back.txt"), "home").unwrap();
        fs::write(dir.path().join("registry.json"), r#"{"back": "back.txt"}"#).unwrap();
        let control = Arc::new(RunControl::default());
        let executor = Arc::new(RecordingExecutor::default());
        let handle = SupervisorHandle::new(
            control.clone(),
            executor.clone(),
            ScriptEngine::new(dir.path().join("registry.json")),
            Duration::ZERO,
        );
        Fixture {
            app: router(handle, &config),
            control,
            executor,
            _dir: dir,
        }
    }

    fn get(uri: &str) -> HttpRequest<Body> {
        HttpRequest::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn send(app: &Router, request: HttpRequest<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), MAX_BODY_BYTES).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_health_and_status() {
        let f = fixture(None);
        let (code, body) = send(&f.app, get("/health")).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (code, body) = send(&f.app, get("/v1/agent/status")).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["state"], "running");
        assert_eq!(body["paused"], false);
    }

    #[tokio::test]
    async fn test_token_is_enforced_except_on_health() {
        let f = fixture(Some("secret"));
        assert_eq!(send(&f.app, get("/health")).await.0, StatusCode::OK);

        let (code, body) = send(&f.app, get("/v1/agent/status")).await;
        assert_eq!(code, StatusCode::UNAUTHORIZED);
        assert!(body["error"].is_string());

        let authorized = HttpRequest::builder()
            .uri("/v1/agent/status")
            .header(header::AUTHORIZATION, "Bearer secret")
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(&f.app, authorized).await.0, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_pause_resume_stop_round_trip() {
        let f = fixture(None);
        let (code, body) = send(&f.app, post_json("/v1/agent/pause", json!({}))).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["state"], "paused");
        assert_eq!(f.control.state(), AgentState::Paused);

        let (_, body) = send(&f.app, post_json("/v1/agent/resume", json!({}))).await;
        assert_eq!(body["state"], "running");

        let (_, body) = send(&f.app, post_json("/v1/agent/stop", json!({}))).await;
        assert_eq!(body["state"], "user_stopped");

        let (code, body) = send(&f.app, post_json("/v1/agent/resume", json!({}))).await;
        assert_eq!(code, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("resume"));
    }

    #[tokio::test]
    async fn test_inject_and_context() {
        let f = fixture(None);
        f.control.start("rename the report");
        let (code, body) = send(
            &f.app,
            post_json(
                "/v1/agent/inject",
                json!({"text": "it is in Downloads", "pause": true}),
            ),
        )
        .await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["state"], "paused");
        assert_eq!(body["pending_guidance"], true);

        let (code, _) = send(&f.app, post_json("/v1/agent/inject", json!({"text": " "}))).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);

        let (code, body) = send(&f.app, get("/v1/agent/context?tailRounds=3")).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["rounds"][0]["text"], "rename the report");
        assert_eq!(body["status"]["state"], "paused");
    }

    #[tokio::test]
    async fn test_script_run_requires_pause() {
        let f = fixture(None);
        let run = || post_json("/v1/agent/script/run", json!({"name": "back"}));

        let (code, _) = send(&f.app, run()).await;
        assert_eq!(code, StatusCode::CONFLICT);

        f.control.pause().unwrap();
        let (code, body) = send(&f.app, run()).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["completed"], true);
        assert_eq!(f.executor.executed(), vec![crate::actions::Action::Home]);

        let (code, _) = send(
            &f.app,
            post_json("/v1/agent/script/run", json!({"name": "nope"})),
        )
        .await;
        assert_eq!(code, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_exec_routes_are_forbidden_unless_enabled() {
        let f = fixture_with(SupervisorConfig::default());
        f.control.pause().unwrap();
        let (code, body) = send(
            &f.app,
            post_json("/v1/agent/script/run", json!({"name": "back"})),
        )
        .await;
        assert_eq!(code, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "exec disabled");

        let (code, _) = send(&f.app, post_json("/v1/agent/exec", json!({"actions": "home"}))).await;
        assert_eq!(code, StatusCode::FORBIDDEN);
        assert!(f.executor.executed().is_empty());
    }

    #[tokio::test]
    async fn test_exec_runs_raw_actions() {
        let f = fixture(None);
        let exec = |actions: Value| post_json("/v1/agent/exec", json!({ "actions": actions }));

        let (code, _) = send(&f.app, exec(json!("home"))).await;
        assert_eq!(code, StatusCode::CONFLICT);

        f.control.pause().unwrap();
        let (code, body) = send(&f.app, exec(json!("home"))).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["name"], "exec");
        assert_eq!(body["completed"], true);

        let (code, body) = send(
            &f.app,
            exec(json!(["click(start_box='(1,2)')", "include back"])),
        )
        .await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["total"], 2);
        assert_eq!(f.executor.executed().len(), 3);

        let (code, _) = send(&f.app, exec(json!([]))).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_exec_stops_at_the_action_limit() {
        let f = fixture_with(SupervisorConfig {
            exec_enabled: true,
            max_actions: 2,
            ..Default::default()
        });
        f.control.pause().unwrap();
        let (code, body) = send(
            &f.app,
            post_json("/v1/agent/exec", json!({"actions": "home x 5"})),
        )
        .await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["completed"], false);
        assert_eq!(body["total"], 5);
        assert_eq!(body["error"]["kind"], "action_limit_exceeded");
        assert_eq!(f.executor.executed().len(), 2);
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let f = fixture(None);
        let text = "x".repeat(MAX_BODY_BYTES + 16);
        let (code, _) = send(&f.app, post_json("/v1/agent/inject", json!({ "text": text }))).await;
        assert_eq!(code, StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_event_stream_is_sse() {
        let f = fixture(None);
        let response = f.app.clone().oneshot(get("/v1/agent/events")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/event-stream"
        );
    }
}
