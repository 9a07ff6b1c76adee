//! HTTP chat server.
//!
//! Serves a single-page chat UI and the JSON API it talks to. All state lives
//! in the shared [`AppContext`]; handlers are thin adapters around the
//! provisioning, session and turn managers.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/` | Chat page |
//! | `POST` | `/api/session` | Start or resume a UI session (resolves assistant and thread) |
//! | `GET`  | `/api/history?session_key=` | Text messages of the session's thread |
//! | `POST` | `/api/ask` | Ask one question |
//! | `POST` | `/api/reset` | Delete all local state (body `{"confirm": true}`) |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "question must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `unknown_session` (404), `timeout` (408),
//! `upstream_error` (502), `provisioning_failed` (502), `internal` (500).
//!
//! # Cross-origin access
//!
//! Only the read-only routes answer CORS requests. The `POST` routes take JSON
//! bodies, so a cross-origin page cannot reach them without a preflight, and
//! that preflight is not granted.

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::{Method, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::context::AppContext;
use crate::models::{ChatMessage, Notice, SessionKey, TurnOutcome};
use crate::poll::PollError;
use crate::provision::ProvisionError;
use crate::remote::RemoteError;
use crate::session::SessionError;
use crate::state::StateError;
use crate::turn::TurnError;

const CHAT_PAGE: &str = include_str!("ui.html");

#[derive(Clone)]
struct AppState {
    ctx: Arc<AppContext>,
}

/// Build the application router. Exposed separately from [`run_server`] so it
/// can be driven in-process.
pub fn router(ctx: Arc<AppContext>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET])
        .allow_headers(Any);

    let read_only = Router::new()
        .route("/", get(handle_page))
        .route("/api/history", get(handle_history))
        .route("/health", get(handle_health))
        .layer(cors);

    Router::new()
        .route("/api/session", post(handle_session))
        .route("/api/ask", post(handle_ask))
        .route("/api/reset", post(handle_reset))
        .merge(read_only)
        .with_state(AppState { ctx })
}

/// Bind to `[server].bind` and serve until the process is terminated.
pub async fn run_server(ctx: Arc<AppContext>) -> anyhow::Result<()> {
    let bind_addr = ctx.config.server.bind.clone();
    let app = router(ctx);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "chat server listening");
    println!("Assistente do PPA listening on http://{}", bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(code = self.code, message = %self.message, "request failed");
        }
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn unknown_session() -> AppError {
    AppError::new(
        StatusCode::NOT_FOUND,
        "unknown_session",
        "unknown session, reload the page to start a new one",
    )
}

impl From<RemoteError> for AppError {
    fn from(err: RemoteError) -> Self {
        AppError::new(StatusCode::BAD_GATEWAY, "upstream_error", err.to_string())
    }
}

impl From<StateError> for AppError {
    fn from(err: StateError) -> Self {
        AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", err.to_string())
    }
}

impl From<PollError> for AppError {
    fn from(err: PollError) -> Self {
        match err {
            PollError::Remote(e) => e.into(),
            deadline => AppError::new(StatusCode::REQUEST_TIMEOUT, "timeout", deadline.to_string()),
        }
    }
}

impl From<ProvisionError> for AppError {
    fn from(err: ProvisionError) -> Self {
        match err {
            ProvisionError::Remote(e) => e.into(),
            ProvisionError::Poll(e) => e.into(),
            ProvisionError::State(e) => e.into(),
            ProvisionError::Corpus(_) => {
                AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", err.to_string())
            }
            ProvisionError::NothingUploaded { .. } | ProvisionError::Indexing { .. } => {
                AppError::new(StatusCode::BAD_GATEWAY, "provisioning_failed", err.to_string())
            }
        }
    }
}

impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Remote(e) => e.into(),
            SessionError::State(e) => e.into(),
        }
    }
}

impl From<TurnError> for AppError {
    fn from(err: TurnError) -> Self {
        match err {
            TurnError::EmptyQuestion => bad_request("question must not be empty"),
            TurnError::Remote(e) => e.into(),
            TurnError::Poll(e) => e.into(),
        }
    }
}

// ============ GET / ============

async fn handle_page() -> Html<&'static str> {
    Html(CHAT_PAGE)
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /api/session ============

#[derive(Deserialize)]
struct SessionRequest {
    #[serde(default)]
    session_key: Option<String>,
}

#[derive(Serialize)]
struct SessionResponse {
    session_key: SessionKey,
    user_id: String,
    notices: Vec<Notice>,
    messages: Vec<ChatMessage>,
}

/// Page load: ensure an identity, re-validate the assistant and resolve the thread.
async fn handle_session(
    State(state): State<AppState>,
    Json(req): Json<SessionRequest>,
) -> Result<Json<SessionResponse>, AppError> {
    let ctx = &state.ctx;
    let (session_key, user) = ctx.sessions.ensure_user_identity(req.session_key.as_deref());

    let assistant = ctx.resolve_assistant().await?;
    let thread = ctx.sessions.resolve_thread(&user).await?;
    let messages = ctx.sessions.history(&thread.value).await?;

    let mut notices = assistant.notices;
    notices.extend(thread.notices);

    Ok(Json(SessionResponse {
        session_key,
        user_id: user.to_string(),
        notices,
        messages,
    }))
}

// ============ GET /api/history ============

#[derive(Deserialize)]
struct HistoryQuery {
    session_key: String,
}

#[derive(Serialize)]
struct HistoryResponse {
    messages: Vec<ChatMessage>,
}

async fn handle_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, AppError> {
    let ctx = &state.ctx;
    let user = ctx
        .sessions
        .user_for(&SessionKey::new(query.session_key))
        .ok_or_else(unknown_session)?;

    let thread = ctx.sessions.resolve_thread(&user).await?;
    let messages = ctx.sessions.history(&thread.value).await?;
    Ok(Json(HistoryResponse { messages }))
}

// ============ POST /api/ask ============

#[derive(Deserialize)]
struct AskRequest {
    session_key: Option<String>,
    question: String,
}

#[derive(Serialize)]
struct AskResponse {
    session_key: SessionKey,
    #[serde(flatten)]
    outcome: TurnOutcome,
    notices: Vec<Notice>,
}

async fn handle_ask(
    State(state): State<AppState>,
    Json(req): Json<AskRequest>,
) -> Result<Json<AskResponse>, AppError> {
    if req.question.trim().is_empty() {
        return Err(bad_request("question must not be empty"));
    }

    let ctx = &state.ctx;
    let (session_key, user) = ctx.sessions.ensure_user_identity(req.session_key.as_deref());
    let assistant = ctx.assistant().await?;
    let thread = ctx.sessions.resolve_thread(&user).await?;

    let outcome = ctx
        .turns
        .execute_turn(&assistant.value, &thread.value, &req.question)
        .await?;

    let mut notices = assistant.notices;
    notices.extend(thread.notices);

    Ok(Json(AskResponse {
        session_key,
        outcome,
        notices,
    }))
}

// ============ POST /api/reset ============

#[derive(Deserialize)]
struct ResetRequest {
    #[serde(default)]
    confirm: bool,
}

#[derive(Serialize)]
struct ResetResponse {
    removed: usize,
}

async fn handle_reset(
    State(state): State<AppState>,
    req: Result<Json<ResetRequest>, JsonRejection>,
) -> Result<Json<ResetResponse>, AppError> {
    let confirmed = match req {
        Ok(Json(req)) => req.confirm,
        Err(rejection) => return Err(bad_request(rejection.body_text())),
    };
    if !confirmed {
        return Err(bad_request("reset requires {\"confirm\": true}"));
    }

    let removed = state.ctx.reset().await?;
    Ok(Json(ResetResponse { removed }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, CorpusConfig, PollingConfig, StateConfig};
    use crate::remote::memory::{InMemoryService, RunScript};
    use crate::remote::RunStatus;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use std::fs;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn app(tmp: &TempDir) -> (Arc<InMemoryService>, Router) {
        fs::create_dir_all(tmp.path().join("PDF")).unwrap();
        fs::write(tmp.path().join("PDF/documento_ppa.pdf"), b"PPA 2024-2027").unwrap();

        let config = Config {
            corpus: CorpusConfig {
                root: tmp.path().join("PDF"),
                include_globs: vec!["**/*.pdf".to_string()],
                exclude_globs: vec![],
                follow_symlinks: false,
            },
            state: StateConfig {
                dir: tmp.path().join("data"),
                ..StateConfig::default()
            },
            assistant: Default::default(),
            openai: Default::default(),
            polling: PollingConfig {
                interval_ms: 1,
                ..PollingConfig::default()
            },
            server: Default::default(),
        };
        let service = Arc::new(InMemoryService::new());
        let ctx = Arc::new(AppContext::new(config, service.clone()));
        (service, router(ctx))
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(body) => Body::from(body.to_string()),
                None => Body::empty(),
            })
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn test_health() {
        let tmp = TempDir::new().unwrap();
        let (_, app) = app(&tmp);
        let (status, body) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_session_then_ask() {
        let tmp = TempDir::new().unwrap();
        let (service, app) = app(&tmp);

        let (status, session) = send(&app, "POST", "/api/session", Some(json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(session["messages"], json!([]));
        assert!(!session["notices"].as_array().unwrap().is_empty());
        let key = session["session_key"].as_str().unwrap().to_string();

        let (status, answer) = send(
            &app,
            "POST",
            "/api/ask",
            Some(json!({"session_key": key, "question": "Qual a meta?"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(answer["status"], "answered");
        assert_eq!(answer["answer"], "Resposta: Qual a meta?");
        assert_eq!(answer["session_key"], key.as_str());

        let (status, history) =
            send(&app, "GET", &format!("/api/history?session_key={}", key), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(history["messages"].as_array().unwrap().len(), 2);
        assert_eq!(history["messages"][0]["role"], "user");

        // One provisioning, one thread, reused by the ask.
        let counts = service.counts();
        assert_eq!(counts.assistants, 1);
        assert_eq!(counts.threads, 1);
    }

    #[tokio::test]
    async fn test_failed_run_is_reported_in_body() {
        let tmp = TempDir::new().unwrap();
        let (service, app) = app(&tmp);
        service.script_run(RunScript {
            statuses: vec![RunStatus::Failed],
            reply: None,
            last_error: Some("server_error".to_string()),
        });

        let (status, body) = send(
            &app,
            "POST",
            "/api/ask",
            Some(json!({"question": "Qual a meta?"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "failed");
        assert_eq!(body["diagnostic"], "server_error");
    }

    #[tokio::test]
    async fn test_empty_question_is_bad_request() {
        let tmp = TempDir::new().unwrap();
        let (service, app) = app(&tmp);
        let (status, body) = send(
            &app,
            "POST",
            "/api/ask",
            Some(json!({"question": "  "})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "bad_request");
        assert_eq!(service.counts().mutations(), 0);
    }

    #[tokio::test]
    async fn test_history_requires_known_session() {
        let tmp = TempDir::new().unwrap();
        let (_, app) = app(&tmp);
        let (status, body) = send(&app, "GET", "/api/history?session_key=nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "unknown_session");
    }

    #[tokio::test]
    async fn test_outage_maps_to_bad_gateway() {
        let tmp = TempDir::new().unwrap();
        let (service, app) = app(&tmp);
        service.set_unavailable(true);
        let (status, body) = send(&app, "POST", "/api/session", Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"]["code"], "upstream_error");
    }

    #[tokio::test]
    async fn test_reset_forces_reprovisioning() {
        let tmp = TempDir::new().unwrap();
        let (service, app) = app(&tmp);
        send(&app, "POST", "/api/session", Some(json!({}))).await;

        let (status, body) = send(&app, "POST", "/api/reset", Some(json!({"confirm": true}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["removed"], 2);

        send(&app, "POST", "/api/session", Some(json!({}))).await;
        assert_eq!(service.counts().assistants, 2);
    }

    #[tokio::test]
    async fn test_reset_requires_confirmation() {
        let tmp = TempDir::new().unwrap();
        let (_, app) = app(&tmp);
        send(&app, "POST", "/api/session", Some(json!({}))).await;
        let record = tmp.path().join("data/assistant_config.json");

        let (status, body) = send(&app, "POST", "/api/reset", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "bad_request");

        let form = Request::builder()
            .method("POST")
            .uri("/api/reset")
            .header("content-type", "text/plain")
            .body(Body::from("confirm=true"))
            .unwrap();
        let response = app.clone().oneshot(form).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, "POST", "/api/reset", Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(record.exists());
    }

    async fn preflight(app: &Router, uri: &str, method: &str) -> Response {
        let request = Request::builder()
            .method("OPTIONS")
            .uri(uri)
            .header("origin", "https://elsewhere.example")
            .header("access-control-request-method", method)
            .header("access-control-request-headers", "content-type")
            .body(Body::empty())
            .unwrap();
        app.clone().oneshot(request).await.unwrap()
    }

    #[tokio::test]
    async fn test_cross_origin_mutations_are_not_allowed() {
        let tmp = TempDir::new().unwrap();
        let (_, app) = app(&tmp);

        let health = preflight(&app, "/health", "GET").await;
        assert_eq!(health.headers()["access-control-allow-origin"], "*");

        for uri in ["/api/reset", "/api/ask", "/api/session"] {
            let response = preflight(&app, uri, "POST").await;
            assert!(
                !response.headers().contains_key("access-control-allow-origin"),
                "{uri} granted a cross-origin preflight"
            );
        }
    }
}
