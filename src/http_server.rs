//! Control plane HTTP server implementation using Axum.

use crate::errors::{SandboxError, SandboxResult};
use crate::state::{AppState, SessionInfo, SessionState, STALE_SESSION_TTL_SECS};
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::header::HOST;
use axum::http::{HeaderMap, Uri};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::interval;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Largest accepted request body.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

const REAP_INTERVAL_SECS: u64 = 60;

// Request/Response types
#[derive(Deserialize)]
struct FileQuery {
    path: Option<String>,
}

#[derive(Serialize)]
struct WriteFileResponse {
    ok: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionResponse {
    session_id: String,
    ws_url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionStatus {
    session_id: String,
    state: SessionState,
    workspace: String,
    shell_attached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    attached_secs: Option<u64>,
    age_secs: u64,
}

impl From<SessionInfo> for SessionStatus {
    fn from(info: SessionInfo) -> Self {
        Self {
            session_id: info.id,
            state: info.state,
            workspace: info.workspace.display().to_string(),
            shell_attached: info.shell_attached,
            attached_secs: info.attached_at.map(|at| at.elapsed().as_secs()),
            age_secs: info.created_at.elapsed().as_secs(),
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    message: &'static str,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        // File persistence
        .route("/file", put(write_file))
        // Session management
        .route("/session", post(create_session))
        .route("/session/:id", get(get_session).delete(delete_session))
        // Health check
        .route("/test", get(health))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the control plane on `addr` until `shutdown` resolves.
pub async fn run_server(
    addr: SocketAddr,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    // Spawn cleanup task
    let provisioner = state.provisioner.clone();
    let reaper = tokio::spawn(async move {
        let mut interval = interval(Duration::from_secs(REAP_INTERVAL_SECS));
        loop {
            interval.tick().await;
            let reaped = provisioner
                .reap_stale(Duration::from_secs(STALE_SESSION_TTL_SECS))
                .await;
            if reaped > 0 {
                info!(reaped, "removed stale sessions");
            }
        }
    });

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("control plane listening on http://{}", listener.local_addr()?);

    let result = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await;
    reaper.abort();
    result
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        message: "VM Service is running",
    })
}

/// Bodies are optional; a missing or blank body reads as `null`.
fn json_body(body: &Bytes) -> SandboxResult<Value> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(body)
        .map_err(|e| SandboxError::InvalidRequest(format!("body is not valid JSON: {e}")))
}

/// String field of a JSON body, or empty when absent or not a string.
fn string_field(body: &Value, field: &str) -> String {
    body.get(field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

async fn write_file(
    State(state): State<AppState>,
    Query(query): Query<FileQuery>,
    body: Bytes,
) -> SandboxResult<Json<WriteFileResponse>> {
    let relative = query
        .path
        .filter(|p| !p.trim_start_matches('/').is_empty())
        .ok_or(SandboxError::MissingParameter("path"))?;
    let body = json_body(&body)?;
    let content = string_field(&body, "content");

    let target = state
        .workspace
        .write_file(&relative, content.as_bytes())
        .await?;
    info!(path = %target.display(), bytes = content.len(), "file written");

    Ok(Json(WriteFileResponse { ok: true }))
}

async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> SandboxResult<Json<CreateSessionResponse>> {
    let body = json_body(&body)?;
    let project_path = string_field(&body, "projectPath");
    let workspace = state.workspace.resolve(&project_path)?;
    tokio::fs::create_dir_all(&workspace).await?;

    let session = state.provisioner.provision(workspace).await?;
    let ws_url = terminal_url(&headers, &uri, state.ws_port, &session.id);
    info!(session_id = %session.id, %ws_url, "created session");

    Ok(Json(CreateSessionResponse {
        session_id: session.id,
        ws_url,
    }))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> SandboxResult<Json<SessionStatus>> {
    let info = state
        .registry
        .get(&id)
        .await
        .ok_or_else(|| SandboxError::SessionNotFound(id.clone()))?;
    Ok(Json(info.into()))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> SandboxResult<Json<SessionStatus>> {
    let session = state
        .provisioner
        .release(&id)
        .await
        .ok_or_else(|| SandboxError::SessionNotFound(id.clone()))?;
    Ok(Json(session.info().into()))
}

/// Data-plane URL for `session_id`, mirroring the scheme and host the client
/// used to reach the control plane.
pub fn terminal_url(headers: &HeaderMap, uri: &Uri, ws_port: u16, session_id: &str) -> String {
    let secure = match forwarded_proto(headers) {
        Some(proto) => proto.eq_ignore_ascii_case("https"),
        None => uri.scheme_str() == Some("https"),
    };
    let scheme = if secure { "wss" } else { "ws" };
    let host = headers
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .map(host_without_port)
        .filter(|h| !h.is_empty())
        .unwrap_or("localhost");
    format!("{scheme}://{host}:{ws_port}/term/{session_id}")
}

fn forwarded_proto(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("x-forwarded-proto")?
        .to_str()
        .ok()?
        .split(',')
        .next()
        .map(str::trim)
}

fn host_without_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    host.split(':').next().unwrap_or(host)
}
