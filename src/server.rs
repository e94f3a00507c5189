//! Transports for the capability table: JSON over HTTP and JSON lines over
//! stdio.
//!
//! # HTTP endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/tools/list` | All registered tools with schemas |
//! | `POST` | `/tools/{name}` | Call a tool; body is the parameter object |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Stdio
//!
//! One request per stdin line, one response per stdout line:
//!
//! ```json
//! {"id": 1, "tool": "list_history", "params": {"repository": "notes", "limit": 5}}
//! {"id": 1, "result": {"changes": [...]}}
//! ```
//!
//! `"tool": "tools/list"` returns the tool table. Diagnostics never reach
//! stdout: the tracing subscriber writes to stderr.
//!
//! # Error contract
//!
//! ```json
//! { "error": { "code": "path_prohibited", "message": "browse_repository: ..." } }
//! ```
//!
//! Codes are [`KbError::code`] values, plus `invalid_params` (400),
//! `bad_request` (400) and `tool_error` (500).

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

use kb_ledger_core::KbError;

use crate::service::{domain_error, KnowledgeService};
use crate::tools::{InvalidParams, ToolContext, ToolInfo, ToolRegistry};

#[derive(Clone)]
struct AppState {
    tools: Arc<ToolRegistry>,
    ctx: ToolContext,
}

/// Build the HTTP application.
pub fn router(tools: Arc<ToolRegistry>, ctx: ToolContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/tools/list", get(handle_list_tools))
        .route("/tools/{name}", post(handle_tool_call))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(AppState { tools, ctx })
}

/// Serve HTTP on `[server].bind` until the process ends.
pub async fn run_server(service: Arc<KnowledgeService>, tools: Arc<ToolRegistry>) -> Result<()> {
    let bind_addr = service.config().server.bind.clone();
    let app = router(tools.clone(), ToolContext::new(service));

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, tools = tools.len(), "HTTP server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

struct AppError {
    status: StatusCode,
    detail: ErrorDetail,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { error: self.detail })).into_response()
    }
}

fn status_for(err: &KbError) -> StatusCode {
    match err {
        KbError::NotFound { .. } => StatusCode::NOT_FOUND,
        KbError::PathProhibited { .. } => StatusCode::FORBIDDEN,
        KbError::InvalidPath { .. }
        | KbError::AmbiguousRevertTarget { .. }
        | KbError::Configuration(_)
        | KbError::InvalidEntry(_) => StatusCode::BAD_REQUEST,
        KbError::SyncConflict { .. } | KbError::RevertConflict { .. } => StatusCode::CONFLICT,
        KbError::SyncFailure { .. } => StatusCode::BAD_GATEWAY,
        KbError::Timeout { .. } => StatusCode::REQUEST_TIMEOUT,
        KbError::Git { .. }
        | KbError::Summarizer(_)
        | KbError::Io(_)
        | KbError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Map a tool failure to a status and an error body.
fn classify_error(tool_name: &str, err: &anyhow::Error) -> AppError {
    let message = format!("{}: {:#}", tool_name, err);
    let (status, code) = if err.chain().any(|e| e.is::<InvalidParams>()) {
        (StatusCode::BAD_REQUEST, "invalid_params")
    } else if let Some(kb) = domain_error(err) {
        (status_for(kb), kb.code())
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "tool_error")
    };
    AppError {
        status,
        detail: ErrorDetail {
            code: code.to_string(),
            message,
        },
    }
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

// ============ GET /tools/list ============

#[derive(Serialize)]
struct ToolListResponse {
    tools: Vec<ToolInfo>,
}

async fn handle_list_tools(State(state): State<AppState>) -> Json<ToolListResponse> {
    Json(ToolListResponse {
        tools: state.tools.list(),
    })
}

// ============ POST /tools/{name} ============

async fn handle_tool_call(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(params): Json<Value>,
) -> Result<Json<Value>, AppError> {
    debug!(tool = %name, "tool call");
    let result = state
        .tools
        .call(&name, params, &state.ctx)
        .await
        .map_err(|e| {
            let app_error = classify_error(&name, &e);
            warn!(tool = %name, code = %app_error.detail.code, error = %app_error.detail.message, "tool call failed");
            app_error
        })?;
    Ok(Json(json!({ "result": result })))
}

// ============ stdio ============

#[derive(Debug, Deserialize)]
struct StdioRequest {
    #[serde(default)]
    id: Value,
    tool: String,
    #[serde(default)]
    params: Value,
}

/// Serve JSON lines from `reader` to `writer` until end of input.
pub async fn serve_lines<R, W>(
    reader: R,
    mut writer: W,
    tools: &ToolRegistry,
    ctx: &ToolContext,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<StdioRequest>(&line) {
            Err(e) => json!({
                "id": Value::Null,
                "error": ErrorDetail { code: "bad_request".to_string(), message: e.to_string() },
            }),
            Ok(request) if request.tool == "tools/list" => {
                json!({ "id": request.id, "result": { "tools": tools.list() } })
            }
            Ok(request) => match tools.call(&request.tool, request.params, ctx).await {
                Ok(result) => json!({ "id": request.id, "result": result }),
                Err(e) => {
                    let app_error = classify_error(&request.tool, &e);
                    warn!(tool = %request.tool, code = %app_error.detail.code, "tool call failed");
                    json!({ "id": request.id, "error": app_error.detail })
                }
            },
        };
        let mut out = serde_json::to_vec(&response)?;
        out.push(b'\n');
        writer.write_all(&out).await?;
        writer.flush().await?;
    }
    Ok(())
}

/// Serve the stdio transport on the process's stdin and stdout.
pub async fn run_stdio(service: Arc<KnowledgeService>, tools: Arc<ToolRegistry>) -> Result<()> {
    info!(tools = tools.len(), "stdio transport ready");
    let ctx = ToolContext::new(service);
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    serve_lines(stdin, tokio::io::stdout(), &tools, &ctx).await
}
