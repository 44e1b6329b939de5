//! Courier HTTP REST API
//!
//! Axum front door for session management and direct agent execution.
//!
//! Architecture: each endpoint has a thin axum handler that delegates to an
//! inner function returning `(StatusCode, serde_json::Value)`. The inner
//! functions are testable without axum dispatch.
//!
//! Endpoints:
//! - GET    /health                      health check (unauthenticated)
//! - GET    /version                     server version info
//! - POST   /api/v1/sessions/create      create a session and start pairing
//! - GET    /api/v1/sessions/status      session status and current pairing code
//! - DELETE /api/v1/sessions/delete      tear down and delete a session
//! - GET    /api/v1/sessions/detail      session plus message counters
//! - POST   /api/v1/sessions/reconnect   re-attach a session to its device
//! - POST   /api/v1/agents/execute       run a message through the agent backend
//!
//! Everything under `/api/v1` requires `Authorization: Bearer <api key>` when
//! `auth.enabled` is set.

use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Query, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Extension, Json, Router};
use courier_core::models::{AgentSession, ExecutionRecord, NewSession};
use courier_core::render::{strip_data_url, to_data_url};
use courier_core::store::Stores;
use courier_core::{CourierConfig, CourierError};
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::PgPool;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::subsystems::execution::Parameters;
use crate::subsystems::sessions::SessionManager;

/// Shared state for all HTTP handlers
pub struct HttpState {
    pub manager: Arc<SessionManager>,
    pub stores: Stores,
    /// `None` in ephemeral mode.
    pub pool: Option<PgPool>,
    pub config: CourierConfig,
}

/// Principal resolved by the auth layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner(pub String);

/// Build the Axum router with all endpoints
pub fn build_router(state: Arc<HttpState>) -> Router {
    let api = Router::new()
        .route("/sessions/create", post(create_session_handler))
        .route("/sessions/status", get(session_status_handler))
        .route("/sessions/delete", delete(delete_session_handler))
        .route("/sessions/detail", get(session_detail_handler))
        .route("/sessions/reconnect", post(reconnect_session_handler))
        .route("/agents/execute", post(execute_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .nest("/api/v1", api)
        .with_state(state)
}

/// Start the HTTP server on the configured address.
/// Gracefully shuts down when the broadcast shutdown signal fires.
pub async fn start_http_server(
    state: Arc<HttpState>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = format!("{}:{}", state.config.http.host, state.config.http.port);

    let app = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Courier HTTP API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Request DTOs
// ============================================================================

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub agent_id: Option<String>,
    #[serde(alias = "displayName")]
    pub agent_name: Option<String>,
    pub api_key: Option<String>,
    #[serde(alias = "langchainUrl")]
    pub backend_url: Option<String>,
}

/// `agentId` carried in a body or a query string.
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AgentRef {
    pub agent_id: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub agent_id: Option<String>,
    pub message: Option<String>,
    pub sender: Option<String>,
    #[serde(alias = "parameters")]
    pub params: Option<Parameters>,
}

// ============================================================================
// Auth
// ============================================================================

/// Resolve the principal for an `Authorization` header value.
pub async fn authenticate_inner(
    stores: &Stores,
    header: Option<&str>,
) -> std::result::Result<Owner, (StatusCode, Value)> {
    let header = match header {
        Some(h) if !h.is_empty() => h,
        _ => return Err(unauthorized("Missing Authorization header")),
    };

    let api_key = match header.split_once(' ') {
        Some(("Bearer", key)) if !key.is_empty() && !key.contains(' ') => key,
        _ => return Err(unauthorized("Invalid Authorization header format")),
    };

    match stores.users.get_by_api_key(api_key).await {
        Ok(Some(user)) => Ok(Owner(user.user_id)),
        Ok(None) => Err(unauthorized("Invalid API Key")),
        Err(e) => {
            tracing::error!(error = %e, "API key lookup failed");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "success": false, "error": "Internal Server Error" }),
            ))
        }
    }
}

async fn require_api_key(
    State(state): State<Arc<HttpState>>,
    mut req: Request,
    next: Next,
) -> Response {
    if !state.config.auth.enabled {
        req.extensions_mut()
            .insert(Owner(state.config.auth.default_owner.clone()));
        return next.run(req).await;
    }

    let header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    match authenticate_inner(&state.stores, header.as_deref()).await {
        Ok(owner) => {
            req.extensions_mut().insert(owner);
            next.run(req).await
        }
        Err((status, body)) => (status, Json(body)).into_response(),
    }
}

fn unauthorized(msg: &str) -> (StatusCode, Value) {
    (
        StatusCode::UNAUTHORIZED,
        json!({ "success": false, "error": msg }),
    )
}

// ============================================================================
// Inner (directly testable) business logic functions
// ============================================================================

/// Inner health check. Reports `ephemeral` instead of a database version when
/// running on in-memory stores.
pub async fn health_inner(state: &HttpState) -> (StatusCode, Value) {
    let database = match &state.pool {
        Some(pool) => match courier_core::db::health_check(pool).await {
            Ok(v) => v,
            Err(e) => {
                return (
                    StatusCode::SERVICE_UNAVAILABLE,
                    json!({
                        "status": "unhealthy",
                        "error": e.to_string(),
                    }),
                );
            }
        },
        None => "ephemeral".to_string(),
    };

    (
        StatusCode::OK,
        json!({
            "status": "healthy",
            "version": env!("CARGO_PKG_VERSION"),
            "database": database,
            "connections": state.manager.registry().len(),
        }),
    )
}

/// Inner version (pure, no IO).
pub fn version_inner() -> Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "api": "courier/v1",
    })
}

pub async fn create_session_inner(
    manager: &Arc<SessionManager>,
    owner: &str,
    req: CreateSessionRequest,
) -> (StatusCode, Value) {
    let Some(agent_id) = non_blank(req.agent_id) else {
        return bad_request("AgentID is required");
    };

    let new = NewSession {
        agent_id,
        display_name: req.agent_name,
        backend_api_key: req.api_key,
        backend_url: req.backend_url,
    };

    match manager.create_session(owner, new).await {
        Ok(session) => (
            StatusCode::OK,
            json!({
                "success": true,
                "data": pairing_view(&session),
                "message": "Session created successfully",
            }),
        ),
        Err(e) => error_response(&e),
    }
}

pub async fn session_status_inner(
    manager: &Arc<SessionManager>,
    agent_id: Option<String>,
) -> (StatusCode, Value) {
    let Some(agent_id) = non_blank(agent_id) else {
        return bad_request("AgentID is required");
    };

    match manager.get_session(&agent_id).await {
        Ok(session) => (
            StatusCode::OK,
            json!({ "success": true, "data": status_view(&session) }),
        ),
        Err(e) => error_response(&e),
    }
}

pub async fn delete_session_inner(
    manager: &Arc<SessionManager>,
    agent_id: Option<String>,
) -> (StatusCode, Value) {
    let Some(agent_id) = non_blank(agent_id) else {
        return bad_request("AgentID is required");
    };

    match manager.delete_session(&agent_id).await {
        Ok(()) => (
            StatusCode::OK,
            json!({ "success": true, "message": "Session deleted successfully" }),
        ),
        Err(e) => error_response(&e),
    }
}

pub async fn session_detail_inner(
    manager: &Arc<SessionManager>,
    agent_id: Option<String>,
) -> (StatusCode, Value) {
    let Some(agent_id) = non_blank(agent_id) else {
        return bad_request("AgentID is required");
    };

    match manager.session_detail(&agent_id).await {
        Ok(detail) => (
            StatusCode::OK,
            json!({ "success": true, "data": detail }),
        ),
        Err(e) => error_response(&e),
    }
}

pub async fn reconnect_session_inner(
    manager: &Arc<SessionManager>,
    agent_id: Option<String>,
) -> (StatusCode, Value) {
    let Some(agent_id) = non_blank(agent_id) else {
        return bad_request("AgentID is required");
    };

    match manager.reconnect_session(&agent_id).await {
        Ok(session) => (
            StatusCode::OK,
            json!({
                "success": true,
                "data": pairing_view(&session),
                "message": "Session reconnected successfully",
            }),
        ),
        Err(e) => error_response(&e),
    }
}

pub async fn execute_inner(
    manager: &Arc<SessionManager>,
    req: ExecuteRequest,
) -> (StatusCode, Value) {
    let (Some(agent_id), Some(message)) = (non_blank(req.agent_id), non_blank(req.message)) else {
        return bad_request("agentId and message are required");
    };

    let result = manager
        .proxy()
        .execute(&agent_id, &message, req.sender.as_deref(), req.params.as_ref())
        .await;

    match result {
        Ok(record) => (
            StatusCode::OK,
            json!({ "success": true, "data": execution_view(&record) }),
        ),
        Err(CourierError::ExecutionFailed { message, record }) => (
            StatusCode::BAD_GATEWAY,
            json!({
                "success": false,
                "error": message,
                "data": execution_view(&record),
            }),
        ),
        Err(e) => error_response(&e),
    }
}

// ============================================================================
// Axum handler wrappers (thin, delegate to inner functions)
// ============================================================================

pub async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = health_inner(&state).await;
    (status, Json(body))
}

pub async fn version_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(version_inner()))
}

pub async fn create_session_handler(
    State(state): State<Arc<HttpState>>,
    Extension(owner): Extension<Owner>,
    Query(query): Query<AgentRef>,
    body: Option<Json<CreateSessionRequest>>,
) -> impl IntoResponse {
    let mut req = body.map(|Json(b)| b).unwrap_or_default();
    if req.agent_id.is_none() {
        req.agent_id = query.agent_id;
    }
    let (status, body) = create_session_inner(&state.manager, &owner.0, req).await;
    (status, Json(body))
}

pub async fn session_status_handler(
    State(state): State<Arc<HttpState>>,
    Query(query): Query<AgentRef>,
) -> impl IntoResponse {
    let (status, body) = session_status_inner(&state.manager, query.agent_id).await;
    (status, Json(body))
}

pub async fn delete_session_handler(
    State(state): State<Arc<HttpState>>,
    Query(query): Query<AgentRef>,
    body: Option<Json<AgentRef>>,
) -> impl IntoResponse {
    let agent_id = agent_from(body, query);
    let (status, body) = delete_session_inner(&state.manager, agent_id).await;
    (status, Json(body))
}

pub async fn session_detail_handler(
    State(state): State<Arc<HttpState>>,
    Query(query): Query<AgentRef>,
) -> impl IntoResponse {
    let (status, body) = session_detail_inner(&state.manager, query.agent_id).await;
    (status, Json(body))
}

pub async fn reconnect_session_handler(
    State(state): State<Arc<HttpState>>,
    Query(query): Query<AgentRef>,
    body: Option<Json<AgentRef>>,
) -> impl IntoResponse {
    let agent_id = agent_from(body, query);
    let (status, body) = reconnect_session_inner(&state.manager, agent_id).await;
    (status, Json(body))
}

pub async fn execute_handler(
    State(state): State<Arc<HttpState>>,
    body: Option<Json<ExecuteRequest>>,
) -> impl IntoResponse {
    let Some(Json(req)) = body else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "error": "Invalid request body" })),
        );
    };
    let (status, body) = execute_inner(&state.manager, req).await;
    (status, Json(body))
}

// ============================================================================
// Helpers
// ============================================================================

/// HTTP status for a caller-facing error.
pub fn error_status(e: &CourierError) -> StatusCode {
    match e {
        CourierError::AlreadyExists(_) => StatusCode::CONFLICT,
        CourierError::NotFound(_) => StatusCode::NOT_FOUND,
        CourierError::Config(_) => StatusCode::BAD_REQUEST,
        CourierError::Connection(_) | CourierError::ExecutionFailed { .. } => {
            StatusCode::BAD_GATEWAY
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(e: &CourierError) -> (StatusCode, Value) {
    let status = error_status(e);
    if status.is_server_error() {
        tracing::warn!(error = %e, status = status.as_u16(), "Request failed");
    }
    (status, json!({ "success": false, "error": e.to_string() }))
}

fn bad_request(msg: &str) -> (StatusCode, Value) {
    (
        StatusCode::BAD_REQUEST,
        json!({ "success": false, "error": msg }),
    )
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Body wins over the query string.
fn agent_from(body: Option<Json<AgentRef>>, query: AgentRef) -> Option<String> {
    body.and_then(|Json(b)| non_blank(b.agent_id))
        .or(query.agent_id)
}

/// `(qrCode, qrCodeBase64)`; both empty when no image is stored.
fn qr_fields(session: &AgentSession) -> (String, String) {
    match session.pairing_code_image.as_deref().filter(|i| !i.is_empty()) {
        Some(image) => (to_data_url(image), strip_data_url(image).to_string()),
        None => (String::new(), String::new()),
    }
}

/// Payload returned by create and reconnect.
pub fn pairing_view(session: &AgentSession) -> Value {
    let (qr_code, qr_code_base64) = qr_fields(session);
    json!({
        "sessionId": session.id,
        "agentId": session.agent_id,
        "qrCode": qr_code,
        "qrCodeBase64": qr_code_base64,
        "status": session.status,
        "lastGeneratedAt": session.last_pairing_code_issued_at,
    })
}

/// Payload returned by status.
pub fn status_view(session: &AgentSession) -> Value {
    let (qr_code, qr_code_base64) = qr_fields(session);
    json!({
        "agentId": session.agent_id,
        "status": session.status,
        "phoneNumber": session.phone_number,
        "connectedAt": session.connected_at,
        "qrCode": qr_code,
        "qrCodeBase64": qr_code_base64,
        "lastQrGeneratedAt": session.last_pairing_code_issued_at,
    })
}

pub fn execution_view(record: &ExecutionRecord) -> Value {
    let parsed = record
        .response_body
        .as_deref()
        .and_then(|b| serde_json::from_str::<Value>(b).ok());
    json!({
        "id": record.id,
        "agentId": record.agent_id,
        "sessionId": record.session_id,
        "status": record.status,
        "error": record.error_message.clone().unwrap_or_default(),
        "userMessage": record.user_message.clone().unwrap_or_default(),
        "response": parsed,
        "rawResponse": record.response_body.clone().unwrap_or_default(),
        "executionTimeMs": record.execution_time_ms,
        "createdAt": record.created_at,
    })
}

// ============================================================================
// Tests
// ============================================================================
