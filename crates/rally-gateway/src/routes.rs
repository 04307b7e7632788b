//! API route handlers for the gateway.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use rally_core::error::RallyError;
use rally_core::types::ActivityMetrics;

use super::server::AppState;

/// Engine error rendered as `{ok: false, error, kind}` with a mapped status.
#[derive(Debug)]
pub struct ApiError(pub RallyError);

impl From<RallyError> for ApiError {
    fn from(e: RallyError) -> Self {
        Self(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            RallyError::NotFound(_) => StatusCode::NOT_FOUND,
            RallyError::InvalidState(_) | RallyError::Conflict(_) => StatusCode::CONFLICT,
            RallyError::Persistence(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("❌ API error: {}", self.0);
        }
        let body = serde_json::json!({
            "ok": false,
            "error": self.0.to_string(),
            "kind": self.0.kind(),
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult = Result<Json<serde_json::Value>, ApiError>;

/// Health check endpoint.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "rally-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct InitiateRequest {
    pub target_id: String,
    pub initiator_id: String,
    #[serde(default)]
    pub participant_ids: Vec<String>,
    #[serde(default)]
    pub metrics: HashMap<String, ActivityMetrics>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Start an operation against a target.
pub async fn initiate_operation(
    State(state): State<Arc<AppState>>,
    Json(req): Json<InitiateRequest>,
) -> ApiResult {
    let operation_id = state.engine.initiate_with_metadata(
        &req.target_id,
        &req.initiator_id,
        req.participant_ids,
        &req.metrics,
        req.metadata,
    )?;
    Ok(Json(serde_json::json!({
        "ok": true,
        "operation_id": operation_id,
    })))
}

pub async fn operation_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    let view = state.engine.get_status(&id)?;
    Ok(Json(serde_json::json!({"ok": true, "operation": view})))
}

pub async fn advance_operation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    let op = state.engine.advance_phase(&id)?;
    Ok(Json(serde_json::json!({
        "ok": true,
        "phase": op.phase,
        "operation": op.status_view(),
    })))
}

pub async fn cancel_operation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    let cancelled = state.engine.cancel(&id)?;
    Ok(Json(serde_json::json!({"ok": true, "cancelled": cancelled})))
}

pub async fn complete_target(
    State(state): State<Arc<AppState>>,
    Path(target_id): Path<String>,
) -> ApiResult {
    let completed = state.engine.mark_complete(&target_id)?;
    Ok(Json(serde_json::json!({"ok": true, "completed": completed})))
}

pub async fn target_operations(
    State(state): State<Arc<AppState>>,
    Path(target_id): Path<String>,
) -> ApiResult {
    let listing = state.engine.list_for_target(&target_id)?;
    Ok(Json(serde_json::json!({
        "ok": true,
        "target_id": target_id,
        "active": listing.active,
        "historical": listing.historical,
    })))
}

/// Messages waiting for the external sender.
pub async fn ready_messages(State(state): State<Arc<AppState>>) -> ApiResult {
    let messages = state.engine.get_ready_messages()?;
    Ok(Json(serde_json::json!({
        "ok": true,
        "total": messages.len(),
        "messages": messages,
    })))
}

pub async fn confirm_delivered(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    let delivered = state.engine.confirm_delivered(&id)?;
    Ok(Json(serde_json::json!({"ok": true, "delivered": delivered})))
}
