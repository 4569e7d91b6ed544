//! REST API handlers.
//!
//! Each handler reads or writes the `RequestQueue` (or reads the watcher
//! registry) and returns JSON responses.

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use tracing::{error, warn};

use labvm_core::{LifecycleOperation, OpCode};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

/// Body of a 202 from `POST /api/v1/operations`.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct Accepted {
    /// Queue sequence number assigned to the operation.
    pub seq: u64,
}

// ── Operations ─────────────────────────────────────────────────

/// POST /api/v1/operations
///
/// Accepted means durably queued, not applied.
pub async fn publish_operation(
    State(state): State<ApiState>,
    body: Result<Json<LifecycleOperation>, JsonRejection>,
) -> impl IntoResponse {
    let op = match body {
        Ok(Json(op)) => op,
        Err(rejection) => {
            return error_response(&rejection.body_text(), StatusCode::BAD_REQUEST)
                .into_response();
        }
    };

    if let OpCode::Unknown(code) = op.opcode {
        return error_response(&format!("unknown opcode {code}"), StatusCode::BAD_REQUEST)
            .into_response();
    }
    if op.workload_name.trim().is_empty() {
        return error_response("workload name is empty", StatusCode::BAD_REQUEST).into_response();
    }

    match state.queue.enqueue(&op) {
        Ok(seq) => (StatusCode::ACCEPTED, ApiResponse::ok(Accepted { seq })).into_response(),
        Err(e) => {
            error!(vm_name = %op.workload_name, error = %e, "failed to enqueue operation");
            error_response(&e.to_string(), StatusCode::SERVICE_UNAVAILABLE).into_response()
        }
    }
}

/// GET /api/v1/operations
pub async fn list_operations(State(state): State<ApiState>) -> impl IntoResponse {
    match state.queue.pending() {
        Ok(pending) => ApiResponse::ok(pending).into_response(),
        Err(e) => {
            warn!(error = %e, "failed to list pending operations");
            error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response()
        }
    }
}

// ── Dead letters ───────────────────────────────────────────────

/// GET /api/v1/dead-letters
pub async fn list_dead_letters(State(state): State<ApiState>) -> impl IntoResponse {
    match state.queue.dead_letters() {
        Ok(letters) => ApiResponse::ok(letters).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

// ── Watchers ───────────────────────────────────────────────────

/// GET /api/v1/watchers
pub async fn list_watchers(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.watchers.active().await)
}

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    ApiResponse::ok("ok")
}
