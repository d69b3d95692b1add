use crate::engine_api::http_client::{ReloadResponse, TID_HEADER};
use crate::http::http_server::HttpServer;
use crate::services::instance::{InvalidOwnerError, LabDescriptor, LabNotFoundError, OwnerKey};
use crate::services::lifecycle::EngineStatus;
use crate::services::resources::CapacityExceededError;
use crate::services::templates::UnknownProfileError;
use axum::{
    extract::{Extension, Json, Query},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use labforge_library::transaction::{gen_tid, TransactionId};
use serde_json::json;
use tracing::debug;

/// Error types for the HTTP handlers.
/// Typed engine errors map to the matching status, anything else is internal.
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    /// No capacity for the lab right now, the caller should retry later
    Unavailable(String),
    InternalError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            AppError::InternalError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        let body = axum::Json(json!({ "error": message }));
        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        if e.downcast_ref::<CapacityExceededError>().is_some() {
            AppError::Unavailable(e.to_string())
        } else if e.downcast_ref::<UnknownProfileError>().is_some() || e.downcast_ref::<LabNotFoundError>().is_some() {
            AppError::NotFound(e.to_string())
        } else if e.downcast_ref::<InvalidOwnerError>().is_some() {
            AppError::BadRequest(e.to_string())
        } else {
            AppError::InternalError(e.to_string())
        }
    }
}

/// Use the caller's transaction id if it sent one
fn request_tid(headers: &HeaderMap) -> TransactionId {
    match headers.get(TID_HEADER).and_then(|h| h.to_str().ok()) {
        Some(t) if !t.is_empty() => t.to_string(),
        _ => gen_tid(),
    }
}

/// Handler for the /ping route.
pub async fn handle_ping(headers: HeaderMap) -> impl IntoResponse {
    let tid = request_tid(&headers);
    debug!(tid = tid, "Ping");
    "pong"
}

/// Handler for POST /labs.
/// - 503 when capacity is exhausted
/// - 404 for an unknown profile
pub async fn handle_request_lab(
    Extension(server): Extension<HttpServer>,
    headers: HeaderMap,
    Json(owner): Json<OwnerKey>,
) -> Result<Json<LabDescriptor>, AppError> {
    let tid = request_tid(&headers);
    Ok(Json(server.engine.request_lab(&owner, &tid).await?))
}

/// Handler for POST /labs/activity.
pub async fn handle_report_activity(
    Extension(server): Extension<HttpServer>,
    headers: HeaderMap,
    Json(owner): Json<OwnerKey>,
) -> Result<Json<LabDescriptor>, AppError> {
    let tid = request_tid(&headers);
    Ok(Json(server.engine.report_activity(&owner, &tid)?))
}

/// Handler for POST /labs/stop.
/// Stopping an already destroyed lab returns its last descriptor.
pub async fn handle_stop_lab(
    Extension(server): Extension<HttpServer>,
    headers: HeaderMap,
    Json(owner): Json<OwnerKey>,
) -> Result<Json<LabDescriptor>, AppError> {
    let tid = request_tid(&headers);
    Ok(Json(server.engine.stop_lab(&owner, &tid).await?))
}

/// Handler for GET /labs/status, example: /labs/status?student_id=s1&course_id=c1&profile_id=python
pub async fn handle_lab_status(
    Extension(server): Extension<HttpServer>,
    headers: HeaderMap,
    Query(owner): Query<OwnerKey>,
) -> Result<Json<LabDescriptor>, AppError> {
    let tid = request_tid(&headers);
    Ok(Json(server.engine.get_lab_status(&owner, &tid)?))
}

pub async fn handle_engine_status(Extension(server): Extension<HttpServer>, headers: HeaderMap) -> Json<EngineStatus> {
    let tid = request_tid(&headers);
    Json(server.engine.engine_status(&tid))
}

/// Handler for POST /templates/reload.
/// Any failure to read or validate the file is the caller's problem, and leaves the current templates in place.
pub async fn handle_reload_templates(
    Extension(server): Extension<HttpServer>,
    headers: HeaderMap,
) -> Result<Json<ReloadResponse>, AppError> {
    let tid = request_tid(&headers);
    match server.engine.reload_templates(&tid) {
        Ok(loaded) => Ok(Json(ReloadResponse { loaded })),
        Err(e) => Err(AppError::BadRequest(format!("Template reload failed: {}", e))),
    }
}
