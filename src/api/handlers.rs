use super::AppState;
use crate::commands::EntityRequest;
use crate::error::{DbError, ProxyError};
use crate::service::Identity;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{Value, json};

pub const EMAIL_HEADER: &str = "x-user-email";
pub const ROLE_HEADER: &str = "x-user-role";
pub const CREDENTIALS_HEADER: &str = "x-db-credentials";

/// `GET /health`
pub(super) async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

/// `POST /api/entities`
pub(super) async fn entities(
    State(service): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<EntityRequest>, JsonRejection>,
) -> Result<Json<Value>, ProxyError> {
    let identity = identity(&headers)?;
    let Json(request) = body.map_err(|e| ProxyError::BadRequest(e.body_text()))?;
    let token = header_str(&headers, CREDENTIALS_HEADER);
    Ok(Json(service.handle_action(&identity, token, request).await?))
}

/// `POST /api/atomic`
pub(super) async fn atomic(
    State(service): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<EntityRequest>, JsonRejection>,
) -> Result<Json<Value>, ProxyError> {
    let identity = identity(&headers)?;
    let Json(request) = body.map_err(|e| ProxyError::BadRequest(e.body_text()))?;
    let token = header_str(&headers, CREDENTIALS_HEADER);
    Ok(Json(service.handle_operation(&identity, token, request).await?))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn identity(headers: &HeaderMap) -> Result<Identity, ProxyError> {
    Identity::from_parts(
        header_str(headers, EMAIL_HEADER),
        header_str(headers, ROLE_HEADER),
    )
}

/// HTTP status for an error
pub fn error_status(err: &ProxyError) -> StatusCode {
    match err {
        ProxyError::Unauthorized => StatusCode::UNAUTHORIZED,
        ProxyError::Forbidden(_) => StatusCode::FORBIDDEN,
        ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
        ProxyError::NotFound => StatusCode::NOT_FOUND,
        ProxyError::Concurrency { .. }
        | ProxyError::ValueConflict { .. }
        | ProxyError::Duplicate { .. } => StatusCode::CONFLICT,
        ProxyError::Database(DbError::InvalidInput(_)) => StatusCode::BAD_REQUEST,
        ProxyError::Database(DbError::Upstream { .. } | DbError::UpstreamUnavailable(_)) => {
            StatusCode::BAD_GATEWAY
        }
        ProxyError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = error_status(&self);
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self, "request failed");
        }
        let body = match self {
            ProxyError::Concurrency { current } => json!({
                "error": "CONCURRENCY_ERROR",
                "currentData": Value::Object(*current),
            }),
            ProxyError::ValueConflict {
                current_value,
                current,
            } => json!({
                "error": "CONCURRENCY_ERROR",
                "currentValue": current_value,
                "currentData": Value::Object(*current),
            }),
            ProxyError::Duplicate { existing } => json!({
                "error": "DUPLICATE_ERROR",
                "existingEntry": Value::Object(*existing),
            }),
            ProxyError::Database(DbError::InvalidInput(message)) | ProxyError::BadRequest(message) => {
                json!({"error": message})
            }
            other => json!({"error": other.to_string()}),
        };
        (status, Json(body)).into_response()
    }
}
