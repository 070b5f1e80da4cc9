//! HTTP interface
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/health` | Liveness |
//! | `POST` | `/api/entities` | Plain entity actions (`list`, `get`, `create`, ...) |
//! | `POST` | `/api/atomic` | Guarded operations (`checkAndUpdate`, ...) |
//!
//! Every entity request needs an `x-user-email` header. `x-user-role` gates
//! admin-only actions and `x-db-credentials` optionally selects a tenant
//! store.

mod handlers;

use crate::service::ProxyService;
use axum::Router;
use axum::routing::{get, post};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub use handlers::{CREDENTIALS_HEADER, EMAIL_HEADER, ROLE_HEADER, error_status};

/// Application state shared across all handlers.
pub type AppState = Arc<ProxyService>;

/// Creates the proxy router.
pub fn router(service: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/entities", post(handlers::entities))
        .route("/api/atomic", post(handlers::atomic))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}
