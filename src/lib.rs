//! entityproxy - a data-access proxy for entity records
//!
//! entityproxy turns generic entity CRUD and filter requests into either
//! parameterized SQL against a tenant's PostgreSQL store or calls to a
//! managed backend API, chosen at runtime from a stored setting.
//!
//! # Features
//!
//! - **Schema-drift tolerance**: unknown columns are dropped on write, and
//!   reads against a missing table return nothing instead of failing
//! - **Tenant pools**: one bounded connection pool per distinct credential
//!   set, shared across requests
//! - **Guarded operations**: optimistic update, duplicate-checked create and
//!   a keyed cell upsert
//!
//! # Architecture
//!
//! - [`config`]: Tenant credentials and proxy settings
//! - [`db`]: Value coercion, schema cache, pools, SQL building and backends
//! - [`ops`]: Guarded update, create and cell upsert
//! - [`dispatch`]: Backend mode resolution and routing
//! - [`commands`]: Request parsing and execution
//! - [`service`]: Shared service state and access rules
//! - [`api`]: HTTP router
//! - [`error`]: Error types and result aliases
//!
//! # Example
//!
//! ```no_run
//! use entityproxy::config::Settings;
//! use entityproxy::dispatch::Dispatcher;
//! use entityproxy::service::ProxyService;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::default();
//! let dispatcher = Dispatcher::from_settings(&settings)?;
//! let service = Arc::new(ProxyService::new(dispatcher, &settings));
//!
//! let listener = tokio::net::TcpListener::bind(&settings.server.listen).await?;
//! axum::serve(listener, entityproxy::api::router(service)).await?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod commands;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod ops;
pub mod service;

pub use error::{ConfigError, DbError, ProxyError, Result};
