//! Entity storage layer
//!
//! This module provides a trait-based abstraction over entity storage, with
//! a relational implementation (pooled PostgreSQL, schema-aware SQL) and a
//! managed backend API implementation.

pub mod managed;
pub mod pool;
pub mod postgres;
pub mod provider;
pub mod query;
pub mod schema;
pub mod types;

// Re-export main types
pub use managed::ManagedBackend;
pub use pool::{PoolKey, PoolManager};
pub use postgres::PostgresBackend;
pub use provider::{EntityBackend, GuardedUpdate, SYSTEM_FIELDS, strip_system_fields};
pub use query::{Filter, ListQuery, Page, SortSpec};
pub use schema::{SchemaCache, TableColumns};
pub use types::{CoercionRules, Record, StoreValue};
