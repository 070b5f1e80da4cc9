//! Entity backend trait
//!
//! Defines the interface both storage paths implement: the relational store
//! (`PostgresBackend`) and the managed backend API (`ManagedBackend`). The
//! dispatcher picks one per request; everything above it is backend-agnostic.

use crate::db::query::ListQuery;
use crate::db::types::{Record, same_instant};
use crate::error::DbResult;
use async_trait::async_trait;
use serde_json::Value;

/// Columns the proxy owns; clients never set them on update
pub const SYSTEM_FIELDS: [&str; 4] = ["id", "created_date", "updated_date", "created_by"];

/// Remove system-managed columns from a client payload
pub fn strip_system_fields(mut data: Record) -> Record {
    for field in SYSTEM_FIELDS {
        data.remove(field);
    }
    data
}

/// Result of an update guarded by an `updated_date` token
#[derive(Debug, Clone, PartialEq)]
pub enum GuardedUpdate {
    /// The token matched and the write landed
    Applied(Record),
    /// The stored record moved on; here is its current state
    Stale(Record),
    /// No record with that id
    Missing,
}

/// Storage backend for entity records
///
/// All implementations must be usable concurrently from many requests.
#[async_trait]
pub trait EntityBackend: Send + Sync {
    /// Short backend label for logs
    fn name(&self) -> &'static str;

    /// List records matching a filter, sorted and windowed
    ///
    /// A missing table yields an empty list.
    async fn list(&self, entity: &str, query: &ListQuery) -> DbResult<Vec<Record>>;

    /// Fetch one record by id
    async fn get(&self, entity: &str, id: &str) -> DbResult<Option<Record>>;

    /// Insert a record, stamping id, timestamps and creator
    async fn create(&self, entity: &str, data: Record, created_by: &str) -> DbResult<Record>;

    /// Update a record in place
    ///
    /// Returns `None` when no record has this id.
    async fn update(&self, entity: &str, id: &str, data: Record) -> DbResult<Option<Record>>;

    /// Update only if the stored `updated_date` still equals `token`.
    ///
    /// The default is read-compare-write; backends that support a
    /// conditional write override it.
    async fn update_guarded(
        &self,
        entity: &str,
        id: &str,
        data: Record,
        token: &Value,
    ) -> DbResult<GuardedUpdate> {
        let Some(current) = self.get(entity, id).await? else {
            return Ok(GuardedUpdate::Missing);
        };
        let stored = current.get("updated_date").unwrap_or(&Value::Null);
        if !same_instant(token, stored) {
            return Ok(GuardedUpdate::Stale(current));
        }
        Ok(match self.update(entity, id, data).await? {
            Some(updated) => GuardedUpdate::Applied(updated),
            None => GuardedUpdate::Missing,
        })
    }

    /// Delete by id; deleting an absent id succeeds
    async fn delete(&self, entity: &str, id: &str) -> DbResult<()>;

    /// Insert many records in one operation
    async fn bulk_create(
        &self,
        entity: &str,
        records: Vec<Record>,
        created_by: &str,
    ) -> DbResult<Vec<Record>>;
}
