//! Atomic operations
//!
//! Compare-then-act protocols on top of any `EntityBackend`: guarded update
//! (timestamp token), guarded create (unique key fields) and keyed cell
//! upsert (prior-value token). None of them run inside a store transaction.
//! Guarded creates and upserts on the same key are serialized within this
//! process by [`KeyedLocks`]; writers in other processes can still interleave
//! between the read and the write.

use crate::config::settings::StaffingSettings;
use crate::db::provider::{EntityBackend, GuardedUpdate};
use crate::db::query::{Filter, ListQuery};
use crate::db::types::Record;
use crate::error::{ProxyError, Result};
use dashmap::DashMap;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Field carrying the prior-value token of a cell upsert
pub const OLD_VALUE_FIELD: &str = "old_value_check";

/// Table of async mutexes keyed by string, removed when no longer held
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Holds one key of a [`KeyedLocks`] table until dropped
pub struct KeyedGuard<'a> {
    locks: &'a KeyedLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: String) -> KeyedGuard<'_> {
        let mutex = self.locks.entry(key.clone()).or_default().clone();
        let guard = mutex.lock_owned().await;
        KeyedGuard {
            locks: self,
            key,
            guard: Some(guard),
        }
    }

    /// Number of keys currently held or waited on
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl Drop for KeyedGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        // Only the table's own reference left: nobody holds or awaits the key
        self.locks
            .locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

/// Natural key and value field of a keyed cell
#[derive(Debug, Clone)]
pub struct CellSpec {
    pub key_fields: Vec<String>,
    pub value_field: String,
}

impl From<&StaffingSettings> for CellSpec {
    fn from(settings: &StaffingSettings) -> Self {
        Self {
            key_fields: settings.key_fields.clone(),
            value_field: settings.value_field.clone(),
        }
    }
}

/// Outcome of a keyed cell upsert
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    /// No record and nothing to write
    Skipped,
    Created(Record),
    Updated(Record),
    /// The cell was cleared
    Deleted { id: String },
}

impl UpsertOutcome {
    pub fn into_json(self) -> Value {
        match self {
            UpsertOutcome::Skipped => json!({"skipped": true}),
            UpsertOutcome::Created(record) | UpsertOutcome::Updated(record) => {
                Value::Object(record)
            }
            UpsertOutcome::Deleted { id } => json!({"deleted": true, "id": id}),
        }
    }
}

/// Guarded create/upsert engine with its in-process lock table
#[derive(Debug, Default)]
pub struct AtomicOps {
    locks: KeyedLocks,
}

impl AtomicOps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn locks(&self) -> &KeyedLocks {
        &self.locks
    }

    /// Update a record if its `updated_date` still equals `token`.
    ///
    /// Without a token the update is applied to whatever is stored.
    pub async fn check_and_update(
        &self,
        backend: &dyn EntityBackend,
        entity: &str,
        id: &str,
        data: Record,
        token: Option<&Value>,
    ) -> Result<Record> {
        let Some(token) = token.filter(|t| !t.is_null()) else {
            if backend.get(entity, id).await?.is_none() {
                return Err(ProxyError::NotFound);
            }
            return backend
                .update(entity, id, data)
                .await?
                .ok_or(ProxyError::NotFound);
        };

        match backend.update_guarded(entity, id, data, token).await? {
            GuardedUpdate::Applied(record) => Ok(record),
            GuardedUpdate::Stale(current) => {
                tracing::info!(entity, id, "stale update token");
                Err(ProxyError::Concurrency {
                    current: Box::new(current),
                })
            }
            GuardedUpdate::Missing => Err(ProxyError::NotFound),
        }
    }

    /// Create a record unless one with the same unique key fields exists
    pub async fn check_and_create(
        &self,
        backend: &dyn EntityBackend,
        entity: &str,
        data: Record,
        unique_keys: &[String],
        created_by: &str,
    ) -> Result<Record> {
        if unique_keys.is_empty() {
            return Ok(backend.create(entity, data, created_by).await?);
        }

        let _guard = self.locks.lock(lock_key(entity, &data, unique_keys)).await;
        let filter = key_filter(&data, unique_keys);
        let existing = backend
            .list(entity, &ListQuery::filtered(filter).limit(1))
            .await?;
        if let Some(existing) = existing.into_iter().next() {
            tracing::info!(entity, "duplicate on unique keys");
            return Err(ProxyError::Duplicate {
                existing: Box::new(existing),
            });
        }
        Ok(backend.create(entity, data, created_by).await?)
    }

    /// Create, update, clear or skip the record at a natural key.
    ///
    /// The prior-value token is taken from `token`, else from the
    /// `old_value_check` field of `data`; an absent token skips the
    /// comparison. A stale token with no stored record is not a conflict:
    /// the cell is simply written fresh.
    pub async fn upsert_cell(
        &self,
        backend: &dyn EntityBackend,
        entity: &str,
        mut data: Record,
        token: Option<Value>,
        spec: &CellSpec,
        created_by: &str,
    ) -> Result<UpsertOutcome> {
        let embedded = data.remove(OLD_VALUE_FIELD);
        let token = token.or(embedded);

        for field in &spec.key_fields {
            if data.get(field).is_none_or(Value::is_null) {
                return Err(ProxyError::BadRequest(format!(
                    "missing key field: {}",
                    field
                )));
            }
        }
        let _guard = self
            .locks
            .lock(lock_key(entity, &data, &spec.key_fields))
            .await;
        let filter = key_filter(&data, &spec.key_fields);

        let current = backend
            .list(entity, &ListQuery::filtered(filter).limit(1))
            .await?
            .into_iter()
            .next();
        let incoming_empty = is_empty_value(data.get(&spec.value_field));

        let Some(current) = current else {
            if incoming_empty {
                return Ok(UpsertOutcome::Skipped);
            }
            let created = backend.create(entity, data, created_by).await?;
            return Ok(UpsertOutcome::Created(created));
        };

        let stored = current
            .get(&spec.value_field)
            .cloned()
            .unwrap_or(Value::Null);
        if let Some(token) = &token {
            if !values_match(token, &stored) {
                tracing::info!(entity, "stale cell value token");
                return Err(ProxyError::ValueConflict {
                    current_value: stored,
                    current: Box::new(current),
                });
            }
        }

        let id = record_id(&current)?;
        if incoming_empty {
            backend.delete(entity, &id).await?;
            return Ok(UpsertOutcome::Deleted { id });
        }
        let updated = backend
            .update(entity, &id, data)
            .await?
            .ok_or(ProxyError::NotFound)?;
        Ok(UpsertOutcome::Updated(updated))
    }
}

fn key_filter(data: &Record, fields: &[String]) -> Filter {
    fields.iter().fold(Filter::default(), |filter, field| {
        filter.eq(field.clone(), data.get(field).cloned().unwrap_or(Value::Null))
    })
}

/// Lock name for one natural key: independent of field order and of how
/// the client typed the values (`2025` and `"2025"` share a lock)
fn lock_key(entity: &str, data: &Record, fields: &[String]) -> String {
    let mut parts: Vec<(&str, String)> = fields
        .iter()
        .map(|field| {
            let value = match normalize(data.get(field).unwrap_or(&Value::Null)) {
                Normalized::Empty => String::new(),
                Normalized::Number(n) => n.to_string(),
                Normalized::Text(t) => t,
            };
            (field.as_str(), value)
        })
        .collect();
    parts.sort();
    parts.dedup();
    parts.iter().fold(entity.to_string(), |mut key, (field, value)| {
        key.push('\u{1f}');
        key.push_str(field);
        key.push('=');
        key.push_str(value);
        key
    })
}

fn record_id(record: &Record) -> Result<String> {
    match record.get("id") {
        Some(Value::String(id)) => Ok(id.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(ProxyError::BadRequest("stored record has no id".into())),
    }
}

/// Null, missing or blank text
fn is_empty_value(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    }
}

#[derive(Debug, PartialEq)]
enum Normalized {
    Empty,
    Number(f64),
    Text(String),
}

fn normalize(value: &Value) -> Normalized {
    match value {
        Value::Null => Normalized::Empty,
        Value::Number(n) => n
            .as_f64()
            .map_or_else(|| Normalized::Text(n.to_string()), Normalized::Number),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return Normalized::Empty;
            }
            match s.parse::<f64>() {
                Ok(f) if f.is_finite() => Normalized::Number(f),
                _ => Normalized::Text(s.to_string()),
            }
        }
        other => Normalized::Text(other.to_string()),
    }
}

/// Compare a prior-value token with the stored value.
///
/// Text is trimmed, numeric text compares numerically, and null equals blank.
pub fn values_match(token: &Value, stored: &Value) -> bool {
    normalize(token) == normalize(stored)
}
