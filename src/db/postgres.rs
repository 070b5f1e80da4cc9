//! PostgreSQL entity backend
//!
//! Concrete `EntityBackend` over a pooled tokio-postgres connection. Each
//! instance is bound to one tenant pool and shares the process-wide schema
//! cache and coercion rules.

use crate::db::pool::PoolKey;
use crate::db::provider::{EntityBackend, GuardedUpdate, strip_system_fields};
use crate::db::query::{self, COLUMNS_SQL, ID_COLUMN, ListQuery, Statement, is_valid_ident};
use crate::db::schema::{ColumnSource, IntrospectError, SchemaCache, TableColumns};
use crate::db::types::{
    CoercionRules, Record, StoreValue, now_timestamp, parse_timestamp, same_instant,
    to_store_value,
};
use crate::error::{DbError, DbResult};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use deadpool_postgres::Pool;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_postgres::Row;
use tokio_postgres::types::{FromSql, Type};

const STAMP_COLUMNS: [&str; 2] = ["created_date", "updated_date"];

/// Relational backend for one tenant store
#[derive(Clone)]
pub struct PostgresBackend {
    pool: Pool,
    key: PoolKey,
    schema: Arc<SchemaCache>,
    rules: Arc<CoercionRules>,
}

impl PostgresBackend {
    pub fn new(pool: Pool, key: PoolKey, schema: Arc<SchemaCache>, rules: Arc<CoercionRules>) -> Self {
        Self {
            pool,
            key,
            schema,
            rules,
        }
    }

    async fn columns(&self, table: &str) -> TableColumns {
        let source = PoolColumnSource { pool: &self.pool };
        self.schema.columns(self.key.as_str(), table, &source).await
    }

    /// Run a row-returning statement and decode every row
    async fn fetch(&self, stmt: &Statement) -> DbResult<Vec<Record>> {
        tracing::debug!(pool = %self.key, sql = %stmt.sql, params = stmt.params.len(), "query");
        let client = self.pool.get().await?;
        // Prepared per call: a plan cached on the connection goes stale once
        // the table gains or loses columns.
        let rows = client.query(stmt.sql.as_str(), &stmt.param_refs()).await?;
        Ok(rows.iter().map(|row| self.decode(row)).collect())
    }

    async fn execute(&self, stmt: &Statement) -> DbResult<u64> {
        tracing::debug!(pool = %self.key, sql = %stmt.sql, params = stmt.params.len(), "execute");
        let client = self.pool.get().await?;
        Ok(client.execute(stmt.sql.as_str(), &stmt.param_refs()).await?)
    }

    fn decode(&self, row: &Row) -> Record {
        self.rules.decode_row(
            row.columns()
                .iter()
                .enumerate()
                .map(|(idx, col)| (col.name().to_string(), extract_store_value(row, idx))),
        )
    }

    async fn insert_rows(
        &self,
        entity: &str,
        records: Vec<Record>,
        created_by: &str,
    ) -> DbResult<Vec<Record>> {
        if records.is_empty() {
            return Err(DbError::InvalidInput("no records to insert".into()));
        }
        let columns = self.columns(entity).await;
        let now = now_timestamp();
        let stamped: Vec<Record> = records
            .into_iter()
            .map(|record| stamp_new(record, created_by, now))
            .collect();

        // Union of field names across records, first-seen order
        let mut seen = HashSet::new();
        let mut names = Vec::new();
        for record in &stamped {
            for name in record.keys() {
                if seen.insert(name.as_str()) {
                    names.push(name.clone());
                }
            }
        }
        let (kept, dropped): (Vec<String>, Vec<String>) = names
            .into_iter()
            .partition(|name| is_valid_ident(name) && columns.allows(name));
        if !dropped.is_empty() {
            tracing::debug!(entity, ?dropped, "dropping fields unknown to table");
        }
        if kept.is_empty() {
            return Err(DbError::InvalidInput(format!(
                "no known columns to insert into {}",
                entity
            )));
        }

        let rows = stamped
            .iter()
            .map(|record| kept.iter().map(|col| write_value(col, record)).collect())
            .collect();
        let stmt = query::insert(entity, &kept, rows)?;
        self.fetch(&stmt).await
    }

    /// Build the update statement, or `None` when nothing writable remains
    async fn prepare_update(
        &self,
        entity: &str,
        id: &str,
        data: Record,
        expected_updated: Option<NaiveDateTime>,
    ) -> DbResult<Option<Statement>> {
        let columns = self.columns(entity).await;
        let data = strip_system_fields(data);
        let fields = data
            .keys()
            .map(|name| (name.clone(), write_value(name, &data)))
            .collect();
        let (mut kept, dropped) = query::retain_writable(fields, &columns);
        if !dropped.is_empty() {
            tracing::debug!(entity, ?dropped, "dropping fields unknown to table");
        }
        if kept.is_empty() {
            return Ok(None);
        }
        if columns.allows("updated_date") {
            kept.push(("updated_date".into(), StoreValue::Timestamp(now_timestamp())));
        }
        query::update(entity, id, kept, expected_updated).map(Some)
    }
}

#[async_trait]
impl EntityBackend for PostgresBackend {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn list(&self, entity: &str, query: &ListQuery) -> DbResult<Vec<Record>> {
        let columns = self.columns(entity).await;
        if columns.is_missing() {
            tracing::debug!(entity, "table does not exist, returning empty list");
            return Ok(Vec::new());
        }
        let Some(stmt) = query::select(entity, query, &columns)? else {
            return Ok(Vec::new());
        };
        match self.fetch(&stmt).await {
            Err(e) if e.is_undefined_table() => {
                tracing::warn!(entity, error = %e, "list on missing table");
                Ok(Vec::new())
            }
            other => other,
        }
    }

    async fn get(&self, entity: &str, id: &str) -> DbResult<Option<Record>> {
        let stmt = query::select_by_id(entity, id)?;
        match self.fetch(&stmt).await {
            Ok(rows) => Ok(rows.into_iter().next()),
            Err(e) if e.is_undefined_table() => {
                tracing::warn!(entity, error = %e, "get on missing table");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn create(&self, entity: &str, data: Record, created_by: &str) -> DbResult<Record> {
        self.insert_rows(entity, vec![data], created_by)
            .await?
            .pop()
            .ok_or_else(|| DbError::QueryFailed(format!("insert into {} returned no row", entity)))
    }

    async fn update(&self, entity: &str, id: &str, data: Record) -> DbResult<Option<Record>> {
        match self.prepare_update(entity, id, data, None).await? {
            Some(stmt) => Ok(self.fetch(&stmt).await?.into_iter().next()),
            None => self.get(entity, id).await,
        }
    }

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
        let stored = current.get("updated_date").cloned().unwrap_or(Value::Null);
        if !same_instant(token, &stored) {
            return Ok(GuardedUpdate::Stale(current));
        }

        // The write itself re-checks the token so a writer landing between
        // the read and the update is still detected.
        let expected = stored.as_str().and_then(parse_timestamp);
        let Some(stmt) = self.prepare_update(entity, id, data, expected).await? else {
            return Ok(GuardedUpdate::Applied(current));
        };
        if let Some(updated) = self.fetch(&stmt).await?.into_iter().next() {
            return Ok(GuardedUpdate::Applied(updated));
        }
        tracing::info!(entity, id, "conditional update lost the race");
        Ok(match self.get(entity, id).await? {
            Some(now) => GuardedUpdate::Stale(now),
            None => GuardedUpdate::Missing,
        })
    }

    async fn delete(&self, entity: &str, id: &str) -> DbResult<()> {
        let stmt = query::delete(entity, id)?;
        let affected = self.execute(&stmt).await?;
        tracing::debug!(entity, id, affected, "delete");
        Ok(())
    }

    async fn bulk_create(
        &self,
        entity: &str,
        records: Vec<Record>,
        created_by: &str,
    ) -> DbResult<Vec<Record>> {
        self.insert_rows(entity, records, created_by).await
    }
}

/// Column listing over a pooled connection
struct PoolColumnSource<'a> {
    pool: &'a Pool,
}

#[async_trait]
impl ColumnSource for PoolColumnSource<'_> {
    async fn load_columns(&self, table: &str) -> Result<Vec<String>, IntrospectError> {
        let client = self.pool.get().await.map_err(introspect_failed)?;
        let rows = client
            .query(COLUMNS_SQL, &[&table])
            .await
            .map_err(introspect_failed)?;
        if rows.is_empty() {
            return Err(IntrospectError::TableMissing);
        }
        rows.iter()
            .map(|row| row.try_get::<_, String>(0))
            .collect::<Result<Vec<_>, _>>()
            .map_err(introspect_failed)
    }
}

fn introspect_failed(err: impl std::fmt::Display) -> IntrospectError {
    IntrospectError::Failed(err.to_string())
}

/// Stamp system columns on a record about to be inserted
fn stamp_new(mut record: Record, created_by: &str, now: NaiveDateTime) -> Record {
    let has_id = match record.get(ID_COLUMN) {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(_) => true,
    };
    if !has_id {
        record.insert(
            ID_COLUMN.into(),
            Value::String(uuid::Uuid::new_v4().to_string()),
        );
    }
    let stamp = Value::String(crate::db::types::format_timestamp(&now));
    for column in STAMP_COLUMNS {
        record.insert(column.into(), stamp.clone());
    }
    if !record.get("created_by").is_some_and(|v| !v.is_null()) {
        record.insert("created_by".into(), Value::String(created_by.to_string()));
    }
    record
}

/// Store value for one column of an outgoing record.
///
/// System timestamps are bound as timestamps so text columns receive the
/// canonical write format.
fn write_value(column: &str, record: &Record) -> StoreValue {
    match record.get(column) {
        None => StoreValue::Null,
        Some(Value::String(s)) if STAMP_COLUMNS.contains(&column) => parse_timestamp(s)
            .map_or_else(|| StoreValue::Text(s.clone()), StoreValue::Timestamp),
        Some(value) => to_store_value(value),
    }
}

/// Extract a column value from a row based on its server-side type
fn extract_store_value(row: &Row, idx: usize) -> StoreValue {
    let Some(column) = row.columns().get(idx) else {
        return StoreValue::Null;
    };
    match *column.type_() {
        Type::BOOL => typed(row, idx, StoreValue::Boolean),
        Type::INT2 => typed(row, idx, |v: i16| StoreValue::Integer(v.into())),
        Type::INT4 => typed(row, idx, |v: i32| StoreValue::Integer(v.into())),
        Type::INT8 => typed(row, idx, StoreValue::Integer),
        Type::FLOAT4 => typed(row, idx, |v: f32| StoreValue::from(f64::from(v))),
        Type::FLOAT8 => typed(row, idx, |v: f64| StoreValue::from(v)),
        Type::NUMERIC => typed(row, idx, decimal_value),
        Type::JSON | Type::JSONB => typed(row, idx, StoreValue::Json),
        Type::TIMESTAMP => typed(row, idx, StoreValue::Timestamp),
        Type::TIMESTAMPTZ => typed(row, idx, |v: DateTime<Utc>| {
            StoreValue::Timestamp(v.naive_utc())
        }),
        Type::DATE => typed(row, idx, StoreValue::Date),
        Type::UUID => typed(row, idx, |v: uuid::Uuid| StoreValue::Text(v.to_string())),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => {
            typed(row, idx, |v: Vec<String>| StoreValue::Json(v.into()))
        }
        Type::INT4_ARRAY => typed(row, idx, |v: Vec<i32>| StoreValue::Json(v.into())),
        Type::INT8_ARRAY => typed(row, idx, |v: Vec<i64>| StoreValue::Json(v.into())),
        // Text types and fallback for unknown types
        _ => try_as_text(row, idx),
    }
}

/// Typed extraction with a text fallback on type mismatch
fn typed<'a, T, F>(row: &'a Row, idx: usize, wrap: F) -> StoreValue
where
    T: FromSql<'a>,
    F: FnOnce(T) -> StoreValue,
{
    match row.try_get::<_, Option<T>>(idx) {
        Ok(Some(v)) => wrap(v),
        Ok(None) => StoreValue::Null,
        Err(_) => try_as_text(row, idx),
    }
}

fn try_as_text(row: &Row, idx: usize) -> StoreValue {
    match row.try_get::<_, Option<String>>(idx) {
        Ok(Some(v)) => StoreValue::Text(v),
        Ok(None) => StoreValue::Null,
        Err(_) => {
            let type_name = row
                .columns()
                .get(idx)
                .map_or("unknown", |c| c.type_().name());
            tracing::debug!(column = idx, type_name, "unreadable column type, returning null");
            StoreValue::Null
        }
    }
}

/// Whole numerics become integers; the rest become floats
fn decimal_value(d: Decimal) -> StoreValue {
    if d.fract().is_zero() {
        if let Some(i) = d.to_i64() {
            return StoreValue::Integer(i);
        }
    }
    d.to_f64()
        .map_or_else(|| StoreValue::Text(d.to_string()), StoreValue::from)
}
