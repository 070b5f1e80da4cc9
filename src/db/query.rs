//! SQL statement construction
//!
//! Every value goes into a bound parameter. Identifiers (table and column
//! names) are the only tokens written into SQL text; they must match
//! `[A-Za-z_][A-Za-z0-9_]*` and are always double-quoted.

use crate::db::schema::TableColumns;
use crate::db::types::{StoreValue, to_store_value};
use crate::error::{DbError, DbResult};
use chrono::NaiveDateTime;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt::Write;
use tokio_postgres::types::ToSql;

/// Column every table is keyed and tiebroken on
pub const ID_COLUMN: &str = "id";

/// Column list query used for schema introspection
pub const COLUMNS_SQL: &str = "SELECT column_name::text FROM information_schema.columns \
     WHERE table_schema = current_schema() AND table_name = $1 \
     ORDER BY ordinal_position";

/// A parameterized statement ready to execute
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<StoreValue>,
}

impl Statement {
    pub fn param_refs(&self) -> Vec<&(dyn ToSql + Sync)> {
        self.params
            .iter()
            .map(|p| p as &(dyn ToSql + Sync))
            .collect()
    }

    /// Append a parameter and return its placeholder
    fn bind(&mut self, value: StoreValue) -> String {
        self.params.push(value);
        format!("${}", self.params.len())
    }
}

pub fn is_valid_ident(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    name.len() <= 63 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Double-quote a validated identifier
pub fn quote_ident(name: &str) -> DbResult<String> {
    if is_valid_ident(name) {
        Ok(format!("\"{}\"", name))
    } else {
        Err(DbError::InvalidInput(format!("invalid identifier: {:?}", name)))
    }
}

/// One filter condition on a column
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Equality; JSON null means `IS NULL`
    Eq(Value),
    /// Inclusive range; either bound may be absent
    Range {
        gte: Option<Value>,
        lte: Option<Value>,
    },
}

/// Conjunction of per-column conditions
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    entries: Vec<(String, Condition)>,
}

impl Filter {
    /// Parse a filter expression from request JSON.
    ///
    /// Objects whose keys are `$gte`/`$lte` become ranges; any other `$`
    /// operator is rejected; remaining objects and arrays compare for
    /// equality against their JSON text.
    pub fn from_json(value: Option<&Value>) -> DbResult<Self> {
        let map = match value {
            None | Some(Value::Null) => return Ok(Self::default()),
            Some(Value::Object(map)) => map,
            Some(other) => {
                return Err(DbError::InvalidInput(format!(
                    "filter must be an object, got {}",
                    other
                )));
            }
        };

        let mut filter = Self::default();
        for (column, expr) in map {
            let condition = match expr {
                Value::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => {
                    range_condition(column, ops)?
                }
                other => Condition::Eq(other.clone()),
            };
            filter.entries.push((column.clone(), condition));
        }
        Ok(filter)
    }

    /// Add an equality condition
    pub fn eq(mut self, column: impl Into<String>, value: Value) -> Self {
        self.entries.push((column.into(), Condition::Eq(value)));
        self
    }

    pub fn entries(&self) -> &[(String, Condition)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Wire form, as accepted by `from_json`
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        for (column, condition) in &self.entries {
            let value = match condition {
                Condition::Eq(v) => v.clone(),
                Condition::Range { gte, lte } => {
                    let mut ops = Map::new();
                    if let Some(v) = gte {
                        ops.insert("$gte".into(), v.clone());
                    }
                    if let Some(v) = lte {
                        ops.insert("$lte".into(), v.clone());
                    }
                    Value::Object(ops)
                }
            };
            map.insert(column.clone(), value);
        }
        Value::Object(map)
    }
}

fn range_condition(column: &str, ops: &Map<String, Value>) -> DbResult<Condition> {
    let mut gte = None;
    let mut lte = None;
    for (op, bound) in ops {
        match op.as_str() {
            "$gte" => gte = Some(bound.clone()).filter(|v| !v.is_null()),
            "$lte" => lte = Some(bound.clone()).filter(|v| !v.is_null()),
            other => {
                return Err(DbError::InvalidInput(format!(
                    "unsupported filter operator {} on {}",
                    other, column
                )));
            }
        }
    }
    Ok(Condition::Range { gte, lte })
}

/// Sort column and direction, parsed from the `-column` convention
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortSpec {
    pub column: String,
    pub descending: bool,
}

impl Default for SortSpec {
    fn default() -> Self {
        Self {
            column: ID_COLUMN.to_string(),
            descending: false,
        }
    }
}

impl SortSpec {
    pub fn parse(sort: Option<&str>) -> Self {
        let Some(raw) = sort.map(str::trim).filter(|s| !s.is_empty()) else {
            return Self::default();
        };
        let (column, descending) = match raw.strip_prefix('-') {
            Some(rest) => (rest, true),
            None => (raw.strip_prefix('+').unwrap_or(raw), false),
        };
        if column.is_empty() {
            return Self::default();
        }
        Self {
            column: column.to_string(),
            descending,
        }
    }

    /// Wire form (`-column` for descending)
    pub fn to_param(&self) -> String {
        if self.descending {
            format!("-{}", self.column)
        } else {
            self.column.clone()
        }
    }
}

/// Pagination window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Page {
    pub limit: Option<i64>,
    pub skip: Option<i64>,
}

impl Page {
    /// Keep only values that are non-negative integers (numbers or digit strings)
    pub fn from_json(limit: Option<&Value>, skip: Option<&Value>) -> Self {
        Self {
            limit: limit.and_then(non_negative_int),
            skip: skip.and_then(non_negative_int),
        }
    }
}

fn non_negative_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().filter(|i| *i >= 0),
        Value::String(s) => s.trim().parse::<i64>().ok().filter(|i| *i >= 0),
        _ => None,
    }
}

/// Structured read request: filter, sort, window
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListQuery {
    pub filter: Filter,
    pub sort: SortSpec,
    pub page: Page,
}

impl ListQuery {
    pub fn filtered(filter: Filter) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.page.limit = Some(limit);
        self
    }
}

/// Build a `SELECT` for a list/filter request.
///
/// Returns `Ok(None)` when the filter names a column the table does not have:
/// no stored record can match it.
pub fn select(table: &str, query: &ListQuery, columns: &TableColumns) -> DbResult<Option<Statement>> {
    let mut stmt = Statement {
        sql: format!("SELECT * FROM {}", quote_ident(table)?),
        params: Vec::new(),
    };

    let mut clauses = Vec::new();
    for (column, condition) in query.filter.entries() {
        if !is_valid_ident(column) || !columns.allows(column) {
            tracing::debug!(table, column = %column, "filter on unknown column matches nothing");
            return Ok(None);
        }
        let col = quote_ident(column)?;
        match condition {
            Condition::Eq(Value::Null) => clauses.push(format!("{} IS NULL", col)),
            Condition::Eq(value) => {
                let p = stmt.bind(to_store_value(value));
                clauses.push(format!("{} = {}", col, p));
            }
            Condition::Range { gte, lte } => {
                if let Some(v) = gte {
                    let p = stmt.bind(to_store_value(v));
                    clauses.push(format!("{} >= {}", col, p));
                }
                if let Some(v) = lte {
                    let p = stmt.bind(to_store_value(v));
                    clauses.push(format!("{} <= {}", col, p));
                }
            }
        }
    }
    if !clauses.is_empty() {
        let _ = write!(stmt.sql, " WHERE {}", clauses.join(" AND "));
    }

    let sort_column = if is_valid_ident(&query.sort.column) && columns.allows(&query.sort.column) {
        query.sort.column.as_str()
    } else {
        ID_COLUMN
    };
    let direction = if query.sort.descending { "DESC" } else { "ASC" };
    let _ = write!(stmt.sql, " ORDER BY {} {}", quote_ident(sort_column)?, direction);
    if sort_column != ID_COLUMN {
        let _ = write!(stmt.sql, ", {} ASC", quote_ident(ID_COLUMN)?);
    }

    if let Some(limit) = query.page.limit {
        let p = stmt.bind(StoreValue::Integer(limit));
        let _ = write!(stmt.sql, " LIMIT {}", p);
        if let Some(skip) = query.page.skip {
            let p = stmt.bind(StoreValue::Integer(skip));
            let _ = write!(stmt.sql, " OFFSET {}", p);
        }
    }

    Ok(Some(stmt))
}

/// Single-row lookup by id
pub fn select_by_id(table: &str, id: &str) -> DbResult<Statement> {
    Ok(Statement {
        sql: format!(
            "SELECT * FROM {} WHERE {} = $1 LIMIT 1",
            quote_ident(table)?,
            quote_ident(ID_COLUMN)?
        ),
        params: vec![StoreValue::Text(id.to_string())],
    })
}

/// Multi-row `INSERT ... RETURNING *`; every row must have one value per column
pub fn insert(table: &str, columns: &[String], rows: Vec<Vec<StoreValue>>) -> DbResult<Statement> {
    if columns.is_empty() || rows.is_empty() {
        return Err(DbError::InvalidInput(format!(
            "nothing to insert into {}",
            table
        )));
    }
    let quoted = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<DbResult<Vec<_>>>()?;

    let mut stmt = Statement {
        sql: format!("INSERT INTO {} ({}) VALUES ", quote_ident(table)?, quoted.join(", ")),
        params: Vec::with_capacity(columns.len() * rows.len()),
    };
    let mut tuples = Vec::with_capacity(rows.len());
    for row in rows {
        if row.len() != columns.len() {
            return Err(DbError::InvalidInput("row width does not match columns".into()));
        }
        let placeholders: Vec<String> = row.into_iter().map(|v| stmt.bind(v)).collect();
        tuples.push(format!("({})", placeholders.join(", ")));
    }
    stmt.sql.push_str(&tuples.join(", "));
    stmt.sql.push_str(" RETURNING *");
    Ok(stmt)
}

/// `UPDATE ... RETURNING *` by id, optionally guarded on the stored
/// `updated_date` (compared at millisecond precision)
pub fn update(
    table: &str,
    id: &str,
    fields: Vec<(String, StoreValue)>,
    expected_updated: Option<NaiveDateTime>,
) -> DbResult<Statement> {
    if fields.is_empty() {
        return Err(DbError::InvalidInput(format!("nothing to update in {}", table)));
    }
    let mut stmt = Statement {
        sql: format!("UPDATE {} SET ", quote_ident(table)?),
        params: Vec::with_capacity(fields.len() + 2),
    };
    let mut assignments = Vec::with_capacity(fields.len());
    for (column, value) in fields {
        let col = quote_ident(&column)?;
        let p = stmt.bind(value);
        assignments.push(format!("{} = {}", col, p));
    }
    stmt.sql.push_str(&assignments.join(", "));

    let p = stmt.bind(StoreValue::Text(id.to_string()));
    let _ = write!(stmt.sql, " WHERE {} = {}", quote_ident(ID_COLUMN)?, p);
    if let Some(expected) = expected_updated {
        let p = stmt.bind(StoreValue::Timestamp(expected));
        let _ = write!(
            stmt.sql,
            " AND date_trunc('milliseconds', \"updated_date\"::timestamp) = {}",
            p
        );
    }
    stmt.sql.push_str(" RETURNING *");
    Ok(stmt)
}

pub fn delete(table: &str, id: &str) -> DbResult<Statement> {
    Ok(Statement {
        sql: format!(
            "DELETE FROM {} WHERE {} = $1",
            quote_ident(table)?,
            quote_ident(ID_COLUMN)?
        ),
        params: vec![StoreValue::Text(id.to_string())],
    })
}

/// Split write fields into those the table accepts and the names dropped
pub fn retain_writable(
    fields: Vec<(String, StoreValue)>,
    columns: &TableColumns,
) -> (Vec<(String, StoreValue)>, Vec<String>) {
    let mut seen = HashSet::new();
    let mut dropped = Vec::new();
    let kept = fields
        .into_iter()
        .filter(|(name, _)| {
            if !is_valid_ident(name) || !columns.allows(name) {
                dropped.push(name.clone());
                false
            } else {
                seen.insert(name.clone())
            }
        })
        .collect();
    (kept, dropped)
}
