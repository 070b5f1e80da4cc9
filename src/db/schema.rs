//! Schema introspection cache
//!
//! Column names are discovered from the store on first use of a table and
//! memoized for the lifetime of the process. A schema change is only seen
//! after a restart.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;

/// Ordered set of the column names of one table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSet {
    names: Vec<String>,
    lookup: HashSet<String>,
}

impl ColumnSet {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut lookup = HashSet::new();
        let names = names
            .into_iter()
            .map(Into::into)
            .filter(|n: &String| lookup.insert(n.clone()))
            .collect();
        Self { names, lookup }
    }

    pub fn contains(&self, column: &str) -> bool {
        self.lookup.contains(column)
    }

    /// Column names in table order
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// What the store told us about a table's columns
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableColumns {
    /// The table exists with these columns
    Known(Arc<ColumnSet>),
    /// The table does not exist: no valid columns, but not an error
    Missing,
    /// Introspection failed for another reason: do not filter
    Unknown,
}

impl TableColumns {
    /// Whether a request column may be used against this table
    pub fn allows(&self, column: &str) -> bool {
        match self {
            TableColumns::Known(set) => set.contains(column),
            TableColumns::Missing => false,
            TableColumns::Unknown => true,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, TableColumns::Missing)
    }
}

/// Failure modes of a column listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntrospectError {
    TableMissing,
    Failed(String),
}

/// Something that can list a table's columns
#[async_trait]
pub trait ColumnSource: Send + Sync {
    async fn load_columns(&self, table: &str) -> Result<Vec<String>, IntrospectError>;
}

/// Process-wide memo of table columns, keyed by (pool key, table)
#[derive(Debug, Default)]
pub struct SchemaCache {
    entries: DashMap<(String, String), TableColumns>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Columns of `table` in the store identified by `scope`.
    ///
    /// `Known` and `Missing` results are cached; `Unknown` is not, so the
    /// next request retries the metadata query.
    pub async fn columns(
        &self,
        scope: &str,
        table: &str,
        source: &dyn ColumnSource,
    ) -> TableColumns {
        let key = (scope.to_string(), table.to_string());
        if let Some(hit) = self.entries.get(&key).map(|e| e.value().clone()) {
            return hit;
        }

        let resolved = match source.load_columns(table).await {
            Ok(names) => TableColumns::Known(Arc::new(ColumnSet::new(names))),
            Err(IntrospectError::TableMissing) => TableColumns::Missing,
            Err(IntrospectError::Failed(message)) => {
                tracing::warn!(table, error = %message, "column introspection failed, not filtering");
                return TableColumns::Unknown;
            }
        };

        tracing::debug!(table, ?resolved, "cached table columns");
        // A concurrent fill for the same key may have landed first; keep it.
        self.entries.entry(key).or_insert(resolved).value().clone()
    }

    /// Number of cached tables
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
