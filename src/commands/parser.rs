//! Request parsing
//!
//! Parses entity request bodies into structured `Command`s. The same body
//! shape serves both endpoints: `action` selects a plain operation,
//! `operation` selects a guarded one.

use crate::db::query::{Filter, ListQuery, Page, SortSpec, is_valid_ident};
use crate::db::types::Record;
use crate::error::{ProxyError, Result};
use serde::Deserialize;
use serde_json::Value;

/// Wire form of an entity request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EntityRequest {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub operation: Option<String>,
    #[serde(default)]
    pub entity: Option<String>,
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub query: Option<Value>,
    #[serde(default)]
    pub filter: Option<Value>,
    #[serde(default)]
    pub sort: Option<Value>,
    #[serde(default)]
    pub limit: Option<Value>,
    #[serde(default)]
    pub skip: Option<Value>,
    #[serde(default)]
    pub check: Option<Value>,
}

/// Operations the proxy can execute
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// List records (also serves `filter`)
    List(ListQuery),

    /// Fetch by id; no id reads as a miss
    Get(Option<String>),

    Create(Record),

    Update { id: String, data: Record },

    Delete(String),

    BulkCreate(Vec<Record>),

    /// Update guarded by an `updated_date` token
    CheckAndUpdate {
        id: String,
        data: Record,
        token: Option<Value>,
    },

    /// Create unless the unique key fields already match a record
    CheckAndCreate {
        data: Record,
        unique_keys: Vec<String>,
    },

    /// Keyed cell upsert guarded by a prior-value token
    UpsertCell { data: Record, token: Option<Value> },
}

/// A parsed request: the target entity, the wire name and the command
#[derive(Debug, Clone, PartialEq)]
pub struct EntityCommand {
    pub entity: String,
    pub name: String,
    pub command: Command,
}

/// Parse a `POST /api/entities` body
pub fn parse_action(request: EntityRequest) -> Result<EntityCommand> {
    let name = required(request.action.as_deref(), "action")?;
    let entity = entity_name(request.entity.as_deref())?;

    let command = match name.as_str() {
        "list" | "filter" => {
            let filter_value = request.filter.as_ref().or(request.query.as_ref());
            let sort = match &request.sort {
                Some(Value::String(s)) => Some(s.as_str()),
                _ => None,
            };
            Command::List(ListQuery {
                filter: Filter::from_json(filter_value)
                    .map_err(|e| ProxyError::BadRequest(e.to_string()))?,
                sort: SortSpec::parse(sort),
                page: Page::from_json(request.limit.as_ref(), request.skip.as_ref()),
            })
        }
        "get" => Command::Get(id_of(request.id.as_ref())),
        "create" => Command::Create(record_of(request.data)?),
        "update" => Command::Update {
            id: required_id(request.id.as_ref())?,
            data: record_of(request.data)?,
        },
        "delete" => Command::Delete(required_id(request.id.as_ref())?),
        "bulkCreate" => Command::BulkCreate(records_of(request.data)?),
        unknown => {
            return Err(ProxyError::BadRequest(format!("Unknown action: {}", unknown)));
        }
    };

    Ok(EntityCommand {
        entity,
        name,
        command,
    })
}

/// Parse a `POST /api/atomic` body
pub fn parse_operation(request: EntityRequest) -> Result<EntityCommand> {
    let name = required(request.operation.as_deref(), "operation")?;
    let entity = entity_name(request.entity.as_deref())?;
    let check = request.check.filter(|c| !c.is_null());

    let command = match name.as_str() {
        "checkAndUpdate" => Command::CheckAndUpdate {
            id: required_id(request.id.as_ref())?,
            data: record_of(request.data)?,
            token: token_of(check, "updated_date"),
        },
        "checkAndCreate" => Command::CheckAndCreate {
            data: record_of(request.data)?,
            unique_keys: unique_keys_of(check.as_ref())?,
        },
        "upsertStaffing" => Command::UpsertCell {
            data: record_of(request.data)?,
            token: token_of(check, "old_value_check"),
        },
        unknown => {
            return Err(ProxyError::BadRequest(format!(
                "Unknown operation: {}",
                unknown
            )));
        }
    };

    Ok(EntityCommand {
        entity,
        name,
        command,
    })
}

fn required(value: Option<&str>, field: &str) -> Result<String> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        Some(v) => Ok(v.to_string()),
        None => Err(ProxyError::BadRequest(format!("Missing {}", field))),
    }
}

fn entity_name(entity: Option<&str>) -> Result<String> {
    let name = required(entity, "entity")?;
    if !is_valid_ident(&name) {
        return Err(ProxyError::BadRequest(format!("Invalid entity: {}", name)));
    }
    Ok(name)
}

fn id_of(id: Option<&Value>) -> Option<String> {
    match id? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn required_id(id: Option<&Value>) -> Result<String> {
    id_of(id).ok_or_else(|| ProxyError::BadRequest("Missing id".into()))
}

fn record_of(data: Option<Value>) -> Result<Record> {
    match data {
        None | Some(Value::Null) => Ok(Record::new()),
        Some(Value::Object(map)) => Ok(map),
        Some(_) => Err(ProxyError::BadRequest("data must be an object".into())),
    }
}

fn records_of(data: Option<Value>) -> Result<Vec<Record>> {
    let Some(Value::Array(items)) = data else {
        return Err(ProxyError::BadRequest("data must be an array of records".into()));
    };
    if items.is_empty() {
        return Err(ProxyError::BadRequest("No records to create".into()));
    }
    items
        .into_iter()
        .map(|item| match item {
            Value::Object(map) => Ok(map),
            _ => Err(ProxyError::BadRequest("data must be an array of records".into())),
        })
        .collect()
}

/// Token from `check`: a field of an object, or the value itself
fn token_of(check: Option<Value>, field: &str) -> Option<Value> {
    match check? {
        Value::Object(mut map) => map.remove(field).filter(|v| !v.is_null()),
        scalar => Some(scalar),
    }
}

/// Unique key field names from `check`: a list, or an object holding one
fn unique_keys_of(check: Option<&Value>) -> Result<Vec<String>> {
    let list = match check {
        None => return Ok(Vec::new()),
        Some(Value::Array(items)) => items,
        Some(Value::Object(map)) => match ["unique_keys", "uniqueKeys", "unique_fields"]
            .iter()
            .find_map(|k| map.get(*k))
        {
            Some(Value::Array(items)) => items,
            Some(_) => return Err(ProxyError::BadRequest("unique keys must be a list".into())),
            None => return Ok(Vec::new()),
        },
        Some(_) => return Err(ProxyError::BadRequest("unique keys must be a list".into())),
    };
    list.iter()
        .map(|item| match item.as_str() {
            Some(name) if !name.trim().is_empty() => Ok(name.trim().to_string()),
            _ => Err(ProxyError::BadRequest(format!("Invalid unique key: {}", item))),
        })
        .collect()
}
