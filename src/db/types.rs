//! Value model and type coercion
//!
//! Records travel through the proxy as JSON maps. `StoreValue` is the
//! intermediate form on the relational side: request values become
//! `StoreValue`s with [`to_store_value`], are bound as statement parameters
//! through the `ToSql` impl below (which adapts to whatever column type the
//! server inferred for the parameter), and come back from rows as
//! `StoreValue`s that [`CoercionRules::from_store_value`] turns into JSON.

use crate::config::settings::CoercionSettings;
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, SubsecRound, Utc};
use rust_decimal::Decimal;
use serde_json::{Number, Value};
use std::collections::HashSet;
use std::error::Error;
use std::str::FromStr;
use tokio_postgres::types::{IsNull, ToSql, Type, to_sql_checked};

/// An entity record: column name to value
pub type Record = serde_json::Map<String, Value>;

/// Format timestamps are read back in (no zone suffix)
pub const TIMESTAMP_READ_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

/// Format timestamps are written in when the target column is text
pub const TIMESTAMP_WRITE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

type SqlError = Box<dyn Error + Sync + Send>;

/// A column value on the relational side
#[derive(Debug, Clone, PartialEq)]
pub enum StoreValue {
    /// NULL value
    Null,

    /// Boolean value
    Boolean(bool),

    /// Integer value
    Integer(i64),

    /// Floating point value (always finite)
    Float(f64),

    /// Text value
    Text(String),

    /// Native json/jsonb value
    Json(Value),

    /// Timestamp without zone (UTC for timestamptz columns)
    Timestamp(NaiveDateTime),

    /// Calendar date
    Date(NaiveDate),
}

/// Convert a request value into its store representation.
///
/// Never fails: non-finite numbers become NULL, objects and arrays become
/// their JSON text.
pub fn to_store_value(value: &Value) -> StoreValue {
    match value {
        Value::Null => StoreValue::Null,
        Value::Bool(b) => StoreValue::Boolean(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                StoreValue::Integer(i)
            } else {
                match n.as_f64() {
                    Some(f) if f.is_finite() => StoreValue::Float(f),
                    _ => StoreValue::Null,
                }
            }
        }
        Value::String(s) => StoreValue::Text(s.clone()),
        Value::Array(_) | Value::Object(_) => StoreValue::Text(value.to_string()),
    }
}

impl From<f64> for StoreValue {
    fn from(f: f64) -> Self {
        if f.is_finite() {
            StoreValue::Float(f)
        } else {
            StoreValue::Null
        }
    }
}

/// Column allow-lists that drive read-side coercion
#[derive(Debug, Clone, Default)]
pub struct CoercionRules {
    json_columns: HashSet<String>,
    boolean_columns: HashSet<String>,
}

impl CoercionRules {
    pub fn new<J, B>(json_columns: J, boolean_columns: B) -> Self
    where
        J: IntoIterator,
        J::Item: Into<String>,
        B: IntoIterator,
        B::Item: Into<String>,
    {
        Self {
            json_columns: json_columns.into_iter().map(Into::into).collect(),
            boolean_columns: boolean_columns.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_settings(settings: &CoercionSettings) -> Self {
        Self::new(
            settings.json_columns.iter().cloned(),
            settings.boolean_columns.iter().cloned(),
        )
    }

    /// Convert one column value read from the store into a response value
    pub fn from_store_value(&self, column: &str, value: StoreValue) -> Value {
        if self.boolean_columns.contains(column) {
            return strict_bool(value);
        }
        match value {
            StoreValue::Null => Value::Null,
            StoreValue::Boolean(b) => Value::Bool(b),
            StoreValue::Integer(i) => Value::Number(i.into()),
            StoreValue::Float(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
            StoreValue::Text(s) => {
                if self.json_columns.contains(column) {
                    serde_json::from_str(&s).unwrap_or(Value::String(s))
                } else {
                    Value::String(s)
                }
            }
            StoreValue::Json(v) => v,
            StoreValue::Timestamp(ts) => Value::String(format_timestamp(&ts)),
            StoreValue::Date(d) => Value::String(d.format("%Y-%m-%d").to_string()),
        }
    }

    /// Build a record from (column, value) pairs read from one row
    pub fn decode_row<I>(&self, columns: I) -> Record
    where
        I: IntoIterator<Item = (String, StoreValue)>,
    {
        columns
            .into_iter()
            .map(|(name, value)| {
                let value = self.from_store_value(&name, value);
                (name, value)
            })
            .collect()
    }
}

fn strict_bool(value: StoreValue) -> Value {
    let b = match value {
        StoreValue::Null => return Value::Null,
        StoreValue::Boolean(b) => b,
        StoreValue::Integer(i) => i != 0,
        StoreValue::Float(f) => f != 0.0,
        StoreValue::Text(s) => text_truthy(&s),
        StoreValue::Json(Value::Bool(b)) => b,
        StoreValue::Json(Value::String(s)) => text_truthy(&s),
        StoreValue::Json(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        StoreValue::Json(_) | StoreValue::Timestamp(_) | StoreValue::Date(_) => false,
    };
    Value::Bool(b)
}

fn text_truthy(s: &str) -> bool {
    matches!(
        s.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "t" | "yes" | "y" | "on"
    )
}

/// Current time as a system timestamp (UTC, millisecond precision)
pub fn now_timestamp() -> NaiveDateTime {
    Utc::now().naive_utc().trunc_subsecs(3)
}

pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(TIMESTAMP_READ_FORMAT).to_string()
}

/// Parse the timestamp shapes clients send.
///
/// Zoned inputs are converted to UTC; unzoned inputs are taken as-is.
pub fn parse_timestamp(input: &str) -> Option<NaiveDateTime> {
    let s = input.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    let naive = s.strip_suffix('Z').unwrap_or(s);
    for fmt in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(naive, fmt) {
            return Some(ts);
        }
    }
    NaiveDate::parse_from_str(naive, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

fn value_timestamp(value: &Value) -> Option<NaiveDateTime> {
    match value {
        Value::String(s) => parse_timestamp(s),
        Value::Number(n) => n
            .as_i64()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .map(|dt| dt.naive_utc()),
        _ => None,
    }
}

/// Compare two `updated_date` snapshots as instants at millisecond precision.
///
/// Values that do not parse as timestamps fall back to plain equality.
pub fn same_instant(a: &Value, b: &Value) -> bool {
    match (value_timestamp(a), value_timestamp(b)) {
        (Some(x), Some(y)) => x.trunc_subsecs(3) == y.trunc_subsecs(3),
        _ => a == b,
    }
}

impl StoreValue {
    fn as_bool(&self) -> Result<bool, SqlError> {
        match self {
            StoreValue::Boolean(b) => Ok(*b),
            StoreValue::Integer(i) => Ok(*i != 0),
            StoreValue::Float(f) => Ok(*f != 0.0),
            StoreValue::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "t" | "yes" | "y" | "on" => Ok(true),
                "0" | "false" | "f" | "no" | "n" | "off" | "" => Ok(false),
                other => Err(format!("cannot store {:?} as boolean", other).into()),
            },
            other => Err(format!("cannot store {:?} as boolean", other).into()),
        }
    }

    fn as_i64(&self) -> Result<i64, SqlError> {
        match self {
            StoreValue::Integer(i) => Ok(*i),
            StoreValue::Boolean(b) => Ok(i64::from(*b)),
            StoreValue::Float(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Ok(*f as i64),
            StoreValue::Text(s) => {
                let s = s.trim();
                if let Ok(i) = s.parse::<i64>() {
                    return Ok(i);
                }
                match s.parse::<f64>() {
                    Ok(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Ok(f as i64),
                    _ => Err(format!("cannot store {:?} as integer", s).into()),
                }
            }
            other => Err(format!("cannot store {:?} as integer", other).into()),
        }
    }

    fn as_f64(&self) -> Result<f64, SqlError> {
        match self {
            StoreValue::Float(f) => Ok(*f),
            StoreValue::Integer(i) => Ok(*i as f64),
            StoreValue::Boolean(b) => Ok(if *b { 1.0 } else { 0.0 }),
            StoreValue::Text(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| format!("cannot store {:?} as float", s).into()),
            other => Err(format!("cannot store {:?} as float", other).into()),
        }
    }

    fn as_decimal(&self) -> Result<Decimal, SqlError> {
        match self {
            StoreValue::Integer(i) => Ok(Decimal::from(*i)),
            StoreValue::Float(f) => Ok(Decimal::try_from(*f)?),
            StoreValue::Boolean(b) => Ok(Decimal::from(i64::from(*b))),
            StoreValue::Text(s) => {
                let s = s.trim();
                Decimal::from_str(s)
                    .or_else(|_| Decimal::from_scientific(s))
                    .map_err(|_| format!("cannot store {:?} as numeric", s).into())
            }
            other => Err(format!("cannot store {:?} as numeric", other).into()),
        }
    }

    fn as_json(&self) -> Value {
        match self {
            StoreValue::Null => Value::Null,
            StoreValue::Boolean(b) => Value::Bool(*b),
            StoreValue::Integer(i) => Value::Number((*i).into()),
            StoreValue::Float(f) => Number::from_f64(*f).map_or(Value::Null, Value::Number),
            StoreValue::Text(s) => {
                serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.clone()))
            }
            StoreValue::Json(v) => v.clone(),
            StoreValue::Timestamp(ts) => Value::String(format_timestamp(ts)),
            StoreValue::Date(d) => Value::String(d.to_string()),
        }
    }

    fn as_timestamp(&self) -> Result<NaiveDateTime, SqlError> {
        match self {
            StoreValue::Timestamp(ts) => Ok(*ts),
            StoreValue::Date(d) => d
                .and_hms_opt(0, 0, 0)
                .ok_or_else(|| "invalid date".into()),
            StoreValue::Text(s) => {
                parse_timestamp(s).ok_or_else(|| format!("cannot store {:?} as timestamp", s).into())
            }
            StoreValue::Integer(ms) => DateTime::<Utc>::from_timestamp_millis(*ms)
                .map(|dt| dt.naive_utc())
                .ok_or_else(|| format!("timestamp out of range: {}", ms).into()),
            other => Err(format!("cannot store {:?} as timestamp", other).into()),
        }
    }

    fn as_date(&self) -> Result<NaiveDate, SqlError> {
        match self {
            StoreValue::Date(d) => Ok(*d),
            other => other.as_timestamp().map(|ts| ts.date()),
        }
    }

    fn as_text(&self) -> String {
        match self {
            StoreValue::Null => String::new(),
            StoreValue::Boolean(b) => b.to_string(),
            StoreValue::Integer(i) => i.to_string(),
            StoreValue::Float(f) => f.to_string(),
            StoreValue::Text(s) => s.clone(),
            StoreValue::Json(Value::String(s)) => s.clone(),
            StoreValue::Json(v) => v.to_string(),
            StoreValue::Timestamp(ts) => ts.format(TIMESTAMP_WRITE_FORMAT).to_string(),
            StoreValue::Date(d) => d.to_string(),
        }
    }
}

impl ToSql for StoreValue {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, SqlError> {
        if matches!(self, StoreValue::Null) {
            return Ok(IsNull::Yes);
        }
        match *ty {
            Type::BOOL => self.as_bool()?.to_sql(ty, out),
            Type::INT2 => i16::try_from(self.as_i64()?)?.to_sql(ty, out),
            Type::INT4 => i32::try_from(self.as_i64()?)?.to_sql(ty, out),
            Type::INT8 => self.as_i64()?.to_sql(ty, out),
            Type::FLOAT4 => (self.as_f64()? as f32).to_sql(ty, out),
            Type::FLOAT8 => self.as_f64()?.to_sql(ty, out),
            Type::NUMERIC => self.as_decimal()?.to_sql(ty, out),
            Type::JSON | Type::JSONB => self.as_json().to_sql(ty, out),
            Type::TIMESTAMP => self.as_timestamp()?.to_sql(ty, out),
            Type::TIMESTAMPTZ => self.as_timestamp()?.and_utc().to_sql(ty, out),
            Type::DATE => self.as_date()?.to_sql(ty, out),
            Type::UUID => uuid::Uuid::parse_str(self.as_text().trim())?.to_sql(ty, out),
            _ if <String as ToSql>::accepts(ty) => self.as_text().to_sql(ty, out),
            _ => Err(format!("unsupported column type {}", ty.name()).into()),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}
