//! Statement-related data models.
//!
//! This module defines bound values and execution outcomes.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A fetched row, keyed by column name.
pub type Row = serde_json::Map<String, JsonValue>;

/// A relative change applied to a numeric column.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Delta {
    Int(i64),
    Float(f64),
}

impl Delta {
    /// Apply this delta to a cached column value.
    ///
    /// Non-numeric or missing values are treated as zero. Numeric strings
    /// (as returned for DECIMAL columns) are parsed first.
    pub fn apply(&self, current: &JsonValue) -> JsonValue {
        let base = match current {
            JsonValue::Number(n) => Some(n.clone()),
            JsonValue::String(s) => s.trim().parse::<serde_json::Number>().ok(),
            _ => None,
        };

        match (self, base) {
            (Delta::Int(d), Some(n)) if n.is_i64() => {
                JsonValue::from(n.as_i64().unwrap_or_default().saturating_add(*d))
            }
            (Delta::Int(d), None) => JsonValue::from(*d),
            (Delta::Int(d), Some(n)) => float_value(n.as_f64().unwrap_or_default() + *d as f64),
            (Delta::Float(d), Some(n)) => float_value(n.as_f64().unwrap_or_default() + d),
            (Delta::Float(d), None) => float_value(*d),
        }
    }

    /// Combine two pending deltas on the same column.
    pub fn merge(self, other: Delta) -> Delta {
        match (self, other) {
            (Delta::Int(a), Delta::Int(b)) => Delta::Int(a.saturating_add(b)),
            (a, b) => Delta::Float(a.as_f64() + b.as_f64()),
        }
    }

    pub fn as_f64(&self) -> f64 {
        match self {
            Delta::Int(v) => *v as f64,
            Delta::Float(v) => *v,
        }
    }
}

impl From<i64> for Delta {
    fn from(v: i64) -> Self {
        Delta::Int(v)
    }
}

impl From<i32> for Delta {
    fn from(v: i32) -> Self {
        Delta::Int(v.into())
    }
}

impl From<f64> for Delta {
    fn from(v: f64) -> Self {
        Delta::Float(v)
    }
}

fn float_value(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or(JsonValue::Null)
}

/// A value bound into a statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// NULL value
    Null,
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    Float(f64),
    String(String),
    /// JSON document, bound as its text encoding
    Json(JsonValue),
    /// Server-side expression substituted verbatim into the SQL text (e.g. `NOW()`)
    Raw(String),
    /// Relative change; renders as `col = col + ?` in updates
    Delta(Delta),
}

impl Value {
    /// Create a raw SQL expression value.
    pub fn raw(expression: impl Into<String>) -> Self {
        Self::Raw(expression.into())
    }

    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, Self::Raw(_))
    }

    /// Get the type name of this value for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Json(_) => "json",
            Self::Raw(_) => "raw",
            Self::Delta(_) => "delta",
        }
    }

    /// Convert a JSON field value into a bind value.
    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(b) => Self::Bool(*b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or_default()),
            },
            JsonValue::String(s) => Self::String(s.clone()),
            other => Self::Json(other.clone()),
        }
    }

    /// Convert back into the JSON representation used by rows and snapshots.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Null => JsonValue::Null,
            Self::Bool(b) => JsonValue::Bool(*b),
            Self::Int(i) => JsonValue::from(*i),
            Self::Float(f) => float_value(*f),
            Self::String(s) | Self::Raw(s) => JsonValue::String(s.clone()),
            Self::Json(j) => j.clone(),
            Self::Delta(Delta::Int(d)) => JsonValue::from(*d),
            Self::Delta(Delta::Float(d)) => float_value(*d),
        }
    }
}

macro_rules! impl_value_from {
    ($($ty:ty => $variant:ident as $conv:ty),+ $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v as $conv)
                }
            }
        )+
    };
}

impl_value_from!(
    i8 => Int as i64,
    i16 => Int as i64,
    i32 => Int as i64,
    i64 => Int as i64,
    u8 => Int as i64,
    u16 => Int as i64,
    u32 => Int as i64,
    u64 => Int as i64,
    f32 => Float as f64,
    f64 => Float as f64,
);

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<JsonValue> for Value {
    fn from(v: JsonValue) -> Self {
        Value::from_json(&v)
    }
}

impl From<Delta> for Value {
    fn from(v: Delta) -> Self {
        Value::Delta(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Result of running one statement on a physical driver.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Outcome {
    pub rows: Vec<Row>,
    pub rows_affected: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_insert_id: Option<u64>,
}

impl Outcome {
    /// Create a result for a query.
    pub fn rows(rows: Vec<Row>) -> Self {
        let rows_affected = rows.len() as u64;
        Self {
            rows,
            rows_affected,
            last_insert_id: None,
        }
    }

    /// Create a result for write operations (INSERT/UPDATE/DELETE).
    pub fn write(rows_affected: u64, last_insert_id: Option<u64>) -> Self {
        Self {
            rows: Vec::new(),
            rows_affected,
            last_insert_id,
        }
    }
}
