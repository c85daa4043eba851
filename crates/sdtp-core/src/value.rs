//! Scalar cell values.
//!
//! Every row is a `Vec<Value>` aligned with its table's [`Schema`]. Values are
//! decoded from JSON according to the declared column type, so a NUMBER column
//! always holds `Value::Number` (or `Value::Null`), regardless of whether the
//! source wrote `1200` or `"1200"`.
//!
//! [`Schema`]: crate::schema::Schema
use std::{cmp::Ordering, fmt};

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, SubsecRound, Utc};
use serde_json::Value as Json;
use snafu::prelude::*;

use crate::schema::ColumnType;

/// Largest integer magnitude an `f64` represents exactly.
const MAX_EXACT_INT: f64 = 9_007_199_254_740_992.0;

/// Errors produced while decoding a JSON value into a typed [`Value`].
#[derive(Debug, Clone, Snafu, PartialEq, Eq)]
#[snafu(display("Cannot read {found} as {expected}"))]
pub struct ValueError {
    /// The column type the value was decoded against.
    pub expected: ColumnType,
    /// Rendering of the offending input.
    pub found: String,
}

/// A single typed cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Missing value. Never matches a filter leaf.
    Null,
    /// Text.
    String(String),
    /// Number.
    Number(f64),
    /// Boolean.
    Boolean(bool),
    /// UTC instant.
    DateTime(DateTime<Utc>),
}

impl Value {
    /// Decode `json` as a value of `column_type`.
    ///
    /// JSON `null` decodes to [`Value::Null`] for every type.
    pub fn from_json(json: &Json, column_type: ColumnType) -> Result<Value, ValueError> {
        let fail = || ValueError {
            expected: column_type,
            found: json.to_string(),
        };

        if json.is_null() {
            return Ok(Value::Null);
        }

        match column_type {
            ColumnType::String => match json {
                Json::String(s) => Ok(Value::String(s.clone())),
                _ => Err(fail()),
            },
            ColumnType::Number => match json {
                Json::Number(n) => n.as_f64().map(Value::Number).ok_or_else(fail),
                Json::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(Value::Number)
                    .map_err(|_| fail()),
                _ => Err(fail()),
            },
            ColumnType::Boolean => match json {
                Json::Bool(b) => Ok(Value::Boolean(*b)),
                Json::String(s) if s.eq_ignore_ascii_case("true") => Ok(Value::Boolean(true)),
                Json::String(s) if s.eq_ignore_ascii_case("false") => Ok(Value::Boolean(false)),
                _ => Err(fail()),
            },
            ColumnType::DateTime => match json {
                Json::String(s) => parse_datetime(s).map(Value::DateTime).ok_or_else(fail),
                _ => Err(fail()),
            },
        }
    }

    /// Encode to JSON. Integral numbers are written as JSON integers and
    /// datetimes as RFC 3339 strings.
    pub fn to_json(&self) -> Json {
        match self {
            Value::Null => Json::Null,
            Value::String(s) => Json::String(s.clone()),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.abs() <= MAX_EXACT_INT {
                    Json::from(*n as i64)
                } else {
                    serde_json::Number::from_f64(*n)
                        .map(Json::Number)
                        .unwrap_or(Json::Null)
                }
            }
            Value::Boolean(b) => Json::Bool(*b),
            Value::DateTime(dt) => Json::String(dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        }
    }

    /// True for [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Natural ordering between two values of the same type.
    ///
    /// Returns `None` when the values have different types or a number is NaN.
    pub fn partial_cmp_same_type(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
            (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
            (Value::DateTime(a), Value::DateTime(b)) => Some(a.cmp(b)),
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            _ => None,
        }
    }

    /// Total order used for sorting column values: nulls first, then the
    /// natural ordering within a type.
    pub fn sort_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Less,
            (_, Value::Null) => Ordering::Greater,
            (Value::Number(a), Value::Number(b)) => a.total_cmp(b),
            _ => self
                .partial_cmp_same_type(other)
                .unwrap_or_else(|| self.type_rank().cmp(&other.type_rank())),
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Boolean(_) => 1,
            Value::Number(_) => 2,
            Value::DateTime(_) => 3,
            Value::String(_) => 4,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::String(s) => f.write_str(s),
            Value::Number(_) => write!(f, "{}", self.to_json()),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::DateTime(dt) => f.write_str(&dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        }
    }
}

/// Parse the datetime spellings accepted in descriptors and filters:
/// RFC 3339, `YYYY-MM-DD HH:MM:SS` / `YYYY-MM-DDTHH:MM:SS` (read as UTC) and
/// plain `YYYY-MM-DD` dates (midnight UTC).
///
/// Fractional seconds are truncated to microseconds, the finest precision
/// every backend stores.
pub fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    parse_datetime_exact(s.trim()).map(|dt| dt.trunc_subsecs(6))
}

fn parse_datetime_exact(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Decode a JSON row against the given column types.
pub fn row_from_json(
    json_row: &[Json],
    column_types: &[ColumnType],
) -> Result<Vec<Value>, ValueError> {
    json_row
        .iter()
        .zip(column_types)
        .map(|(json, ty)| Value::from_json(json, *ty))
        .collect()
}

/// Encode a row as a JSON array.
pub fn row_to_json(row: &[Value]) -> Json {
    Json::Array(row.iter().map(Value::to_json).collect())
}
