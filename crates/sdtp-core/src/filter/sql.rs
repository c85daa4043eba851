//! Translation of flat filters into a SQL `WHERE` predicate.
//!
//! Only shapes whose SQL meaning matches local evaluation exactly are
//! translated: a single leaf, or one combinator over leaves. Deeper trees
//! return `None` and are evaluated locally.
//!
//! Local evaluation treats a NULL cell as "no match" for every leaf, which
//! SQL already does for `IN`, `BETWEEN`-style comparisons and
//! `REGEXP_CONTAINS` at the top level. Negation is the exception, so `NONE`
//! is emitted as `NOT COALESCE(..., FALSE)`.
//!
//! DATETIME columns may be stored as `DATE`, `DATETIME` or `TIMESTAMP` in the
//! warehouse. They are compared as `CAST(col AS TIMESTAMP)` against
//! `TIMESTAMP` literals, which every one of those types accepts and which
//! reads zone-less values as UTC, as local decoding does.
use chrono::SecondsFormat;

use super::{CompiledFilter, FilterSpec};
use crate::{
    schema::{ColumnType, Schema},
    value::Value,
};

/// Translate `spec` into a SQL predicate over the columns of `schema`.
///
/// Returns `None` when the spec does not validate or is nested more than one
/// combinator deep.
pub fn to_sql_predicate(spec: &FilterSpec, schema: &Schema) -> Option<String> {
    let compiled = CompiledFilter::compile(spec, schema).ok()?;
    match &compiled {
        CompiledFilter::All(children)
        | CompiledFilter::Any(children)
        | CompiledFilter::NoneOf(children) => {
            if children.iter().any(|c| !is_leaf(c)) {
                return None;
            }
        }
        _ => {}
    }
    Some(predicate(&compiled, schema))
}

fn is_leaf(filter: &CompiledFilter) -> bool {
    matches!(
        filter,
        CompiledFilter::InList { .. }
            | CompiledFilter::InRange { .. }
            | CompiledFilter::RegexMatch { .. }
    )
}

fn predicate(filter: &CompiledFilter, schema: &Schema) -> String {
    let column = |index: usize| {
        let descriptor = &schema.columns()[index];
        let quoted = quote_identifier(&descriptor.name);
        match descriptor.column_type {
            ColumnType::DateTime => format!("CAST({quoted} AS TIMESTAMP)"),
            _ => quoted,
        }
    };
    match filter {
        CompiledFilter::InList { index, values } => {
            let literals: Vec<String> = values
                .iter()
                .filter(|v| !v.is_null())
                .map(literal)
                .collect();
            if literals.is_empty() {
                "FALSE".to_string()
            } else {
                format!("{} IN ({})", column(*index), literals.join(", "))
            }
        }
        CompiledFilter::InRange { index, min, max } => {
            let col = column(*index);
            match (min, max) {
                (None, None) => format!("{col} IS NOT NULL"),
                (Some(lo), None) => format!("{col} >= {}", literal(lo)),
                (None, Some(hi)) => format!("{col} <= {}", literal(hi)),
                (Some(lo), Some(hi)) => {
                    format!("({col} >= {} AND {col} <= {})", literal(lo), literal(hi))
                }
            }
        }
        CompiledFilter::RegexMatch { index, regex } => format!(
            "REGEXP_CONTAINS({}, {})",
            column(*index),
            quote_string(regex.as_str())
        ),
        CompiledFilter::All(children) => join(children, schema, " AND ", "TRUE"),
        CompiledFilter::Any(children) => join(children, schema, " OR ", "FALSE"),
        CompiledFilter::NoneOf(children) => {
            if children.is_empty() {
                "TRUE".to_string()
            } else {
                format!(
                    "NOT COALESCE({}, FALSE)",
                    join(children, schema, " OR ", "FALSE")
                )
            }
        }
    }
}

fn join(children: &[CompiledFilter], schema: &Schema, sep: &str, empty: &str) -> String {
    if children.is_empty() {
        return empty.to_string();
    }
    let parts: Vec<String> = children.iter().map(|c| predicate(c, schema)).collect();
    format!("({})", parts.join(sep))
}

fn literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::String(s) => quote_string(s),
        Value::Number(_) => value.to_json().to_string(),
        Value::Boolean(true) => "TRUE".to_string(),
        Value::Boolean(false) => "FALSE".to_string(),
        Value::DateTime(dt) => format!(
            "TIMESTAMP {}",
            quote_string(&dt.to_rfc3339_opts(SecondsFormat::AutoSi, true))
        ),
    }
}

/// Quote a string literal, escaping backslashes and single quotes.
fn quote_string(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Quote an identifier with backticks.
pub(crate) fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "\\`"))
}
