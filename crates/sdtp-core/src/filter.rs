//! Filter specification language.
//!
//! A filter is a small tree built from exactly six constructors:
//!
//! | constructor   | JSON form                                                          |
//! |---------------|--------------------------------------------------------------------|
//! | `IN_LIST`     | `{"operator": "IN_LIST", "column": c, "values": [...]}`            |
//! | `IN_RANGE`    | `{"operator": "IN_RANGE", "column": c, "min_val": v, "max_val": v}` |
//! | `REGEX_MATCH` | `{"operator": "REGEX_MATCH", "column": c, "expression": p}`        |
//! | `ALL`         | `{"operator": "ALL", "arguments": [...]}`                          |
//! | `ANY`         | `{"operator": "ANY", "arguments": [...]}`                          |
//! | `NONE`        | `{"operator": "NONE", "arguments": [...]}`                         |
//!
//! The same trees can be written in call form, e.g.
//! `ALL([IN_LIST('Month', ['Jun', 'Jul']), IN_RANGE('Disease', 1000, 5000)])`.
//!
//! Processing happens in three pure stages:
//! - [`parse`] turns text into an untyped [`FilterSpec`] or a
//!   [`FilterSyntaxError`]; nothing in the input is ever executed.
//! - [`validate`] / [`CompiledFilter::compile`] check the tree against a
//!   [`Schema`]: columns must exist, `IN_RANGE` needs a NUMBER or DATETIME
//!   column, `REGEX_MATCH` a STRING column, and literals must decode as the
//!   column's type.
//! - [`apply`] evaluates a compiled tree over rows, keeping row order.
//!
//! Invalid filters never fail a request. [`resolve`] packages the policy: a
//! filter that does not parse or validate is dropped and the caller serves
//! unfiltered rows.
use std::fmt;

use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::schema::Schema;

mod eval;
mod parse;
mod sql;
mod validate;

pub use eval::{apply, apply_compiled};
pub use parse::{FilterSyntaxError, parse, parse_json};
pub use sql::to_sql_predicate;
pub(crate) use sql::quote_identifier;
pub use validate::{CompiledFilter, FilterTypeError, validate};

/// Untyped filter tree as parsed from JSON or call syntax.
///
/// Literal values are kept as JSON scalars until the tree is compiled against
/// a schema, which decodes them according to the referenced column's type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Json", into = "Json")]
pub enum FilterSpec {
    /// Column value is one of `values`.
    InList {
        /// Column name.
        column: String,
        /// Accepted values.
        values: Vec<Json>,
    },
    /// Column value lies in `[min, max]`; a missing bound is open.
    InRange {
        /// Column name.
        column: String,
        /// Inclusive lower bound.
        min: Option<Json>,
        /// Inclusive upper bound.
        max: Option<Json>,
    },
    /// Column value contains a match for `pattern`.
    RegexMatch {
        /// Column name.
        column: String,
        /// Regular expression.
        pattern: String,
    },
    /// Every child matches. Empty means true.
    All(Vec<FilterSpec>),
    /// At least one child matches. Empty means false.
    Any(Vec<FilterSpec>),
    /// No child matches. Empty means true.
    NoneOf(Vec<FilterSpec>),
}

impl FilterSpec {
    /// Wire name of this node's operator.
    pub fn operator(&self) -> &'static str {
        match self {
            FilterSpec::InList { .. } => "IN_LIST",
            FilterSpec::InRange { .. } => "IN_RANGE",
            FilterSpec::RegexMatch { .. } => "REGEX_MATCH",
            FilterSpec::All(_) => "ALL",
            FilterSpec::Any(_) => "ANY",
            FilterSpec::NoneOf(_) => "NONE",
        }
    }

    /// Children of a combinator; empty for leaves.
    pub fn children(&self) -> &[FilterSpec] {
        match self {
            FilterSpec::All(c) | FilterSpec::Any(c) | FilterSpec::NoneOf(c) => c,
            _ => &[],
        }
    }

    /// True for `IN_LIST`, `IN_RANGE` and `REGEX_MATCH`.
    pub fn is_leaf(&self) -> bool {
        matches!(
            self,
            FilterSpec::InList { .. } | FilterSpec::InRange { .. } | FilterSpec::RegexMatch { .. }
        )
    }

    /// Encode in the JSON wire form.
    pub fn to_json(&self) -> Json {
        let mut obj = Map::new();
        obj.insert("operator".into(), Json::from(self.operator()));
        match self {
            FilterSpec::InList { column, values } => {
                obj.insert("column".into(), Json::from(column.as_str()));
                obj.insert("values".into(), Json::Array(values.clone()));
            }
            FilterSpec::InRange { column, min, max } => {
                obj.insert("column".into(), Json::from(column.as_str()));
                if let Some(min) = min {
                    obj.insert("min_val".into(), min.clone());
                }
                if let Some(max) = max {
                    obj.insert("max_val".into(), max.clone());
                }
            }
            FilterSpec::RegexMatch { column, pattern } => {
                obj.insert("column".into(), Json::from(column.as_str()));
                obj.insert("expression".into(), Json::from(pattern.as_str()));
            }
            FilterSpec::All(children) | FilterSpec::Any(children) | FilterSpec::NoneOf(children) => {
                obj.insert(
                    "arguments".into(),
                    Json::Array(children.iter().map(FilterSpec::to_json).collect()),
                );
            }
        }
        Json::Object(obj)
    }
}

impl TryFrom<Json> for FilterSpec {
    type Error = FilterSyntaxError;

    fn try_from(value: Json) -> Result<Self, Self::Error> {
        parse_json(&value)
    }
}

impl From<FilterSpec> for Json {
    fn from(value: FilterSpec) -> Self {
        value.to_json()
    }
}

impl fmt::Display for FilterSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

/// Outcome of turning optional user input into a filter for one table.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterResolution {
    /// No filter was supplied.
    Unfiltered,
    /// The filter parsed and validated against the table's schema.
    Applied(FilterSpec),
    /// The filter was dropped; rows are served unfiltered.
    Rejected {
        /// The input as supplied.
        input: String,
        /// Human-readable reason, suitable for a user notice.
        reason: String,
    },
}

impl FilterResolution {
    /// The filter to apply, if any.
    pub fn spec(&self) -> Option<&FilterSpec> {
        match self {
            FilterResolution::Applied(spec) => Some(spec),
            _ => None,
        }
    }

    /// True when user input was discarded.
    pub fn is_rejected(&self) -> bool {
        matches!(self, FilterResolution::Rejected { .. })
    }
}

/// Parse and validate `input` against `schema`, falling back to no filter.
///
/// Empty or whitespace-only input means "no filter". Syntax and type errors
/// are logged and reported as [`FilterResolution::Rejected`]; they are never
/// returned as errors.
pub fn resolve(input: Option<&str>, schema: &Schema) -> FilterResolution {
    let Some(text) = input.map(str::trim).filter(|s| !s.is_empty()) else {
        return FilterResolution::Unfiltered;
    };

    let spec = match parse(text) {
        Ok(spec) => spec,
        Err(e) => {
            warn!("ignoring unparsable filter {text:?}: {e}");
            return FilterResolution::Rejected {
                input: text.to_string(),
                reason: format!("{text} is not a valid filter specification: {e}"),
            };
        }
    };

    match CompiledFilter::compile(&spec, schema) {
        Ok(_) => FilterResolution::Applied(spec),
        Err(e) => {
            warn!("ignoring filter {text:?} that does not fit schema {schema}: {e}");
            FilterResolution::Rejected {
                input: text.to_string(),
                reason: format!("{text} is not a valid filter specification: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn schema() -> Schema {
        Schema::from_pairs([("Month", "STRING"), ("Disease", "NUMBER")]).expect("schema")
    }

    #[test]
    fn serde_uses_wire_form() -> TestResult {
        let spec = FilterSpec::NoneOf(vec![FilterSpec::InList {
            column: "Month".into(),
            values: vec![json!("Jun"), json!("Jul")],
        }]);
        let encoded = serde_json::to_value(&spec)?;
        assert_eq!(
            encoded,
            json!({"operator": "NONE", "arguments": [
                {"operator": "IN_LIST", "column": "Month", "values": ["Jun", "Jul"]}
            ]})
        );
        let decoded: FilterSpec = serde_json::from_value(encoded)?;
        assert_eq!(decoded, spec);
        Ok(())
    }

    #[test]
    fn resolve_empty_input_is_unfiltered() {
        assert_eq!(resolve(None, &schema()), FilterResolution::Unfiltered);
        assert_eq!(resolve(Some("   "), &schema()), FilterResolution::Unfiltered);
    }

    #[test]
    fn resolve_accepts_valid_filter() {
        let res = resolve(
            Some(r#"{"operator": "IN_RANGE", "column": "Disease", "min_val": 1000, "max_val": 5000}"#),
            &schema(),
        );
        assert!(matches!(res, FilterResolution::Applied(FilterSpec::InRange { .. })));
    }

    #[test]
    fn resolve_rejects_syntax_and_type_errors() {
        let bad_syntax = resolve(Some("__import__('os')"), &schema());
        assert!(bad_syntax.is_rejected());
        assert!(bad_syntax.spec().is_none());

        let bad_type = resolve(Some("REGEX_MATCH('Disease', '^1')"), &schema());
        assert!(bad_type.is_rejected());
    }

    #[test]
    fn resolve_rejects_deeply_nested_input() {
        let depth = 10_000;
        let input = format!(
            "{}IN_LIST('Month', ['Jan']){}",
            "ANY([".repeat(depth),
            "])".repeat(depth)
        );
        let res = resolve(Some(&input), &schema());
        assert!(res.is_rejected());
        assert!(res.spec().is_none());
    }
}
