//! Checking filters against a schema.
//!
//! Compilation resolves column names to positions, decodes literals to typed
//! [`Value`]s and builds regexes once, so evaluation is a cheap walk over
//! prepared data.
use regex::Regex;
use snafu::prelude::*;

use super::FilterSpec;
use crate::{
    schema::{ColumnType, Schema},
    value::Value,
};

/// Reasons a syntactically valid filter does not fit a schema.
///
/// These never escape a request: [`validate`] maps them to `false`, and
/// callers serve unfiltered rows.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum FilterTypeError {
    /// A leaf names a column the schema does not have.
    #[snafu(display("{operator} references unknown column '{column}'"))]
    UnknownColumn {
        /// Operator of the leaf.
        operator: String,
        /// The missing column.
        column: String,
    },

    /// The operator cannot be applied to the column's type.
    #[snafu(display("{operator} cannot be applied to {column_type} column '{column}'"))]
    IncompatibleType {
        /// Operator of the leaf.
        operator: String,
        /// Column name.
        column: String,
        /// Declared column type.
        column_type: ColumnType,
    },

    /// A literal does not decode as the column's type.
    #[snafu(display("{operator} value {value} does not fit {column_type} column '{column}'"))]
    UncoercibleValue {
        /// Operator of the leaf.
        operator: String,
        /// Column name.
        column: String,
        /// Declared column type.
        column_type: ColumnType,
        /// Rendering of the literal.
        value: String,
    },

    /// The regular expression does not compile.
    #[snafu(display("REGEX_MATCH pattern for column '{column}' is invalid: {source}"))]
    InvalidPattern {
        /// Column name.
        column: String,
        /// Regex compile error.
        source: regex::Error,
    },
}

/// A filter tree bound to a specific schema.
#[derive(Debug, Clone)]
pub enum CompiledFilter {
    /// Membership test on the column at `index`.
    InList {
        /// Column position.
        index: usize,
        /// Accepted values, decoded to the column type.
        values: Vec<Value>,
    },
    /// Inclusive range test on the column at `index`.
    InRange {
        /// Column position.
        index: usize,
        /// Lower bound.
        min: Option<Value>,
        /// Upper bound.
        max: Option<Value>,
    },
    /// Regex search on the column at `index`.
    RegexMatch {
        /// Column position.
        index: usize,
        /// Compiled pattern.
        regex: Regex,
    },
    /// Conjunction.
    All(Vec<CompiledFilter>),
    /// Disjunction.
    Any(Vec<CompiledFilter>),
    /// Negated disjunction.
    NoneOf(Vec<CompiledFilter>),
}

impl CompiledFilter {
    /// Bind `spec` to `schema`.
    pub fn compile(spec: &FilterSpec, schema: &Schema) -> Result<CompiledFilter, FilterTypeError> {
        let operator = spec.operator();
        match spec {
            FilterSpec::InList { column, values } => {
                let (index, column_type) = lookup(schema, operator, column)?;
                let values = values
                    .iter()
                    .map(|v| decode(v, operator, column, column_type))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(CompiledFilter::InList { index, values })
            }
            FilterSpec::InRange { column, min, max } => {
                let (index, column_type) = lookup(schema, operator, column)?;
                ensure!(
                    column_type.is_ordered(),
                    IncompatibleTypeSnafu {
                        operator,
                        column,
                        column_type,
                    }
                );
                let min = min
                    .as_ref()
                    .map(|v| decode(v, operator, column, column_type))
                    .transpose()?;
                let max = max
                    .as_ref()
                    .map(|v| decode(v, operator, column, column_type))
                    .transpose()?;
                Ok(CompiledFilter::InRange { index, min, max })
            }
            FilterSpec::RegexMatch { column, pattern } => {
                let (index, column_type) = lookup(schema, operator, column)?;
                ensure!(
                    column_type == ColumnType::String,
                    IncompatibleTypeSnafu {
                        operator,
                        column,
                        column_type,
                    }
                );
                let regex = Regex::new(pattern).context(InvalidPatternSnafu { column })?;
                Ok(CompiledFilter::RegexMatch { index, regex })
            }
            FilterSpec::All(children) => Ok(CompiledFilter::All(compile_all(children, schema)?)),
            FilterSpec::Any(children) => Ok(CompiledFilter::Any(compile_all(children, schema)?)),
            FilterSpec::NoneOf(children) => {
                Ok(CompiledFilter::NoneOf(compile_all(children, schema)?))
            }
        }
    }
}

fn compile_all(
    children: &[FilterSpec],
    schema: &Schema,
) -> Result<Vec<CompiledFilter>, FilterTypeError> {
    children
        .iter()
        .map(|child| CompiledFilter::compile(child, schema))
        .collect()
}

fn lookup(
    schema: &Schema,
    operator: &str,
    column: &str,
) -> Result<(usize, ColumnType), FilterTypeError> {
    schema
        .column(column)
        .map(|(index, descriptor)| (index, descriptor.column_type))
        .context(UnknownColumnSnafu { operator, column })
}

fn decode(
    literal: &serde_json::Value,
    operator: &str,
    column: &str,
    column_type: ColumnType,
) -> Result<Value, FilterTypeError> {
    // Bare numbers in a STRING column compare by their text.
    let coerced = match (column_type, literal) {
        (ColumnType::String, serde_json::Value::Number(n)) => {
            serde_json::Value::String(n.to_string())
        }
        _ => literal.clone(),
    };
    Value::from_json(&coerced, column_type).map_err(|_| FilterTypeError::UncoercibleValue {
        operator: operator.to_string(),
        column: column.to_string(),
        column_type,
        value: literal.to_string(),
    })
}

/// Check `spec` against `schema`.
///
/// `None` means "no filtering" and is always valid. Never fails; any problem
/// yields `false`.
pub fn validate(spec: Option<&FilterSpec>, schema: &Schema) -> bool {
    match spec {
        None => true,
        Some(spec) => CompiledFilter::compile(spec, schema).is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::parse;

    fn schema() -> Schema {
        Schema::from_pairs([
            ("Month", "STRING"),
            ("Disease", "NUMBER"),
            ("Reported", "BOOLEAN"),
            ("When", "DATETIME"),
        ])
        .expect("schema")
    }

    fn valid(text: &str) -> bool {
        let spec = parse(text).expect("test filters parse");
        validate(Some(&spec), &schema())
    }

    #[test]
    fn none_is_always_valid() {
        assert!(validate(None, &schema()));
    }

    #[test]
    fn unknown_columns_are_invalid() {
        assert!(!valid("IN_LIST('Wounds', [1])"));
        assert!(!valid("ALL([IN_LIST('Month', ['Jan']), IN_RANGE('Wounds', 1, 2)])"));
        assert!(!valid("NONE([REGEX_MATCH('month', 'J')])"));
    }

    #[test]
    fn range_needs_ordered_column() {
        assert!(valid("IN_RANGE('Disease', 1000, 5000)"));
        assert!(valid("IN_RANGE('When', '2020-01-01', '2021-01-01')"));
        assert!(!valid("IN_RANGE('Month', 'A', 'M')"));
        assert!(!valid("IN_RANGE('Reported', false, true)"));
    }

    #[test]
    fn regex_needs_string_column() {
        assert!(valid("REGEX_MATCH('Month', '^J')"));
        assert!(!valid("REGEX_MATCH('Disease', '^1')"));
        assert!(!valid("REGEX_MATCH('Month', '(unclosed')"));
    }

    #[test]
    fn list_values_must_fit_column_type() {
        assert!(valid("IN_LIST('Reported', [true])"));
        assert!(valid("IN_LIST('Disease', [800, '1200'])"));
        assert!(valid("IN_LIST('Month', [42])"));
        assert!(!valid("IN_LIST('Disease', ['Jun'])"));
        assert!(!valid("IN_LIST('When', ['not a date'])"));
    }

    #[test]
    fn empty_combinators_are_valid() {
        assert!(valid("ALL([])"));
        assert!(valid("ANY([])"));
        assert!(valid("NONE([])"));
    }
}
