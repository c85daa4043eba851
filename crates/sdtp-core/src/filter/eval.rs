//! Filter evaluation over rows.
use std::cmp::Ordering;

use log::warn;

use super::{CompiledFilter, FilterSpec};
use crate::{schema::Schema, table::Row, value::Value};

impl CompiledFilter {
    /// Whether `row` satisfies this filter. Null or missing cells never match
    /// a leaf.
    pub fn matches(&self, row: &[Value]) -> bool {
        match self {
            CompiledFilter::InList { index, values } => match row.get(*index) {
                Some(cell) if !cell.is_null() => values.iter().any(|v| v == cell),
                _ => false,
            },
            CompiledFilter::InRange { index, min, max } => match row.get(*index) {
                Some(cell) if !cell.is_null() => {
                    let above_min = min.as_ref().is_none_or(|m| {
                        matches!(
                            cell.partial_cmp_same_type(m),
                            Some(Ordering::Greater | Ordering::Equal)
                        )
                    });
                    let below_max = max.as_ref().is_none_or(|m| {
                        matches!(
                            cell.partial_cmp_same_type(m),
                            Some(Ordering::Less | Ordering::Equal)
                        )
                    });
                    above_min && below_max
                }
                _ => false,
            },
            CompiledFilter::RegexMatch { index, regex } => match row.get(*index) {
                Some(Value::String(s)) => regex.is_match(s),
                _ => false,
            },
            CompiledFilter::All(children) => children.iter().all(|c| c.matches(row)),
            CompiledFilter::Any(children) => children.iter().any(|c| c.matches(row)),
            CompiledFilter::NoneOf(children) => !children.iter().any(|c| c.matches(row)),
        }
    }
}

/// Keep the rows matching `filter`, in their original order.
pub fn apply_compiled(filter: &CompiledFilter, rows: Vec<Row>) -> Vec<Row> {
    rows.into_iter().filter(|row| filter.matches(row)).collect()
}

/// Keep the rows of `rows` matching `spec` under `schema`, in their original
/// order.
///
/// A spec that does not validate against `schema` filters nothing: the rows
/// are returned unchanged and the problem is logged.
pub fn apply(spec: &FilterSpec, rows: Vec<Row>, schema: &Schema) -> Vec<Row> {
    match CompiledFilter::compile(spec, schema) {
        Ok(filter) => apply_compiled(&filter, rows),
        Err(e) => {
            warn!("filter {spec} does not fit schema {schema}, returning rows unfiltered: {e}");
            rows
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::parse;

    fn schema() -> Schema {
        Schema::from_pairs([("Month", "STRING"), ("Disease", "NUMBER"), ("When", "DATETIME")])
            .expect("schema")
    }

    fn rows() -> Vec<Row> {
        let dt = |s: &str| Value::DateTime(crate::value::parse_datetime(s).expect("datetime"));
        vec![
            vec![Value::String("Jan".into()), Value::Number(1200.0), dt("2024-01-15")],
            vec![Value::String("Jun".into()), Value::Number(800.0), dt("2024-06-15")],
            vec![Value::String("Jul".into()), Value::Null, dt("2024-07-15")],
            vec![Value::Null, Value::Number(5000.0), Value::Null],
        ]
    }

    fn run(text: &str) -> Vec<Row> {
        let spec = parse(text).expect("test filters parse");
        apply(&spec, rows(), &schema())
    }

    fn months(rows: &[Row]) -> Vec<String> {
        rows.iter().map(|r| r[0].to_string()).collect()
    }

    #[test]
    fn empty_combinators() {
        assert_eq!(run("ALL([])"), rows());
        assert_eq!(run("ANY([])"), Vec::<Row>::new());
        assert_eq!(run("NONE([])"), rows());
    }

    #[test]
    fn range_is_inclusive_and_skips_nulls() {
        assert_eq!(months(&run("IN_RANGE('Disease', 1000, 5000)")), vec!["Jan", ""]);
        assert_eq!(months(&run("IN_RANGE('Disease', 800, 800)")), vec!["Jun"]);
        assert_eq!(months(&run("IN_RANGE('Disease', None, 1000)")), vec!["Jun"]);
    }

    #[test]
    fn inverted_range_matches_nothing() {
        assert!(run("IN_RANGE('Disease', 5000, 1000)").is_empty());
    }

    #[test]
    fn datetime_range() {
        assert_eq!(
            months(&run("IN_RANGE('When', '2024-06-01', '2024-12-31T00:00:00Z')")),
            vec!["Jun", "Jul"]
        );
    }

    #[test]
    fn regex_uses_search_semantics() {
        assert_eq!(months(&run("REGEX_MATCH('Month', 'u')")), vec!["Jun", "Jul"]);
        assert_eq!(months(&run("REGEX_MATCH('Month', '^J.n$')")), vec!["Jan", "Jun"]);
    }

    #[test]
    fn none_keeps_rows_with_null_cells() {
        assert_eq!(
            months(&run("NONE([IN_LIST('Month', ['Jun', 'Jul', 'Aug'])])")),
            vec!["Jan", ""]
        );
    }

    #[test]
    fn in_list_compares_numbers_by_value() {
        assert_eq!(months(&run("IN_LIST('Disease', [800.0, '1200'])")), vec!["Jan", "Jun"]);
    }

    #[test]
    fn nested_combinators() {
        let out = run(
            "ANY([ALL([REGEX_MATCH('Month', '^J'), IN_RANGE('Disease', 1000, None)]), \
             IN_LIST('Month', ['Jul'])])",
        );
        assert_eq!(months(&out), vec!["Jan", "Jul"]);
    }

    #[test]
    fn applying_twice_is_idempotent() {
        for text in [
            "IN_RANGE('Disease', 1000, 5000)",
            "NONE([IN_LIST('Month', ['Jun'])])",
            "ANY([REGEX_MATCH('Month', 'a'), IN_RANGE('Disease', 0, 900)])",
        ] {
            let spec = parse(text).expect("parse");
            let once = apply(&spec, rows(), &schema());
            let twice = apply(&spec, once.clone(), &schema());
            assert_eq!(once, twice, "{text}");
        }
    }

    #[test]
    fn invalid_spec_returns_rows_unchanged() {
        assert_eq!(run("IN_LIST('Wounds', [1])"), rows());
    }
}
