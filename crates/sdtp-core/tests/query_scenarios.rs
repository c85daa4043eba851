//! End-to-end queries over the in-memory and columnar backends.
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;

use sdtp_core::{
    FilterSpec, Schema, Table, TableRegistry, Value,
    query::{QueryRequest, run_query},
    table::{FrameTable, RowTable},
};
use serde_json::json;

type TestResult = Result<(), Box<dyn std::error::Error>>;

const MONTHS: [(&str, f64); 6] = [
    ("Jan", 1200.0),
    ("Feb", 400.0),
    ("Jun", 800.0),
    ("Jul", 950.0),
    ("Aug", 5000.0),
    ("Dec", 3100.0),
];

fn schema() -> Schema {
    Schema::from_pairs([("Month", "STRING"), ("Disease", "NUMBER")]).unwrap()
}

fn backends() -> Vec<(&'static str, Arc<dyn Table>)> {
    let rows: Vec<Vec<Value>> = MONTHS
        .iter()
        .map(|(m, d)| vec![Value::String((*m).into()), Value::Number(*d)])
        .collect();
    let columns = vec![
        MONTHS.iter().map(|(m, _)| Value::String((*m).into())).collect(),
        MONTHS.iter().map(|(_, d)| Value::Number(*d)).collect(),
    ];
    let row_table: Arc<dyn Table> = Arc::new(RowTable::new(schema(), rows).unwrap());
    let frame_table: Arc<dyn Table> =
        Arc::new(FrameTable::from_columns(schema(), columns).unwrap());
    vec![("rows", row_table), ("frame", frame_table)]
}

fn months(rows: &[Vec<Value>]) -> Vec<String> {
    rows.iter().map(|r| r[0].to_string()).collect()
}

#[tokio::test]
async fn backends_agree_on_filters() -> TestResult {
    let filters = [
        (
            "ALL([IN_LIST('Month', ['Jun', 'Jul', 'Aug']), IN_RANGE('Disease', 900, 5000)])",
            vec!["Jul", "Aug"],
        ),
        ("NONE([REGEX_MATCH('Month', '^J')])", vec!["Feb", "Aug", "Dec"]),
        (
            r#"{"operator": "ANY", "arguments": [
                {"operator": "IN_RANGE", "column": "Disease", "max_val": 500},
                {"operator": "IN_LIST", "column": "Month", "values": ["Dec"]}
            ]}"#,
            vec!["Feb", "Dec"],
        ),
        ("IN_RANGE('Disease', 5000, 1000)", vec![]),
    ];

    for (name, table) in backends() {
        for (text, expected) in &filters {
            let spec = sdtp_core::filter::parse(text)?;
            let rows = table.get_filtered_rows(Some(&spec), None).await?;
            assert_eq!(months(&rows), *expected, "{name}: {text}");
        }
    }
    Ok(())
}

#[tokio::test]
async fn backends_agree_on_values_and_ranges() -> TestResult {
    for (name, table) in backends() {
        let values = table.all_values("Month").await?;
        assert_eq!(
            values.iter().map(Value::to_string).collect::<Vec<_>>(),
            vec!["Aug", "Dec", "Feb", "Jan", "Jul", "Jun"],
            "{name}"
        );
        let range = table.range_spec("Disease").await?;
        assert_eq!(range.to_json(), json!({"min_val": 400, "max_val": 5000}), "{name}");
    }
    Ok(())
}

#[tokio::test]
async fn projection_follows_requested_order() -> TestResult {
    for (name, table) in backends() {
        let spec = FilterSpec::InList {
            column: "Month".into(),
            values: vec![json!("Jan")],
        };
        let columns = vec!["Disease".to_string(), "Month".to_string()];
        let rows = table.get_filtered_rows(Some(&spec), Some(&columns)).await?;
        assert_eq!(
            rows,
            vec![vec![Value::Number(1200.0), Value::String("Jan".into())]],
            "{name}"
        );
    }
    Ok(())
}

#[tokio::test]
async fn query_through_registry_ignores_bad_filter() -> TestResult {
    let registry = TableRegistry::with_builtin_factories();
    for (name, table) in backends() {
        registry.add_table(name, table);
    }
    assert_eq!(registry.list_table_names(), vec!["frame", "rows"]);

    let request = QueryRequest {
        table: "frame".into(),
        filter: Some("REGEX_MATCH('Disease', '^1')".into()),
        columns: vec!["Month".into()],
        max_rows: None,
    };
    let result = run_query(&registry, &request).await?;
    assert_eq!(result.rows.len(), MONTHS.len());
    assert!(result.notice().is_some());
    assert_eq!(result.to_json()["columns"], json!([{"name": "Month", "type": "STRING"}]));
    Ok(())
}
