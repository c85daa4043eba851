//! Tables stored in a remote SQL warehouse.
//!
//! The warehouse client sits behind the [`Warehouse`] trait so any SQL
//! engine speaking the BigQuery dialect can be plugged in. Reads are bounded
//! by the table's [`RemoteOptions`] and retried; flat filters are pushed down
//! as a `WHERE` clause, anything deeper is evaluated locally.
use std::{fmt, sync::Arc};

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use snafu::prelude::*;

use super::{
    BackendUnavailableSnafu, Row, Table, TableError, TableResult, column_index, distinct_sorted,
    project, resolve_columns,
};
use crate::{
    descriptor::TableBody,
    filter::{self, FilterSpec, to_sql_predicate},
    retry::{BoxError, RemoteOptions, with_retry},
    schema::{ColumnDescriptor, ColumnType, Schema},
    value::{Value, row_from_json},
};

/// Fully qualified warehouse table name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarehouseTableRef {
    /// Project (or catalog).
    pub project: String,
    /// Dataset (or schema).
    pub dataset: String,
    /// Table.
    pub table: String,
}

impl WarehouseTableRef {
    /// Read the `project`, `dataset` and `table` payload fields.
    pub fn from_body(body: &TableBody) -> TableResult<Self> {
        let field = |key| {
            body.str_field(key)
                .map(str::to_string)
                .context(super::DescriptorSnafu)
        };
        Ok(Self {
            project: field("project")?,
            dataset: field("dataset")?,
            table: field("table")?,
        })
    }

    /// `project.dataset.table`.
    pub fn table_id(&self) -> String {
        format!("{}.{}.{}", self.project, self.dataset, self.table)
    }
}

impl fmt::Display for WarehouseTableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.table_id())
    }
}

/// A column as reported by the warehouse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarehouseField {
    /// Column name.
    pub name: String,
    /// Warehouse type name, e.g. `INTEGER`.
    pub field_type: String,
}

/// Minimal client surface of a SQL warehouse.
#[async_trait]
pub trait Warehouse: Send + Sync + fmt::Debug {
    /// Columns of `table`, in table order.
    async fn table_schema(&self, table: &WarehouseTableRef) -> Result<Vec<WarehouseField>, BoxError>;

    /// Run `sql` and return its rows as JSON scalars, in select-list order.
    async fn query(&self, sql: &str) -> Result<Vec<Vec<Json>>, BoxError>;
}

/// Column type for a warehouse type name. Unknown types read as STRING.
pub fn column_type_for_warehouse(field_type: &str) -> ColumnType {
    match field_type.to_ascii_uppercase().as_str() {
        "INTEGER" | "INT64" | "FLOAT" | "FLOAT64" | "NUMERIC" | "BIGNUMERIC" => ColumnType::Number,
        "BOOLEAN" | "BOOL" => ColumnType::Boolean,
        "TIMESTAMP" | "DATETIME" | "DATE" => ColumnType::DateTime,
        _ => ColumnType::String,
    }
}

/// A table whose rows live in a warehouse table.
#[derive(Debug, Clone)]
pub struct RemoteQueryTable {
    schema: Schema,
    table_ref: WarehouseTableRef,
    warehouse: Arc<dyn Warehouse>,
    options: RemoteOptions,
}

impl RemoteQueryTable {
    /// Descriptor type tag.
    pub const TYPE_TAG: &'static str = "BigQueryTable";

    /// A table with a declared schema.
    pub fn new(
        schema: Schema,
        table_ref: WarehouseTableRef,
        warehouse: Arc<dyn Warehouse>,
        options: RemoteOptions,
    ) -> Self {
        Self {
            schema,
            table_ref,
            warehouse,
            options,
        }
    }

    /// Build a table from the warehouse's own schema for `table_ref`.
    pub async fn discover(
        table_ref: WarehouseTableRef,
        warehouse: Arc<dyn Warehouse>,
        options: RemoteOptions,
    ) -> TableResult<Self> {
        let operation = format!("schema lookup for {table_ref}");
        let fields = with_retry(&options, &operation, || warehouse.table_schema(&table_ref))
            .await
            .context(BackendUnavailableSnafu)?;
        let columns = fields
            .iter()
            .map(|f| ColumnDescriptor::new(f.name.clone(), column_type_for_warehouse(&f.field_type)))
            .collect();
        let schema = Schema::new(columns).map_err(|e| TableError::InvalidData {
            message: format!("warehouse schema of {table_ref}: {e}"),
        })?;
        Ok(Self::new(schema, table_ref, warehouse, options))
    }

    /// The warehouse table this reads from.
    pub fn table_ref(&self) -> &WarehouseTableRef {
        &self.table_ref
    }

    /// `SELECT` over every schema column, optionally restricted by `predicate`.
    pub fn select_sql(&self, predicate: Option<&str>) -> String {
        let columns: Vec<String> = self
            .schema
            .column_names()
            .into_iter()
            .map(filter::quote_identifier)
            .collect();
        let mut sql = format!(
            "SELECT {} FROM {}",
            columns.join(", "),
            filter::quote_identifier(&self.table_ref.table_id())
        );
        if let Some(predicate) = predicate {
            sql.push_str(" WHERE ");
            sql.push_str(predicate);
        }
        sql
    }

    async fn run(&self, sql: &str, types: &[ColumnType]) -> TableResult<Vec<Row>> {
        debug!("{}: {sql}", self.table_ref);
        let operation = format!("query on {}", self.table_ref);
        let json_rows = with_retry(&self.options, &operation, || self.warehouse.query(sql))
            .await
            .context(BackendUnavailableSnafu)?;
        json_rows
            .iter()
            .enumerate()
            .map(|(i, json_row)| {
                ensure!(
                    json_row.len() == types.len(),
                    super::InvalidDataSnafu {
                        message: format!(
                            "{} returned {} values in row {i}, expected {}",
                            self.table_ref,
                            json_row.len(),
                            types.len()
                        ),
                    }
                );
                row_from_json(json_row, types).map_err(|e| TableError::InvalidData {
                    message: format!("{} row {i}: {e}", self.table_ref),
                })
            })
            .collect()
    }
}

#[async_trait]
impl Table for RemoteQueryTable {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn get_rows(&self) -> TableResult<Vec<Row>> {
        self.run(&self.select_sql(None), &self.schema.column_types())
            .await
    }

    async fn get_filtered_rows(
        &self,
        filter: Option<&FilterSpec>,
        columns: Option<&[String]>,
    ) -> TableResult<Vec<Row>> {
        let indices = resolve_columns(&self.schema, columns)?;
        let types = self.schema.column_types();
        let rows = match filter {
            None => self.run(&self.select_sql(None), &types).await?,
            Some(spec) => match to_sql_predicate(spec, &self.schema) {
                Some(predicate) => self.run(&self.select_sql(Some(&predicate)), &types).await?,
                None => filter::apply(spec, self.get_rows().await?, &self.schema),
            },
        };
        Ok(project(rows, indices.as_deref()))
    }

    async fn all_values(&self, column: &str) -> TableResult<Vec<Value>> {
        let index = column_index(&self.schema, column)?;
        let column_type = self.schema.columns()[index].column_type;
        let quoted = filter::quote_identifier(column);
        let sql = format!(
            "SELECT DISTINCT {quoted} FROM {} WHERE {quoted} IS NOT NULL ORDER BY {quoted}",
            filter::quote_identifier(&self.table_ref.table_id())
        );
        let rows = self.run(&sql, &[column_type]).await?;
        Ok(distinct_sorted(rows.into_iter().flatten()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{filter::parse, retry::RemoteError};
    use serde_json::json;
    use std::{sync::Mutex, time::Duration};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    /// Canned warehouse: answers `WHERE` queries with `filtered`, `DISTINCT`
    /// queries with `distinct`, everything else with `rows`.
    #[derive(Debug, Default)]
    struct CannedWarehouse {
        fields: Vec<WarehouseField>,
        rows: Vec<Vec<Json>>,
        filtered: Vec<Vec<Json>>,
        distinct: Vec<Vec<Json>>,
        delay: Option<Duration>,
        seen: Mutex<Vec<String>>,
    }

    impl CannedWarehouse {
        fn seen(&self) -> Vec<String> {
            self.seen.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl Warehouse for CannedWarehouse {
        async fn table_schema(&self, _: &WarehouseTableRef) -> Result<Vec<WarehouseField>, BoxError> {
            Ok(self.fields.clone())
        }

        async fn query(&self, sql: &str) -> Result<Vec<Vec<Json>>, BoxError> {
            self.seen.lock().expect("lock").push(sql.to_string());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(if sql.starts_with("SELECT DISTINCT") {
                self.distinct.clone()
            } else if sql.contains(" WHERE ") {
                self.filtered.clone()
            } else {
                self.rows.clone()
            })
        }
    }

    fn table_ref() -> WarehouseTableRef {
        WarehouseTableRef {
            project: "proj".into(),
            dataset: "health".into(),
            table: "cases".into(),
        }
    }

    fn warehouse() -> CannedWarehouse {
        CannedWarehouse {
            fields: vec![
                WarehouseField { name: "Month".into(), field_type: "STRING".into() },
                WarehouseField { name: "Disease".into(), field_type: "INTEGER".into() },
                WarehouseField { name: "Geo".into(), field_type: "GEOGRAPHY".into() },
            ],
            rows: vec![
                vec![json!("Jan"), json!(1200), json!("POINT(0 0)")],
                vec![json!("Jun"), json!(800), json!(null)],
            ],
            filtered: vec![vec![json!("Jan"), json!(1200), json!("POINT(0 0)")]],
            distinct: vec![vec![json!(800)], vec![json!(1200)]],
            ..Default::default()
        }
    }

    #[test]
    fn maps_warehouse_types() {
        assert_eq!(column_type_for_warehouse("INTEGER"), ColumnType::Number);
        assert_eq!(column_type_for_warehouse("float"), ColumnType::Number);
        assert_eq!(column_type_for_warehouse("NUMERIC"), ColumnType::Number);
        assert_eq!(column_type_for_warehouse("BOOLEAN"), ColumnType::Boolean);
        assert_eq!(column_type_for_warehouse("DATE"), ColumnType::DateTime);
        assert_eq!(column_type_for_warehouse("TIMESTAMP"), ColumnType::DateTime);
        assert_eq!(column_type_for_warehouse("GEOGRAPHY"), ColumnType::String);
    }

    #[tokio::test]
    async fn discover_builds_schema_from_warehouse() -> TestResult {
        let wh = Arc::new(warehouse());
        let table = RemoteQueryTable::discover(table_ref(), wh, RemoteOptions::default()).await?;
        assert_eq!(
            table.schema().column_types(),
            vec![ColumnType::String, ColumnType::Number, ColumnType::String]
        );
        Ok(())
    }

    #[tokio::test]
    async fn flat_filters_are_pushed_down() -> TestResult {
        let wh = Arc::new(warehouse());
        let table = RemoteQueryTable::discover(table_ref(), wh.clone(), RemoteOptions::default()).await?;
        let filter = parse("IN_RANGE('Disease', 1000, 5000)")?;
        let month = vec!["Month".to_string()];
        let rows = table.get_filtered_rows(Some(&filter), Some(&month)).await?;
        assert_eq!(rows, vec![vec![Value::String("Jan".into())]]);
        assert_eq!(
            wh.seen(),
            vec![
                "SELECT `Month`, `Disease`, `Geo` FROM `proj.health.cases` \
                 WHERE (`Disease` >= 1000 AND `Disease` <= 5000)"
                    .to_string()
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn date_columns_are_compared_as_timestamps() -> TestResult {
        let wh = Arc::new(CannedWarehouse {
            fields: vec![
                WarehouseField { name: "Day".into(), field_type: "DATE".into() },
                WarehouseField { name: "Disease".into(), field_type: "INTEGER".into() },
            ],
            filtered: vec![vec![json!("2024-06-15"), json!(800)]],
            ..Default::default()
        });
        let table = RemoteQueryTable::discover(table_ref(), wh.clone(), RemoteOptions::default()).await?;
        let filter = parse("IN_RANGE('Day', '2024-06-01', '2024-06-30')")?;
        let rows = table.get_filtered_rows(Some(&filter), None).await?;
        assert_eq!(rows.len(), 1);
        assert_eq!(
            wh.seen(),
            vec![
                "SELECT `Day`, `Disease` FROM `proj.health.cases` \
                 WHERE (CAST(`Day` AS TIMESTAMP) >= TIMESTAMP '2024-06-01T00:00:00Z' \
                 AND CAST(`Day` AS TIMESTAMP) <= TIMESTAMP '2024-06-30T00:00:00Z')"
                    .to_string()
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn nested_filters_fall_back_to_local_evaluation() -> TestResult {
        let wh = Arc::new(warehouse());
        let table = RemoteQueryTable::discover(table_ref(), wh.clone(), RemoteOptions::default()).await?;
        let filter = parse("ALL([ANY([IN_LIST('Month', ['Jun'])])])")?;
        let rows = table.get_filtered_rows(Some(&filter), None).await?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0], Value::String("Jun".into()));
        assert!(wh.seen().iter().all(|sql| !sql.contains("WHERE")));
        Ok(())
    }

    #[tokio::test]
    async fn values_and_range_use_one_distinct_query() -> TestResult {
        let wh = Arc::new(warehouse());
        let table = RemoteQueryTable::discover(table_ref(), wh.clone(), RemoteOptions::default()).await?;
        let range = table.range_spec("Disease").await?;
        assert_eq!((range.min, range.max), (Value::Number(800.0), Value::Number(1200.0)));
        assert_eq!(
            wh.seen(),
            vec![
                "SELECT DISTINCT `Disease` FROM `proj.health.cases` \
                 WHERE `Disease` IS NOT NULL ORDER BY `Disease`"
                    .to_string()
            ]
        );
        assert!(matches!(
            table.all_values("Wounds").await,
            Err(TableError::ColumnNotFound { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn slow_warehouse_is_unavailable() -> TestResult {
        let wh = Arc::new(CannedWarehouse {
            delay: Some(Duration::from_secs(5)),
            ..warehouse()
        });
        let options = RemoteOptions {
            timeout_ms: 20,
            max_attempts: 2,
            initial_backoff_ms: 1,
        };
        let schema = Schema::from_pairs([("Month", "STRING"), ("Disease", "NUMBER"), ("Geo", "STRING")])?;
        let table = RemoteQueryTable::new(schema, table_ref(), wh.clone(), options);
        let err = table.get_rows().await.expect_err("timeout");
        assert!(matches!(
            err,
            TableError::BackendUnavailable {
                source: RemoteError::Timeout { attempts: 2, .. }
            }
        ));
        assert_eq!(wh.seen().len(), 2);
        Ok(())
    }
}
