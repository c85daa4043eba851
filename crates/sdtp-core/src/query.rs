//! Request-level query entry points shared by front ends.
use serde_json::{Value as Json, json};
use snafu::prelude::*;

use crate::{
    filter::{self, FilterResolution},
    registry::{RegistryError, TableRegistry},
    schema::{Schema, SchemaError},
    table::{RangeSpec, Row, TableError},
    value::{Value, row_to_json},
};

/// Errors that fail a query.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum QueryError {
    /// Table lookup failed.
    #[snafu(display("{source}"))]
    Registry {
        /// Registry error.
        source: RegistryError,
    },

    /// The table operation failed.
    #[snafu(display("Query on '{table}' failed: {source}"))]
    Table {
        /// Table name.
        table: String,
        /// Table error.
        source: TableError,
    },

    /// The requested columns do not form a schema.
    #[snafu(display("Invalid column selection on '{table}': {source}"))]
    Columns {
        /// Table name.
        table: String,
        /// Schema error.
        source: SchemaError,
    },
}

/// A row query against one table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryRequest {
    /// Registry name of the table.
    pub table: String,
    /// Filter text in JSON or call form; blank means no filter.
    pub filter: Option<String>,
    /// Columns to return, in order; empty means all.
    pub columns: Vec<String>,
    /// Maximum rows returned; `None` returns everything.
    pub max_rows: Option<usize>,
}

/// Rows returned by [`run_query`].
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    /// Schema of the returned rows.
    pub schema: Schema,
    /// The rows, at most `max_rows`.
    pub rows: Vec<Row>,
    /// Rows matched before truncation.
    pub total_rows: usize,
    /// How the filter input was handled.
    pub filter: FilterResolution,
}

impl QueryResult {
    /// Message for the user when their filter was ignored.
    pub fn notice(&self) -> Option<&str> {
        match &self.filter {
            FilterResolution::Rejected { reason, .. } => Some(reason),
            _ => None,
        }
    }

    /// Whether rows were dropped by `max_rows`.
    pub fn truncated(&self) -> bool {
        self.rows.len() < self.total_rows
    }

    /// `{"columns": [...], "rows": [[...]], "total_rows": n, "notice": ...}`.
    pub fn to_json(&self) -> Json {
        json!({
            "columns": self.schema,
            "rows": self.rows.iter().map(|r| row_to_json(r)).collect::<Vec<_>>(),
            "total_rows": self.total_rows,
            "notice": self.notice(),
        })
    }
}

/// Run `request` against `registry`.
///
/// An unusable filter never fails the query: rows come back unfiltered and
/// [`QueryResult::notice`] explains why.
pub async fn run_query(
    registry: &TableRegistry,
    request: &QueryRequest,
) -> Result<QueryResult, QueryError> {
    let table = registry.get_table(&request.table).context(RegistrySnafu)?;
    let schema = table.schema();
    let resolution = filter::resolve(request.filter.as_deref(), schema);

    let mut columns: Vec<String> = Vec::with_capacity(request.columns.len());
    for column in &request.columns {
        if !columns.contains(column) {
            columns.push(column.clone());
        }
    }

    let rows = table
        .get_filtered_rows(resolution.spec(), Some(columns.as_slice()))
        .await
        .context(TableSnafu {
            table: &request.table,
        })?;

    let result_schema = if columns.is_empty() {
        schema.clone()
    } else {
        Schema::new(
            columns
                .iter()
                .filter_map(|name| schema.column(name).map(|(_, c)| c.clone()))
                .collect(),
        )
        .context(ColumnsSnafu {
            table: &request.table,
        })?
    };

    let total_rows = rows.len();
    let mut rows = rows;
    if let Some(max) = request.max_rows {
        rows.truncate(max);
    }

    Ok(QueryResult {
        schema: result_schema,
        rows,
        total_rows,
        filter: resolution,
    })
}

/// Sorted distinct values of `column` in `table`.
pub async fn column_values(
    registry: &TableRegistry,
    table: &str,
    column: &str,
) -> Result<Vec<Value>, QueryError> {
    registry
        .get_table(table)
        .context(RegistrySnafu)?
        .all_values(column)
        .await
        .context(TableSnafu { table })
}

/// Range of `column` in `table`.
pub async fn column_range(
    registry: &TableRegistry,
    table: &str,
    column: &str,
) -> Result<RangeSpec, QueryError> {
    registry
        .get_table(table)
        .context(RegistrySnafu)?
        .range_spec(column)
        .await
        .context(TableSnafu { table })
}
