//! The `Table` abstraction and its backends.
//!
//! Every table exposes the same read-only surface: its [`Schema`], all rows,
//! filtered and projected rows, the distinct values of a column and the range
//! of a column. Backends differ only in where rows come from:
//!
//! - [`RowTable`]: rows held in memory.
//! - [`FrameTable`]: an Arrow record batch.
//! - [`RemoteQueryTable`]: a SQL warehouse, with filter pushdown.
//! - [`BlobBackedTable`]: a descriptor stored in a blob store, loaded on
//!   first use.
//!
//! The provided methods on [`Table`] implement the local evaluation path on
//! top of [`Table::get_rows`]; backends override them only to push work down,
//! and must return the same rows as the local path would.
use std::fmt;

use async_trait::async_trait;
use serde_json::{Value as Json, json};
use snafu::prelude::*;

use crate::{
    descriptor::DescriptorError,
    filter::{self, FilterSpec},
    retry::RemoteError,
    schema::Schema,
    value::Value,
};

mod blob_backed;
mod frame;
mod remote;
mod row_table;

pub use blob_backed::BlobBackedTable;
pub use frame::{FrameTable, arrow_schema, rows_to_record_batch};
pub use remote::{
    RemoteQueryTable, Warehouse, WarehouseField, WarehouseTableRef, column_type_for_warehouse,
};
pub use row_table::RowTable;

/// A row of cells aligned with its table's schema.
pub type Row = Vec<Value>;

/// Result type used by table operations.
pub type TableResult<T> = Result<T, TableError>;

/// Errors raised by table operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TableError {
    /// A requested column is not in the table's schema.
    #[snafu(display("Column '{column}' not found; available columns: {available}"))]
    ColumnNotFound {
        /// The requested column.
        column: String,
        /// Comma-separated list of the schema's columns.
        available: String,
    },

    /// The backing store could not be reached or timed out.
    #[snafu(display("Backend unavailable: {source}"))]
    BackendUnavailable {
        /// The remote failure.
        source: RemoteError,
    },

    /// The backing data does not match the declared table.
    #[snafu(display("Invalid table data: {message}"))]
    InvalidData {
        /// What was wrong.
        message: String,
    },

    /// A descriptor payload could not be decoded.
    #[snafu(display("Invalid table descriptor: {source}"))]
    Descriptor {
        /// Decoding error.
        source: DescriptorError,
    },

    /// Columnar conversion failed.
    #[snafu(display("Arrow error: {source}"))]
    Arrow {
        /// Underlying Arrow error.
        source: arrow::error::ArrowError,
    },
}

/// Minimum and maximum of a column. Both are `Null` for an empty column.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeSpec {
    /// Smallest non-null value.
    pub min: Value,
    /// Largest non-null value.
    pub max: Value,
}

impl RangeSpec {
    /// Range of an already sorted list of distinct values.
    pub fn from_sorted(values: &[Value]) -> Self {
        Self {
            min: values.first().cloned().unwrap_or(Value::Null),
            max: values.last().cloned().unwrap_or(Value::Null),
        }
    }

    /// Wire form `{"min_val": v, "max_val": v}`.
    pub fn to_json(&self) -> Json {
        json!({"min_val": self.min.to_json(), "max_val": self.max.to_json()})
    }
}

/// A read-only table.
#[async_trait]
pub trait Table: Send + Sync + fmt::Debug {
    /// The table's schema. Fixed for the lifetime of the table.
    fn schema(&self) -> &Schema;

    /// Every row, in the backend's natural order.
    async fn get_rows(&self) -> TableResult<Vec<Row>>;

    /// Rows matching `filter`, projected onto `columns` in the order given.
    ///
    /// A filter that does not validate against the schema is ignored and all
    /// rows are returned. `None` or an empty column list keeps every column.
    async fn get_filtered_rows(
        &self,
        filter: Option<&FilterSpec>,
        columns: Option<&[String]>,
    ) -> TableResult<Vec<Row>> {
        let indices = resolve_columns(self.schema(), columns)?;
        let rows = self.get_rows().await?;
        let rows = match filter {
            Some(spec) => filter::apply(spec, rows, self.schema()),
            None => rows,
        };
        Ok(project(rows, indices.as_deref()))
    }

    /// Sorted distinct non-null values of `column`.
    async fn all_values(&self, column: &str) -> TableResult<Vec<Value>> {
        let index = column_index(self.schema(), column)?;
        let rows = self.get_rows().await?;
        Ok(distinct_sorted(
            rows.into_iter().filter_map(|row| row.into_iter().nth(index)),
        ))
    }

    /// Minimum and maximum of `column`.
    async fn range_spec(&self, column: &str) -> TableResult<RangeSpec> {
        let values = self.all_values(column).await?;
        Ok(RangeSpec::from_sorted(&values))
    }
}

/// Position of `column` in `schema`, or `ColumnNotFound`.
pub fn column_index(schema: &Schema, column: &str) -> TableResult<usize> {
    schema.index_of(column).with_context(|| ColumnNotFoundSnafu {
        column,
        available: schema.column_names().join(", "),
    })
}

/// Positions of the requested columns, or `None` for "all columns".
pub fn resolve_columns(
    schema: &Schema,
    columns: Option<&[String]>,
) -> TableResult<Option<Vec<usize>>> {
    match columns {
        None | Some([]) => Ok(None),
        Some(names) => names
            .iter()
            .map(|name| column_index(schema, name))
            .collect::<TableResult<Vec<_>>>()
            .map(Some),
    }
}

/// Project rows onto `indices`; `None` keeps rows unchanged.
pub fn project(rows: Vec<Row>, indices: Option<&[usize]>) -> Vec<Row> {
    let Some(indices) = indices else {
        return rows;
    };
    rows.into_iter()
        .map(|row| {
            indices
                .iter()
                .map(|&i| row.get(i).cloned().unwrap_or(Value::Null))
                .collect()
        })
        .collect()
}

/// Sort and deduplicate `values`, dropping nulls.
pub fn distinct_sorted(values: impl IntoIterator<Item = Value>) -> Vec<Value> {
    let mut out: Vec<Value> = values.into_iter().filter(|v| !v.is_null()).collect();
    out.sort_by(Value::sort_cmp);
    out.dedup();
    out
}
