//! Columnar tables backed by an Arrow [`RecordBatch`].
//!
//! Column types map onto Arrow as follows:
//!
//! | column type | Arrow type                        |
//! |-------------|-----------------------------------|
//! | STRING      | `Utf8`                            |
//! | NUMBER      | `Float64`                         |
//! | BOOLEAN     | `Boolean`                         |
//! | DATETIME    | `Timestamp(Microsecond, None)`, UTC |
//!
//! Rows are materialized on first use and cached; `all_values` reads the
//! column array directly.
use std::sync::{Arc, OnceLock};

use arrow::{
    array::{
        Array, ArrayRef, BooleanArray, BooleanBuilder, Float64Array, Float64Builder, StringArray,
        StringBuilder, TimestampMicrosecondArray, TimestampMicrosecondBuilder,
    },
    datatypes::{DataType, Field, Schema as ArrowSchema, TimeUnit},
    record_batch::{RecordBatch, RecordBatchOptions},
};
use async_trait::async_trait;
use chrono::DateTime;
use serde_json::Value as Json;
use snafu::prelude::*;

use super::{
    ArrowSnafu, DescriptorSnafu, InvalidDataSnafu, Row, Table, TableError, TableResult,
    column_index, distinct_sorted, row_table::check_widths,
};
use crate::{
    descriptor::TableBody,
    schema::{ColumnType, Schema},
    value::Value,
};

/// A table stored column-major in an Arrow record batch.
#[derive(Debug)]
pub struct FrameTable {
    schema: Schema,
    batch: RecordBatch,
    rows: OnceLock<Arc<[Row]>>,
}

impl FrameTable {
    /// Descriptor type tag.
    pub const TYPE_TAG: &'static str = "FrameTable";

    /// Wrap a record batch, checking its columns match `schema`.
    pub fn try_new(schema: Schema, batch: RecordBatch) -> TableResult<Self> {
        ensure!(
            batch.num_columns() == schema.len(),
            InvalidDataSnafu {
                message: format!(
                    "record batch has {} columns, schema {schema} has {}",
                    batch.num_columns(),
                    schema.len()
                ),
            }
        );
        for (column, array) in schema.columns().iter().zip(batch.columns()) {
            let expected = arrow_type(column.column_type);
            ensure!(
                array.data_type() == &expected,
                InvalidDataSnafu {
                    message: format!(
                        "column '{}' is {} in the batch, expected {expected}",
                        column.name,
                        array.data_type()
                    ),
                }
            );
        }
        Ok(Self {
            schema,
            batch,
            rows: OnceLock::new(),
        })
    }

    /// Build from typed column vectors, one per schema column.
    pub fn from_columns(schema: Schema, columns: Vec<Vec<Value>>) -> TableResult<Self> {
        let batch = columns_to_record_batch(&schema, &columns)?;
        Self::try_new(schema, batch)
    }

    /// Build from a descriptor body carrying a column-major `columns` payload.
    pub fn from_body(body: &TableBody) -> TableResult<Self> {
        let json_columns = body.nested_array_field("columns").context(DescriptorSnafu)?;
        let schema = &body.schema;
        ensure!(
            json_columns.len() == schema.len(),
            InvalidDataSnafu {
                message: format!(
                    "payload has {} columns, schema {schema} has {}",
                    json_columns.len(),
                    schema.len()
                ),
            }
        );
        let columns = schema
            .columns()
            .iter()
            .zip(json_columns)
            .map(|(column, values)| {
                values
                    .iter()
                    .map(|v| Value::from_json(v, column.column_type))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| TableError::InvalidData {
                        message: format!("column '{}': {e}", column.name),
                    })
            })
            .collect::<TableResult<Vec<_>>>()?;
        Self::from_columns(schema.clone(), columns)
    }

    /// Descriptor body reproducing this table.
    pub fn to_body(&self) -> TableResult<TableBody> {
        let columns = self
            .schema
            .columns()
            .iter()
            .zip(self.batch.columns())
            .map(|(column, array)| {
                column_values(array, column.column_type)
                    .map(|values| Json::Array(values.iter().map(Value::to_json).collect()))
            })
            .collect::<TableResult<Vec<_>>>()?;
        Ok(TableBody::new(self.schema.clone(), Self::TYPE_TAG).with_field("columns", columns))
    }

    /// The underlying batch.
    pub fn record_batch(&self) -> &RecordBatch {
        &self.batch
    }

    fn materialize(&self) -> TableResult<Arc<[Row]>> {
        if let Some(rows) = self.rows.get() {
            return Ok(Arc::clone(rows));
        }
        let columns = self
            .schema
            .columns()
            .iter()
            .zip(self.batch.columns())
            .map(|(column, array)| column_values(array, column.column_type))
            .collect::<TableResult<Vec<_>>>()?;
        let rows: Arc<[Row]> = (0..self.batch.num_rows())
            .map(|i| columns.iter().map(|col| col[i].clone()).collect())
            .collect();
        Ok(Arc::clone(self.rows.get_or_init(|| rows)))
    }
}

#[async_trait]
impl Table for FrameTable {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn get_rows(&self) -> TableResult<Vec<Row>> {
        Ok(self.materialize()?.to_vec())
    }

    async fn all_values(&self, column: &str) -> TableResult<Vec<Value>> {
        let index = column_index(&self.schema, column)?;
        let column_type = self.schema.columns()[index].column_type;
        let values = column_values(self.batch.column(index), column_type)?;
        Ok(distinct_sorted(values))
    }
}

/// Arrow data type used for a column type.
fn arrow_type(column_type: ColumnType) -> DataType {
    match column_type {
        ColumnType::String => DataType::Utf8,
        ColumnType::Number => DataType::Float64,
        ColumnType::Boolean => DataType::Boolean,
        ColumnType::DateTime => DataType::Timestamp(TimeUnit::Microsecond, None),
    }
}

/// Arrow schema for `schema`; every field is nullable.
pub fn arrow_schema(schema: &Schema) -> ArrowSchema {
    ArrowSchema::new(
        schema
            .columns()
            .iter()
            .map(|c| Field::new(c.name.as_str(), arrow_type(c.column_type), true))
            .collect::<Vec<_>>(),
    )
}

/// Build a record batch from rows aligned with `schema`.
pub fn rows_to_record_batch(schema: &Schema, rows: &[Row]) -> TableResult<RecordBatch> {
    check_widths(schema, rows)?;
    let columns: Vec<Vec<Value>> = (0..schema.len())
        .map(|i| rows.iter().map(|row| row[i].clone()).collect())
        .collect();
    columns_to_record_batch(schema, &columns)
}

fn columns_to_record_batch(schema: &Schema, columns: &[Vec<Value>]) -> TableResult<RecordBatch> {
    ensure!(
        columns.len() == schema.len(),
        InvalidDataSnafu {
            message: format!(
                "{} columns supplied for schema {schema} with {}",
                columns.len(),
                schema.len()
            ),
        }
    );
    let row_count = columns.first().map_or(0, Vec::len);
    let arrays = schema
        .columns()
        .iter()
        .zip(columns)
        .map(|(column, values)| {
            ensure!(
                values.len() == row_count,
                InvalidDataSnafu {
                    message: format!(
                        "column '{}' has {} values, expected {row_count}",
                        column.name,
                        values.len()
                    ),
                }
            );
            build_array(&column.name, column.column_type, values)
        })
        .collect::<TableResult<Vec<_>>>()?;

    let options = RecordBatchOptions::new().with_row_count(Some(row_count));
    RecordBatch::try_new_with_options(Arc::new(arrow_schema(schema)), arrays, &options)
        .context(ArrowSnafu)
}

fn mismatch(name: &str, column_type: ColumnType, value: &Value) -> TableError {
    TableError::InvalidData {
        message: format!("column '{name}' is {column_type} but holds {value:?}"),
    }
}

fn build_array(name: &str, column_type: ColumnType, values: &[Value]) -> TableResult<ArrayRef> {
    let array: ArrayRef = match column_type {
        ColumnType::String => {
            let mut builder = StringBuilder::with_capacity(values.len(), 0);
            for v in values {
                match v {
                    Value::Null => builder.append_null(),
                    Value::String(s) => builder.append_value(s),
                    other => return Err(mismatch(name, column_type, other)),
                }
            }
            Arc::new(builder.finish())
        }
        ColumnType::Number => {
            let mut builder = Float64Builder::with_capacity(values.len());
            for v in values {
                match v {
                    Value::Null => builder.append_null(),
                    Value::Number(n) => builder.append_value(*n),
                    other => return Err(mismatch(name, column_type, other)),
                }
            }
            Arc::new(builder.finish())
        }
        ColumnType::Boolean => {
            let mut builder = BooleanBuilder::with_capacity(values.len());
            for v in values {
                match v {
                    Value::Null => builder.append_null(),
                    Value::Boolean(b) => builder.append_value(*b),
                    other => return Err(mismatch(name, column_type, other)),
                }
            }
            Arc::new(builder.finish())
        }
        ColumnType::DateTime => {
            let mut builder = TimestampMicrosecondBuilder::with_capacity(values.len());
            for v in values {
                match v {
                    Value::Null => builder.append_null(),
                    Value::DateTime(dt) if dt.timestamp_subsec_nanos() % 1_000 != 0 => {
                        return InvalidDataSnafu {
                            message: format!(
                                "column '{name}' value {dt} is finer than microseconds"
                            ),
                        }
                        .fail();
                    }
                    Value::DateTime(dt) => builder.append_value(dt.timestamp_micros()),
                    other => return Err(mismatch(name, column_type, other)),
                }
            }
            Arc::new(builder.finish())
        }
    };
    Ok(array)
}

fn column_values(array: &ArrayRef, column_type: ColumnType) -> TableResult<Vec<Value>> {
    let wrong_type = || TableError::InvalidData {
        message: format!(
            "array of type {} cannot hold {column_type} values",
            array.data_type()
        ),
    };
    let len = array.len();
    let values: Vec<Value> = match column_type {
        ColumnType::String => {
            let arr = array
                .as_any()
                .downcast_ref::<StringArray>()
                .ok_or_else(wrong_type)?;
            (0..len)
                .map(|i| {
                    if arr.is_null(i) {
                        Value::Null
                    } else {
                        Value::String(arr.value(i).to_string())
                    }
                })
                .collect()
        }
        ColumnType::Number => {
            let arr = array
                .as_any()
                .downcast_ref::<Float64Array>()
                .ok_or_else(wrong_type)?;
            (0..len)
                .map(|i| {
                    if arr.is_null(i) {
                        Value::Null
                    } else {
                        Value::Number(arr.value(i))
                    }
                })
                .collect()
        }
        ColumnType::Boolean => {
            let arr = array
                .as_any()
                .downcast_ref::<BooleanArray>()
                .ok_or_else(wrong_type)?;
            (0..len)
                .map(|i| {
                    if arr.is_null(i) {
                        Value::Null
                    } else {
                        Value::Boolean(arr.value(i))
                    }
                })
                .collect()
        }
        ColumnType::DateTime => {
            let arr = array
                .as_any()
                .downcast_ref::<TimestampMicrosecondArray>()
                .ok_or_else(wrong_type)?;
            (0..len)
                .map(|i| {
                    if arr.is_null(i) {
                        return Ok(Value::Null);
                    }
                    let micros = arr.value(i);
                    DateTime::from_timestamp_micros(micros)
                        .map(Value::DateTime)
                        .ok_or_else(|| TableError::InvalidData {
                            message: format!("timestamp {micros} us is out of range"),
                        })
                })
                .collect::<TableResult<Vec<_>>>()?
        }
    };
    Ok(values)
}
