//! In-memory row tables.
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as Json;
use snafu::prelude::*;

use super::{DescriptorSnafu, InvalidDataSnafu, Row, Table, TableResult};
use crate::{
    descriptor::TableBody,
    schema::Schema,
    value::{Value, row_from_json, row_to_json},
};

/// A table whose rows are held in memory.
#[derive(Debug, Clone)]
pub struct RowTable {
    schema: Schema,
    rows: Arc<[Row]>,
}

impl RowTable {
    /// Descriptor type tag.
    pub const TYPE_TAG: &'static str = "RowTable";

    /// Build a table, checking every row has one cell per column.
    pub fn new(schema: Schema, rows: Vec<Row>) -> TableResult<Self> {
        check_widths(&schema, &rows)?;
        Ok(Self {
            schema,
            rows: rows.into(),
        })
    }

    /// Build from a descriptor body carrying a `rows` payload.
    pub fn from_body(body: &TableBody) -> TableResult<Self> {
        let json_rows = body.nested_array_field("rows").context(DescriptorSnafu)?;
        let types = body.schema.column_types();
        let rows = json_rows
            .into_iter()
            .enumerate()
            .map(|(i, json_row)| {
                ensure!(
                    json_row.len() == types.len(),
                    InvalidDataSnafu {
                        message: format!(
                            "row {i} has {} values, schema has {} columns",
                            json_row.len(),
                            types.len()
                        ),
                    }
                );
                row_from_json(json_row, &types).map_err(|e| super::TableError::InvalidData {
                    message: format!("row {i}: {e}"),
                })
            })
            .collect::<TableResult<Vec<Row>>>()?;
        Self::new(body.schema.clone(), rows)
    }

    /// Descriptor body reproducing this table.
    pub fn to_body(&self) -> TableBody {
        let rows: Vec<Json> = self.rows.iter().map(|r| row_to_json(r)).collect();
        TableBody::new(self.schema.clone(), Self::TYPE_TAG).with_field("rows", rows)
    }

    /// The rows, without copying.
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }
}

pub(crate) fn check_widths(schema: &Schema, rows: &[Vec<Value>]) -> TableResult<()> {
    if let Some((i, row)) = rows
        .iter()
        .enumerate()
        .find(|(_, row)| row.len() != schema.len())
    {
        return InvalidDataSnafu {
            message: format!(
                "row {i} has {} values, schema {schema} has {} columns",
                row.len(),
                schema.len()
            ),
        }
        .fail();
    }
    Ok(())
}

#[async_trait]
impl Table for RowTable {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn get_rows(&self) -> TableResult<Vec<Row>> {
        Ok(self.rows.to_vec())
    }
}
