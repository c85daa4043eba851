//! Table descriptors: the JSON documents that define tables.
//!
//! ```json
//! {"name": "cases",
//!  "table": {"schema": [{"name": "Month", "type": "STRING"}],
//!            "type": "RowTable",
//!            "rows": [["Jan"], ["Jun"]]}}
//! ```
//!
//! The `table` object is a [`TableBody`]: the schema, the factory type tag and
//! whatever extra fields that factory needs, kept verbatim in
//! [`TableBody::payload`] until a factory decodes them.
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use snafu::prelude::*;

use crate::schema::Schema;

/// Errors raised while decoding descriptor documents.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum DescriptorError {
    /// The document is not valid JSON or does not have the descriptor shape.
    #[snafu(display("Malformed table descriptor: {source}"))]
    Json {
        /// Underlying JSON error; schema errors surface here too.
        source: serde_json::Error,
    },

    /// The descriptor has an empty `name`.
    #[snafu(display("Table descriptor has an empty name"))]
    EmptyName,

    /// The descriptor has an empty `type` tag.
    #[snafu(display("Table descriptor for '{name}' has an empty type"))]
    EmptyType {
        /// Table name, or the blob it came from.
        name: String,
    },

    /// A field required by the table type is absent.
    #[snafu(display("{table_type} descriptor is missing field '{field}'"))]
    MissingField {
        /// Type tag of the descriptor.
        table_type: String,
        /// Missing field name.
        field: String,
    },

    /// A payload field has the wrong JSON shape.
    #[snafu(display("{table_type} descriptor field '{field}' must be {expected}"))]
    WrongShape {
        /// Type tag of the descriptor.
        table_type: String,
        /// Offending field name.
        field: String,
        /// Description of the expected shape.
        expected: String,
    },
}

/// The `table` part of a descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableBody {
    /// Column schema of the table.
    pub schema: Schema,
    /// Factory type tag, e.g. `RowTable`.
    #[serde(rename = "type")]
    pub table_type: String,
    /// Factory-specific fields.
    #[serde(flatten)]
    pub payload: Map<String, Json>,
}

impl TableBody {
    /// A body with no payload fields.
    pub fn new(schema: Schema, table_type: impl Into<String>) -> Self {
        Self {
            schema,
            table_type: table_type.into(),
            payload: Map::new(),
        }
    }

    /// Builder-style payload insertion.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Json>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Raw payload field.
    pub fn field(&self, key: &str) -> Option<&Json> {
        self.payload.get(key)
    }

    /// Required string payload field.
    pub fn str_field(&self, key: &str) -> Result<&str, DescriptorError> {
        self.required(key)?
            .as_str()
            .with_context(|| WrongShapeSnafu {
                table_type: self.table_type.clone(),
                field: key,
                expected: "a string",
            })
    }

    /// Required array-of-arrays payload field, e.g. `rows` or `columns`.
    pub fn nested_array_field(&self, key: &str) -> Result<Vec<&[Json]>, DescriptorError> {
        let shape_err = || WrongShapeSnafu {
            table_type: self.table_type.clone(),
            field: key,
            expected: "an array of arrays",
        };
        self.required(key)?
            .as_array()
            .with_context(shape_err)?
            .iter()
            .map(|inner| inner.as_array().map(Vec::as_slice).with_context(shape_err))
            .collect()
    }

    fn required(&self, key: &str) -> Result<&Json, DescriptorError> {
        self.payload.get(key).with_context(|| MissingFieldSnafu {
            table_type: self.table_type.clone(),
            field: key,
        })
    }

    /// Decode a bare body.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, DescriptorError> {
        serde_json::from_slice(bytes).context(JsonSnafu)
    }

    /// Encode as pretty-printed JSON.
    pub fn to_vec(&self) -> Result<Vec<u8>, DescriptorError> {
        serde_json::to_vec_pretty(self).context(JsonSnafu)
    }
}

/// A named table definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDescriptor {
    /// Registry name of the table.
    pub name: String,
    /// Schema, type tag and payload.
    pub table: TableBody,
}

impl TableDescriptor {
    /// Pair a name with a body.
    pub fn new(name: impl Into<String>, table: TableBody) -> Self {
        Self {
            name: name.into(),
            table,
        }
    }

    /// Decode a full `{"name", "table"}` document.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, DescriptorError> {
        let descriptor: TableDescriptor = serde_json::from_slice(bytes).context(JsonSnafu)?;
        descriptor.checked()
    }

    /// Decode either a full descriptor or a bare body.
    ///
    /// A bare body takes `fallback_name`; blobs store bodies and are named
    /// after their table.
    pub fn from_slice_or_body(bytes: &[u8], fallback_name: &str) -> Result<Self, DescriptorError> {
        let json: Json = serde_json::from_slice(bytes).context(JsonSnafu)?;
        let is_full = json
            .as_object()
            .is_some_and(|obj| obj.get("table").is_some_and(Json::is_object));
        let descriptor = if is_full {
            serde_json::from_value(json).context(JsonSnafu)?
        } else {
            TableDescriptor::new(
                fallback_name,
                serde_json::from_value(json).context(JsonSnafu)?,
            )
        };
        descriptor.checked()
    }

    /// Encode as pretty-printed JSON.
    pub fn to_vec(&self) -> Result<Vec<u8>, DescriptorError> {
        serde_json::to_vec_pretty(self).context(JsonSnafu)
    }

    fn checked(self) -> Result<Self, DescriptorError> {
        ensure!(!self.name.trim().is_empty(), EmptyNameSnafu);
        ensure!(
            !self.table.table_type.trim().is_empty(),
            EmptyTypeSnafu {
                name: self.name.clone(),
            }
        );
        Ok(self)
    }
}
