//! Column schema shared by every table.
//!
//! A [`Schema`] is an ordered list of [`ColumnDescriptor`]s. The order defines
//! the positional mapping of row values, so it is fixed once the schema is
//! built; changing a table's columns means building a new table.
//!
//! On the wire a schema is a JSON array:
//!
//! ```json
//! [{"name": "Month", "type": "STRING"}, {"name": "Disease", "type": "NUMBER"}]
//! ```
//!
//! Type tags are matched case-insensitively and always written upper-case.
use std::{collections::HashSet, fmt, str::FromStr, sync::Arc};

use serde::{Deserialize, Serialize};
use snafu::prelude::*;

/// Errors raised while constructing a schema.
#[derive(Debug, Clone, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum SchemaError {
    /// Two columns share a name.
    #[snafu(display("Duplicate column name: {column}"))]
    DuplicateColumn {
        /// The repeated column name.
        column: String,
    },

    /// A column type tag is not one of the supported types.
    #[snafu(display(
        "Unknown column type '{type_tag}' (expected STRING, NUMBER, BOOLEAN or DATETIME)"
    ))]
    UnknownColumnType {
        /// The tag as supplied.
        type_tag: String,
    },

    /// A column was declared without a name.
    #[snafu(display("Column at position {position} has an empty name"))]
    EmptyColumnName {
        /// Zero-based position of the column in the schema.
        position: usize,
    },
}

/// The closed set of column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ColumnType {
    /// UTF-8 text.
    String,
    /// Numeric value, stored as `f64`.
    Number,
    /// `true` / `false`.
    Boolean,
    /// Instant in time, normalized to UTC.
    DateTime,
}

impl ColumnType {
    /// The canonical wire tag for this type.
    pub fn as_str(self) -> &'static str {
        match self {
            ColumnType::String => "STRING",
            ColumnType::Number => "NUMBER",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::DateTime => "DATETIME",
        }
    }

    /// Whether values of this type have a meaningful ordering for range filters.
    pub fn is_ordered(self) -> bool {
        matches!(self, ColumnType::Number | ColumnType::DateTime)
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ColumnType {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "STRING" => Ok(ColumnType::String),
            "NUMBER" => Ok(ColumnType::Number),
            "BOOLEAN" => Ok(ColumnType::Boolean),
            "DATETIME" => Ok(ColumnType::DateTime),
            _ => UnknownColumnTypeSnafu { type_tag: s }.fail(),
        }
    }
}

impl TryFrom<String> for ColumnType {
    type Error = SchemaError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ColumnType> for String {
    fn from(value: ColumnType) -> Self {
        value.as_str().to_string()
    }
}

/// A single named, typed column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    /// Column name, unique within its schema.
    pub name: String,
    /// Column type.
    #[serde(rename = "type")]
    pub column_type: ColumnType,
}

impl ColumnDescriptor {
    /// Convenience constructor.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

impl fmt::Display for ColumnDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.column_type)
    }
}

/// Ordered, validated, immutable list of columns.
///
/// Cloning is cheap; clones share the same column list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<ColumnDescriptor>", into = "Vec<ColumnDescriptor>")]
pub struct Schema {
    columns: Arc<[ColumnDescriptor]>,
}

impl Schema {
    /// Build a schema, rejecting empty or duplicate column names.
    pub fn new(columns: Vec<ColumnDescriptor>) -> Result<Self, SchemaError> {
        let mut seen = HashSet::with_capacity(columns.len());
        for (position, column) in columns.iter().enumerate() {
            ensure!(!column.name.is_empty(), EmptyColumnNameSnafu { position });
            ensure!(
                seen.insert(column.name.as_str()),
                DuplicateColumnSnafu {
                    column: column.name.clone(),
                }
            );
        }

        Ok(Self {
            columns: columns.into(),
        })
    }

    /// Build a schema from `(name, type tag)` pairs, e.g. as read from a
    /// header row and a type row.
    pub fn from_pairs<N, T>(pairs: impl IntoIterator<Item = (N, T)>) -> Result<Self, SchemaError>
    where
        N: Into<String>,
        T: AsRef<str>,
    {
        let columns = pairs
            .into_iter()
            .map(|(name, tag)| Ok(ColumnDescriptor::new(name, tag.as_ref().parse()?)))
            .collect::<Result<Vec<_>, SchemaError>>()?;
        Self::new(columns)
    }

    /// All columns in positional order.
    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// True when the schema has no columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Column names in positional order.
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Column types in positional order.
    pub fn column_types(&self) -> Vec<ColumnType> {
        self.columns.iter().map(|c| c.column_type).collect()
    }

    /// Position of `name`, if present.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Position and descriptor of `name`, if present.
    pub fn column(&self, name: &str) -> Option<(usize, &ColumnDescriptor)> {
        self.columns
            .iter()
            .enumerate()
            .find(|(_, c)| c.name == name)
    }
}

impl TryFrom<Vec<ColumnDescriptor>> for Schema {
    type Error = SchemaError;

    fn try_from(value: Vec<ColumnDescriptor>) -> Result<Self, Self::Error> {
        Schema::new(value)
    }
}

impl From<Schema> for Vec<ColumnDescriptor> {
    fn from(value: Schema) -> Self {
        value.columns.to_vec()
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, column) in self.columns.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{column}")?;
        }
        write!(f, "]")
    }
}
