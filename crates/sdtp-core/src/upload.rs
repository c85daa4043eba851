//! Checks applied to user uploads before they reach the registry.
use snafu::prelude::*;

use crate::descriptor::{DescriptorError, TableDescriptor};

/// Errors raised while vetting an upload.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum UploadError {
    /// The uploaded document is not a valid descriptor.
    #[snafu(display("Uploaded descriptor is invalid: {source}"))]
    InvalidDescriptor {
        /// Decoding error.
        source: DescriptorError,
    },

    /// The descriptor's type has no registered factory.
    #[snafu(display("Uploaded descriptor has unknown type '{table_type}'; known types: {known}"))]
    UnknownTableType {
        /// Type tag as uploaded.
        table_type: String,
        /// Comma-separated accepted tags.
        known: String,
    },

    /// The file name has no recognized extension.
    #[snafu(display("Unsupported upload file '{filename}'"))]
    UnsupportedFile {
        /// The file name as uploaded.
        filename: String,
    },
}

/// Kind of a spreadsheet-like upload, by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    /// `.csv`
    Csv,
    /// `.xls` / `.xlsx`
    Excel,
}

impl UploadKind {
    fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "csv" => Some(UploadKind::Csv),
            "xls" | "xlsx" => Some(UploadKind::Excel),
            _ => None,
        }
    }
}

/// An uploaded file name split into base and suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    base: String,
    suffix: String,
    kind: UploadKind,
}

impl UploadedFile {
    /// Split `filename` at its last dot and classify the extension.
    pub fn parse(filename: &str) -> Result<Self, UploadError> {
        let unsupported = || UnsupportedFileSnafu { filename };
        let (base, suffix) = filename.rsplit_once('.').with_context(unsupported)?;
        let kind = UploadKind::from_extension(suffix).with_context(unsupported)?;
        ensure!(!base.is_empty(), unsupported());
        Ok(Self {
            base: base.to_string(),
            suffix: suffix.to_string(),
            kind,
        })
    }

    /// File name without the extension; also the table name.
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Extension as uploaded.
    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// Spreadsheet kind.
    pub fn kind(&self) -> UploadKind {
        self.kind
    }

    /// Sanitized name for storing the upload itself.
    pub fn safe_filename(&self) -> String {
        secure_filename(&format!("{}.{}", self.base, self.suffix))
    }

    /// Sanitized name for the descriptor file written for this upload.
    pub fn table_filename(&self) -> String {
        secure_filename(&format!("{}.json", self.base))
    }
}

/// Reduce `name` to a safe single path component.
///
/// Path separators become spaces, whitespace runs become `_`, everything but
/// ASCII letters, digits, `_`, `.` and `-` is dropped, and leading or
/// trailing dots and underscores are trimmed. The result may be empty.
pub fn secure_filename(name: &str) -> String {
    let spaced = name.replace(['/', '\\'], " ");
    let joined = spaced.split_whitespace().collect::<Vec<_>>().join("_");
    joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .collect::<String>()
        .trim_matches(|c| c == '.' || c == '_')
        .to_string()
}

/// Name under which `user`'s upload of `name` is published: `user/name`.
///
/// Without a user the name is unchanged; an already namespaced name is not
/// prefixed twice.
pub fn namespaced_name(user: Option<&str>, name: &str) -> String {
    match user.map(str::trim).filter(|u| !u.is_empty()) {
        Some(user) if !name.starts_with(&format!("{user}/")) => format!("{user}/{name}"),
        _ => name.to_string(),
    }
}

/// Vet an uploaded descriptor document.
///
/// The document must be a full `{"name", "table"}` descriptor with a valid
/// schema, a non-empty name and a type tag from `known_types`.
pub fn check_descriptor(
    bytes: &[u8],
    known_types: &[String],
) -> Result<TableDescriptor, UploadError> {
    let descriptor = TableDescriptor::from_slice(bytes).context(InvalidDescriptorSnafu)?;
    ensure!(
        known_types.contains(&descriptor.table.table_type),
        UnknownTableTypeSnafu {
            table_type: descriptor.table.table_type.clone(),
            known: known_types.join(", "),
        }
    );
    Ok(descriptor)
}
