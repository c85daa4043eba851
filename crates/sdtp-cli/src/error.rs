use sdtp_core::{
    RegistryError, config::ConfigError, query::QueryError, storage::StorageError,
    sync::SyncError, table::TableError, upload::UploadError,
};
use snafu::Snafu;

pub type CliResult<T> = std::result::Result<T, CliError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CliError {
    #[snafu(display("Failed to load config {path}: {source}"))]
    Config { path: String, source: ConfigError },

    #[snafu(display("{source}"))]
    Lookup { source: RegistryError },

    #[snafu(display("{source}"))]
    Query { source: QueryError },

    #[snafu(display("Failed to read descriptor file {path}: {source}"))]
    ReadDescriptor {
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("Rejected upload {path}: {source}"))]
    Upload { path: String, source: UploadError },

    #[snafu(display("Failed to publish {path}: {source}"))]
    Publish { path: String, source: SyncError },

    #[snafu(display("Uploads need a bucket; pass --bucket-root or set `blob` in the config"))]
    NoBucket,

    #[snafu(display("Output error: {source}"))]
    Storage { source: StorageError },

    #[snafu(display("Failed to encode rows: {source}"))]
    Encode { source: TableError },

    #[snafu(display("Arrow error: {source}"))]
    Arrow { source: arrow::error::ArrowError },

    #[snafu(display("Failed to encode JSON: {source}"))]
    Json { source: serde_json::Error },

    #[snafu(display("Failed to write output: {source}"))]
    Write { source: std::io::Error },
}
