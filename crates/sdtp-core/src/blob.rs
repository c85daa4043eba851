//! Blob stores and the descriptor naming convention.
//!
//! Descriptors are persisted as blobs named `<prefix>/<table-name>.sdml`. The
//! prefix partitions blobs by role: [`ROW_TABLE_PREFIX`] holds full row-table
//! bodies, [`BLOB_TABLE_PREFIX`] holds small reference descriptors pointing
//! at them. A blob stores only the descriptor body; the table name comes from
//! the blob name.
use std::{
    collections::BTreeMap,
    fmt,
    path::Path,
    sync::{Arc, PoisonError, RwLock},
};

use async_trait::async_trait;
use log::debug;
use snafu::prelude::*;

use crate::{
    descriptor::{DescriptorError, TableDescriptor},
    retry::{BoxError, RemoteError, RemoteOptions, with_retry_if, with_timeout},
    storage::{self, StorageError, StorageLocation},
};

/// Prefix of full row-table descriptors.
pub const ROW_TABLE_PREFIX: &str = "rowtables";
/// Prefix of blob-reference descriptors loaded at startup.
pub const BLOB_TABLE_PREFIX: &str = "gcstables";
/// Extension of descriptor blobs.
pub const DESCRIPTOR_EXTENSION: &str = "sdml";

/// Errors raised by blob stores and descriptor sync.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum BlobError {
    /// No blob has the given name.
    #[snafu(display("Blob {bucket}/{name} not found"))]
    NotFound {
        /// Bucket name.
        bucket: String,
        /// Blob name.
        name: String,
    },

    /// The blob name is empty or escapes the bucket.
    #[snafu(display("Invalid blob name {name:?} in bucket {bucket}"))]
    InvalidName {
        /// Bucket name.
        bucket: String,
        /// Blob name.
        name: String,
    },

    /// The store's transport failed.
    #[snafu(display("Transport failure on {bucket}/{name}: {source}"))]
    Transport {
        /// Bucket name.
        bucket: String,
        /// Blob name, or the listing prefix.
        name: String,
        /// Underlying storage error.
        source: StorageError,
    },

    /// The store did not answer in time or kept failing.
    #[snafu(display("Blob store {bucket} unavailable: {source}"))]
    Unavailable {
        /// Bucket name.
        bucket: String,
        /// The remote failure.
        source: RemoteError,
    },

    /// A descriptor blob could not be fetched or decoded.
    #[snafu(display("Invalid descriptor data in {bucket}/{name}: {source}"))]
    InvalidData {
        /// Bucket name.
        bucket: String,
        /// Blob name.
        name: String,
        /// Decode or transport error.
        source: BoxError,
    },

    /// A descriptor could not be encoded for upload.
    #[snafu(display("Cannot encode descriptor {name}: {source}"))]
    Encode {
        /// Table name.
        name: String,
        /// Encoding error.
        source: DescriptorError,
    },
}

impl BlobError {
    /// Whether another attempt could succeed. A missing blob or a bad name
    /// fails the same way every time.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::NotFound { .. } | Self::InvalidName { .. })
    }
}

/// A flat namespace of named byte blobs.
#[async_trait]
pub trait BlobStore: Send + Sync + fmt::Debug {
    /// Name of the bucket, recorded in reference descriptors.
    fn bucket(&self) -> &str;

    /// Create or overwrite `name`.
    async fn put(&self, name: &str, bytes: Vec<u8>) -> Result<(), BlobError>;

    /// Contents of `name`.
    async fn get(&self, name: &str) -> Result<Vec<u8>, BlobError>;

    /// Names starting with `prefix` (all names for `None`), sorted.
    async fn list(&self, prefix: Option<&str>) -> Result<Vec<String>, BlobError>;
}

/// A bucket backed by a local directory.
///
/// Blob names map to relative paths, so `a/b.sdml` lives in subdirectory
/// `a`. Writes are atomic.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    bucket: String,
    location: StorageLocation,
}

impl LocalBlobStore {
    /// A store named `bucket` rooted at `root`; the directory is created on
    /// first write.
    pub fn new(bucket: impl Into<String>, root: impl Into<std::path::PathBuf>) -> Self {
        Self {
            bucket: bucket.into(),
            location: StorageLocation::local(root),
        }
    }

    fn map_storage_error(&self, name: &str, err: StorageError) -> BlobError {
        match err {
            StorageError::InvalidPath { .. } => BlobError::InvalidName {
                bucket: self.bucket.clone(),
                name: name.to_string(),
            },
            StorageError::NotFound { .. } => BlobError::NotFound {
                bucket: self.bucket.clone(),
                name: name.to_string(),
            },
            source => BlobError::Transport {
                bucket: self.bucket.clone(),
                name: name.to_string(),
                source,
            },
        }
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put(&self, name: &str, bytes: Vec<u8>) -> Result<(), BlobError> {
        storage::write_atomic(&self.location, Path::new(name), &bytes)
            .await
            .map_err(|e| self.map_storage_error(name, e))
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>, BlobError> {
        storage::read_all_bytes(&self.location, Path::new(name))
            .await
            .map_err(|e| self.map_storage_error(name, e))
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<String>, BlobError> {
        let names = storage::list_files(&self.location, true)
            .await
            .map_err(|e| self.map_storage_error(prefix.unwrap_or(""), e))?;
        Ok(names
            .into_iter()
            .filter(|n| prefix.is_none_or(|p| n.starts_with(p)))
            .collect())
    }
}

/// An in-process bucket.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    bucket: String,
    blobs: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    /// An empty store named `bucket`.
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            blobs: RwLock::default(),
        }
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put(&self, name: &str, bytes: Vec<u8>) -> Result<(), BlobError> {
        ensure!(
            !name.is_empty(),
            InvalidNameSnafu {
                bucket: self.bucket.clone(),
                name,
            }
        );
        self.blobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>, BlobError> {
        self.blobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .with_context(|| NotFoundSnafu {
                bucket: self.bucket.clone(),
                name,
            })
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<String>, BlobError> {
        let blobs = self.blobs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(blobs
            .keys()
            .filter(|n| prefix.is_none_or(|p| n.starts_with(p)))
            .cloned()
            .collect())
    }
}

/// Descriptor persistence over a [`BlobStore`].
///
/// Reads (`list`, `fetch`) are retried per [`RemoteOptions`]; uploads are
/// bounded by the timeout but never retried.
#[derive(Debug, Clone)]
pub struct DescriptorBucket {
    store: Arc<dyn BlobStore>,
    options: RemoteOptions,
}

impl DescriptorBucket {
    /// Wrap `store`.
    pub fn new(store: Arc<dyn BlobStore>, options: RemoteOptions) -> Self {
        Self { store, options }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    /// Name of the underlying bucket.
    pub fn bucket(&self) -> &str {
        self.store.bucket()
    }

    /// Blob name for `table_name` under `prefix`: `<prefix>/<table_name>.sdml`.
    pub fn blob_name(prefix: &str, table_name: &str) -> String {
        let prefix = prefix.trim_matches('/');
        if prefix.is_empty() {
            format!("{table_name}.{DESCRIPTOR_EXTENSION}")
        } else {
            format!("{prefix}/{table_name}.{DESCRIPTOR_EXTENSION}")
        }
    }

    /// Inverse of [`DescriptorBucket::blob_name`]; `None` if `blob_name` is
    /// not a descriptor blob under `prefix`.
    pub fn table_name(prefix: &str, blob_name: &str) -> Option<String> {
        let prefix = prefix.trim_matches('/');
        let rest = if prefix.is_empty() {
            blob_name
        } else {
            blob_name.strip_prefix(prefix)?.strip_prefix('/')?
        };
        let name = rest.strip_suffix(DESCRIPTOR_EXTENSION)?.strip_suffix('.')?;
        (!name.is_empty()).then(|| name.to_string())
    }

    fn default_table_name(blob_name: &str) -> String {
        let stem = blob_name
            .strip_suffix(DESCRIPTOR_EXTENSION)
            .and_then(|s| s.strip_suffix('.'))
            .unwrap_or(blob_name);
        match stem.split_once('/') {
            Some((_, rest)) if !rest.is_empty() => rest.to_string(),
            _ => stem.to_string(),
        }
    }

    /// Write the body of `descriptor` to `<prefix>/<name>.sdml`, overwriting
    /// any previous blob. Returns the blob name.
    pub async fn upload(
        &self,
        prefix: &str,
        descriptor: &TableDescriptor,
    ) -> Result<String, BlobError> {
        let blob_name = Self::blob_name(prefix, &descriptor.name);
        let bytes = descriptor.table.to_vec().context(EncodeSnafu {
            name: descriptor.name.clone(),
        })?;
        let operation = format!("upload of {}/{blob_name}", self.bucket());
        with_timeout(&self.options, &operation, self.store.put(&blob_name, bytes))
            .await
            .context(UnavailableSnafu {
                bucket: self.bucket(),
            })?;
        debug!("uploaded {} to {}/{blob_name}", descriptor.name, self.bucket());
        Ok(blob_name)
    }

    /// Descriptor blobs whose names start with `prefix`, sorted.
    pub async fn list(&self, prefix: Option<&str>) -> Result<Vec<String>, BlobError> {
        let operation = format!("listing of {}", self.bucket());
        let names = with_retry_if(
            &self.options,
            &operation,
            || self.store.list(prefix),
            BlobError::is_transient,
        )
            .await
            .context(UnavailableSnafu {
                bucket: self.bucket(),
            })?;
        let suffix = format!(".{DESCRIPTOR_EXTENSION}");
        Ok(names.into_iter().filter(|n| n.ends_with(&suffix)).collect())
    }

    /// Download and decode `blob_name`.
    ///
    /// The blob may hold a bare body or a full descriptor; a bare body is
    /// named after the blob with its role prefix and extension removed. Any
    /// transport or decode failure yields [`BlobError::InvalidData`].
    pub async fn fetch(&self, blob_name: &str) -> Result<TableDescriptor, BlobError> {
        let operation = format!("fetch of {}/{blob_name}", self.bucket());
        let bytes = with_retry_if(
            &self.options,
            &operation,
            || self.store.get(blob_name),
            BlobError::is_transient,
        )
            .await
            .map_err(|e| BlobError::InvalidData {
                bucket: self.bucket().to_string(),
                name: blob_name.to_string(),
                source: Box::new(e),
            })?;
        TableDescriptor::from_slice_or_body(&bytes, &Self::default_table_name(blob_name)).map_err(
            |e| BlobError::InvalidData {
                bucket: self.bucket().to_string(),
                name: blob_name.to_string(),
                source: Box::new(e),
            },
        )
    }
}
