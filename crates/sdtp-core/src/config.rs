//! Engine configuration.
//!
//! ```json
//! {"sdtp_path": ["./tables"],
//!  "blob": {"root": "./bucket", "bucket": "wiki", "prefix": "gcstables"},
//!  "remote": {"timeout_ms": 30000, "max_attempts": 3, "initial_backoff_ms": 100}}
//! ```
//!
//! Every field is optional. Relative paths are used as given, i.e. relative
//! to the process working directory.
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::{
    blob::{BLOB_TABLE_PREFIX, DescriptorBucket, LocalBlobStore},
    loader::DescriptorSource,
    registry::{BlobTableFactory, TableRegistry},
    retry::RemoteOptions,
    storage::{self, StorageError, StorageLocation},
};

/// Errors raised while loading configuration.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    /// The file could not be read.
    #[snafu(display("Cannot read config {path}: {source}"))]
    Read {
        /// Config file path.
        path: String,
        /// Storage error.
        source: StorageError,
    },

    /// The file is not a valid configuration document.
    #[snafu(display("Invalid config {path}: {source}"))]
    Parse {
        /// Config file path.
        path: String,
        /// JSON error.
        source: serde_json::Error,
    },

    /// The `blob` section is incomplete.
    #[snafu(display("Config blob section needs a non-empty bucket name"))]
    BlobBucket,
}

fn default_prefix() -> String {
    BLOB_TABLE_PREFIX.to_string()
}

/// A local directory acting as a blob bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlobConfig {
    /// Directory holding the bucket's blobs.
    pub root: PathBuf,
    /// Bucket name recorded in reference descriptors.
    pub bucket: String,
    /// Prefix scanned at startup.
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Directories of JSON descriptor files loaded at startup.
    pub sdtp_path: Vec<PathBuf>,
    /// Optional descriptor bucket.
    pub blob: Option<BlobConfig>,
    /// Timeouts and retries for remote calls.
    pub remote: RemoteOptions,
}

impl EngineConfig {
    /// Read and parse the JSON config file at `path`.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let (dir, file) = match (path.parent(), path.file_name()) {
            (Some(parent), Some(file)) if !parent.as_os_str().is_empty() => {
                (parent.to_path_buf(), PathBuf::from(file))
            }
            _ => (PathBuf::from("."), path.to_path_buf()),
        };
        let text = storage::read_to_string(&StorageLocation::local(dir), &file)
            .await
            .context(ReadSnafu { path: &display })?;
        let config = Self::from_json_str(&text).context(ParseSnafu { path: &display })?;
        config.validate()
    }

    /// Parse a JSON config document.
    pub fn from_json_str(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    fn validate(self) -> Result<Self, ConfigError> {
        if let Some(blob) = &self.blob {
            ensure!(!blob.bucket.trim().is_empty(), BlobBucketSnafu);
        }
        Ok(self)
    }

    /// The configured bucket, if any.
    pub fn descriptor_bucket(&self) -> Option<DescriptorBucket> {
        self.blob.as_ref().map(|blob| {
            DescriptorBucket::new(
                Arc::new(LocalBlobStore::new(blob.bucket.clone(), blob.root.clone())),
                self.remote,
            )
        })
    }

    /// Startup sources: every `sdtp_path` directory, then the bucket prefix.
    pub fn sources(&self) -> Vec<DescriptorSource> {
        let mut sources: Vec<DescriptorSource> = self
            .sdtp_path
            .iter()
            .cloned()
            .map(DescriptorSource::Directory)
            .collect();
        if let (Some(blob), Some(bucket)) = (&self.blob, self.descriptor_bucket()) {
            sources.push(DescriptorSource::Bucket {
                bucket,
                prefix: blob.prefix.clone(),
            });
        }
        sources
    }

    /// A registry with the built-in factories plus a `GCSTable` factory for
    /// the configured bucket.
    pub fn build_registry(&self) -> TableRegistry {
        let registry = TableRegistry::with_builtin_factories();
        if let Some(bucket) = self.descriptor_bucket() {
            let factory = Arc::new(BlobTableFactory::new().with_bucket(bucket));
            let tag = crate::table::BlobBackedTable::TYPE_TAG;
            if let Err(e) = registry.add_table_factory(tag, factory) {
                log::error!("cannot register {tag} factory: {e}");
            }
        }
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn empty_document_uses_defaults() -> TestResult {
        let config = EngineConfig::from_json_str("{}")?;
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.remote.max_attempts, 3);
        assert!(config.sources().is_empty());
        Ok(())
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(EngineConfig::from_json_str(r#"{"sdtp_paths": []}"#).is_err());
    }

    #[tokio::test]
    async fn load_builds_sources_and_registry() -> TestResult {
        let tmp = TempDir::new()?;
        let path = tmp.path().join("sdtp.json");
        std::fs::write(
            &path,
            r#"{"sdtp_path": ["tables"], "blob": {"root": "bucket", "bucket": "wiki"},
                "remote": {"timeout_ms": 500}}"#,
        )?;

        let config = EngineConfig::load(&path).await?;
        assert_eq!(config.remote.timeout_ms, 500);
        let blob = config.blob.as_ref().ok_or("blob section")?;
        assert_eq!(blob.prefix, "gcstables");

        let sources = config.sources();
        assert_eq!(sources.len(), 2);
        assert!(matches!(&sources[1], DescriptorSource::Bucket { prefix, .. } if prefix == "gcstables"));

        let registry = config.build_registry();
        assert_eq!(registry.factory_types(), vec!["FrameTable", "GCSTable", "RowTable"]);
        Ok(())
    }

    #[tokio::test]
    async fn load_reports_missing_file_and_bad_bucket() -> TestResult {
        let tmp = TempDir::new()?;
        let missing = EngineConfig::load(&tmp.path().join("nope.json")).await;
        assert!(matches!(missing, Err(ConfigError::Read { .. })));

        let path = tmp.path().join("bad.json");
        std::fs::write(&path, r#"{"blob": {"root": "b", "bucket": ""}}"#)?;
        assert!(matches!(
            EngineConfig::load(&path).await,
            Err(ConfigError::BlobBucket)
        ));
        Ok(())
    }
}
