//! Startup loading of descriptors into a registry.
//!
//! Each configured source is scanned once. Every entry is decoded and
//! registered on its own: a corrupt file, an unreachable blob or an unknown
//! table type is logged and recorded in the [`LoadReport`], and loading moves
//! on to the next entry.
use std::{
    fmt,
    path::{Path, PathBuf},
};

use futures::{StreamExt, stream};
use log::{info, warn};

use crate::{
    blob::DescriptorBucket,
    descriptor::TableDescriptor,
    registry::TableRegistry,
    storage::{self, StorageLocation},
};

/// Blob fetches in flight at once while loading a bucket.
const FETCH_CONCURRENCY: usize = 8;

/// File extensions picked up from descriptor directories.
const DESCRIPTOR_FILE_EXTENSIONS: [&str; 2] = [".json", ".sdml"];

/// Where descriptors are loaded from.
#[derive(Debug, Clone)]
pub enum DescriptorSource {
    /// JSON descriptor files directly inside a directory.
    Directory(PathBuf),
    /// Descriptor blobs under `prefix` in a bucket.
    Bucket {
        /// The bucket.
        bucket: DescriptorBucket,
        /// Role prefix, e.g. `gcstables`.
        prefix: String,
    },
}

impl fmt::Display for DescriptorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DescriptorSource::Directory(dir) => write!(f, "directory {}", dir.display()),
            DescriptorSource::Bucket { bucket, prefix } => {
                write!(f, "bucket {}/{}", bucket.bucket(), prefix)
            }
        }
    }
}

/// An entry that could not be loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadFailure {
    /// The source being scanned.
    pub source: String,
    /// File or blob name; empty when the source itself failed.
    pub entry: String,
    /// Error message.
    pub reason: String,
}

/// Result of a startup scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Names of registered tables, in load order.
    pub loaded: Vec<String>,
    /// Entries that were skipped.
    pub failures: Vec<LoadFailure>,
}

impl LoadReport {
    fn fail(&mut self, source: &DescriptorSource, entry: &str, reason: impl fmt::Display) {
        warn!("skipping {entry:?} from {source}: {reason}");
        self.failures.push(LoadFailure {
            source: source.to_string(),
            entry: entry.to_string(),
            reason: reason.to_string(),
        });
    }
}

/// Scan `sources` in order and register every valid descriptor.
///
/// Later sources overwrite tables of the same name from earlier ones.
pub async fn load_sources(registry: &TableRegistry, sources: &[DescriptorSource]) -> LoadReport {
    let mut report = LoadReport::default();
    for source in sources {
        match source {
            DescriptorSource::Directory(dir) => {
                load_directory(registry, source, dir, &mut report).await;
            }
            DescriptorSource::Bucket { bucket, prefix } => {
                load_bucket(registry, source, bucket, prefix, &mut report).await;
            }
        }
    }
    info!(
        "loaded {} table(s), skipped {} entr(ies)",
        report.loaded.len(),
        report.failures.len()
    );
    report
}

async fn register(
    registry: &TableRegistry,
    source: &DescriptorSource,
    entry: &str,
    descriptor: TableDescriptor,
    report: &mut LoadReport,
) {
    match registry.add_descriptor(&descriptor).await {
        Ok(_) => report.loaded.push(descriptor.name),
        Err(e) => report.fail(source, entry, e),
    }
}

async fn load_directory(
    registry: &TableRegistry,
    source: &DescriptorSource,
    dir: &Path,
    report: &mut LoadReport,
) {
    let location = StorageLocation::local(dir);
    let files = match storage::list_files(&location, false).await {
        Ok(files) => files,
        Err(e) => return report.fail(source, "", e),
    };

    for file in files
        .iter()
        .filter(|f| DESCRIPTOR_FILE_EXTENSIONS.iter().any(|ext| f.ends_with(ext)))
    {
        let bytes = match storage::read_all_bytes(&location, Path::new(file)).await {
            Ok(bytes) => bytes,
            Err(e) => {
                report.fail(source, file, e);
                continue;
            }
        };
        let stem = file.rsplit_once('.').map_or(file.as_str(), |(stem, _)| stem);
        match TableDescriptor::from_slice_or_body(&bytes, stem) {
            Ok(descriptor) => register(registry, source, file, descriptor, report).await,
            Err(e) => report.fail(source, file, e),
        }
    }
}

async fn load_bucket(
    registry: &TableRegistry,
    source: &DescriptorSource,
    bucket: &DescriptorBucket,
    prefix: &str,
    report: &mut LoadReport,
) {
    let listing_prefix = format!("{}/", prefix.trim_matches('/'));
    let listing_prefix = (listing_prefix != "/").then_some(listing_prefix);
    let blobs = match bucket.list(listing_prefix.as_deref()).await {
        Ok(blobs) => blobs,
        Err(e) => return report.fail(source, "", e),
    };

    let fetched: Vec<_> = stream::iter(blobs)
        .map(|blob| async move {
            let result = bucket.fetch(&blob).await;
            (blob, result)
        })
        .buffered(FETCH_CONCURRENCY)
        .collect()
        .await;

    for (blob, result) in fetched {
        let Some(name) = DescriptorBucket::table_name(prefix, &blob) else {
            report.fail(source, &blob, "blob name does not follow <prefix>/<name>.sdml");
            continue;
        };
        match result {
            Ok(mut descriptor) => {
                descriptor.name = name;
                register(registry, source, &blob, descriptor, report).await;
            }
            Err(e) => report.fail(source, &blob, e),
        }
    }
}
