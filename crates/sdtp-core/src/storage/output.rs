use std::{
    io::{self, Write},
    path::{Path, PathBuf},
};

use snafu::ResultExt;
use tokio::fs;

use crate::storage::{
    BackendError, InvalidPathSnafu, OtherIoSnafu, StorageLocation, StorageResult, TempFileGuard,
    create_parent_dir, join_local, tmp_path_for,
};

/// Local filesystem sink that writes to a temp file and renames on finish.
struct LocalSink {
    tmp_path: PathBuf,
    final_path: PathBuf,
    writer: io::BufWriter<std::fs::File>,
    guard: TempFileGuard,
}

impl LocalSink {
    async fn open(location: &StorageLocation, rel_path: &Path) -> StorageResult<Self> {
        let final_path = join_local(location, rel_path)?;
        create_parent_dir(&final_path).await?;

        let tmp_path = tmp_path_for(&final_path);

        // Arrow writers require std::io::Write.
        let file = std::fs::File::create(&tmp_path)
            .map_err(BackendError::Local)
            .context(OtherIoSnafu {
                path: tmp_path.display().to_string(),
            })?;

        let writer = io::BufWriter::new(file);
        let guard = TempFileGuard::new(tmp_path.clone());

        Ok(Self {
            tmp_path,
            final_path,
            writer,
            guard,
        })
    }

    async fn finish(&mut self) -> StorageResult<()> {
        self.writer
            .flush()
            .map_err(BackendError::Local)
            .context(OtherIoSnafu {
                path: self.tmp_path.display().to_string(),
            })?;

        self.writer
            .get_ref()
            .sync_all()
            .map_err(BackendError::Local)
            .context(OtherIoSnafu {
                path: self.tmp_path.display().to_string(),
            })?;

        fs::rename(&self.tmp_path, &self.final_path)
            .await
            .map_err(BackendError::Local)
            .context(OtherIoSnafu {
                path: self.final_path.display().to_string(),
            })?;

        self.guard.disarm();
        Ok(())
    }
}

/// A streaming output sink for query results.
///
/// Callers obtain a sink via [`open_output_sink`], stream bytes through
/// [`OutputSink::writer`] and commit with [`OutputSink::finish`]. Dropping an
/// unfinished sink removes the partial file.
pub struct OutputSink {
    inner: LocalSink,
}

impl OutputSink {
    /// Return a mutable Write handle for streaming bytes.
    pub fn writer(&mut self) -> &mut dyn Write {
        &mut self.inner.writer
    }

    /// Flush, fsync, and commit to the final location.
    pub async fn finish(mut self) -> StorageResult<()> {
        self.inner.finish().await
    }
}

/// Open a streaming output sink at `location` + `rel_path`.
pub async fn open_output_sink(
    location: &StorageLocation,
    rel_path: &Path,
) -> StorageResult<OutputSink> {
    let inner = LocalSink::open(location, rel_path).await?;
    Ok(OutputSink { inner })
}

/// Fully-qualified output target: backend root + file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLocation {
    /// Directory the output is written into.
    pub storage: StorageLocation,
    /// File name under `storage`.
    pub rel_path: PathBuf,
}

impl OutputLocation {
    /// Parse a user-supplied output path.
    ///
    /// The parent directory becomes the storage root so absolute paths are
    /// accepted; the path must name a file.
    pub fn parse(spec: &str) -> StorageResult<OutputLocation> {
        let trimmed = spec.trim();
        let path = PathBuf::from(trimmed);

        let Some(file_name) = path.file_name().filter(|_| !trimmed.is_empty()) else {
            return InvalidPathSnafu {
                path: trimmed.to_string(),
            }
            .fail();
        };

        let base = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        Ok(OutputLocation {
            storage: StorageLocation::Local(base),
            rel_path: PathBuf::from(file_name),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn parse_splits_parent_and_file() -> TestResult {
        let loc = OutputLocation::parse("out/cases.csv")?;
        assert_eq!(loc.storage, StorageLocation::local("out"));
        assert_eq!(loc.rel_path, PathBuf::from("cases.csv"));

        let bare = OutputLocation::parse("cases.jsonl")?;
        assert_eq!(bare.storage, StorageLocation::local("."));
        Ok(())
    }

    #[test]
    fn parse_rejects_empty_and_directory_paths() {
        assert!(OutputLocation::parse("  ").is_err());
        assert!(OutputLocation::parse("out/..").is_err());
    }

    #[tokio::test]
    async fn sink_commits_on_finish_only() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StorageLocation::local(tmp.path());

        let mut sink = open_output_sink(&location, Path::new("a.csv")).await?;
        sink.writer().write_all(b"x,y\n")?;
        assert!(!tmp.path().join("a.csv").exists());
        sink.finish().await?;
        assert_eq!(std::fs::read_to_string(tmp.path().join("a.csv"))?, "x,y\n");

        let mut dropped = open_output_sink(&location, Path::new("b.csv")).await?;
        dropped.writer().write_all(b"partial")?;
        drop(dropped);
        assert!(!tmp.path().join("b.csv").exists());
        assert!(!tmp.path().join("b.csv.tmp").exists());
        Ok(())
    }
}
