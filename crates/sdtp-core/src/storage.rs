//! Local filesystem storage helpers.
//!
//! Descriptor directories, the local blob store and CLI output files all go
//! through this module, so path conventions and atomic-write semantics live in
//! one place:
//!
//! - Writes are write-then-rename, so readers never observe a partially
//!   written file.
//! - Relative paths are resolved under a [`StorageLocation`] root and may not
//!   escape it.
//! - Errors carry the offending path and are classified into
//!   [`StorageError`] variants.

use std::{
    ffi::OsString,
    io,
    path::{Component, Path, PathBuf},
};

use snafu::prelude::*;
use tokio::{fs, io::AsyncWriteExt};

mod error;
mod output;

pub use error::{BackendError, StorageError};
pub(crate) use error::{InvalidPathSnafu, NotFoundSnafu, OtherIoSnafu};
pub use output::{OutputLocation, OutputSink, open_output_sink};

/// General result type used by storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Suffix of in-flight temporary files; listings skip them.
const TMP_SUFFIX: &str = ".tmp";

/// Root of a storage area.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageLocation {
    /// A directory on the local filesystem.
    Local(PathBuf),
}

impl StorageLocation {
    /// Creates a new `StorageLocation` for a local filesystem path.
    pub fn local(root: impl Into<PathBuf>) -> Self {
        StorageLocation::Local(root.into())
    }

    /// The root directory.
    pub fn root(&self) -> &Path {
        match self {
            StorageLocation::Local(root) => root,
        }
    }
}

/// Join a location with a relative path, refusing paths that leave the root.
pub(crate) fn join_local(location: &StorageLocation, rel: &Path) -> StorageResult<PathBuf> {
    let escapes = rel
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    ensure!(
        !escapes && rel.components().next().is_some(),
        InvalidPathSnafu {
            path: rel.display().to_string(),
        }
    );
    match location {
        StorageLocation::Local(root) => Ok(root.join(rel)),
    }
}

pub(crate) async fn create_parent_dir(abs: &Path) -> StorageResult<()> {
    if let Some(parent) = abs.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(BackendError::Local)
            .context(OtherIoSnafu {
                path: parent.display().to_string(),
            })?;
    }
    Ok(())
}

pub(crate) fn tmp_path_for(abs: &Path) -> PathBuf {
    let mut name = OsString::from(abs.as_os_str());
    name.push(TMP_SUFFIX);
    PathBuf::from(name)
}

/// Guard that removes a temporary file on drop unless disarmed.
/// Used to ensure cleanup on error paths during atomic writes.
pub(crate) struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    /// Disarm the guard so the file is NOT removed on drop.
    /// Call this after a successful rename.
    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            // Best-effort cleanup; we are already on an error path.
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Write `contents` to `rel_path` inside `location` using an atomic write.
///
/// The payload goes to a temporary file next to the target, is synced, and is
/// then renamed into place. An existing file is replaced in one step.
///
/// # Errors
///
/// `StorageError::InvalidPath` when `rel_path` escapes the root, and
/// `StorageError::OtherIo` when filesystem I/O fails.
pub async fn write_atomic(
    location: &StorageLocation,
    rel_path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    let abs = join_local(location, rel_path)?;
    create_parent_dir(&abs).await?;

    let tmp_path = tmp_path_for(&abs);
    let mut guard = TempFileGuard::new(tmp_path.clone());

    {
        let mut file = fs::File::create(&tmp_path)
            .await
            .map_err(BackendError::Local)
            .context(OtherIoSnafu {
                path: tmp_path.display().to_string(),
            })?;

        file.write_all(contents)
            .await
            .map_err(BackendError::Local)
            .context(OtherIoSnafu {
                path: tmp_path.display().to_string(),
            })?;

        file.sync_all()
            .await
            .map_err(BackendError::Local)
            .context(OtherIoSnafu {
                path: tmp_path.display().to_string(),
            })?;
    }

    fs::rename(&tmp_path, &abs)
        .await
        .map_err(BackendError::Local)
        .context(OtherIoSnafu {
            path: abs.display().to_string(),
        })?;

    guard.disarm();
    Ok(())
}

/// Read the file at `rel_path` within `location` as UTF-8 text.
///
/// A missing file yields `StorageError::NotFound`; other filesystem problems
/// produce `StorageError::OtherIo`.
pub async fn read_to_string(location: &StorageLocation, rel_path: &Path) -> StorageResult<String> {
    let abs = join_local(location, rel_path)?;
    let path_str = abs.display().to_string();

    match fs::read_to_string(&abs).await {
        Ok(s) => Ok(s),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            Err(BackendError::Local(e)).context(NotFoundSnafu { path: path_str })
        }
        Err(e) => Err(BackendError::Local(e)).context(OtherIoSnafu { path: path_str }),
    }
}

/// Read the full contents of the file at `rel_path` within `location`.
///
/// Errors are classified like [`read_to_string`].
pub async fn read_all_bytes(location: &StorageLocation, rel_path: &Path) -> StorageResult<Vec<u8>> {
    let abs = join_local(location, rel_path)?;
    let path_str = abs.display().to_string();

    match fs::read(&abs).await {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            Err(BackendError::Local(e)).context(NotFoundSnafu { path: path_str })
        }
        Err(e) => Err(BackendError::Local(e)).context(OtherIoSnafu { path: path_str }),
    }
}

/// List regular files under `location`, relative to its root and joined with
/// `/`, in sorted order.
///
/// With `recursive` unset only the root directory itself is scanned.
/// Temporary files left by interrupted writes are skipped. A missing root
/// yields an empty listing.
pub async fn list_files(location: &StorageLocation, recursive: bool) -> StorageResult<Vec<String>> {
    let root = location.root().to_path_buf();
    let mut pending = vec![(root.clone(), String::new())];
    let mut out = Vec::new();

    while let Some((dir, rel_prefix)) = pending.pop() {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound && dir == root => return Ok(out),
            Err(e) => {
                return Err(BackendError::Local(e)).context(OtherIoSnafu {
                    path: dir.display().to_string(),
                });
            }
        };

        loop {
            let entry = entries
                .next_entry()
                .await
                .map_err(BackendError::Local)
                .context(OtherIoSnafu {
                    path: dir.display().to_string(),
                })?;
            let Some(entry) = entry else { break };

            let name = entry.file_name().to_string_lossy().into_owned();
            let file_type = entry
                .file_type()
                .await
                .map_err(BackendError::Local)
                .context(OtherIoSnafu {
                    path: entry.path().display().to_string(),
                })?;
            let rel = format!("{rel_prefix}{name}");

            if file_type.is_dir() {
                if recursive {
                    pending.push((entry.path(), format!("{rel}/")));
                }
            } else if file_type.is_file() && !name.ends_with(TMP_SUFFIX) {
                out.push(rel);
            }
        }
    }

    out.sort();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[tokio::test]
    async fn write_atomic_creates_parent_directories() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StorageLocation::local(tmp.path());

        let rel_path = Path::new("rowtables/alice/cases.sdml");
        write_atomic(&location, rel_path, b"nested content").await?;

        let read_back = read_to_string(&location, rel_path).await?;
        assert_eq!(read_back, "nested content");
        Ok(())
    }

    #[tokio::test]
    async fn write_atomic_overwrites_existing_file() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StorageLocation::local(tmp.path());
        let rel_path = Path::new("overwrite.txt");

        write_atomic(&location, rel_path, b"original").await?;
        write_atomic(&location, rel_path, b"updated").await?;

        assert_eq!(read_all_bytes(&location, rel_path).await?, b"updated");
        assert!(!tmp.path().join("overwrite.txt.tmp").exists());
        Ok(())
    }

    #[tokio::test]
    async fn read_missing_file_is_not_found() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StorageLocation::local(tmp.path());

        let err = read_to_string(&location, Path::new("missing.json"))
            .await
            .expect_err("missing file");
        assert!(err.is_not_found());
        Ok(())
    }

    #[tokio::test]
    async fn paths_may_not_escape_the_root() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StorageLocation::local(tmp.path());

        for rel in ["../outside.txt", "/etc/passwd", ""] {
            let err = write_atomic(&location, Path::new(rel), b"x")
                .await
                .expect_err("escaping path");
            assert!(matches!(err, StorageError::InvalidPath { .. }), "{rel}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn list_files_walks_and_skips_temp_files() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StorageLocation::local(tmp.path());

        write_atomic(&location, Path::new("b.json"), b"{}").await?;
        write_atomic(&location, Path::new("gcstables/x/y.sdml"), b"{}").await?;
        std::fs::write(tmp.path().join("a.json.tmp"), b"partial")?;

        assert_eq!(list_files(&location, false).await?, vec!["b.json"]);
        assert_eq!(
            list_files(&location, true).await?,
            vec!["b.json", "gcstables/x/y.sdml"]
        );
        Ok(())
    }

    #[tokio::test]
    async fn list_files_of_missing_root_is_empty() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StorageLocation::local(tmp.path().join("nope"));
        assert!(list_files(&location, true).await?.is_empty());
        Ok(())
    }
}
