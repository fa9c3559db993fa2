//! File storage collaborator.
//!
//! The core decides which file operation must happen and when; a
//! [`FileStorage`] performs it. Only the artifact manager calls into it.

use std::io;
use std::path::{Component, Path, PathBuf};

/// Result of a delete request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The file existed and was removed.
    Deleted,
    /// Nothing was there.
    NotFound,
}

/// Byte storage for artifact files.
pub trait FileStorage: Send + Sync {
    /// Write `bytes` to `path`, replacing any existing file. Returns the size written.
    fn write_file(&self, path: &str, bytes: &[u8]) -> io::Result<u64>;

    /// Remove the file at `path`.
    fn delete_file(&self, path: &str) -> io::Result<DeleteOutcome>;
}

/// Files under a root directory on the local filesystem.
///
/// Relative artifact paths resolve against the root. Paths that climb out of
/// it are rejected.
#[derive(Debug, Clone)]
pub struct LocalFileStorage {
    root: PathBuf,
}

impl LocalFileStorage {
    /// Create a storage rooted at `root`. The directory is created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> io::Result<PathBuf> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)));
        if path.is_empty() || escapes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("path not allowed: {path:?}"),
            ));
        }
        let trimmed = relative.strip_prefix("/").unwrap_or(relative);
        Ok(self.root.join(trimmed))
    }
}

impl FileStorage for LocalFileStorage {
    fn write_file(&self, path: &str, bytes: &[u8]) -> io::Result<u64> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Write beside the target and rename so readers never see a partial file.
        let mut staging = target.clone().into_os_string();
        staging.push(".partial");
        std::fs::write(&staging, bytes)?;
        std::fs::rename(&staging, &target)?;
        Ok(bytes.len() as u64)
    }

    fn delete_file(&self, path: &str) -> io::Result<DeleteOutcome> {
        let target = self.resolve(path)?;
        match std::fs::remove_file(&target) {
            Ok(()) => Ok(DeleteOutcome::Deleted),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(DeleteOutcome::NotFound),
            Err(e) => Err(e),
        }
    }
}


// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
