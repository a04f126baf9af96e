//! Filesystem abstractions used for tree building and path expansion.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{QfarmError, Result};

/// A path discovered while walking a checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEntry {
    /// Path of the entry, prefixed with the walk root.
    pub path: PathBuf,
    /// Whether the entry is a directory.
    pub dir: bool,
}

impl FsEntry {
    /// Directory entry.
    pub fn dir(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            dir: true,
        }
    }

    /// File entry.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            dir: false,
        }
    }
}

/// Abstraction over filesystem access for testability.
#[cfg_attr(test, mockall::automock)]
pub trait FileSystem {
    /// List the root and every file and directory below it.
    fn walk(&self, root: &Path) -> Result<Vec<FsEntry>>;
    /// Read a file into memory.
    fn read(&self, path: &Path) -> Result<Vec<u8>>;
}

/// Default filesystem implementation backed by `walkdir` and `std::fs`.
#[derive(Debug, Default, Clone)]
pub struct StdFileSystem;

impl StdFileSystem {
    /// Create a new standard filesystem adapter.
    pub fn new() -> Self {
        Self
    }
}

impl FileSystem for StdFileSystem {
    fn walk(&self, root: &Path) -> Result<Vec<FsEntry>> {
        let mut entries = Vec::new();
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry.map_err(|err| {
                let message = err.to_string();
                err.into_io_error()
                    .map(QfarmError::Io)
                    .unwrap_or(QfarmError::Other(message))
            })?;
            entries.push(FsEntry {
                path: entry.path().to_path_buf(),
                dir: entry.file_type().is_dir(),
            });
        }
        Ok(entries)
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        Ok(std::fs::read(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::{FsEntry, StdFileSystem};
    use crate::fs::FileSystem;
    use std::path::PathBuf;

    #[test]
    fn std_filesystem_walks_and_reads_files() {
        let root = std::env::temp_dir().join(unique_dir_name());
        std::fs::create_dir_all(root.join("pkg")).expect("create temp dir");
        let file_path = root.join("pkg").join("main.go");
        std::fs::write(&file_path, "package main").expect("write test file");

        let fs = StdFileSystem::new();
        let entries = fs.walk(&root).expect("walk");
        assert_eq!(
            entries,
            vec![
                FsEntry::dir(root.clone()),
                FsEntry::dir(root.join("pkg")),
                FsEntry::file(file_path.clone()),
            ]
        );

        let contents = fs.read(&file_path).expect("read file");
        assert_eq!(contents, b"package main");

        std::fs::remove_dir_all(&root).expect("cleanup temp dir");
    }

    #[test]
    fn walking_a_missing_root_fails() {
        let root = std::env::temp_dir().join(unique_dir_name()).join("missing");
        assert!(StdFileSystem::new().walk(&root).is_err());
    }

    fn unique_dir_name() -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system time")
            .as_nanos();
        PathBuf::from(format!("qfarm_core_fs_test_{nanos}"))
    }
}
