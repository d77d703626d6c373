// src/fs/mod.rs

//! Filesystem access used by the merge stage and the collect summary.
//!
//! Shard outputs are read and merged results written through this trait so
//! collect can be exercised against [`mock::MockFileSystem`].

use std::fmt::Debug;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};

pub mod mock;

/// Abstract filesystem interface.
pub trait FileSystem: Send + Sync + Debug {
    fn read_to_string(&self, path: &Path) -> Result<String>;

    /// Write `contents`, creating parent directories as needed.
    fn write(&self, path: &Path, contents: &[u8]) -> Result<()>;

    fn is_file(&self, path: &Path) -> bool;

    /// Remove a file. A file that does not exist is not an error.
    fn remove_file(&self, path: &Path) -> Result<()>;
}

/// Implementation that uses `std::fs`.
#[derive(Debug, Clone, Default)]
pub struct RealFileSystem;

impl FileSystem for RealFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String> {
        fs::read_to_string(path).with_context(|| format!("reading file {:?}", path))
    }

    fn write(&self, path: &Path, contents: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("creating dir {:?}", parent))?;
        }
        fs::write(path, contents).with_context(|| format!("writing to file {:?}", path))
    }

    fn is_file(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Err(err) if err.kind() != ErrorKind::NotFound => {
                Err(err).with_context(|| format!("removing file {:?}", path))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn real_write_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/summary.json");
        RealFileSystem.write(&path, b"{}").unwrap();
        assert!(RealFileSystem.is_file(&path));
        assert_eq!(RealFileSystem.read_to_string(&path).unwrap(), "{}");
    }

    #[test]
    fn real_remove_tolerates_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.json");
        RealFileSystem.remove_file(&path).unwrap();

        RealFileSystem.write(&path, b"{}").unwrap();
        RealFileSystem.remove_file(&path).unwrap();
        assert!(!RealFileSystem.is_file(&path));
    }
}
