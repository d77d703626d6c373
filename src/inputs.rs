// src/inputs.rs

//! Content-addressed digest of a local input directory.
//!
//! Tasks configured with `input_dir` ship that directory to the bot. The
//! directory is identified by a CAS-style `"<hex>/<size>"` string computed
//! over its sorted relative paths and file contents, so the same tree always
//! yields the same input reference.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::Context;
use blake3::Hasher;
use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::{debug, trace};

use crate::errors::{Result, ShardrunError};
use crate::request::InputRef;

/// Digest of one input tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputDigest {
    pub hash: String,
    /// Total size of the hashed file contents in bytes.
    pub size: u64,
    pub files: usize,
}

impl InputDigest {
    /// `"<hex>/<size>"`.
    pub fn as_cas_digest(&self) -> String {
        format!("{}/{}", self.hash, self.size)
    }

    pub fn input_ref(&self) -> InputRef {
        InputRef::Cas(self.as_cas_digest())
    }
}

fn build_exclude_set(patterns: &[String]) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|err| {
            ShardrunError::InvalidConfig(format!("invalid input_exclude pattern '{pattern}': {err}"))
        })?;
        builder.add(glob);
    }
    let set = builder
        .build()
        .map_err(|err| ShardrunError::InvalidConfig(format!("invalid input_exclude set: {err}")))?;
    Ok(Some(set))
}

/// Relative paths (forward slashes) of every file under `root`, sorted.
fn collect_files(root: &Path, exclude: Option<&GlobSet>) -> anyhow::Result<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir).with_context(|| format!("reading dir {:?}", dir))? {
            let path = entry?.path();
            let rel = path
                .strip_prefix(root)
                .with_context(|| format!("{:?} is outside {:?}", path, root))?
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if exclude.is_some_and(|set| set.is_match(&rel)) {
                trace!(path = %rel, "input excluded");
                continue;
            }
            if path.is_dir() {
                stack.push(path);
            } else if path.is_file() {
                files.push((rel, path));
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Digest the directory tree at `root`, skipping paths that match any of
/// the `exclude` globs (matched against the path relative to `root`).
pub fn digest_dir(root: &Path, exclude: &[String]) -> Result<InputDigest> {
    if !root.is_dir() {
        return Err(ShardrunError::InvalidConfig(format!(
            "input_dir {:?} is not a directory",
            root
        )));
    }
    let exclude = build_exclude_set(exclude)?;
    let files = collect_files(root, exclude.as_ref())?;

    let mut hasher = Hasher::new();
    let mut size = 0u64;
    let mut buf = [0u8; 8192];
    for (rel, path) in &files {
        hasher.update(rel.as_bytes());
        hasher.update(&[0]);
        let mut file =
            File::open(path).with_context(|| format!("opening input file {:?}", path))?;
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            size += n as u64;
        }
        hasher.update(&[0]);
    }

    let digest = InputDigest {
        hash: hasher.finalize().to_hex().to_string(),
        size,
        files: files.len(),
    };
    debug!(root = ?root, files = digest.files, digest = %digest.as_cas_digest(), "input digest");
    Ok(digest)
}
