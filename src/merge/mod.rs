// src/merge/mod.rs

//! Merging of per-shard result files into one summary.
//!
//! The merge stage is a collaborator: its exit code is informational only.
//! Pass/fail is always decided by shard classification.
//!
//! - [`ScriptMerge`] runs an external merge script.
//! - [`NoopMerge`] passes shard results through unchanged.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::backend::BoxFuture;
use crate::dispatch::ShardHandle;
use crate::errors::Result;
use crate::fs::FileSystem;

pub mod noop;
pub mod script;

pub use noop::NoopMerge;
pub use script::ScriptMerge;

/// File each shard writes its test results to, relative to its output dir.
pub const SHARD_RESULT_FILE: &str = "output.json";

/// External merge script reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeScript {
    pub script: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Everything a merge stage needs for one collect.
#[derive(Debug, Clone)]
pub struct MergeRequest {
    /// Where the merged JSON is written.
    pub output_json: PathBuf,
    pub task_output_dir: PathBuf,
    /// Shard result files in shard order; missing or empty ones are excluded.
    pub shard_files: Vec<PathBuf>,
    pub summary_json: Option<PathBuf>,
    pub build_properties: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default)]
pub struct MergeOutput {
    pub merged: Option<serde_json::Value>,
    /// Captured stdout/stderr of the merge.
    pub log: String,
    pub exit_code: Option<i32>,
}

impl MergeOutput {
    /// Shard indices the merge reported as missing.
    pub fn missing_shards(&self) -> Vec<u32> {
        self.merged
            .as_ref()
            .and_then(|m| m.get("missing_shards"))
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_u64())
                    .filter_map(|v| u32::try_from(v).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `links` object of the merged result, as label/url pairs.
    pub fn links(&self) -> Vec<(String, String)> {
        self.merged
            .as_ref()
            .and_then(|m| m.get("links"))
            .and_then(|v| v.as_object())
            .map(|links| {
                links
                    .iter()
                    .filter_map(|(k, v)| v.as_str().map(|url| (k.clone(), url.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// A pluggable merge implementation.
pub trait MergeStage: Send + Sync {
    fn merge(&self, request: MergeRequest) -> BoxFuture<'_, Result<MergeOutput>>;
}

/// The merge stage for a task: its script if configured, else passthrough.
pub fn merge_stage_for(
    merge: Option<&MergeScript>,
    fs: Arc<dyn FileSystem>,
) -> Box<dyn MergeStage> {
    match merge {
        Some(script) => Box::new(ScriptMerge::new(script.clone(), fs)),
        None => Box::new(NoopMerge::new(fs)),
    }
}

/// Locate `<task_output_dir>/<task_id>/output.json` for each shard, in the
/// order given. Missing or empty files are skipped with a warning.
pub fn shard_result_files<'a, I>(fs: &dyn FileSystem, task_output_dir: &Path, handles: I) -> Vec<PathBuf>
where
    I: IntoIterator<Item = &'a ShardHandle>,
{
    let mut files = Vec::new();
    for handle in handles {
        let path = task_output_dir.join(&handle.task_id).join(SHARD_RESULT_FILE);
        if !fs.is_file(&path) {
            warn!(shard = handle.shard_index, path = ?path, "shard result file missing; skipping");
            continue;
        }
        match fs.read_to_string(&path) {
            Ok(contents) if contents.trim().is_empty() => {
                warn!(shard = handle.shard_index, path = ?path, "shard result file empty; skipping");
            }
            Ok(_) => files.push(path),
            Err(err) => {
                warn!(shard = handle.shard_index, path = ?path, error = %err, "unreadable shard result file; skipping");
            }
        }
    }
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::mock::MockFileSystem;

    fn handle(index: u32, task_id: &str) -> ShardHandle {
        ShardHandle {
            task_id: task_id.into(),
            shard_index: index,
            name: format!("t:2:{index}"),
            view_url: None,
            invocation: None,
        }
    }

    #[test]
    fn discovery_skips_missing_and_empty_files() {
        let fs = MockFileSystem::new();
        fs.add_file("/out/a/output.json", r#"{"ok": true}"#);
        fs.add_file("/out/b/output.json", "  ");
        let handles = [handle(0, "a"), handle(1, "b"), handle(2, "c")];

        let files = shard_result_files(&fs, Path::new("/out"), handles.iter());
        assert_eq!(files, vec![PathBuf::from("/out/a/output.json")]);
    }

    #[test]
    fn missing_shards_and_links_are_read_from_merged_json() {
        let output = MergeOutput {
            merged: Some(serde_json::json!({
                "missing_shards": [1, 3],
                "links": {"report": "https://example.com/r"}
            })),
            ..Default::default()
        };
        assert_eq!(output.missing_shards(), vec![1, 3]);
        assert_eq!(
            output.links(),
            vec![("report".to_string(), "https://example.com/r".to_string())]
        );
    }
}
