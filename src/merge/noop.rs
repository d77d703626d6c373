// src/merge/noop.rs

use std::sync::Arc;

use anyhow::Context;
use tracing::debug;

use crate::backend::BoxFuture;
use crate::errors::Result;
use crate::fs::FileSystem;

use super::{MergeOutput, MergeRequest, MergeStage};

/// Passthrough merge used when a task has no merge script.
///
/// One shard file yields its JSON unchanged; several yield a JSON array in
/// shard order; none yields no merged result.
#[derive(Debug, Clone)]
pub struct NoopMerge {
    fs: Arc<dyn FileSystem>,
}

impl NoopMerge {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self { fs }
    }

    fn merge_files(&self, request: &MergeRequest) -> Result<MergeOutput> {
        let mut values = Vec::with_capacity(request.shard_files.len());
        for path in &request.shard_files {
            let contents = self.fs.read_to_string(path)?;
            let value: serde_json::Value = serde_json::from_str(&contents)
                .with_context(|| format!("parsing shard result {path:?}"))?;
            values.push(value);
        }

        let merged = match values.len() {
            0 => None,
            1 => values.pop(),
            _ => Some(serde_json::Value::Array(values)),
        };

        match &merged {
            Some(value) => self
                .fs
                .write(&request.output_json, serde_json::to_string_pretty(value)?.as_bytes())?,
            None => self.fs.remove_file(&request.output_json)?,
        }

        debug!(files = request.shard_files.len(), "passthrough merge complete");
        Ok(MergeOutput {
            merged,
            log: format!(
                "Passed through {} shard result file(s)",
                request.shard_files.len()
            ),
            exit_code: Some(0),
        })
    }
}

impl MergeStage for NoopMerge {
    fn merge(&self, request: MergeRequest) -> BoxFuture<'_, Result<MergeOutput>> {
        Box::pin(async move { self.merge_files(&request) })
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::fs::mock::MockFileSystem;

    fn request(files: &[&str]) -> MergeRequest {
        MergeRequest {
            output_json: PathBuf::from("/out/merged.json"),
            task_output_dir: PathBuf::from("/out"),
            shard_files: files.iter().map(PathBuf::from).collect(),
            summary_json: None,
            build_properties: None,
        }
    }

    #[tokio::test]
    async fn single_file_passes_through_unchanged() {
        let fs = MockFileSystem::new();
        fs.add_file("/out/a/output.json", r#"{"tests": 3}"#);
        let merge = NoopMerge::new(Arc::new(fs.clone()));

        let out = merge.merge(request(&["/out/a/output.json"])).await.unwrap();
        assert_eq!(out.merged, Some(serde_json::json!({"tests": 3})));
        assert!(fs.is_file(std::path::Path::new("/out/merged.json")));
    }

    #[tokio::test]
    async fn several_files_become_an_array_and_none_is_empty() {
        let fs = MockFileSystem::new();
        fs.add_file("/out/a/output.json", "1");
        fs.add_file("/out/b/output.json", "2");
        let merge = NoopMerge::new(Arc::new(fs));

        let out = merge
            .merge(request(&["/out/a/output.json", "/out/b/output.json"]))
            .await
            .unwrap();
        assert_eq!(out.merged, Some(serde_json::json!([1, 2])));

        let out = merge.merge(request(&[])).await.unwrap();
        assert_eq!(out.merged, None);
    }

    #[tokio::test]
    async fn no_shard_files_clear_an_earlier_merged_file() {
        let fs = MockFileSystem::new();
        fs.add_file("/out/merged.json", r#"{"stale": true}"#);
        let merge = NoopMerge::new(Arc::new(fs.clone()));

        let out = merge.merge(request(&[])).await.unwrap();
        assert_eq!(out.merged, None);
        assert!(fs.paths().is_empty());
    }
}
