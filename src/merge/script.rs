// src/merge/script.rs

//! External merge script runner.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context;
use tokio::process::Command;
use tracing::{info, warn};

use crate::backend::BoxFuture;
use crate::errors::Result;
use crate::fs::FileSystem;

use super::{MergeOutput, MergeRequest, MergeScript, MergeStage};

/// Runs `script [--build-properties JSON] [--summary-json P]
/// --task-output-dir D [args..] -o OUT shard.json..`.
#[derive(Debug, Clone)]
pub struct ScriptMerge {
    script: MergeScript,
    fs: Arc<dyn FileSystem>,
}

impl ScriptMerge {
    pub fn new(script: MergeScript, fs: Arc<dyn FileSystem>) -> Self {
        Self { script, fs }
    }

    /// Argument list passed after the script itself.
    pub fn args_for(&self, request: &MergeRequest) -> Result<Vec<String>> {
        let mut args = Vec::new();
        if let Some(props) = &request.build_properties {
            args.push("--build-properties".to_string());
            args.push(serde_json::to_string(props)?);
        }
        if let Some(summary) = &request.summary_json {
            args.push("--summary-json".to_string());
            args.push(summary.display().to_string());
        }
        args.push("--task-output-dir".to_string());
        args.push(request.task_output_dir.display().to_string());
        args.extend(self.script.args.iter().cloned());
        args.push("-o".to_string());
        args.push(request.output_json.display().to_string());
        args.extend(request.shard_files.iter().map(|p| p.display().to_string()));
        Ok(args)
    }

    async fn run(&self, request: MergeRequest) -> Result<MergeOutput> {
        let args = self.args_for(&request)?;
        // Only what this run writes may become the merged result.
        self.fs.remove_file(&request.output_json)?;

        let mut cmd = command_for(&self.script.script);
        cmd.args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(script = %self.script.script, shards = request.shard_files.len(), "running merge script");

        let output = cmd
            .output()
            .await
            .with_context(|| format!("running merge script '{}'", self.script.script))?;

        let mut log = String::from_utf8_lossy(&output.stdout).into_owned();
        log.push_str(&String::from_utf8_lossy(&output.stderr));

        let exit_code = output.status.code();
        if !output.status.success() {
            warn!(
                script = %self.script.script,
                exit_code = exit_code.unwrap_or(-1),
                "merge script exited unsuccessfully"
            );
        }

        let merged = if self.fs.is_file(&request.output_json) {
            let contents = self.fs.read_to_string(&request.output_json)?;
            match serde_json::from_str(&contents) {
                Ok(value) => Some(value),
                Err(err) => {
                    warn!(path = ?request.output_json, error = %err, "merge output is not valid JSON");
                    None
                }
            }
        } else {
            None
        };

        Ok(MergeOutput {
            merged,
            log,
            exit_code,
        })
    }
}

impl MergeStage for ScriptMerge {
    fn merge(&self, request: MergeRequest) -> BoxFuture<'_, Result<MergeOutput>> {
        Box::pin(self.run(request))
    }
}

/// Python and shell scripts run through their interpreter; anything else is
/// executed directly.
fn command_for(script: &str) -> Command {
    match Path::new(script).extension().and_then(|e| e.to_str()) {
        Some("py") => {
            let mut c = Command::new("python3");
            c.arg(script);
            c
        }
        Some("sh") => {
            let mut c = Command::new("sh");
            c.arg(script);
            c
        }
        _ => Command::new(script),
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::fs::RealFileSystem;

    #[test]
    fn args_follow_collect_wrapper_contract() {
        let merge = ScriptMerge::new(
            MergeScript {
                script: "merge.py".into(),
                args: vec!["--flag".into()],
            },
            Arc::new(RealFileSystem),
        );
        let request = MergeRequest {
            output_json: PathBuf::from("/o/merged.json"),
            task_output_dir: PathBuf::from("/o"),
            shard_files: vec![PathBuf::from("/o/a/output.json")],
            summary_json: Some(PathBuf::from("/o/summary.json")),
            build_properties: Some(serde_json::json!({"k": "v"})),
        };

        assert_eq!(
            merge.args_for(&request).unwrap(),
            vec![
                "--build-properties",
                r#"{"k":"v"}"#,
                "--summary-json",
                "/o/summary.json",
                "--task-output-dir",
                "/o",
                "--flag",
                "-o",
                "/o/merged.json",
                "/o/a/output.json",
            ]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn script_output_becomes_merged_result() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("merge.sh");
        // Last two args are `-o OUT`; no shard files are passed.
        std::fs::write(
            &script,
            "for a; do out=\"$a\"; done\necho '{\"merged\": true}' > \"$out\"\necho merging\n",
        )
        .unwrap();

        let merge = ScriptMerge::new(
            MergeScript {
                script: script.display().to_string(),
                args: Vec::new(),
            },
            Arc::new(RealFileSystem),
        );
        let output = merge
            .merge(MergeRequest {
                output_json: dir.path().join("merged.json"),
                task_output_dir: dir.path().to_path_buf(),
                shard_files: Vec::new(),
                summary_json: None,
                build_properties: None,
            })
            .await
            .unwrap();

        assert_eq!(output.exit_code, Some(0));
        assert_eq!(output.merged, Some(serde_json::json!({"merged": true})));
        assert!(output.log.contains("merging"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn crashed_script_leaves_no_merged_result() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("merge.sh");
        std::fs::write(&script, "exit 1\n").unwrap();
        let output_json = dir.path().join("output.json");
        std::fs::write(&output_json, r#"{"stale": "from a previous run"}"#).unwrap();

        let merge = ScriptMerge::new(
            MergeScript {
                script: script.display().to_string(),
                args: Vec::new(),
            },
            Arc::new(RealFileSystem),
        );
        let output = merge
            .merge(MergeRequest {
                output_json: output_json.clone(),
                task_output_dir: dir.path().to_path_buf(),
                shard_files: Vec::new(),
                summary_json: None,
                build_properties: None,
            })
            .await
            .unwrap();

        assert_eq!(output.exit_code, Some(1));
        assert_eq!(output.merged, None);
        assert!(!output_json.exists());
    }
}
