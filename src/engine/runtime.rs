// src/engine/runtime.rs

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::TaskBackend;
use crate::collect::{
    apply_merge_output, assemble_verdict, wait_for_finished_task_set, CollectOptions,
    CollectVerdict, CollectedShard, EngineStats, PresentationOptions,
};
use crate::dispatch::{
    build_shard_requests, step_name, submit_shards, task_tags, DispatchedTask, ShardHandle,
    ShardRequest,
};
use crate::errors::{Result, ShardrunError};
use crate::fs::{FileSystem, RealFileSystem};
use crate::merge::{merge_stage_for, shard_result_files, MergeOutput, MergeRequest, SHARD_RESULT_FILE};
use crate::request::{BuildInfo, DimensionSet, EngineDefaults, ProjectProfile, TaskParams, TaskSpec};
use crate::retry::effective_trigger_output;
use crate::types::StepStatus;

use super::core::EngineCore;
use super::{sanitize_dir_name, EngineOptions};

/// File the per-collect shard summary is written to, inside the task
/// output dir.
pub const SUMMARY_FILE: &str = "summary.json";

/// Async shell around [`EngineCore`]: submits shards through a
/// [`TaskBackend`], waits for them, and runs the merge stage.
///
/// `trigger` and `collect` take `&self` so several tasks can be in flight
/// at once; the core is only locked for bookkeeping, never across an await.
pub struct Engine<B: TaskBackend> {
    backend: B,
    fs: Arc<dyn FileSystem>,
    options: EngineOptions,
    core: Mutex<EngineCore>,
    cancel: CancellationToken,
}

impl<B: TaskBackend> fmt::Debug for Engine<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("options", &self.options)
            .field("core", &self.core)
            .finish_non_exhaustive()
    }
}

impl<B: TaskBackend> Engine<B> {
    pub fn new(backend: B, build: BuildInfo, options: EngineOptions) -> Result<Self> {
        Ok(Self {
            backend,
            fs: Arc::new(RealFileSystem),
            options,
            core: Mutex::new(EngineCore::new(build)?),
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_fs(mut self, fs: Arc<dyn FileSystem>) -> Self {
        self.fs = fs;
        self
    }

    /// Share a cancellation token with the caller (e.g. a Ctrl-C handler).
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    fn core(&self) -> MutexGuard<'_, EngineCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn core_mut(&mut self) -> &mut EngineCore {
        self.core.get_mut().unwrap_or_else(PoisonError::into_inner)
    }

    // ---------------------------------------------------------------------
    // Defaults
    // ---------------------------------------------------------------------

    pub fn defaults_mut(&mut self) -> &mut EngineDefaults {
        self.core_mut().defaults_mut()
    }

    /// Read-only copy of the default dimensions.
    pub fn default_dimensions(&self) -> DimensionSet {
        self.core().defaults().dimensions().clone()
    }

    pub fn set_default_dimension(&mut self, key: &str, value: Option<&str>) -> Result<()> {
        self.defaults_mut().set_dimension(key, value)
    }

    pub fn set_default_env(&mut self, key: &str, value: &str) -> Result<()> {
        self.defaults_mut().set_env(key, value)
    }

    pub fn add_default_tag(&mut self, tag: &str) -> Result<()> {
        self.defaults_mut().add_tag(tag)
    }

    /// Apply the project/builder profile to the defaults.
    pub fn configure(&mut self, profile: &ProjectProfile) -> Result<()> {
        self.defaults_mut().configure(profile)
    }

    // ---------------------------------------------------------------------
    // Building
    // ---------------------------------------------------------------------

    /// Build a task spec from `params` over the current defaults.
    ///
    /// Without an explicit `task_output_dir` the task writes under
    /// `<output_dir>/<task identity>`.
    pub fn task(&self, params: TaskParams) -> Result<TaskSpec> {
        let mut spec = self.core().build_spec(params)?;
        if spec.task_output_dir.is_none() {
            spec.task_output_dir = Some(self.default_output_dir(&spec.task_name()));
        }
        Ok(spec)
    }

    /// Shard requests `trigger` would submit for `spec`.
    pub fn shard_requests(&self, spec: &TaskSpec) -> Result<Vec<ShardRequest>> {
        spec.validate()?;
        let tags = task_tags(spec, self.core().build());
        build_shard_requests(spec, &tags)
    }

    fn default_output_dir(&self, task_name: &str) -> PathBuf {
        self.options.output_dir.join(sanitize_dir_name(task_name))
    }

    // ---------------------------------------------------------------------
    // Trigger / collect
    // ---------------------------------------------------------------------

    /// Submit every shard in `spec.shard_indices`.
    ///
    /// The task is marked pending before the first submission; a task whose
    /// identity is already pending is rejected with `InvariantViolation`.
    pub async fn trigger(&self, spec: TaskSpec) -> Result<DispatchedTask> {
        spec.validate()?;
        let task_name = spec.task_name();

        let (requests, name) = {
            let core = self.core();
            let tags = task_tags(&spec, core.build());
            let requests = build_shard_requests(&spec, &tags)?;
            let name = step_name("", &spec, core.build().platform.as_deref());
            (requests, name)
        };

        self.core().begin_trigger(&task_name)?;

        let simultaneous = spec
            .trigger_script
            .as_ref()
            .is_some_and(|t| t.requires_simultaneous_shard_dispatch);
        info!(
            task = %task_name,
            shards = requests.len(),
            total_shards = spec.shards,
            retry = spec.is_retry(),
            "triggering task"
        );

        let trigger_output = submit_shards(&self.backend, requests, simultaneous).await?;
        Ok(DispatchedTask::new(spec, trigger_output, name))
    }

    /// Wait for every shard of `task`, classify them and run the merge.
    ///
    /// `task.failed_shards` is updated before any error is returned, so a
    /// retry can always be built from the task afterwards.
    pub async fn collect(
        &self,
        task: &mut DispatchedTask,
        options: CollectOptions,
    ) -> Result<CollectVerdict> {
        let task_name = task.task_name();
        self.core().begin_collect(&task_name)?;

        let handles = effective_trigger_output(task)?;
        let task_ids: Vec<String> = handles.values().map(|h| h.task_id.clone()).collect();
        let output_dir = task
            .spec
            .task_output_dir
            .clone()
            .unwrap_or_else(|| self.default_output_dir(&task_name));

        info!(task = %task_name, shards = task_ids.len(), "collecting task");
        self.wait_for_finished_task_set(std::slice::from_ref(&task_ids), 0)
            .await?;

        let mut records = self
            .backend
            .fetch_results(task_ids, output_dir.clone())
            .await?
            .into_iter();
        let shards: Vec<CollectedShard> = handles
            .values()
            .map(|handle| CollectedShard {
                handle: handle.clone(),
                record: records.next().flatten(),
            })
            .collect();

        let dispatched = task.dispatched_task_ids();
        let durations: Vec<f64> = shards
            .iter()
            .filter(|s| dispatched.contains(s.handle.task_id.as_str()))
            .filter_map(|s| s.record.as_ref().and_then(|r| r.duration))
            .filter(|d| *d > 0.0)
            .collect();
        self.core().record_shard_durations(durations);

        let mut verdict = assemble_verdict(
            task,
            &shards,
            PresentationOptions {
                show_outputs_ref: self.options.show_outputs_ref,
            },
        );

        // Retries share the output dir; each attempt gets its own summary and
        // merged result so a failed merge never reads a stale one.
        let attempt = retry_depth(task);
        let summary_json =
            self.write_summary(output_dir.join(attempt_file(SUMMARY_FILE, attempt)), &shards);
        let merged_json = output_dir.join(attempt_file(SHARD_RESULT_FILE, attempt));
        let merge = self
            .run_merge(task, &output_dir, merged_json, &handles, summary_json)
            .await;
        let view_urls: BTreeMap<u32, Option<String>> = handles
            .iter()
            .map(|(index, handle)| (*index, handle.view_url.clone()))
            .collect();
        apply_merge_output(&mut verdict, merge, &view_urls);

        task.failed_shards = verdict.failed_shards.clone();
        info!(
            task = %task_name,
            status = %verdict.status,
            failed = ?verdict.failed_shards,
            valid_results = verdict.has_valid_results,
            "task collected"
        );

        if options.failure_as_exception {
            match verdict.status {
                StepStatus::Exception => {
                    return Err(ShardrunError::InfraFailure {
                        failures: verdict.failures.clone(),
                        verdict: Some(Box::new(verdict)),
                    });
                }
                StepStatus::Failure if !options.ignore_task_failure => {
                    return Err(ShardrunError::TestFailure {
                        failures: verdict.failures.clone(),
                        verdict: Box::new(verdict),
                    });
                }
                _ => {}
            }
        }

        Ok(verdict)
    }

    /// Block until at least one of `task_sets` has fully finished.
    pub async fn wait_for_finished_task_set(
        &self,
        task_sets: &[Vec<String>],
        attempts: u32,
    ) -> Result<(Vec<Vec<String>>, u32)> {
        wait_for_finished_task_set(
            &self.backend,
            task_sets,
            attempts,
            &self.options.poll,
            &self.cancel,
        )
        .await
    }

    // ---------------------------------------------------------------------
    // Reporting
    // ---------------------------------------------------------------------

    /// Shard runtime statistics over every collect of this engine.
    pub fn report_stats(&self) -> Option<EngineStats> {
        let stats = self.core().stats();
        if let Some(stats) = &stats {
            info!(
                total_shards = stats.total_shards,
                total_runtime = stats.total_runtime,
                "engine stats"
            );
        }
        stats
    }

    /// Identities of tasks that were triggered but not yet collected.
    pub fn pending_tasks(&self) -> Vec<String> {
        self.core().pending().map(str::to_string).collect()
    }

    pub fn is_pending(&self, spec: &TaskSpec) -> bool {
        self.core().is_pending(&spec.task_name())
    }

    fn write_summary(&self, path: PathBuf, shards: &[CollectedShard]) -> Option<PathBuf> {
        let summary = serde_json::json!({
            "shards": shards.iter().map(|s| &s.record).collect::<Vec<_>>(),
        });
        let written = serde_json::to_vec_pretty(&summary)
            .map_err(anyhow::Error::from)
            .and_then(|bytes| self.fs.write(&path, &bytes));
        match written {
            Ok(()) => Some(path),
            Err(err) => {
                warn!(path = ?path, error = %err, "failed to write shard summary");
                None
            }
        }
    }

    async fn run_merge(
        &self,
        task: &DispatchedTask,
        output_dir: &Path,
        output_json: PathBuf,
        handles: &BTreeMap<u32, ShardHandle>,
        summary_json: Option<PathBuf>,
    ) -> MergeOutput {
        let request = MergeRequest {
            output_json,
            task_output_dir: output_dir.to_path_buf(),
            shard_files: shard_result_files(self.fs.as_ref(), output_dir, handles.values()),
            summary_json,
            build_properties: task.spec.build_properties.clone(),
        };
        debug!(files = request.shard_files.len(), "running merge stage");

        let stage = merge_stage_for(task.spec.merge.as_ref(), Arc::clone(&self.fs));
        match stage.merge(request).await {
            Ok(output) => output,
            Err(err) => {
                warn!(task = %task.spec.title, error = %err, "merge stage failed");
                MergeOutput {
                    log: format!("merge failed: {err}"),
                    ..Default::default()
                }
            }
        }
    }
}

/// Number of earlier tasks `task` retries.
fn retry_depth(task: &DispatchedTask) -> usize {
    let mut depth = 0;
    let mut current = task.spec.task_to_retry.as_deref();
    while let Some(previous) = current {
        depth += 1;
        current = previous.spec.task_to_retry.as_deref();
    }
    depth
}

/// `name` for the first attempt, `<stem>.retry<n>.<ext>` for retries.
fn attempt_file(name: &str, attempt: usize) -> String {
    if attempt == 0 {
        return name.to_string();
    }
    match name.rsplit_once('.') {
        Some((stem, ext)) => format!("{stem}.retry{attempt}.{ext}"),
        None => format!("{name}.retry{attempt}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_get_their_own_files() {
        assert_eq!(attempt_file("summary.json", 0), "summary.json");
        assert_eq!(attempt_file("output.json", 2), "output.retry2.json");
    }
}
