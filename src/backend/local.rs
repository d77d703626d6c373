// src/backend/local.rs

//! Task backend that runs shard requests as local processes.
//!
//! The local machine acts as a single bot advertising a fixed set of
//! dimensions:
//! - the first slice whose dimensions the bot satisfies is executed; if no
//!   slice matches, the shard expires immediately,
//! - hard timeout and io timeout (no output for `io_timeout`) kill the
//!   process and report `TIMED_OUT`,
//! - a process that cannot be started is an internal failure,
//! - idempotent requests identical to an earlier successful one are deduped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, anyhow};
use time::OffsetDateTime;
use time::macros::format_description;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::collect::ShardRecord;
use crate::dispatch::{ShardHandle, ShardRequest};
use crate::errors::{Result, ShardrunError};
use crate::request::{DimensionSet, ISOLATED_OUTDIR_ENV, InputRef, TaskSlice};
use crate::types::TaskState;

use super::{BoxFuture, TaskBackend};

/// Settings of the local bot.
#[derive(Debug, Clone)]
pub struct LocalBackendConfig {
    /// Dimensions the local bot advertises.
    pub bot_dimensions: DimensionSet,
    /// Root for per-task working and output directories.
    pub work_dir: PathBuf,
    /// Base URL for task view links (`<server>/task?id=<id>`).
    pub server: Option<String>,
    pub bot_id: String,
}

#[derive(Debug, Clone)]
struct LocalTask {
    state: TaskState,
    record: Option<ShardRecord>,
    out_dir: PathBuf,
}

#[derive(Debug)]
struct Inner {
    config: LocalBackendConfig,
    tasks: Mutex<HashMap<String, LocalTask>>,
    /// Request digest -> task id of the successful run it can be deduped to.
    dedup: Mutex<HashMap<String, String>>,
    /// Input reference -> local directory holding the inputs.
    inputs: Mutex<HashMap<String, PathBuf>>,
    counter: AtomicU64,
    cancel: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct LocalBackend {
    inner: Arc<Inner>,
}

impl LocalBackend {
    /// Running processes are killed (state `CANCELED`) when `cancel` fires.
    pub fn new(config: LocalBackendConfig, cancel: CancellationToken) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                tasks: Mutex::new(HashMap::new()),
                dedup: Mutex::new(HashMap::new()),
                inputs: Mutex::new(HashMap::new()),
                counter: AtomicU64::new(0),
                cancel,
            }),
        }
    }

    /// Make `dir` the working tree for slices that reference `input`.
    pub fn register_input(&self, input: &InputRef, dir: PathBuf) {
        lock(&self.inner.inputs).insert(input.as_str().to_string(), dir);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Inner {
    fn next_task_id(&self, request: &ShardRequest) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let mut hasher = blake3::Hasher::new();
        hasher.update(request.name.as_bytes());
        hasher.update(&n.to_le_bytes());
        hasher.update(&nanos.to_le_bytes());
        hasher.finalize().to_hex()[..16].to_string()
    }

    fn view_url(&self, task_id: &str) -> Option<String> {
        self.config
            .server
            .as_ref()
            .map(|server| format!("{}/task?id={task_id}", server.trim_end_matches('/')))
    }

    fn submit(self: &Arc<Self>, request: ShardRequest) -> Result<ShardHandle> {
        if request.trigger.is_some() {
            return Err(ShardrunError::Submission {
                shard_index: request.shard_index,
                message: "the local backend cannot run custom trigger scripts".to_string(),
            });
        }

        let task_id = self.next_task_id(&request);
        let handle = ShardHandle {
            task_id: task_id.clone(),
            shard_index: request.shard_index,
            name: request.name.clone(),
            view_url: self.view_url(&task_id),
            invocation: None,
        };
        let created_ts = now_ts();

        let dedup_key = match request.slices.first() {
            Some(slice) if slice.idempotent => Some(request_digest(&request.slices)?),
            _ => None,
        };
        if let Some(key) = &dedup_key {
            if let Some(task) = self.deduped(key, &task_id, &created_ts) {
                info!(shard = request.shard_index, task_id = %task_id, "deduped against earlier identical task");
                lock(&self.tasks).insert(task_id, task);
                return Ok(handle);
            }
        }

        let out_dir = self.config.work_dir.join(&task_id).join("out");
        let bot = &self.config.bot_dimensions;
        let Some(slice) = request
            .slices
            .iter()
            .find(|s| s.dimensions.is_satisfied_by(bot))
            .cloned()
        else {
            warn!(
                shard = request.shard_index,
                request = %request.name,
                "no slice matches the local bot dimensions; expiring"
            );
            let mut record = ShardRecord::new(&task_id, TaskState::Expired);
            record.created_ts = Some(created_ts);
            lock(&self.tasks).insert(
                task_id,
                LocalTask {
                    state: TaskState::Expired,
                    record: Some(record),
                    out_dir,
                },
            );
            return Ok(handle);
        };

        lock(&self.tasks).insert(
            task_id.clone(),
            LocalTask {
                state: TaskState::Pending,
                record: None,
                out_dir: out_dir.clone(),
            },
        );

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner
                .run_shard(task_id, slice, out_dir, created_ts, dedup_key)
                .await;
        });

        Ok(handle)
    }

    /// A completed copy of an earlier successful run with the same request.
    fn deduped(&self, key: &str, task_id: &str, created_ts: &str) -> Option<LocalTask> {
        let previous_id = lock(&self.dedup).get(key).cloned()?;
        let previous = lock(&self.tasks).get(&previous_id).cloned()?;
        let mut record = previous.record?;
        record.task_id = task_id.to_string();
        record.created_ts = Some(created_ts.to_string());
        record.deduped_from = Some(previous_id);
        Some(LocalTask {
            state: TaskState::Completed,
            record: Some(record),
            out_dir: previous.out_dir,
        })
    }

    fn set_state(&self, task_id: &str, state: TaskState) {
        if let Some(task) = lock(&self.tasks).get_mut(task_id) {
            task.state = state;
        }
    }

    async fn run_shard(
        self: Arc<Self>,
        task_id: String,
        slice: TaskSlice,
        out_dir: PathBuf,
        created_ts: String,
        dedup_key: Option<String>,
    ) {
        self.set_state(&task_id, TaskState::Running);
        let started_ts = now_ts();

        let mut record = match self.execute(&task_id, &slice, &out_dir).await {
            Ok(execution) => {
                let mut record = ShardRecord::new(&task_id, execution.state);
                record.exit_code = execution.exit_code;
                record.duration = Some(execution.runtime.as_secs_f64());
                record
            }
            Err(err) => {
                error!(task_id = %task_id, error = %err, "shard could not be executed");
                let mut record = ShardRecord::new(&task_id, TaskState::BotDied);
                record.internal_failure = true;
                record
            }
        };
        record.created_ts = Some(created_ts);
        record.started_ts = Some(started_ts);
        record.completed_ts = Some(now_ts());
        record.bot_id = Some(self.config.bot_id.clone());

        let succeeded = record.state == TaskState::Completed && record.exit_code == Some(0);
        if let (true, Some(key)) = (succeeded, dedup_key) {
            lock(&self.dedup).insert(key, task_id.clone());
        }

        if let Some(task) = lock(&self.tasks).get_mut(&task_id) {
            task.state = record.state;
            task.record = Some(record);
        }
    }

    fn working_dir(&self, task_id: &str, slice: &TaskSlice) -> PathBuf {
        let root = slice
            .input
            .as_ref()
            .and_then(|input| lock(&self.inputs).get(input.as_str()).cloned())
            .unwrap_or_else(|| self.config.work_dir.join(task_id).join("work"));
        match &slice.relative_cwd {
            Some(rel) => root.join(rel),
            None => root,
        }
    }

    async fn execute(
        &self,
        task_id: &str,
        slice: &TaskSlice,
        out_dir: &Path,
    ) -> anyhow::Result<Execution> {
        let (program, args) = slice
            .command
            .split_first()
            .ok_or_else(|| anyhow!("task {task_id} has an empty command"))?;

        let cwd = self.working_dir(task_id, slice);
        tokio::fs::create_dir_all(&cwd)
            .await
            .with_context(|| format!("creating working dir {cwd:?}"))?;
        tokio::fs::create_dir_all(out_dir)
            .await
            .with_context(|| format!("creating output dir {out_dir:?}"))?;

        let out_dir_str = out_dir.display().to_string();
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&cwd);
        for (key, value) in &slice.env {
            cmd.env(key, value.replace("${ISOLATED_OUTDIR}", &out_dir_str));
        }
        cmd.env(ISOLATED_OUTDIR_ENV, &out_dir_str);
        for (key, prefixes) in &slice.env_prefixes {
            let mut paths: Vec<PathBuf> = prefixes.iter().map(|p| cwd.join(p)).collect();
            if let Some(existing) = std::env::var_os(key) {
                paths.extend(std::env::split_paths(&existing));
            }
            cmd.env(key, std::env::join_paths(paths)?);
        }
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(task_id = %task_id, cmd = ?slice.command, cwd = ?cwd, "starting shard process");

        let started = Instant::now();
        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning process for task {task_id}"))?;

        let (tx, mut rx) = mpsc::channel::<()>(64);
        if let Some(stdout) = child.stdout.take() {
            forward_lines(task_id, "stdout", stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(task_id, "stderr", stderr, tx.clone());
        }
        drop(tx);

        let io_timeout = Duration::from_secs(slice.timeouts.io_timeout_secs);
        let hard_deadline = started + Duration::from_secs(slice.timeouts.hard_timeout_secs);
        let mut io_deadline = started + io_timeout;
        let mut output_open = true;

        loop {
            let deadline = hard_deadline.min(io_deadline);
            tokio::select! {
                status = child.wait() => {
                    let status = status.with_context(|| format!("waiting for task {task_id}"))?;
                    let code = status.code().unwrap_or(-1);
                    info!(task_id = %task_id, exit_code = code, "shard process exited");
                    return Ok(Execution {
                        state: TaskState::Completed,
                        exit_code: Some(i64::from(code)),
                        runtime: started.elapsed(),
                    });
                }

                line = rx.recv(), if output_open => {
                    match line {
                        Some(()) => io_deadline = Instant::now() + io_timeout,
                        None => output_open = false,
                    }
                }

                _ = tokio::time::sleep_until(deadline) => {
                    let reason = if deadline == hard_deadline { "hard timeout" } else { "io timeout" };
                    warn!(task_id = %task_id, reason, "shard exceeded its timeout; killing process");
                    kill(&mut child, task_id).await;
                    return Ok(Execution {
                        state: TaskState::TimedOut,
                        exit_code: None,
                        runtime: started.elapsed(),
                    });
                }

                _ = self.cancel.cancelled() => {
                    info!(task_id = %task_id, "cancellation requested; killing shard process");
                    kill(&mut child, task_id).await;
                    return Ok(Execution {
                        state: TaskState::Canceled,
                        exit_code: None,
                        runtime: started.elapsed(),
                    });
                }
            }
        }
    }

    fn fetch(&self, task_ids: &[String], output_dir: &Path) -> anyhow::Result<Vec<Option<ShardRecord>>> {
        let mut records = Vec::with_capacity(task_ids.len());
        for task_id in task_ids {
            let task = lock(&self.tasks).get(task_id).cloned();
            let Some(LocalTask {
                record: Some(record),
                out_dir,
                ..
            }) = task
            else {
                records.push(None);
                continue;
            };
            if out_dir.is_dir() {
                copy_dir(&out_dir, &output_dir.join(task_id))?;
            }
            records.push(Some(record));
        }
        Ok(records)
    }
}

struct Execution {
    state: TaskState,
    exit_code: Option<i64>,
    runtime: Duration,
}

async fn kill(child: &mut tokio::process::Child, task_id: &str) {
    if let Err(e) = child.kill().await {
        warn!(task_id = %task_id, error = %e, "failed to kill shard process");
    }
}

/// Log each output line and signal activity for the io timeout.
fn forward_lines<R>(task_id: &str, stream: &'static str, reader: R, tx: mpsc::Sender<()>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let task_id = task_id.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(task_id = %task_id, stream, "{}", line);
            let _ = tx.send(()).await;
        }
    });
}

fn request_digest(slices: &[TaskSlice]) -> Result<String> {
    let bytes = serde_json::to_vec(slices)?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

fn now_ts() -> String {
    let format = format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]"
    );
    OffsetDateTime::now_utc().format(format).unwrap_or_default()
}

fn copy_dir(from: &Path, to: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(to).with_context(|| format!("creating dir {to:?}"))?;
    for entry in std::fs::read_dir(from).with_context(|| format!("reading dir {from:?}"))? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)
                .with_context(|| format!("copying {:?} to {target:?}", entry.path()))?;
        }
    }
    Ok(())
}

impl TaskBackend for LocalBackend {
    fn submit(&self, request: ShardRequest) -> BoxFuture<'_, Result<ShardHandle>> {
        Box::pin(async move { self.inner.submit(request) })
    }

    fn poll_states(&self, task_ids: Vec<String>) -> BoxFuture<'_, Result<Vec<Option<TaskState>>>> {
        Box::pin(async move {
            let tasks = lock(&self.inner.tasks);
            Ok(task_ids
                .iter()
                .map(|id| tasks.get(id).map(|t| t.state))
                .collect())
        })
    }

    fn fetch_results(
        &self,
        task_ids: Vec<String>,
        output_dir: PathBuf,
    ) -> BoxFuture<'_, Result<Vec<Option<ShardRecord>>>> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            let records = tokio::task::spawn_blocking(move || inner.fetch(&task_ids, &output_dir))
                .await
                .map_err(|e| anyhow!("fetching results panicked: {e}"))??;
            Ok(records)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Timeouts;
    use std::collections::BTreeMap;

    fn backend(dir: &Path) -> LocalBackend {
        LocalBackend::new(
            LocalBackendConfig {
                bot_dimensions: DimensionSet::from_pairs([("os", "Linux"), ("pool", "local")]),
                work_dir: dir.to_path_buf(),
                server: Some("https://tasks.example.com".into()),
                bot_id: "local-bot".into(),
            },
            CancellationToken::new(),
        )
    }

    fn request(command: &[&str], dims: &[(&str, &str)]) -> ShardRequest {
        ShardRequest {
            name: "t".into(),
            shard_index: 0,
            total_shards: 1,
            priority: 200,
            user: None,
            service_account: None,
            tags: Vec::new(),
            slices: vec![TaskSlice {
                command: command.iter().map(|s| s.to_string()).collect(),
                relative_cwd: None,
                input: None,
                dimensions: DimensionSet::from_pairs(dims.iter().copied()),
                env: BTreeMap::new(),
                env_prefixes: BTreeMap::new(),
                timeouts: Timeouts {
                    expiration_secs: 60,
                    io_timeout_secs: 60,
                    hard_timeout_secs: 60,
                },
                idempotent: false,
                cipd_packages: Vec::new(),
                named_caches: BTreeMap::new(),
                wait_for_capacity: false,
            }],
            trigger: None,
        }
    }

    async fn wait_terminal(backend: &LocalBackend, id: &str) -> TaskState {
        loop {
            let states = backend.poll_states(vec![id.to_string()]).await.unwrap();
            if let Some(state) = states[0].filter(|s| s.is_terminal()) {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn unmatched_dimensions_expire() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        let handle = backend
            .submit(request(&["true"], &[("os", "Windows")]))
            .await
            .unwrap();

        assert_eq!(
            handle.view_url.as_deref(),
            Some(format!("https://tasks.example.com/task?id={}", handle.task_id).as_str())
        );
        assert_eq!(wait_terminal(&backend, &handle.task_id).await, TaskState::Expired);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_exit_code_and_outputs_are_collected() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        let handle = backend
            .submit(request(
                &["sh", "-c", "echo '{\"ok\":1}' > \"$ISOLATED_OUTDIR/output.json\"; exit 3"],
                &[("os", "Linux")],
            ))
            .await
            .unwrap();
        assert_eq!(wait_terminal(&backend, &handle.task_id).await, TaskState::Completed);

        let collected = dir.path().join("collected");
        let records = backend
            .fetch_results(vec![handle.task_id.clone()], collected.clone())
            .await
            .unwrap();
        let record = records[0].as_ref().unwrap();
        assert_eq!(record.exit_code, Some(3));
        assert!(record.started_ts.is_some());
        assert!(collected.join(&handle.task_id).join("output.json").is_file());
    }

    #[tokio::test]
    async fn spawn_failure_is_internal_failure() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        let handle = backend
            .submit(request(&["/nonexistent/binary"], &[("os", "Linux")]))
            .await
            .unwrap();
        wait_terminal(&backend, &handle.task_id).await;

        let records = backend
            .fetch_results(vec![handle.task_id.clone()], dir.path().join("c"))
            .await
            .unwrap();
        assert!(records[0].as_ref().unwrap().internal_failure);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn idempotent_success_is_deduped() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        let mut req = request(&["true"], &[("os", "Linux")]);
        req.slices[0].idempotent = true;

        let first = backend.submit(req.clone()).await.unwrap();
        wait_terminal(&backend, &first.task_id).await;
        let second = backend.submit(req).await.unwrap();

        let records = backend
            .fetch_results(vec![second.task_id.clone()], dir.path().join("c"))
            .await
            .unwrap();
        let record = records[0].as_ref().unwrap();
        assert_eq!(record.deduped_from.as_deref(), Some(first.task_id.as_str()));
        assert_eq!(record.task_id, second.task_id);
    }
}
