use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use shardrun::backend::{BoxFuture, TaskBackend};
use shardrun::collect::ShardRecord;
use shardrun::dispatch::{ShardHandle, ShardRequest};
use shardrun::errors::{Result, ShardrunError};
use shardrun::types::TaskState;

/// What a scripted shard does once submitted.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// COMPLETED with exit code 0 and an `output.json`.
    Success,
    /// COMPLETED with the given exit code and an `output.json`.
    ExitCode(i64),
    /// Terminal state without an exit code (EXPIRED, TIMED_OUT, ...).
    State(TaskState),
    /// BOT_DIED with `internal_failure` set.
    InternalFailure,
    /// The service has no result for the task at all.
    NoResult,
    /// The service forgets the task: polls and fetches both answer `None`.
    Unknown,
    /// Serve this record verbatim (its `task_id` is replaced).
    Record(ShardRecord),
}

#[derive(Debug)]
struct FakeTask {
    shard_index: u32,
    outcome: Outcome,
    polls_left: u32,
}

#[derive(Debug, Default)]
struct State {
    submissions: Vec<ShardRequest>,
    batch_sizes: Vec<usize>,
    scripted: HashMap<u32, VecDeque<Outcome>>,
    tasks: HashMap<String, FakeTask>,
    fail_submission: Option<usize>,
    polls_before_done: u32,
    poll_calls: usize,
    next_id: u64,
}

/// A fake task service that:
/// - records every submitted shard request,
/// - hands out ids `fake-<n>` and view URLs,
/// - serves scripted outcomes per shard index (first submission of shard 2
///   takes the first outcome scripted for shard 2, a retry the next one),
/// - defaults to `Outcome::Success` for unscripted shards.
#[derive(Debug, Clone, Default)]
pub struct FakeBackend {
    state: Arc<Mutex<State>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `outcome` for the next submission of `shard_index`.
    pub fn script(&self, shard_index: u32, outcome: Outcome) -> &Self {
        self.state
            .lock()
            .unwrap()
            .scripted
            .entry(shard_index)
            .or_default()
            .push_back(outcome);
        self
    }

    /// Fail the `n`-th (0-based) single-shard submission with a transport error.
    pub fn fail_submission(&self, n: usize) -> &Self {
        self.state.lock().unwrap().fail_submission = Some(n);
        self
    }

    /// Report tasks as RUNNING for this many polls before they finish.
    pub fn polls_before_done(&self, polls: u32) -> &Self {
        self.state.lock().unwrap().polls_before_done = polls;
        self
    }

    pub fn submissions(&self) -> Vec<ShardRequest> {
        self.state.lock().unwrap().submissions.clone()
    }

    pub fn submitted_indices(&self) -> Vec<u32> {
        self.submissions().iter().map(|r| r.shard_index).collect()
    }

    /// Sizes of `submit_all` calls.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.state.lock().unwrap().batch_sizes.clone()
    }

    pub fn poll_calls(&self) -> usize {
        self.state.lock().unwrap().poll_calls
    }

    fn submit_one(&self, request: ShardRequest) -> Result<ShardHandle> {
        let mut state = self.state.lock().unwrap();
        let call = state.submissions.len();
        if state.fail_submission == Some(call) {
            return Err(anyhow::anyhow!("connection reset while submitting {}", request.name).into());
        }

        state.next_id += 1;
        let task_id = format!("fake-{}", state.next_id);
        let index = request.shard_index;
        let outcome = state
            .scripted
            .get_mut(&index)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Outcome::Success);
        let polls_left = state.polls_before_done;
        state.tasks.insert(
            task_id.clone(),
            FakeTask {
                shard_index: index,
                outcome,
                polls_left,
            },
        );
        let name = request.name.clone();
        state.submissions.push(request);

        Ok(ShardHandle {
            view_url: Some(format!("https://fake.example.com/task?id={task_id}")),
            task_id,
            shard_index: index,
            name,
            invocation: None,
        })
    }

    fn record_for(task_id: &str, task: &FakeTask) -> Option<ShardRecord> {
        let completed = |exit_code: i64| {
            let mut record = ShardRecord::new(task_id, TaskState::Completed);
            record.exit_code = Some(exit_code);
            record.created_ts = Some("2024-01-01T00:00:00".into());
            record.started_ts = Some("2024-01-01T00:00:05".into());
            record.completed_ts = Some("2024-01-01T00:01:05".into());
            record.duration = Some(50.0);
            record
        };
        match &task.outcome {
            Outcome::Success => Some(completed(0)),
            Outcome::ExitCode(code) => Some(completed(*code)),
            Outcome::State(state) => Some(ShardRecord::new(task_id, *state)),
            Outcome::InternalFailure => {
                let mut record = ShardRecord::new(task_id, TaskState::BotDied);
                record.internal_failure = true;
                Some(record)
            }
            Outcome::NoResult | Outcome::Unknown => None,
            Outcome::Record(record) => {
                let mut record = record.clone();
                record.task_id = task_id.to_string();
                Some(record)
            }
        }
    }
}

impl TaskBackend for FakeBackend {
    fn submit(&self, request: ShardRequest) -> BoxFuture<'_, Result<ShardHandle>> {
        Box::pin(async move { self.submit_one(request) })
    }

    fn submit_all(&self, requests: Vec<ShardRequest>) -> BoxFuture<'_, Result<Vec<ShardHandle>>> {
        Box::pin(async move {
            self.state.lock().unwrap().batch_sizes.push(requests.len());
            requests.into_iter().map(|r| self.submit_one(r)).collect()
        })
    }

    fn poll_states(&self, task_ids: Vec<String>) -> BoxFuture<'_, Result<Vec<Option<TaskState>>>> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            state.poll_calls += 1;
            let states = task_ids
                .iter()
                .map(|id| {
                    let task = state.tasks.get_mut(id)?;
                    if let Outcome::Unknown = task.outcome {
                        return None;
                    }
                    if task.polls_left > 0 {
                        task.polls_left -= 1;
                        return Some(TaskState::Running);
                    }
                    Some(match &task.outcome {
                        Outcome::Success | Outcome::ExitCode(_) | Outcome::NoResult => {
                            TaskState::Completed
                        }
                        Outcome::State(s) => *s,
                        Outcome::InternalFailure => TaskState::BotDied,
                        Outcome::Record(r) => r.state,
                        Outcome::Unknown => return None,
                    })
                })
                .collect();
            Ok(states)
        })
    }

    fn fetch_results(
        &self,
        task_ids: Vec<String>,
        output_dir: PathBuf,
    ) -> BoxFuture<'_, Result<Vec<Option<ShardRecord>>>> {
        Box::pin(async move {
            let state = self.state.lock().unwrap();
            let mut records = Vec::with_capacity(task_ids.len());
            for id in &task_ids {
                let Some(task) = state.tasks.get(id) else {
                    records.push(None);
                    continue;
                };
                let record = Self::record_for(id, task);
                if let Outcome::Success | Outcome::ExitCode(_) = task.outcome {
                    let dir = output_dir.join(id);
                    std::fs::create_dir_all(&dir).map_err(ShardrunError::from)?;
                    let body = serde_json::json!({ "shard": task.shard_index, "passed": true });
                    std::fs::write(dir.join("output.json"), body.to_string())?;
                }
                records.push(record);
            }
            Ok(records)
        })
    }
}
