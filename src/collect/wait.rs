// src/collect/wait.rs

//! The single blocking point of the engine: waiting for shards to finish.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::backend::TaskBackend;
use crate::errors::{Result, ShardrunError};
use crate::types::TaskState;

/// Backoff between polls of the task service.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl PollConfig {
    /// Delay after `attempts` unsuccessful polls, capped at `max_delay`.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempts.min(64) as i32);
        let secs = self.initial_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Wait until at least one of `task_sets` has every task in a terminal state.
///
/// Returns the finished sets and the updated attempt counter. Callers that
/// wait repeatedly pass the counter back so the backoff survives across
/// calls. An empty set counts as finished, and so does a task id the
/// service no longer knows: its result fetch comes back empty and the
/// shard is classified as missing.
pub async fn wait_for_finished_task_set<B>(
    backend: &B,
    task_sets: &[Vec<String>],
    mut attempts: u32,
    poll: &PollConfig,
    cancel: &CancellationToken,
) -> Result<(Vec<Vec<String>>, u32)>
where
    B: TaskBackend + ?Sized,
{
    loop {
        if cancel.is_cancelled() {
            return Err(ShardrunError::Cancelled);
        }

        let mut finished = Vec::new();
        for set in task_sets {
            let states = backend.poll_states(set.clone()).await?;
            trace!(?set, ?states, "polled task states");
            if states.iter().all(|s| s.is_none_or(TaskState::is_terminal)) {
                finished.push(set.clone());
            }
        }

        if !finished.is_empty() || task_sets.is_empty() {
            return Ok((finished, attempts));
        }

        let delay = poll.delay_for(attempts);
        debug!(attempts, delay_ms = delay.as_millis() as u64, "no task set finished yet; backing off");
        attempts = attempts.saturating_add(1);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => return Err(ShardrunError::Cancelled),
        }
    }
}
