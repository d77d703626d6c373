// src/retry.rs

//! Retrying failed shards without re-running passing ones.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::dispatch::{DispatchedTask, ShardHandle};
use crate::errors::{Result, ShardrunError};
use crate::request::TaskSpec;

/// Combined shard handles of a retry task and the task it retries.
///
/// Starts from the old task's full view (itself merged when the old task
/// was a retry too) and overwrites every shard the new task dispatched. The
/// result must cover exactly `0..shards`.
pub fn merge_trigger_output(
    new_task: &DispatchedTask,
    old_task: &DispatchedTask,
) -> Result<BTreeMap<u32, ShardHandle>> {
    if new_task.spec.shards != old_task.spec.shards {
        return Err(ShardrunError::InvariantViolation(format!(
            "retry of '{}' changed the shard count from {} to {}",
            new_task.spec.title, old_task.spec.shards, new_task.spec.shards
        )));
    }

    let mut merged = effective_trigger_output(old_task)?;
    for (index, handle) in &new_task.trigger_output {
        merged.insert(*index, handle.clone());
    }

    let complete = merged.len() == new_task.spec.shards as usize
        && merged.keys().copied().eq(0..new_task.spec.shards);
    if !complete {
        return Err(ShardrunError::InvariantViolation(format!(
            "merged trigger output of '{}' covers shards {:?}, expected 0..{}",
            new_task.spec.title,
            merged.keys().collect::<Vec<_>>(),
            new_task.spec.shards
        )));
    }

    debug!(
        task = %new_task.spec.title,
        retried = new_task.trigger_output.len(),
        total = merged.len(),
        "merged retry trigger output"
    );
    Ok(merged)
}

/// Handles the collector reads for `task`: its own trigger output, or the
/// merged view when it retries an earlier task.
pub fn effective_trigger_output(task: &DispatchedTask) -> Result<BTreeMap<u32, ShardHandle>> {
    match &task.spec.task_to_retry {
        Some(old) => merge_trigger_output(task, old),
        None => Ok(task.trigger_output.clone()),
    }
}

/// Spec that re-dispatches only the failed shards of `old`.
pub fn retry_spec(old: Arc<DispatchedTask>) -> Result<TaskSpec> {
    if old.failed_shards.is_empty() {
        return Err(ShardrunError::InvariantViolation(format!(
            "task '{}' has no failed shards to retry",
            old.spec.title
        )));
    }
    let mut spec = old.spec.clone();
    spec.shard_indices = old.failed_shards.clone();
    spec.task_to_retry = Some(old);
    Ok(spec)
}
