// src/dispatch/trigger.rs

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::backend::TaskBackend;
use crate::dispatch::{ShardHandle, ShardRequest};
use crate::errors::{Result, ShardFailure, ShardrunError};

/// Submit shard requests in ascending index order.
///
/// Submission is fail-fast: the first shard that cannot be submitted stops
/// the batch, and shards already submitted are left running. With
/// `simultaneous` set, all requests go out in a single backend call.
pub async fn submit_shards<B>(
    backend: &B,
    requests: Vec<ShardRequest>,
    simultaneous: bool,
) -> Result<BTreeMap<u32, ShardHandle>>
where
    B: TaskBackend + ?Sized,
{
    let expected: Vec<u32> = requests.iter().map(|r| r.shard_index).collect();
    let mut trigger_output = BTreeMap::new();

    if simultaneous {
        debug!(shards = expected.len(), "submitting all shards in one call");
        let handles = backend.submit_all(requests).await.map_err(|err| {
            as_submission_error(expected.first().copied().unwrap_or_default(), err)
        })?;
        for handle in handles {
            trigger_output.insert(handle.shard_index, handle);
        }
    } else {
        for request in requests {
            let index = request.shard_index;
            let name = request.name.clone();
            match backend.submit(request).await {
                Ok(handle) => {
                    info!(
                        shard = index,
                        request = %name,
                        task_id = %handle.task_id,
                        "shard submitted"
                    );
                    trigger_output.insert(index, handle);
                }
                Err(err) => {
                    warn!(shard = index, request = %name, error = %err, "shard submission failed");
                    return Err(as_submission_error(index, err));
                }
            }
        }
    }

    let missing: Vec<ShardFailure> = expected
        .iter()
        .filter(|i| !trigger_output.contains_key(i))
        .map(|&i| ShardFailure::new(i, "not triggered"))
        .collect();
    if !missing.is_empty() || trigger_output.len() != expected.len() {
        return Err(ShardrunError::InfraFailure {
            failures: if missing.is_empty() {
                vec![ShardFailure::new(
                    0,
                    format!(
                        "wrong number of triggered tasks, expected {} got {}",
                        expected.len(),
                        trigger_output.len()
                    ),
                )]
            } else {
                missing
            },
            verdict: None,
        });
    }

    Ok(trigger_output)
}

fn as_submission_error(shard_index: u32, err: ShardrunError) -> ShardrunError {
    match err {
        ShardrunError::Submission { .. }
        | ShardrunError::InvalidConfig(_)
        | ShardrunError::InvariantViolation(_)
        | ShardrunError::Cancelled => err,
        other => ShardrunError::Submission {
            shard_index,
            message: other.to_string(),
        },
    }
}
