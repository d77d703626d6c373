// src/dispatch/shard.rs

//! Per-shard request construction.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::errors::{Result, ShardrunError};
use crate::request::{TaskSlice, TaskSpec};

pub const GTEST_SHARD_INDEX: &str = "GTEST_SHARD_INDEX";
pub const GTEST_TOTAL_SHARDS: &str = "GTEST_TOTAL_SHARDS";

/// Invocation of a custom trigger script for one submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggerInvocation {
    pub script: String,
    /// Script args followed by the shard selection flags.
    pub args: Vec<String>,
}

/// One remote submission.
///
/// `slices` are tried in order; each later slice is a fallback the
/// scheduler switches to once the previous one expires.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShardRequest {
    pub name: String,
    pub shard_index: u32,
    pub total_shards: u32,
    pub priority: u8,
    pub user: Option<String>,
    pub service_account: Option<String>,
    pub tags: Vec<String>,
    pub slices: Vec<TaskSlice>,
    pub trigger: Option<TriggerInvocation>,
}

impl ShardRequest {
    pub fn primary(&self) -> Option<&TaskSlice> {
        self.slices.first()
    }
}

/// Request name for one shard: the title, suffixed `:<shards>:<index>` when
/// the task is sharded.
pub fn shard_request_name(spec: &TaskSpec, index: u32) -> String {
    if spec.shards > 1 {
        format!("{}:{}:{}", spec.title, spec.shards, index)
    } else {
        spec.title.clone()
    }
}

/// Build the requests for every index in `spec.shard_indices`, in ascending
/// index order.
pub fn build_shard_requests(spec: &TaskSpec, tags: &BTreeSet<String>) -> Result<Vec<ShardRequest>> {
    if let Some(trigger) = &spec.trigger_script {
        if !spec.optional_dimensions.is_empty() {
            return Err(ShardrunError::InvalidConfig(format!(
                "task '{}': a custom trigger script cannot be combined with optional dimensions",
                spec.title
            )));
        }
        if trigger.requires_simultaneous_shard_dispatch {
            if trigger.script.ends_with("swarming.py") {
                return Err(ShardrunError::InvalidConfig(format!(
                    "task '{}': trigger script must be a custom script, {} does not support --shards",
                    spec.title, trigger.script
                )));
            }
            let all: BTreeSet<u32> = (0..spec.shards).collect();
            if spec.shard_indices != all {
                return Err(ShardrunError::InvariantViolation(format!(
                    "task '{}': simultaneous shard dispatch requires all {} shards, got {:?}",
                    spec.title, spec.shards, spec.shard_indices
                )));
            }
        }
    }

    let tags: Vec<String> = tags.iter().cloned().collect();
    let primary = spec.primary_slice().with_extra_args(&spec.extra_args);

    let requests = spec
        .shard_indices
        .iter()
        .map(|&index| {
            let mut slice = primary.clone();
            let mut trigger = None;

            match &spec.trigger_script {
                Some(script) => {
                    let mut args = script.args.clone();
                    if spec.shards > 1 {
                        if !script.requires_simultaneous_shard_dispatch {
                            args.push("--shard-index".to_string());
                            args.push(index.to_string());
                        }
                        args.push("--shards".to_string());
                        args.push(spec.shards.to_string());
                    }
                    trigger = Some(TriggerInvocation {
                        script: script.script.clone(),
                        args,
                    });
                }
                None if spec.shards > 1 => {
                    slice = slice
                        .with_env_var(GTEST_SHARD_INDEX, index.to_string())
                        .with_env_var(GTEST_TOTAL_SHARDS, spec.shards.to_string());
                }
                None => {}
            }

            ShardRequest {
                name: shard_request_name(spec, index),
                shard_index: index,
                total_shards: spec.shards,
                priority: spec.priority,
                user: spec.user.clone(),
                service_account: spec.service_account.clone(),
                tags: tags.clone(),
                slices: with_fallback_slices(slice, spec),
                trigger,
            }
        })
        .collect();

    Ok(requests)
}

/// Primary slice followed by one slice per optional-dimension entry, in
/// ascending order of relative expiration.
///
/// Each fallback starts from the previous slice's dimensions, and its
/// expiration is cumulative so the whole chain shares one deadline budget.
fn with_fallback_slices(primary: TaskSlice, spec: &TaskSpec) -> Vec<TaskSlice> {
    let mut cumulative = primary.timeouts.expiration_secs;
    let mut slices = vec![primary];

    for (relative, dimensions) in &spec.optional_dimensions {
        cumulative += relative;
        let previous = slices[slices.len() - 1].clone();
        slices.push(
            previous
                .with_dimensions(dimensions)
                .with_expiration_secs(cumulative),
        );
    }

    slices
}
