// src/dispatch/mod.rs

//! Shard dispatch: turning one [`TaskSpec`] into 1..N remote submissions.
//!
//! - [`shard`]: per-shard request construction (shard env, fallback slices).
//! - [`tags`]: analytics tags attached to every shard.
//! - [`naming`]: step names shown to humans.
//! - [`trigger`]: submission through a [`TaskBackend`](crate::backend::TaskBackend).

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::request::TaskSpec;

pub mod naming;
pub mod shard;
pub mod tags;
pub mod trigger;

pub use naming::step_name;
pub use shard::{build_shard_requests, ShardRequest, TriggerInvocation};
pub use tags::task_tags;
pub use trigger::submit_shards;

/// Handle to one submitted remote task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardHandle {
    pub task_id: String,
    pub shard_index: u32,
    /// Request name the shard was submitted under.
    pub name: String,
    pub view_url: Option<String>,
    /// Result-sink invocation, when the backend creates one.
    pub invocation: Option<String>,
}

/// A custom script that submits shards instead of the default client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerScript {
    pub script: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// All shards must go out in a single call (device-affinity triggers).
    #[serde(default)]
    pub requires_simultaneous_shard_dispatch: bool,
}

/// A triggered task: its spec plus one handle per submitted shard.
#[derive(Debug, Clone)]
pub struct DispatchedTask {
    pub spec: TaskSpec,
    pub trigger_output: BTreeMap<u32, ShardHandle>,
    /// Shards whose last collected outcome was not OK.
    ///
    /// Updated in place by every collect, even when the collect returns an
    /// error, so callers can always build a retry.
    pub failed_shards: BTreeSet<u32>,
    /// Human-readable step name, e.g. `unit_tests on Ubuntu`.
    pub step_name: String,
}

impl DispatchedTask {
    pub fn new(spec: TaskSpec, trigger_output: BTreeMap<u32, ShardHandle>, step_name: String) -> Self {
        Self {
            spec,
            trigger_output,
            failed_shards: BTreeSet::new(),
            step_name,
        }
    }

    pub fn task_name(&self) -> String {
        self.spec.task_name()
    }

    /// Task ids dispatched by this task (not inherited from a retried one).
    pub fn dispatched_task_ids(&self) -> BTreeSet<&str> {
        self.trigger_output
            .values()
            .map(|h| h.task_id.as_str())
            .collect()
    }
}
