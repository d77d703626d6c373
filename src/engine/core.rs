// src/engine/core.rs

//! Pure engine bookkeeping.
//!
//! This owns everything that must survive between `trigger` and `collect`
//! calls of one build invocation:
//! - the task defaults and build identity
//! - the pending-task set guarding against double trigger / double collect
//! - shard runtimes for the end-of-build statistics
//!
//! It performs no IO; the async shell in [`super::runtime`] locks it only
//! for short, non-awaiting sections.

use std::collections::BTreeSet;

use tracing::debug;

use crate::collect::EngineStats;
use crate::errors::{Result, ShardrunError};
use crate::request::{build_task_spec, BuildInfo, EngineDefaults, TaskParams, TaskSpec};

#[derive(Debug, Default)]
pub struct EngineCore {
    defaults: EngineDefaults,
    build: BuildInfo,
    pending: BTreeSet<String>,
    shard_durations: Vec<f64>,
}

impl EngineCore {
    pub fn new(build: BuildInfo) -> Result<Self> {
        let mut defaults = EngineDefaults::default();
        for tag in build.initial_tags() {
            defaults.add_tag(&tag)?;
        }
        Ok(Self {
            defaults,
            build,
            pending: BTreeSet::new(),
            shard_durations: Vec::new(),
        })
    }

    pub fn defaults(&self) -> &EngineDefaults {
        &self.defaults
    }

    pub fn defaults_mut(&mut self) -> &mut EngineDefaults {
        &mut self.defaults
    }

    pub fn build(&self) -> &BuildInfo {
        &self.build
    }

    pub fn build_spec(&self, params: TaskParams) -> Result<TaskSpec> {
        build_task_spec(&self.defaults, &self.build, params)
    }

    /// Mark `task_name` as triggered.
    ///
    /// The entry stays even if submission later fails: a half-submitted
    /// task must not be triggered again under the same identity.
    pub fn begin_trigger(&mut self, task_name: &str) -> Result<()> {
        if !self.pending.insert(task_name.to_string()) {
            return Err(ShardrunError::InvariantViolation(format!(
                "triggered same task twice: {task_name}"
            )));
        }
        debug!(task = %task_name, pending = self.pending.len(), "task marked pending");
        Ok(())
    }

    /// Remove `task_name` from the pending set before collecting it.
    pub fn begin_collect(&mut self, task_name: &str) -> Result<()> {
        if !self.pending.remove(task_name) {
            return Err(ShardrunError::InvariantViolation(format!(
                "collecting task that is not pending (never triggered or already collected): {task_name}"
            )));
        }
        Ok(())
    }

    pub fn is_pending(&self, task_name: &str) -> bool {
        self.pending.contains(task_name)
    }

    pub fn pending(&self) -> impl Iterator<Item = &str> {
        self.pending.iter().map(String::as_str)
    }

    pub fn record_shard_durations<I: IntoIterator<Item = f64>>(&mut self, durations: I) {
        self.shard_durations.extend(durations);
    }

    /// Statistics over every shard collected so far.
    pub fn stats(&self) -> Option<EngineStats> {
        EngineStats::from_durations(&self.shard_durations)
    }
}
