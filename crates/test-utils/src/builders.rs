#![allow(dead_code)]

use std::path::Path;
use std::time::Duration;

use shardrun::collect::PollConfig;
use shardrun::dispatch::TriggerScript;
use shardrun::engine::EngineOptions;
use shardrun::merge::MergeScript;
use shardrun::request::TaskParams;

/// Engine options for tests: output under `output_dir`, millisecond polling.
pub fn fast_options(output_dir: &Path) -> EngineOptions {
    EngineOptions {
        output_dir: output_dir.to_path_buf(),
        show_outputs_ref: true,
        poll: PollConfig {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
        },
        verbose: false,
    }
}

/// Builder for `TaskParams`.
///
/// Starts as a one-shard `Linux` task running `./run_tests`.
pub struct TaskParamsBuilder {
    params: TaskParams,
}

impl TaskParamsBuilder {
    pub fn new(title: &str) -> Self {
        let mut params = TaskParams::new(title, vec!["./run_tests".to_string()]);
        params
            .dimensions
            .insert("os".to_string(), Some("Linux".to_string()));
        Self { params }
    }

    pub fn command(mut self, command: &[&str]) -> Self {
        self.params.command = command.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn shards(mut self, shards: u32) -> Self {
        self.params.shards = shards;
        self
    }

    pub fn dimension(mut self, key: &str, value: Option<&str>) -> Self {
        self.params
            .dimensions
            .insert(key.to_string(), value.map(str::to_string));
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.params.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn optional_dimension(mut self, expiration_secs: u64, key: &str, value: &str) -> Self {
        self.params
            .optional_dimensions
            .entry(expiration_secs)
            .or_default()
            .insert(key.to_string(), Some(value.to_string()));
        self
    }

    pub fn expiration(mut self, secs: u64) -> Self {
        self.params.expiration_secs = Some(secs);
        self
    }

    pub fn hard_timeout(mut self, secs: u64) -> Self {
        self.params.hard_timeout_secs = Some(secs);
        self
    }

    pub fn io_timeout(mut self, secs: u64) -> Self {
        self.params.io_timeout_secs = Some(secs);
        self
    }

    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.params.idempotent = Some(idempotent);
        self
    }

    pub fn merge(mut self, script: &str, args: &[&str]) -> Self {
        self.params.merge = Some(MergeScript {
            script: script.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        });
        self
    }

    pub fn trigger_script(mut self, script: &str, simultaneous: bool) -> Self {
        self.params.trigger_script = Some(TriggerScript {
            script: script.to_string(),
            args: Vec::new(),
            requires_simultaneous_shard_dispatch: simultaneous,
        });
        self
    }

    pub fn tag(mut self, tag: &str) -> Self {
        self.params.tags.push(tag.to_string());
        self
    }

    pub fn build(self) -> TaskParams {
        self.params
    }
}
