// src/engine/mod.rs

//! Dispatch-and-collect engine.
//!
//! One [`Engine`] lives for one build invocation and ties together:
//! - the task defaults every request starts from
//! - the pending-task set (trigger and collect must alternate per task)
//! - the task backend shards are submitted to
//! - the merge stage run at the end of every collect
//! - engine-wide shard statistics
//!
//! The pure bookkeeping lives in [`core`]; the async/IO shell is
//! implemented in [`runtime`].

use std::path::PathBuf;

use crate::collect::PollConfig;

pub mod core;
pub mod runtime;

pub use core::EngineCore;
pub use runtime::{Engine, SUMMARY_FILE};

/// Engine options that do not change between tasks.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Root of per-task output directories.
    pub output_dir: PathBuf,
    /// Show `isolated out` links in the collect presentation.
    pub show_outputs_ref: bool,
    pub poll: PollConfig,
    pub verbose: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("shardrun-out"),
            show_outputs_ref: true,
            poll: PollConfig::default(),
            verbose: false,
        }
    }
}

/// Directory name derived from a task identity.
pub(crate) fn sanitize_dir_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' => c,
            _ => '_',
        })
        .collect();
    cleaned.trim_matches('_').to_string()
}
