// src/collect/mod.rs

//! Result collection.
//!
//! The pure parts (classification, verdict assembly, timing stats) live in
//! their own modules so they can be tested without a backend. The only
//! blocking operation is [`wait::wait_for_finished_task_set`].

pub mod classify;
pub mod record;
pub mod stats;
pub mod verdict;
pub mod wait;

pub use classify::{classify, ShardOutcome};
pub use record::{parse_timestamp, OutputsRef, ShardRecord};
pub use stats::{fmt_time, EngineStats, TimeStats};
pub use verdict::{
    apply_merge_output, assemble_verdict, CollectOptions, CollectVerdict, CollectedShard, Link,
    PresentationOptions, StepPresentation,
};
pub use wait::{wait_for_finished_task_set, PollConfig};
