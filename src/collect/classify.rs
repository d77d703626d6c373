// src/collect/classify.rs

//! Per-shard outcome classification.

use std::fmt;

use serde::Serialize;

use crate::collect::record::ShardRecord;
use crate::types::{StepStatus, TaskState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShardOutcome {
    Ok,
    FailedExitNonzero,
    TimedOut,
    Expired,
    InternalFailure,
    Missing,
}

impl ShardOutcome {
    /// Infra problem rather than a test failure.
    pub fn is_infra(self) -> bool {
        matches!(
            self,
            ShardOutcome::Missing | ShardOutcome::InternalFailure | ShardOutcome::Expired
        )
    }

    /// The shard produced no meaningful test signal.
    pub fn invalidates_results(self) -> bool {
        matches!(
            self,
            ShardOutcome::Missing
                | ShardOutcome::InternalFailure
                | ShardOutcome::Expired
                | ShardOutcome::TimedOut
        )
    }

    pub fn status(self) -> StepStatus {
        match self {
            ShardOutcome::Ok => StepStatus::Success,
            outcome if outcome.is_infra() => StepStatus::Exception,
            _ => StepStatus::Failure,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            ShardOutcome::Ok => "ok",
            ShardOutcome::FailedExitNonzero => "non-zero exit code",
            ShardOutcome::TimedOut => "timed out",
            ShardOutcome::Expired => "expired, not enough capacity",
            ShardOutcome::InternalFailure => "internal failure",
            ShardOutcome::Missing => "details unknown (missing shard results)",
        }
    }
}

impl fmt::Display for ShardOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}

/// First match wins: missing, internal failure, expired, timed out,
/// non-zero (or unknown) exit code, ok.
///
/// `TIMED_OUT` is checked before the exit code, so a timed-out shard with a
/// stale non-zero exit code is still a timeout.
pub fn classify(record: Option<&ShardRecord>) -> ShardOutcome {
    let Some(record) = record else {
        return ShardOutcome::Missing;
    };
    if record.internal_failure {
        return ShardOutcome::InternalFailure;
    }
    match record.state {
        TaskState::Expired => ShardOutcome::Expired,
        TaskState::TimedOut => ShardOutcome::TimedOut,
        _ if record.effective_exit_code() != Some(0) => ShardOutcome::FailedExitNonzero,
        _ => ShardOutcome::Ok,
    }
}
