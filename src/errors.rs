// src/errors.rs

//! Crate-wide error type.
//!
//! The variants mirror how callers are expected to react:
//! - `InvalidConfig` / `InvariantViolation` always propagate; they mean the
//!   caller built an impossible request or broke the trigger/collect protocol.
//! - `InfraFailure` / `TestFailure` carry per-shard reasons (and the verdict,
//!   so links stay available) and are recoverable by retrying failed shards.

use std::fmt;

use thiserror::Error;

use crate::collect::CollectVerdict;

/// One failed shard and a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardFailure {
    pub index: u32,
    pub reason: String,
}

impl ShardFailure {
    pub fn new(index: u32, reason: impl Into<String>) -> Self {
        Self {
            index,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ShardFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shard #{} failed: {}", self.index, self.reason)
    }
}

fn join_failures(failures: &[ShardFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Error, Debug)]
pub enum ShardrunError {
    #[error("Configuration error: {0}")]
    InvalidConfig(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Infra failure:\n{}", join_failures(.failures))]
    InfraFailure {
        failures: Vec<ShardFailure>,
        verdict: Option<Box<CollectVerdict>>,
    },

    #[error("Test failure:\n{}", join_failures(.failures))]
    TestFailure {
        failures: Vec<ShardFailure>,
        verdict: Box<CollectVerdict>,
    },

    #[error("Failed to trigger shard #{shard_index}: {message}")]
    Submission { shard_index: u32, message: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ShardrunError {
    /// Whether this error means "the fleet broke" rather than "the code is broken".
    pub fn is_infra(&self) -> bool {
        matches!(
            self,
            ShardrunError::InfraFailure { .. }
                | ShardrunError::Submission { .. }
                | ShardrunError::IoError(_)
                | ShardrunError::Other(_)
        )
    }

    /// Verdict attached to a collect failure, if any.
    pub fn verdict(&self) -> Option<&CollectVerdict> {
        match self {
            ShardrunError::InfraFailure { verdict, .. } => verdict.as_deref(),
            ShardrunError::TestFailure { verdict, .. } => Some(verdict),
            _ => None,
        }
    }

    /// Process exit code used by the CLI.
    pub fn exit_code(&self) -> i32 {
        if self.is_infra() { 2 } else { 1 }
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, ShardrunError>;
