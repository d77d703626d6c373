// src/collect/record.rs

//! Wire model of one shard's result as reported by the task service.

use serde::{Deserialize, Deserializer, Serialize};
use time::macros::format_description;
use time::PrimitiveDateTime;

use crate::types::TaskState;

/// Reference to a shard's uploaded outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputsRef {
    pub isolatedserver: String,
    pub namespace: String,
    pub isolated: String,
}

impl OutputsRef {
    pub fn browse_url(&self) -> String {
        format!(
            "{}/browse?namespace={}&hash={}",
            self.isolatedserver, self.namespace, self.isolated
        )
    }
}

/// Result of one remote task.
///
/// A shard that produced nothing at all is represented by the absence of a
/// record, not by an empty one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardRecord {
    pub task_id: String,
    pub state: TaskState,
    #[serde(default, deserialize_with = "lenient_exit_code")]
    pub exit_code: Option<i64>,
    #[serde(default)]
    pub created_ts: Option<String>,
    #[serde(default)]
    pub started_ts: Option<String>,
    #[serde(default)]
    pub completed_ts: Option<String>,
    /// Pure runtime of the command in seconds.
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub internal_failure: bool,
    #[serde(default)]
    pub deduped_from: Option<String>,
    #[serde(default)]
    pub outputs_ref: Option<OutputsRef>,
    #[serde(default)]
    pub bot_id: Option<String>,
}

impl ShardRecord {
    pub fn new(task_id: impl Into<String>, state: TaskState) -> Self {
        Self {
            task_id: task_id.into(),
            state,
            exit_code: None,
            created_ts: None,
            started_ts: None,
            completed_ts: None,
            duration: None,
            internal_failure: false,
            deduped_from: None,
            outputs_ref: None,
            bot_id: None,
        }
    }

    /// Explicit exit code, else 0 for a completed task, else unknown.
    pub fn effective_exit_code(&self) -> Option<i64> {
        match self.exit_code {
            Some(code) => Some(code),
            None if self.state == TaskState::Completed => Some(0),
            None => None,
        }
    }

    /// Seconds spent waiting for a bot.
    pub fn pending_secs(&self) -> Option<f64> {
        seconds_between(self.created_ts.as_deref()?, self.started_ts.as_deref()?)
    }

    /// Wall-clock seconds from start to completion, overhead included.
    pub fn wall_clock_secs(&self) -> Option<f64> {
        seconds_between(self.started_ts.as_deref()?, self.completed_ts.as_deref()?)
    }
}

/// Exit codes arrive either as numbers or as numeric strings.
fn lenient_exit_code<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Str(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Int(code)) => Ok(Some(code)),
        Some(Raw::Str(s)) => s
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Parse a service timestamp.
///
/// Fractional seconds are elided when zero, and older servers use a space
/// instead of `T`.
pub fn parse_timestamp(value: &str) -> Option<PrimitiveDateTime> {
    let with_fraction = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond]");
    let without_fraction = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
    let legacy = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

    PrimitiveDateTime::parse(value, with_fraction)
        .or_else(|_| PrimitiveDateTime::parse(value, without_fraction))
        .or_else(|_| PrimitiveDateTime::parse(value, legacy))
        .ok()
}

fn seconds_between(from: &str, to: &str) -> Option<f64> {
    let from = parse_timestamp(from)?;
    let to = parse_timestamp(to)?;
    Some((to - from).as_seconds_f64())
}
