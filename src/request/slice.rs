// src/request/slice.rs

//! One scheduling alternative of a task request.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::errors::{Result, ShardrunError};

pub const MIN_TIMEOUT_SECS: u64 = 30;
pub const MAX_EXPIRATION_SECS: u64 = 24 * 60 * 60;
pub const MAX_EXECUTION_TIMEOUT_SECS: u64 = 6 * 60 * 60;

/// Caller-facing dimension overrides.
///
/// A `None` value removes the key (e.g. a default `gpu`) instead of setting it.
pub type DimensionOverrides = BTreeMap<String, Option<String>>;

/// Resolved bot-selection constraints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct DimensionSet(BTreeMap<String, String>);

impl DimensionSet {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Set or remove (`None`) a single dimension.
    pub fn set(&mut self, key: impl Into<String>, value: Option<String>) {
        let key = key.into();
        match value {
            Some(v) => {
                self.0.insert(key, v);
            }
            None => {
                self.0.remove(&key);
            }
        }
    }

    /// Apply overrides on top of this set; overrides win on conflict.
    pub fn apply(&mut self, overrides: &DimensionOverrides) {
        for (key, value) in overrides {
            self.set(key.clone(), value.clone());
        }
    }

    pub fn with_overrides(&self, overrides: &DimensionOverrides) -> Self {
        let mut out = self.clone();
        out.apply(overrides);
        out
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Every dimension in `self` is satisfied by `bot`.
    ///
    /// A value may list alternatives separated by `|`.
    pub fn is_satisfied_by(&self, bot: &DimensionSet) -> bool {
        self.iter().all(|(key, wanted)| match bot.get(key) {
            Some(have) => wanted.split('|').any(|alt| alt == have),
            None => false,
        })
    }
}

/// Content-addressed input shipped to the bot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InputRef {
    /// Legacy isolate server hash.
    Isolated(String),
    /// CAS digest (`<hash>/<size>`).
    Cas(String),
}

impl InputRef {
    pub fn as_str(&self) -> &str {
        match self {
            InputRef::Isolated(s) | InputRef::Cas(s) => s,
        }
    }
}

/// A package installed on the bot before the command runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CipdPackage {
    pub name: String,
    pub version: String,
    /// Install path relative to the task root ("." when empty).
    pub root: String,
}

/// Timeout triple of a slice, all in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Timeouts {
    /// How long the scheduler may look for a bot.
    pub expiration_secs: u64,
    /// Max silence on stdout/stderr before the task is killed.
    pub io_timeout_secs: u64,
    /// Max total execution time.
    pub hard_timeout_secs: u64,
}

impl Timeouts {
    pub fn validate(&self) -> Result<()> {
        validate_expiration(self.expiration_secs)?;
        validate_execution_timeout("io_timeout", self.io_timeout_secs)?;
        validate_execution_timeout("hard_timeout", self.hard_timeout_secs)?;
        Ok(())
    }
}

pub fn validate_expiration(secs: u64) -> Result<u64> {
    if !(MIN_TIMEOUT_SECS..=MAX_EXPIRATION_SECS).contains(&secs) {
        return Err(ShardrunError::InvalidConfig(format!(
            "expiration must be within [{MIN_TIMEOUT_SECS}s, {MAX_EXPIRATION_SECS}s] (got {secs}s)"
        )));
    }
    Ok(secs)
}

pub fn validate_execution_timeout(what: &str, secs: u64) -> Result<u64> {
    if !(MIN_TIMEOUT_SECS..=MAX_EXECUTION_TIMEOUT_SECS).contains(&secs) {
        return Err(ShardrunError::InvalidConfig(format!(
            "{what} must be within [{MIN_TIMEOUT_SECS}s, {MAX_EXECUTION_TIMEOUT_SECS}s] (got {secs}s)"
        )));
    }
    Ok(secs)
}

pub fn validate_priority(priority: u32) -> Result<u8> {
    if !(1..=255).contains(&priority) {
        return Err(ShardrunError::InvalidConfig(format!(
            "priority must be within [1, 255] (got {priority})"
        )));
    }
    Ok(priority as u8)
}

/// Everything the remote scheduler needs to run the command on one bot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSlice {
    pub command: Vec<String>,
    pub relative_cwd: Option<String>,
    pub input: Option<InputRef>,
    pub dimensions: DimensionSet,
    pub env: BTreeMap<String, String>,
    pub env_prefixes: BTreeMap<String, Vec<String>>,
    pub timeouts: Timeouts,
    pub idempotent: bool,
    pub cipd_packages: Vec<CipdPackage>,
    pub named_caches: BTreeMap<String, String>,
    pub wait_for_capacity: bool,
}

impl TaskSlice {
    pub fn with_dimensions(mut self, overrides: &DimensionOverrides) -> Self {
        self.dimensions.apply(overrides);
        self
    }

    pub fn with_expiration_secs(mut self, secs: u64) -> Self {
        self.timeouts.expiration_secs = secs;
        self
    }

    pub fn with_env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_extra_args(mut self, extra_args: &[String]) -> Self {
        self.command.extend(extra_args.iter().cloned());
        self
    }
}
