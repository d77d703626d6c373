// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::dispatch::TriggerScript;
use crate::engine::EngineOptions;
use crate::merge::MergeScript;
use crate::request::{
    BuildInfo, DimensionOverrides, DimensionSet, EngineDefaults, GerritChange, ProjectProfile,
    TaskParams,
};

/// Top-level configuration as read from a TOML file.
///
/// ```toml
/// [engine]
/// server = "https://tasks.example.com"
/// output_dir = "out"
///
/// [build]
/// builder = "linux-rel"
/// build_number = 42
///
/// [defaults]
/// priority = 100
/// dimensions = { pool = "ci" }
///
/// [local]
/// dimensions = { os = "Linux", cpu = "x86-64", pool = "ci" }
///
/// [task.unit_tests]
/// command = ["./run_tests.sh"]
/// shards = 4
/// dimensions = { os = "Linux" }
/// ```
///
/// Every section except `[task.<name>]` is optional.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RawConfigFile {
    #[serde(default)]
    pub engine: RawEngineSection,
    #[serde(default)]
    pub build: RawBuildSection,
    /// Optional project profile applied through `EngineDefaults::configure`.
    #[serde(default)]
    pub profile: Option<RawProfileSection>,
    #[serde(default)]
    pub defaults: RawDefaultsSection,
    #[serde(default)]
    pub local: RawLocalSection,
    /// Keys are the task names used by `--task`.
    #[serde(default)]
    pub task: BTreeMap<String, RawTaskConfig>,
}

/// Either integer seconds or a string such as `"250ms"`, `"30s"`, `"20m"`, `"1h"`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum DurationValue {
    Seconds(u64),
    Text(String),
}

impl DurationValue {
    pub fn to_duration(&self) -> Result<Duration, String> {
        match self {
            DurationValue::Seconds(secs) => Ok(Duration::from_secs(*secs)),
            DurationValue::Text(text) => parse_duration(text),
        }
    }
}

/// Parse a simple duration string like `"3s"`, `"250ms"`, `"1m"`, `"2h"`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    let idx = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| "duration missing unit suffix".to_string())?;

    let (num_part, unit_part) = s.split_at(idx);
    let value: u64 = num_part
        .parse()
        .map_err(|e| format!("invalid duration number '{}': {}", num_part, e))?;
    let unit = unit_part.trim().to_lowercase();

    match unit.as_str() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 60 * 60)),
        _ => Err(format!(
            "unsupported duration unit '{}'; expected ms, s, m, or h",
            unit
        )),
    }
}

/// `[engine]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawEngineSection {
    /// Base URL used for task view links.
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default = "default_true")]
    pub show_outputs_ref_in_collect_step: bool,
    #[serde(default)]
    pub poll: RawPollSection,
}

fn default_true() -> bool {
    true
}

impl Default for RawEngineSection {
    fn default() -> Self {
        Self {
            server: None,
            output_dir: None,
            verbose: false,
            show_outputs_ref_in_collect_step: true,
            poll: RawPollSection::default(),
        }
    }
}

/// `[engine.poll]` section.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RawPollSection {
    #[serde(default)]
    pub initial_delay: Option<DurationValue>,
    #[serde(default)]
    pub max_delay: Option<DurationValue>,
    #[serde(default)]
    pub multiplier: Option<f64>,
}

/// `[build]` section: identity of the triggering build.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RawBuildSection {
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub builder: Option<String>,
    #[serde(default)]
    pub build_number: Option<i64>,
    #[serde(default)]
    pub builder_group: Option<String>,
    #[serde(default)]
    pub bot_id: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub experimental: bool,
    #[serde(default)]
    pub gerrit_changes: Vec<GerritChange>,
}

/// `[profile]` section.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RawProfileSection {
    pub project: String,
    #[serde(default)]
    pub precommit: bool,
    #[serde(default)]
    pub default_priority: Option<u32>,
    #[serde(default)]
    pub target_platform: Option<String>,
    #[serde(default)]
    pub requester: Option<String>,
    #[serde(default)]
    pub blamelist: Vec<String>,
    #[serde(default)]
    pub patch_project: Option<String>,
}

/// `[defaults]` section: engine-wide task defaults.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RawDefaultsSection {
    #[serde(default)]
    pub priority: Option<u32>,
    #[serde(default)]
    pub expiration: Option<DurationValue>,
    #[serde(default)]
    pub io_timeout: Option<DurationValue>,
    #[serde(default)]
    pub hard_timeout: Option<DurationValue>,
    #[serde(default)]
    pub idempotent: Option<bool>,
    #[serde(default)]
    pub user: Option<String>,
    /// Values must be strings.
    #[serde(default)]
    pub dimensions: BTreeMap<String, toml::Value>,
    /// Default dimensions to remove (e.g. `gpu`).
    #[serde(default)]
    pub unset_dimensions: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, toml::Value>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// `[local]` section: the bot the local backend pretends to be.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RawLocalSection {
    #[serde(default)]
    pub dimensions: BTreeMap<String, toml::Value>,
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    #[serde(default)]
    pub bot_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawCipdPackage {
    pub name: String,
    pub version: String,
    #[serde(default = "default_cipd_root")]
    pub root: String,
}

fn default_cipd_root() -> String {
    ".".to_string()
}

/// `[task.<name>]` section.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RawTaskConfig {
    /// Display title; defaults to the task name.
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default)]
    pub shards: Option<u32>,
    /// Dispatch only these shards (all when omitted).
    #[serde(default)]
    pub shard_indices: Option<Vec<u32>>,
    #[serde(default)]
    pub dimensions: BTreeMap<String, toml::Value>,
    #[serde(default)]
    pub unset_dimensions: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, toml::Value>,
    #[serde(default)]
    pub env_prefixes: BTreeMap<String, Vec<String>>,
    /// Pre-computed CAS digest (`<hash>/<size>`).
    #[serde(default)]
    pub cas_input_root: Option<String>,
    /// Local directory digested into a CAS input at run time.
    #[serde(default)]
    pub input_dir: Option<PathBuf>,
    #[serde(default)]
    pub input_exclude: Vec<String>,
    #[serde(default)]
    pub expiration: Option<DurationValue>,
    #[serde(default)]
    pub io_timeout: Option<DurationValue>,
    #[serde(default)]
    pub hard_timeout: Option<DurationValue>,
    #[serde(default)]
    pub priority: Option<u32>,
    #[serde(default)]
    pub idempotent: Option<bool>,
    /// `{ "<expiration secs>" = { key = value } }` fallback dimensions.
    #[serde(default)]
    pub optional_dimensions: BTreeMap<String, BTreeMap<String, toml::Value>>,
    #[serde(default)]
    pub merge: Option<MergeScript>,
    #[serde(default)]
    pub trigger_script: Option<TriggerScript>,
    #[serde(default)]
    pub named_caches: BTreeMap<String, String>,
    #[serde(default)]
    pub cipd_packages: Vec<RawCipdPackage>,
    #[serde(default)]
    pub service_account: Option<String>,
    #[serde(default)]
    pub relative_cwd: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub build_properties: Option<toml::Value>,
    #[serde(default)]
    pub wait_for_capacity: bool,
    #[serde(default)]
    pub failure_as_exception: Option<bool>,
    #[serde(default)]
    pub ignore_task_failure: bool,
    #[serde(default)]
    pub retries: u32,
}

// -------------------------------------------------------------------------
// Validated configuration
// -------------------------------------------------------------------------

/// Validated configuration, produced by `ConfigFile::try_from(raw)`.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub engine: EngineOptions,
    pub server: Option<String>,
    pub build: BuildInfo,
    pub profile: Option<ProjectProfile>,
    pub defaults: DefaultsConfig,
    pub local: LocalConfig,
    pub tasks: BTreeMap<String, TaskConfig>,
}

/// Resolved `[defaults]`.
#[derive(Debug, Clone, Default)]
pub struct DefaultsConfig {
    pub priority: Option<u32>,
    pub expiration_secs: Option<u64>,
    pub io_timeout_secs: Option<u64>,
    pub hard_timeout_secs: Option<u64>,
    pub idempotent: Option<bool>,
    pub user: Option<String>,
    pub dimensions: DimensionOverrides,
    pub env: BTreeMap<String, String>,
    pub tags: Vec<String>,
}

/// Resolved `[local]`.
#[derive(Debug, Clone)]
pub struct LocalConfig {
    pub dimensions: DimensionSet,
    pub work_dir: PathBuf,
    pub bot_id: String,
}

/// Resolved `[task.<name>]`.
#[derive(Debug, Clone)]
pub struct TaskConfig {
    pub name: String,
    /// Parameters handed to `Engine::task`; `input` is filled in at run time
    /// when `input_dir` is set.
    pub params: TaskParams,
    pub input_dir: Option<PathBuf>,
    pub input_exclude: Vec<String>,
    pub failure_as_exception: bool,
    pub ignore_task_failure: bool,
    pub retries: u32,
}

impl DefaultsConfig {
    /// Push these defaults through the validating setters of `defaults`.
    pub fn apply(&self, defaults: &mut EngineDefaults) -> crate::errors::Result<()> {
        for (key, value) in &self.dimensions {
            defaults.set_dimension(key, value.as_deref())?;
        }
        for (key, value) in &self.env {
            defaults.set_env(key, value)?;
        }
        for tag in &self.tags {
            defaults.add_tag(tag)?;
        }
        if let Some(priority) = self.priority {
            defaults.set_priority(priority)?;
        }
        if let Some(secs) = self.expiration_secs {
            defaults.set_expiration_secs(secs)?;
        }
        if let Some(secs) = self.io_timeout_secs {
            defaults.set_io_timeout_secs(secs)?;
        }
        if let Some(secs) = self.hard_timeout_secs {
            defaults.set_hard_timeout_secs(secs)?;
        }
        if let Some(idempotent) = self.idempotent {
            defaults.set_idempotent(idempotent);
        }
        if self.user.is_some() {
            defaults.set_user(self.user.clone());
        }
        Ok(())
    }
}
