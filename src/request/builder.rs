// src/request/builder.rs

//! Construction of immutable [`TaskSpec`]s from caller parameters and the
//! engine defaults.
//!
//! Building is pure: nothing is submitted and no engine state is touched.
//! Caller-supplied values win over defaults; a `None` dimension override
//! removes the default instead of setting it.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use crate::dispatch::{DispatchedTask, TriggerScript};
use crate::errors::{Result, ShardrunError};
use crate::merge::MergeScript;
use crate::request::defaults::{validate_tag, BuildInfo, EngineDefaults};
use crate::request::slice::{
    validate_expiration, validate_priority, CipdPackage, DimensionOverrides, DimensionSet,
    InputRef, TaskSlice, Timeouts,
};

/// Placeholder expanded by the bot to the task's output directory.
pub const ISOLATED_OUTDIR_ENV: &str = "ISOLATED_OUTDIR";
const ISOLATED_OUTDIR_PLACEHOLDER: &str = "${ISOLATED_OUTDIR}";

/// High-level parameters for one logical task.
///
/// Unset (`None`) fields fall back to the engine defaults.
#[derive(Debug, Clone)]
pub struct TaskParams {
    pub title: String,
    pub command: Vec<String>,
    /// Appended to `command` for every shard.
    pub extra_args: Vec<String>,
    pub relative_cwd: Option<String>,
    pub input: Option<InputRef>,
    pub dimensions: DimensionOverrides,
    pub env: BTreeMap<String, String>,
    pub env_prefixes: BTreeMap<String, Vec<String>>,
    pub expiration_secs: Option<u64>,
    pub io_timeout_secs: Option<u64>,
    pub hard_timeout_secs: Option<u64>,
    pub priority: Option<u32>,
    pub idempotent: Option<bool>,
    pub shards: u32,
    /// Shards to submit; all of `0..shards` when `None`.
    pub shard_indices: Option<BTreeSet<u32>>,
    pub cipd_packages: Vec<CipdPackage>,
    pub named_caches: BTreeMap<String, String>,
    pub service_account: Option<String>,
    /// Fallback dimensions keyed by relative expiration in seconds.
    pub optional_dimensions: BTreeMap<u64, DimensionOverrides>,
    pub merge: Option<MergeScript>,
    pub trigger_script: Option<TriggerScript>,
    pub tags: Vec<String>,
    pub task_output_dir: Option<PathBuf>,
    /// Passed to the merge script as `--build-properties`.
    pub build_properties: Option<serde_json::Value>,
    pub wait_for_capacity: bool,
    pub task_to_retry: Option<Arc<DispatchedTask>>,
}

impl Default for TaskParams {
    fn default() -> Self {
        Self {
            title: String::new(),
            command: Vec::new(),
            extra_args: Vec::new(),
            relative_cwd: None,
            input: None,
            dimensions: DimensionOverrides::new(),
            env: BTreeMap::new(),
            env_prefixes: BTreeMap::new(),
            expiration_secs: None,
            io_timeout_secs: None,
            hard_timeout_secs: None,
            priority: None,
            idempotent: None,
            shards: 1,
            shard_indices: None,
            cipd_packages: Vec::new(),
            named_caches: BTreeMap::new(),
            service_account: None,
            optional_dimensions: BTreeMap::new(),
            merge: None,
            trigger_script: None,
            tags: Vec::new(),
            task_output_dir: None,
            build_properties: None,
            wait_for_capacity: false,
            task_to_retry: None,
        }
    }
}

impl TaskParams {
    pub fn new(title: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            title: title.into(),
            command,
            ..Default::default()
        }
    }
}

/// Fully resolved, immutable description of a logical task.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub title: String,
    pub command: Vec<String>,
    pub extra_args: Vec<String>,
    pub relative_cwd: Option<String>,
    pub input: Option<InputRef>,
    pub dimensions: DimensionSet,
    pub env: BTreeMap<String, String>,
    pub env_prefixes: BTreeMap<String, Vec<String>>,
    pub timeouts: Timeouts,
    pub priority: u8,
    pub idempotent: bool,
    pub shards: u32,
    pub shard_indices: BTreeSet<u32>,
    pub cipd_packages: Vec<CipdPackage>,
    pub named_caches: BTreeMap<String, String>,
    pub service_account: Option<String>,
    pub user: Option<String>,
    pub optional_dimensions: BTreeMap<u64, DimensionOverrides>,
    pub merge: Option<MergeScript>,
    pub trigger_script: Option<TriggerScript>,
    pub tags: BTreeSet<String>,
    pub task_output_dir: Option<PathBuf>,
    pub build_properties: Option<serde_json::Value>,
    pub wait_for_capacity: bool,
    /// `{project}.{bucket}:{builder}`, for labeling only.
    pub spec_name: Option<String>,
    pub builder_info: Option<(String, i64)>,
    pub task_to_retry: Option<Arc<DispatchedTask>>,
}

impl TaskSpec {
    pub fn os(&self) -> Option<&str> {
        self.dimensions.get("os")
    }

    /// Identity used by the pending-task set.
    ///
    /// `{title}/{os}/{input[..10]}` plus `/{builder}/{build_number}` when the
    /// build is known.
    pub fn task_name(&self) -> String {
        let input = self
            .input
            .as_ref()
            .map(|i| i.as_str().chars().take(10).collect::<String>())
            .unwrap_or_default();
        let mut name = format!("{}/{}/{}", self.title, self.os().unwrap_or_default(), input);
        if let Some((builder, number)) = &self.builder_info {
            name.push_str(&format!("/{builder}/{number}"));
        }
        name
    }

    /// Whether this spec retries a subset of shards of an earlier task.
    pub fn is_retry(&self) -> bool {
        self.task_to_retry.is_some()
    }

    /// Checks that must hold before the task can be triggered.
    pub fn validate(&self) -> Result<()> {
        if self.os().is_none() {
            return Err(ShardrunError::InvalidConfig(format!(
                "task '{}' must specify the 'os' dimension",
                self.title
            )));
        }
        if self.command.is_empty() && self.input.is_none() {
            return Err(ShardrunError::InvalidConfig(format!(
                "task '{}' needs a command or an input reference",
                self.title
            )));
        }
        validate_shards(&self.title, self.shards, &self.shard_indices)?;
        self.timeouts.validate()?;
        // Fallback slices expire relative to the slice before them.
        let mut cumulative = self.timeouts.expiration_secs;
        for secs in self.optional_dimensions.keys() {
            validate_expiration(*secs)?;
            cumulative = validate_expiration(cumulative.saturating_add(*secs))?;
        }
        for tag in &self.tags {
            validate_tag(tag)?;
        }
        Ok(())
    }

    /// The primary slice shared by every shard before per-shard env is added.
    pub fn primary_slice(&self) -> TaskSlice {
        TaskSlice {
            command: self.command.clone(),
            relative_cwd: self.relative_cwd.clone(),
            input: self.input.clone(),
            dimensions: self.dimensions.clone(),
            env: self.env.clone(),
            env_prefixes: self.env_prefixes.clone(),
            timeouts: self.timeouts,
            idempotent: self.idempotent,
            cipd_packages: self.cipd_packages.clone(),
            named_caches: self.named_caches.clone(),
            wait_for_capacity: self.wait_for_capacity,
        }
    }
}

fn validate_shards(title: &str, shards: u32, indices: &BTreeSet<u32>) -> Result<()> {
    if shards == 0 {
        return Err(ShardrunError::InvalidConfig(format!(
            "task '{title}' must have at least one shard"
        )));
    }
    if indices.is_empty() {
        return Err(ShardrunError::InvalidConfig(format!(
            "task '{title}' has no shard indices to dispatch"
        )));
    }
    if let Some(bad) = indices.iter().find(|&&i| i >= shards) {
        return Err(ShardrunError::InvalidConfig(format!(
            "task '{title}' has shard index {bad} outside [0, {shards})"
        )));
    }
    Ok(())
}

/// Merge `params` over `defaults` into an immutable [`TaskSpec`].
pub fn build_task_spec(
    defaults: &EngineDefaults,
    build: &BuildInfo,
    params: TaskParams,
) -> Result<TaskSpec> {
    if params.title.is_empty() {
        return Err(ShardrunError::InvalidConfig(
            "task title must not be empty".to_string(),
        ));
    }

    let dimensions = defaults.dimensions().with_overrides(&params.dimensions);

    let mut env = defaults.env().clone();
    env.extend(params.env);
    env.entry(ISOLATED_OUTDIR_ENV.to_string())
        .or_insert_with(|| ISOLATED_OUTDIR_PLACEHOLDER.to_string());

    let mut tags = defaults.tags().clone();
    for tag in params.tags {
        validate_tag(&tag)?;
        tags.insert(tag);
    }

    let timeouts = Timeouts {
        expiration_secs: params.expiration_secs.unwrap_or(defaults.expiration_secs()),
        io_timeout_secs: params.io_timeout_secs.unwrap_or(defaults.io_timeout_secs()),
        hard_timeout_secs: params.hard_timeout_secs.unwrap_or(defaults.hard_timeout_secs()),
    };
    timeouts.validate()?;

    let priority = match params.priority {
        Some(p) => validate_priority(p)?,
        None => defaults.priority(),
    };

    let shard_indices = params
        .shard_indices
        .unwrap_or_else(|| (0..params.shards).collect());
    validate_shards(&params.title, params.shards, &shard_indices)?;

    Ok(TaskSpec {
        title: params.title,
        command: params.command,
        extra_args: params.extra_args,
        relative_cwd: params.relative_cwd,
        input: params.input,
        dimensions,
        env,
        env_prefixes: params.env_prefixes,
        timeouts,
        priority,
        idempotent: params.idempotent.unwrap_or(defaults.idempotent()),
        shards: params.shards,
        shard_indices,
        cipd_packages: params.cipd_packages,
        named_caches: params.named_caches,
        service_account: params.service_account,
        user: defaults.user().map(str::to_string),
        optional_dimensions: params.optional_dimensions,
        merge: params.merge,
        trigger_script: params.trigger_script,
        tags,
        task_output_dir: params.task_output_dir,
        build_properties: params.build_properties,
        wait_for_capacity: params.wait_for_capacity,
        spec_name: build.spec_name(),
        builder_info: build.builder_info(),
        task_to_retry: params.task_to_retry,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linux_params(title: &str) -> TaskParams {
        let mut params = TaskParams::new(title, vec!["./run_tests".into()]);
        params.dimensions.insert("os".into(), Some("Linux".into()));
        params
    }

    #[test]
    fn caller_values_override_defaults() {
        let mut defaults = EngineDefaults::default();
        defaults.set_env("LANG", "C").unwrap();
        defaults.add_tag("purpose:CI").unwrap();

        let mut params = linux_params("unit_tests");
        params.dimensions.insert("cpu".into(), Some("arm64".into()));
        params.env.insert("LANG".into(), "en_US".into());
        params.tags.push("suite:unit".into());
        params.priority = Some(50);

        let spec = build_task_spec(&defaults, &BuildInfo::default(), params).unwrap();
        assert_eq!(spec.dimensions.get("cpu"), Some("arm64"));
        assert_eq!(spec.env.get("LANG").map(String::as_str), Some("en_US"));
        assert_eq!(
            spec.env.get(ISOLATED_OUTDIR_ENV).map(String::as_str),
            Some("${ISOLATED_OUTDIR}")
        );
        assert!(spec.tags.contains("purpose:CI"));
        assert!(spec.tags.contains("suite:unit"));
        assert_eq!(spec.priority, 50);
        assert_eq!(spec.shard_indices, BTreeSet::from([0]));
    }

    #[test]
    fn tag_without_colon_is_invalid_config() {
        let mut params = linux_params("unit_tests");
        params.tags.push("oops".into());
        let err = build_task_spec(&EngineDefaults::default(), &BuildInfo::default(), params)
            .unwrap_err();
        assert!(matches!(err, ShardrunError::InvalidConfig(_)));
    }

    #[test]
    fn shard_indices_must_fit_shard_count() {
        let mut params = linux_params("unit_tests");
        params.shards = 2;
        params.shard_indices = Some(BTreeSet::from([0, 2]));
        let err = build_task_spec(&EngineDefaults::default(), &BuildInfo::default(), params)
            .unwrap_err();
        assert!(matches!(err, ShardrunError::InvalidConfig(_)));
    }

    #[test]
    fn task_name_includes_input_prefix_and_build() {
        let build = BuildInfo {
            builder: Some("linux-rel".into()),
            build_number: Some(42),
            ..Default::default()
        };
        let mut params = linux_params("browser_tests");
        params.input = Some(InputRef::Cas("0123456789abcdef/512".into()));

        let spec = build_task_spec(&EngineDefaults::default(), &build, params).unwrap();
        assert_eq!(spec.task_name(), "browser_tests/Linux/0123456789/linux-rel/42");
    }

    #[test]
    fn missing_os_fails_validation() {
        let params = TaskParams::new("unit_tests", vec!["./run".into()]);
        let spec =
            build_task_spec(&EngineDefaults::default(), &BuildInfo::default(), params).unwrap();
        assert!(matches!(
            spec.validate(),
            Err(ShardrunError::InvalidConfig(_))
        ));
    }

    #[test]
    fn fallback_slices_count_against_the_expiration_cap() {
        let mut params = linux_params("unit_tests");
        params.expiration_secs = Some(23 * 60 * 60);
        for relative in [1800, 1200] {
            params
                .optional_dimensions
                .entry(relative)
                .or_default()
                .insert("pool".into(), Some(format!("fallback-{relative}")));
        }
        let spec = build_task_spec(&EngineDefaults::default(), &BuildInfo::default(), params.clone())
            .unwrap();
        assert!(spec.validate().is_ok());

        params
            .optional_dimensions
            .entry(900)
            .or_default()
            .insert("gpu".into(), None);
        let spec =
            build_task_spec(&EngineDefaults::default(), &BuildInfo::default(), params).unwrap();
        assert!(matches!(
            spec.validate(),
            Err(ShardrunError::InvalidConfig(ref m)) if m.contains("86400")
        ));
    }
}
