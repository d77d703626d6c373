// src/config/validate.rs

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

use crate::collect::PollConfig;
use crate::config::model::{
    ConfigFile, DefaultsConfig, DurationValue, LocalConfig, RawBuildSection, RawConfigFile,
    RawDefaultsSection, RawEngineSection, RawLocalSection, RawProfileSection, RawTaskConfig,
    TaskConfig,
};
use crate::engine::EngineOptions;
use crate::errors::{Result, ShardrunError};
use crate::request::defaults::validate_tag;
use crate::request::slice::{validate_execution_timeout, validate_expiration, validate_priority};
use crate::request::{
    BuildInfo, CipdPackage, DimensionOverrides, DimensionSet, InputRef, ProjectProfile, TaskParams,
};

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = ShardrunError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        ensure_has_tasks(&raw)?;
        let (engine, server) = engine_options(&raw.engine)?;
        let build = build_info(raw.build);
        let profile = raw.profile.map(|p| project_profile(p, &build));
        let defaults = defaults_config(&raw.defaults)?;
        let local = local_config(raw.local, &build)?;

        let mut tasks = BTreeMap::new();
        for (name, task) in raw.task {
            let task = task_config(&name, task)?;
            tasks.insert(name, task);
        }

        Ok(ConfigFile {
            engine,
            server,
            build,
            profile,
            defaults,
            local,
            tasks,
        })
    }
}

fn config_error(msg: impl Into<String>) -> ShardrunError {
    ShardrunError::InvalidConfig(msg.into())
}

fn ensure_has_tasks(cfg: &RawConfigFile) -> Result<()> {
    if cfg.task.is_empty() {
        return Err(config_error(
            "config must contain at least one [task.<name>] section",
        ));
    }
    Ok(())
}

fn duration(section: &str, key: &str, value: &DurationValue) -> Result<Duration> {
    value
        .to_duration()
        .map_err(|e| config_error(format!("[{section}].{key}: {e}")))
}

fn duration_secs(section: &str, key: &str, value: Option<&DurationValue>) -> Result<Option<u64>> {
    let Some(value) = value else {
        return Ok(None);
    };
    let d = duration(section, key, value)?;
    if d.subsec_nanos() != 0 {
        return Err(config_error(format!(
            "[{section}].{key} must be a whole number of seconds"
        )));
    }
    Ok(Some(d.as_secs()))
}

/// Resolve the three task timeouts, range-checking each one that is set.
fn timeouts(
    section: &str,
    expiration: Option<&DurationValue>,
    io_timeout: Option<&DurationValue>,
    hard_timeout: Option<&DurationValue>,
) -> Result<(Option<u64>, Option<u64>, Option<u64>)> {
    let expiration = duration_secs(section, "expiration", expiration)?;
    let io = duration_secs(section, "io_timeout", io_timeout)?;
    let hard = duration_secs(section, "hard_timeout", hard_timeout)?;
    if let Some(secs) = expiration {
        validate_expiration(secs)?;
    }
    if let Some(secs) = io {
        validate_execution_timeout("io_timeout", secs)?;
    }
    if let Some(secs) = hard {
        validate_execution_timeout("hard_timeout", secs)?;
    }
    Ok((expiration, io, hard))
}

fn string_value(section: &str, field: &str, key: &str, value: &toml::Value) -> Result<String> {
    match value {
        toml::Value::String(s) => Ok(s.clone()),
        other => Err(config_error(format!(
            "[{section}].{field}.{key} must be a string (got {})",
            other.type_str()
        ))),
    }
}

fn dimension_overrides(
    section: &str,
    dimensions: &BTreeMap<String, toml::Value>,
    unset: &[String],
) -> Result<DimensionOverrides> {
    let mut overrides = DimensionOverrides::new();
    for (key, value) in dimensions {
        let value = string_value(section, "dimensions", key, value)?;
        overrides.insert(key.clone(), Some(value));
    }
    for key in unset {
        if overrides.contains_key(key) {
            return Err(config_error(format!(
                "[{section}] sets and unsets dimension '{key}'"
            )));
        }
        overrides.insert(key.clone(), None);
    }
    Ok(overrides)
}

fn env_map(section: &str, env: &BTreeMap<String, toml::Value>) -> Result<BTreeMap<String, String>> {
    env.iter()
        .map(|(key, value)| Ok((key.clone(), string_value(section, "env", key, value)?)))
        .collect()
}

fn validate_tags(section: &str, tags: &[String]) -> Result<()> {
    for tag in tags {
        validate_tag(tag).map_err(|e| config_error(format!("[{section}].tags: {e}")))?;
    }
    Ok(())
}

fn engine_options(raw: &RawEngineSection) -> Result<(EngineOptions, Option<String>)> {
    let mut poll = PollConfig::default();
    if let Some(value) = &raw.poll.initial_delay {
        poll.initial_delay = duration("engine.poll", "initial_delay", value)?;
    }
    if let Some(value) = &raw.poll.max_delay {
        poll.max_delay = duration("engine.poll", "max_delay", value)?;
    }
    if let Some(multiplier) = raw.poll.multiplier {
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(config_error(format!(
                "[engine.poll].multiplier must be >= 1.0 (got {multiplier})"
            )));
        }
        poll.multiplier = multiplier;
    }
    if poll.initial_delay.is_zero() || poll.max_delay < poll.initial_delay {
        return Err(config_error(
            "[engine.poll] needs 0 < initial_delay <= max_delay",
        ));
    }

    let mut options = EngineOptions {
        show_outputs_ref: raw.show_outputs_ref_in_collect_step,
        poll,
        verbose: raw.verbose,
        ..Default::default()
    };
    if let Some(dir) = &raw.output_dir {
        options.output_dir = dir.clone();
    }
    let server = raw.server.as_ref().map(|s| s.trim_end_matches('/').to_string());
    Ok((options, server))
}

fn build_info(raw: RawBuildSection) -> BuildInfo {
    BuildInfo {
        project: raw.project,
        bucket: raw.bucket,
        builder: raw.builder,
        build_number: raw.build_number,
        builder_group: raw.builder_group,
        bot_id: raw.bot_id,
        platform: raw.platform,
        experimental: raw.experimental,
        gerrit_changes: raw.gerrit_changes,
    }
}

fn project_profile(raw: RawProfileSection, build: &BuildInfo) -> ProjectProfile {
    ProjectProfile {
        project: raw.project,
        precommit: raw.precommit,
        builder_group: build.builder_group.clone(),
        default_priority: raw.default_priority,
        target_platform: raw.target_platform,
        requester: raw.requester,
        blamelist: raw.blamelist,
        patch_project: raw.patch_project,
        experimental: build.experimental,
    }
}

fn defaults_config(raw: &RawDefaultsSection) -> Result<DefaultsConfig> {
    let (expiration_secs, io_timeout_secs, hard_timeout_secs) = timeouts(
        "defaults",
        raw.expiration.as_ref(),
        raw.io_timeout.as_ref(),
        raw.hard_timeout.as_ref(),
    )?;
    if let Some(priority) = raw.priority {
        validate_priority(priority)?;
    }
    validate_tags("defaults", &raw.tags)?;

    Ok(DefaultsConfig {
        priority: raw.priority,
        expiration_secs,
        io_timeout_secs,
        hard_timeout_secs,
        idempotent: raw.idempotent,
        user: raw.user.clone(),
        dimensions: dimension_overrides("defaults", &raw.dimensions, &raw.unset_dimensions)?,
        env: env_map("defaults", &raw.env)?,
        tags: raw.tags.clone(),
    })
}

fn local_config(raw: RawLocalSection, build: &BuildInfo) -> Result<LocalConfig> {
    let mut dimensions = DimensionSet::new();
    for (key, value) in &raw.dimensions {
        dimensions.set(key.clone(), Some(string_value("local", "dimensions", key, value)?));
    }
    let bot_id = raw
        .bot_id
        .or_else(|| build.bot_id.clone())
        .unwrap_or_else(|| "local".to_string());
    if !dimensions.contains("id") {
        dimensions.set("id", Some(bot_id.clone()));
    }
    Ok(LocalConfig {
        dimensions,
        work_dir: raw
            .work_dir
            .unwrap_or_else(|| PathBuf::from("shardrun-work")),
        bot_id,
    })
}

fn task_config(name: &str, raw: RawTaskConfig) -> Result<TaskConfig> {
    let section = format!("task.{name}");

    if raw.command.is_empty() && raw.cas_input_root.is_none() && raw.input_dir.is_none() {
        return Err(config_error(format!(
            "[{section}] needs a command or an input (cas_input_root / input_dir)"
        )));
    }
    if raw.cas_input_root.is_some() && raw.input_dir.is_some() {
        return Err(config_error(format!(
            "[{section}] sets both cas_input_root and input_dir"
        )));
    }

    let shards = raw.shards.unwrap_or(1);
    if shards == 0 {
        return Err(config_error(format!("[{section}].shards must be >= 1")));
    }
    let shard_indices = match raw.shard_indices {
        Some(indices) => {
            let indices: BTreeSet<u32> = indices.into_iter().collect();
            if let Some(bad) = indices.iter().find(|&&i| i >= shards) {
                return Err(config_error(format!(
                    "[{section}].shard_indices contains {bad}, outside [0, {shards})"
                )));
            }
            Some(indices)
        }
        None => None,
    };

    let (expiration_secs, io_timeout_secs, hard_timeout_secs) = timeouts(
        &section,
        raw.expiration.as_ref(),
        raw.io_timeout.as_ref(),
        raw.hard_timeout.as_ref(),
    )?;
    if let Some(priority) = raw.priority {
        validate_priority(priority)?;
    }
    validate_tags(&section, &raw.tags)?;

    let mut optional_dimensions = BTreeMap::new();
    for (secs, dims) in &raw.optional_dimensions {
        let secs: u64 = secs.trim().parse().map_err(|_| {
            config_error(format!(
                "[{section}].optional_dimensions key '{secs}' must be an expiration in seconds"
            ))
        })?;
        validate_expiration(secs)?;
        let overrides = dimension_overrides(&section, dims, &[])?;
        optional_dimensions.insert(secs, overrides);
    }

    let build_properties = raw
        .build_properties
        .map(serde_json::to_value)
        .transpose()?;

    let params = TaskParams {
        title: raw.title.unwrap_or_else(|| name.to_string()),
        command: raw.command,
        extra_args: raw.extra_args,
        relative_cwd: raw.relative_cwd,
        input: raw.cas_input_root.map(InputRef::Cas),
        dimensions: dimension_overrides(&section, &raw.dimensions, &raw.unset_dimensions)?,
        env: env_map(&section, &raw.env)?,
        env_prefixes: raw.env_prefixes,
        expiration_secs,
        io_timeout_secs,
        hard_timeout_secs,
        priority: raw.priority,
        idempotent: raw.idempotent,
        shards,
        shard_indices,
        cipd_packages: raw
            .cipd_packages
            .into_iter()
            .map(|p| CipdPackage {
                name: p.name,
                version: p.version,
                root: p.root,
            })
            .collect(),
        named_caches: raw.named_caches,
        service_account: raw.service_account,
        optional_dimensions,
        merge: raw.merge,
        trigger_script: raw.trigger_script,
        tags: raw.tags,
        build_properties,
        wait_for_capacity: raw.wait_for_capacity,
        ..TaskParams::default()
    };

    Ok(TaskConfig {
        name: name.to_string(),
        params,
        input_dir: raw.input_dir,
        input_exclude: raw.input_exclude,
        failure_as_exception: raw.failure_as_exception.unwrap_or(true),
        ignore_task_failure: raw.ignore_task_failure,
        retries: raw.retries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> Result<ConfigFile> {
        let raw: RawConfigFile = toml::from_str(toml_str)?;
        ConfigFile::try_from(raw)
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg = parse(
            r#"
            [task.unit]
            command = ["./t"]
            dimensions = { os = "Linux" }
            "#,
        )
        .unwrap();
        let task = &cfg.tasks["unit"];
        assert_eq!(task.params.title, "unit");
        assert_eq!(task.params.shards, 1);
        assert!(task.failure_as_exception);
        assert_eq!(cfg.engine.poll, PollConfig::default());
        assert_eq!(cfg.local.bot_id, "local");
        assert_eq!(cfg.local.dimensions.get("id"), Some("local"));
    }

    #[test]
    fn durations_accept_strings_and_seconds() {
        let cfg = parse(
            r#"
            [defaults]
            expiration = "1h"
            io_timeout = 600

            [engine.poll]
            initial_delay = "250ms"
            max_delay = "5s"

            [task.unit]
            command = ["./t"]
            hard_timeout = "20m"
            optional_dimensions = { "60" = { gpu = "none" } }
            "#,
        )
        .unwrap();
        assert_eq!(cfg.defaults.expiration_secs, Some(3600));
        assert_eq!(cfg.defaults.io_timeout_secs, Some(600));
        assert_eq!(cfg.engine.poll.initial_delay, Duration::from_millis(250));
        let task = &cfg.tasks["unit"];
        assert_eq!(task.params.hard_timeout_secs, Some(1200));
        assert_eq!(
            task.params.optional_dimensions[&60]["gpu"].as_deref(),
            Some("none")
        );
    }

    #[test]
    fn non_string_dimension_is_rejected() {
        let err = parse(
            r#"
            [task.unit]
            command = ["./t"]
            dimensions = { os = "Linux", cores = 8 }
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ShardrunError::InvalidConfig(ref m) if m.contains("cores")));
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        for body in [
            "hard_timeout = 10",
            "priority = 0",
            "shards = 2\nshard_indices = [2]",
            "expiration = \"2s\"",
            "tags = [\"nocolon\"]",
        ] {
            let toml_str = format!("[task.unit]\ncommand = [\"./t\"]\n{body}\n");
            assert!(
                matches!(parse(&toml_str), Err(ShardrunError::InvalidConfig(_))),
                "accepted: {body}"
            );
        }
    }

    #[test]
    fn config_without_tasks_is_rejected() {
        assert!(matches!(
            parse("[engine]\nverbose = true\n"),
            Err(ShardrunError::InvalidConfig(_))
        ));
    }

    #[test]
    fn unset_dimensions_become_removals() {
        let cfg = parse(
            r#"
            [defaults]
            unset_dimensions = ["gpu"]

            [task.unit]
            command = ["./t"]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.defaults.dimensions.get("gpu"), Some(&None));
    }
}
