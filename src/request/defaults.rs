// src/request/defaults.rs

//! Engine-wide defaults applied to every task, and the build context used
//! for naming and tagging.

use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;
use tracing::debug;

use crate::errors::{Result, ShardrunError};
use crate::request::slice::{
    validate_execution_timeout, validate_expiration, validate_priority, DimensionSet,
};

/// Default parameters applied to all triggered tasks.
///
/// All tests default to an x86-64 bot with no GPU so that new tests do not
/// land on exotic bots by accident.
#[derive(Debug, Clone)]
pub struct EngineDefaults {
    dimensions: DimensionSet,
    env: BTreeMap<String, String>,
    tags: BTreeSet<String>,
    priority: u8,
    expiration_secs: u64,
    io_timeout_secs: u64,
    hard_timeout_secs: u64,
    idempotent: bool,
    user: Option<String>,
}

impl Default for EngineDefaults {
    fn default() -> Self {
        Self {
            dimensions: DimensionSet::from_pairs([("cpu", "x86-64")]),
            env: BTreeMap::new(),
            tags: BTreeSet::new(),
            priority: 200,
            expiration_secs: 60 * 60,
            io_timeout_secs: 20 * 60,
            hard_timeout_secs: 60 * 60,
            idempotent: false,
            user: None,
        }
    }
}

impl EngineDefaults {
    /// Read-only copy of the default dimensions.
    pub fn dimensions(&self) -> &DimensionSet {
        &self.dimensions
    }

    /// Set a default dimension; `None` removes it.
    pub fn set_dimension(&mut self, key: &str, value: Option<&str>) -> Result<()> {
        if key.is_empty() {
            return Err(ShardrunError::InvalidConfig(
                "dimension key must not be empty".to_string(),
            ));
        }
        self.dimensions.set(key, value.map(str::to_string));
        Ok(())
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn set_env(&mut self, key: &str, value: &str) -> Result<()> {
        if key.is_empty() {
            return Err(ShardrunError::InvalidConfig(
                "env var name must not be empty".to_string(),
            ));
        }
        self.env.insert(key.to_string(), value.to_string());
        Ok(())
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    /// Add a `key:value` tag to every triggered task.
    pub fn add_tag(&mut self, tag: &str) -> Result<()> {
        validate_tag(tag)?;
        self.tags.insert(tag.to_string());
        Ok(())
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// Lower is more urgent; valid range is [1, 255].
    pub fn set_priority(&mut self, priority: u32) -> Result<()> {
        self.priority = validate_priority(priority)?;
        Ok(())
    }

    pub fn expiration_secs(&self) -> u64 {
        self.expiration_secs
    }

    pub fn set_expiration_secs(&mut self, secs: u64) -> Result<()> {
        self.expiration_secs = validate_expiration(secs)?;
        Ok(())
    }

    pub fn io_timeout_secs(&self) -> u64 {
        self.io_timeout_secs
    }

    pub fn set_io_timeout_secs(&mut self, secs: u64) -> Result<()> {
        self.io_timeout_secs = validate_execution_timeout("io_timeout", secs)?;
        Ok(())
    }

    pub fn hard_timeout_secs(&self) -> u64 {
        self.hard_timeout_secs
    }

    pub fn set_hard_timeout_secs(&mut self, secs: u64) -> Result<()> {
        self.hard_timeout_secs = validate_execution_timeout("hard_timeout", secs)?;
        Ok(())
    }

    pub fn idempotent(&self) -> bool {
        self.idempotent
    }

    pub fn set_idempotent(&mut self, idempotent: bool) {
        self.idempotent = idempotent;
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn set_user(&mut self, user: Option<String>) {
        self.user = user;
    }

    /// Apply project-level defaults (pool, priority, purpose tags).
    pub fn configure(&mut self, profile: &ProjectProfile) -> Result<()> {
        for (key, value) in per_target_dimensions(profile.target_platform.as_deref()) {
            self.set_dimension(key, value)?;
        }

        self.set_dimension("pool", Some("chromium.tests"))?;
        self.add_tag(&format!("project:{}", profile.project))?;
        self.idempotent = true;

        if profile.precommit {
            self.set_priority(30)?;
            self.add_tag("purpose:pre-commit")?;
            let mut requester = profile.requester.clone();
            if requester.as_deref() == Some(COMMIT_BOT) {
                self.add_tag("purpose:CQ")?;
                if let [single] = profile.blamelist.as_slice() {
                    requester = Some(single.clone());
                }
            } else {
                self.add_tag("purpose:ManualTS")?;
            }
            self.user = requester;

            if let Some(project) = &profile.patch_project {
                self.add_tag(&format!("patch_project:{project}"))?;
            }
        } else {
            self.set_priority(builder_group_priority(profile.builder_group.as_deref()))?;
            self.add_tag("purpose:post-commit")?;
            self.add_tag("purpose:CI")?;
        }

        if let Some(priority) = profile.default_priority {
            self.set_priority(priority)?;
        }

        if profile.experimental {
            self.set_priority(40)?;
        }

        debug!(
            project = %profile.project,
            priority = self.priority,
            tags = ?self.tags,
            "configured engine defaults for project"
        );
        Ok(())
    }
}

const COMMIT_BOT: &str = "commit-bot@chromium.org";

/// Tags must be `key:value` pairs.
pub fn validate_tag(tag: &str) -> Result<()> {
    match tag.split_once(':') {
        Some((key, _)) if !key.is_empty() => Ok(()),
        _ => Err(ShardrunError::InvalidConfig(format!(
            "tag '{tag}' must have the form key:value"
        ))),
    }
}

/// Dimension overrides for target platforms that run tests on devices
/// rather than on the host.
fn per_target_dimensions(target_platform: Option<&str>) -> Vec<(&'static str, Option<&'static str>)> {
    match target_platform {
        Some("android") => vec![("cpu", None), ("gpu", None), ("os", Some("Android"))],
        Some("chromeos") => vec![("cpu", None), ("gpu", None), ("os", Some("ChromeOS"))],
        _ => Vec::new(),
    }
}

fn builder_group_priority(builder_group: Option<&str>) -> u32 {
    match builder_group {
        Some("chromium.android.fyi")
        | Some("chromium.fyi")
        | Some("chromium.goma.fyi")
        | Some("client.v8.chromium")
        | Some("client.v8.fyi") => 35,
        _ => 25,
    }
}

/// Project-level knobs used by [`EngineDefaults::configure`].
#[derive(Debug, Clone, Default)]
pub struct ProjectProfile {
    /// Lowercase project name, e.g. "chromium".
    pub project: String,
    /// Tests run before the change lands.
    pub precommit: bool,
    pub builder_group: Option<String>,
    /// Explicit priority, overriding the builder-group table.
    pub default_priority: Option<u32>,
    pub target_platform: Option<String>,
    pub requester: Option<String>,
    pub blamelist: Vec<String>,
    pub patch_project: Option<String>,
    pub experimental: bool,
}

/// A code review change under test.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GerritChange {
    pub host: String,
    pub change: u64,
    pub patchset: u64,
}

/// Identity of the build that triggers tasks.
///
/// Every field is optional; missing identifiers only drop the matching tags.
#[derive(Debug, Clone, Default)]
pub struct BuildInfo {
    pub project: Option<String>,
    pub bucket: Option<String>,
    pub builder: Option<String>,
    pub build_number: Option<i64>,
    pub builder_group: Option<String>,
    /// Bot running the orchestrating build.
    pub bot_id: Option<String>,
    /// Host platform: "linux", "mac" or "win".
    pub platform: Option<String>,
    pub experimental: bool,
    pub gerrit_changes: Vec<GerritChange>,
}

impl BuildInfo {
    /// `{project}.{bucket}:{builder}`, used for monitoring only.
    pub fn spec_name(&self) -> Option<String> {
        match (&self.project, &self.bucket, &self.builder) {
            (Some(project), Some(bucket), Some(builder)) => {
                Some(format!("{project}.{bucket}:{builder}"))
            }
            _ => None,
        }
    }

    /// Builder name and build number (`-1` when unknown).
    pub fn builder_info(&self) -> Option<(String, i64)> {
        self.builder
            .as_ref()
            .map(|name| (name.clone(), self.build_number.unwrap_or(-1)))
    }

    /// Tags every engine adds at construction time.
    pub fn initial_tags(&self) -> Vec<String> {
        let mut tags = vec![format!("build_is_experimental:{}", self.experimental)];
        if let Some(bucket) = &self.bucket {
            tags.push(format!("bucket:{bucket}"));
        }
        tags
    }
}

/// Preferred OS dimension for a host platform name.
pub fn preferred_os_dimension(platform: &str) -> Option<&'static str> {
    match platform {
        "linux" => Some("Ubuntu-16.04"),
        "mac" => Some("Mac-10.13"),
        "win" => Some("Windows-7-SP1"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_removes_default_gpu_dimension() {
        let mut defaults = EngineDefaults::default();
        defaults.set_dimension("gpu", Some("nvidia")).unwrap();
        assert_eq!(defaults.dimensions().get("gpu"), Some("nvidia"));

        defaults.set_dimension("gpu", None).unwrap();
        assert!(!defaults.dimensions().contains("gpu"));
    }

    #[test]
    fn setters_reject_out_of_range_values() {
        let mut defaults = EngineDefaults::default();
        assert!(defaults.set_priority(0).is_err());
        assert!(defaults.set_expiration_secs(10).is_err());
        assert!(defaults.set_hard_timeout_secs(7 * 60 * 60).is_err());
        assert!(defaults.add_tag("no-colon").is_err());
        assert_eq!(defaults.priority(), 200);
    }

    #[test]
    fn precommit_cq_uses_single_blamelist_entry_as_user() {
        let mut defaults = EngineDefaults::default();
        let profile = ProjectProfile {
            project: "chromium".into(),
            precommit: true,
            requester: Some(COMMIT_BOT.into()),
            blamelist: vec!["dev@example.com".into()],
            ..Default::default()
        };
        defaults.configure(&profile).unwrap();

        assert_eq!(defaults.priority(), 30);
        assert_eq!(defaults.user(), Some("dev@example.com"));
        assert!(defaults.tags().contains("purpose:CQ"));
        assert!(defaults.tags().contains("project:chromium"));
        assert_eq!(defaults.dimensions().get("pool"), Some("chromium.tests"));
        assert!(defaults.idempotent());
    }

    #[test]
    fn postcommit_priority_follows_builder_group() {
        let mut defaults = EngineDefaults::default();
        let profile = ProjectProfile {
            project: "chromium".into(),
            builder_group: Some("chromium.fyi".into()),
            target_platform: Some("android".into()),
            ..Default::default()
        };
        defaults.configure(&profile).unwrap();

        assert_eq!(defaults.priority(), 35);
        assert_eq!(defaults.dimensions().get("os"), Some("Android"));
        assert!(!defaults.dimensions().contains("cpu"));
        assert!(defaults.tags().contains("purpose:CI"));
    }

    #[test]
    fn spec_name_requires_all_identifiers() {
        let mut build = BuildInfo {
            project: Some("chromium".into()),
            bucket: Some("ci".into()),
            ..Default::default()
        };
        assert_eq!(build.spec_name(), None);
        build.builder = Some("linux-rel".into());
        assert_eq!(build.spec_name().as_deref(), Some("chromium.ci:linux-rel"));
        assert_eq!(build.builder_info(), Some(("linux-rel".to_string(), -1)));
    }
}
