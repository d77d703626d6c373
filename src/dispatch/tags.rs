// src/dispatch/tags.rs

//! Tags attached to every shard.
//!
//! Tags are for fleet analytics only; nothing downstream depends on them
//! for correctness.

use std::collections::BTreeSet;

use crate::dispatch::naming::step_name;
use crate::request::{BuildInfo, TaskSpec};

/// Union of spec tags (which already include the engine defaults) and the
/// tags derived from the input reference, title and build identity.
pub fn task_tags(spec: &TaskSpec, build: &BuildInfo) -> BTreeSet<String> {
    let mut tags = spec.tags.clone();

    if let Some(input) = &spec.input {
        tags.insert(format!("data:{}", input.as_str()));
    }
    if let Some(first_word) = spec.title.split(' ').next() {
        tags.insert(format!("name:{first_word}"));
    }
    if let Some(group) = &build.builder_group {
        tags.insert(format!("builder_group:{group}"));
    }
    if let Some(spec_name) = &spec.spec_name {
        tags.insert(format!("spec_name:{spec_name}"));
    }
    if let Some((builder, number)) = &spec.builder_info {
        tags.insert(format!("buildername:{builder}"));
        if *number != -1 {
            tags.insert(format!("buildnumber:{number}"));
        }
    }
    if let Some(bot_id) = &build.bot_id {
        tags.insert(format!("slavename:{bot_id}"));
    }

    tags.insert(format!(
        "stepname:{}",
        step_name("", spec, build.platform.as_deref())
    ));

    for cl in &build.gerrit_changes {
        tags.insert(format!(
            "gerrit:https://{}/c/{}/{}",
            cl.host, cl.change, cl.patchset
        ));
    }

    tags
}
