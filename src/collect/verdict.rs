// src/collect/verdict.rs

//! Pure verdict assembly: shard records in, verdict and presentation out.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::collect::classify::{classify, ShardOutcome};
use crate::collect::record::ShardRecord;
use crate::collect::stats::{fmt_time, TimeStats};
use crate::dispatch::{DispatchedTask, ShardHandle};
use crate::errors::ShardFailure;
use crate::merge::MergeOutput;
use crate::types::StepStatus;

/// Caller choices for one collect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectOptions {
    /// Return an error (instead of only a verdict) when shards fail.
    pub failure_as_exception: bool,
    /// Never escalate test failures to an error.
    pub ignore_task_failure: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Link {
    pub label: String,
    pub url: String,
}

/// What a human sees for the collect step.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StepPresentation {
    pub status: StepStatus,
    pub step_text: Vec<String>,
    pub links: Vec<Link>,
    pub logs: BTreeMap<String, String>,
}

impl StepPresentation {
    fn link(&mut self, label: impl Into<String>, url: impl Into<String>) {
        self.links.push(Link {
            label: label.into(),
            url: url.into(),
        });
    }
}

/// Unified result of collecting one dispatched task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectVerdict {
    pub step_name: String,
    pub status: StepStatus,
    /// False when any shard produced no meaningful test signal.
    pub has_valid_results: bool,
    pub merged_result: Option<serde_json::Value>,
    pub outcomes: BTreeMap<u32, ShardOutcome>,
    pub failed_shards: BTreeSet<u32>,
    #[serde(skip)]
    pub failures: Vec<ShardFailure>,
    pub presentation: StepPresentation,
}

/// Per-shard inputs of one collect, in shard order.
#[derive(Debug, Clone)]
pub struct CollectedShard {
    pub handle: ShardHandle,
    pub record: Option<ShardRecord>,
}

/// Presentation knobs taken from the engine.
#[derive(Debug, Clone, Copy)]
pub struct PresentationOptions {
    pub show_outputs_ref: bool,
}

/// Classify every shard and build the verdict, before merge results are
/// folded in.
pub fn assemble_verdict(
    task: &DispatchedTask,
    shards: &[CollectedShard],
    options: PresentationOptions,
) -> CollectVerdict {
    let mut presentation = StepPresentation {
        step_text: task_text(task),
        ..Default::default()
    };
    let mut outcomes = BTreeMap::new();
    let mut failures = Vec::new();
    let mut failed_shards = BTreeSet::new();
    let mut status = StepStatus::Success;

    // Only shards dispatched by this task get links; shards carried over
    // from a retried task were shown by its own collect.
    let dispatched = task.dispatched_task_ids();

    for shard in shards {
        let index = shard.handle.shard_index;
        let record = shard.record.as_ref();
        let outcome = classify(record);
        let duration = record
            .filter(|r| !r.internal_failure)
            .and_then(|r| r.wall_clock_secs());

        let mut label = match (record, duration) {
            (Some(r), Some(duration)) => {
                let runtime = r.duration.unwrap_or(duration);
                format!(
                    "shard #{index} (runtime ({}) + overhead ({}): {})",
                    fmt_time(runtime),
                    fmt_time(duration - runtime),
                    fmt_time(duration)
                )
            }
            _ => format!("shard #{index}"),
        };
        if record.is_some_and(|r| r.deduped_from.is_some()) {
            label.push_str(" (deduped)");
        }

        let reason = match outcome {
            ShardOutcome::Ok => None,
            ShardOutcome::Missing => {
                label = format!("shard #{index} failed without producing output.json");
                Some(outcome.reason().to_string())
            }
            ShardOutcome::InternalFailure => {
                label = format!("shard #{index} had an internal failure");
                Some(outcome.reason().to_string())
            }
            ShardOutcome::Expired => {
                label = format!("shard #{index} expired, not enough capacity");
                Some(outcome.reason().to_string())
            }
            ShardOutcome::TimedOut => {
                label = match duration {
                    Some(d) => format!("shard #{index} timed out after {}", fmt_time(d)),
                    None => format!("shard #{index} timed out, took too much time to complete"),
                };
                Some(outcome.reason().to_string())
            }
            ShardOutcome::FailedExitNonzero => {
                label = match duration {
                    Some(d) => format!("shard #{index} (failed) ({})", fmt_time(d)),
                    None => format!("shard #{index} (failed)"),
                };
                Some(match record.and_then(|r| r.effective_exit_code()) {
                    Some(code) => format!("exit code {code}"),
                    None => format!(
                        "unknown exit code (state {})",
                        record.map(|r| r.state.as_str()).unwrap_or("?")
                    ),
                })
            }
        };

        if let Some(reason) = reason {
            failures.push(ShardFailure::new(index, reason));
            failed_shards.insert(index);
        }
        status = status.worst(outcome.status());
        outcomes.insert(index, outcome);

        let show = dispatched.contains(shard.handle.task_id.as_str());
        if show && options.show_outputs_ref {
            if let Some(outputs) = record.and_then(|r| r.outputs_ref.as_ref()) {
                presentation.link(format!("shard #{index} isolated out"), outputs.browse_url());
            }
        }
        if show {
            if let Some(url) = &shard.handle.view_url {
                presentation.link(label, url.clone());
            }
        }
    }

    let timed: Vec<(u32, Option<&ShardRecord>)> = shards
        .iter()
        .map(|s| (s.handle.shard_index, s.record.as_ref()))
        .collect();
    presentation
        .step_text
        .extend(TimeStats::from_records(&timed).step_text_lines());

    let has_valid_results = !outcomes.values().any(|o| o.invalidates_results());
    presentation.status = status;

    CollectVerdict {
        step_name: task.step_name.clone(),
        status,
        has_valid_results,
        merged_result: None,
        outcomes,
        failed_shards,
        failures,
        presentation,
    }
}

/// Fold the merge stage output into the verdict.
///
/// Shards the merge reports as missing make the verdict an infra failure.
pub fn apply_merge_output(
    verdict: &mut CollectVerdict,
    merge: MergeOutput,
    view_urls: &BTreeMap<u32, Option<String>>,
) {
    for (label, url) in merge.links() {
        verdict.presentation.link(label, url);
    }

    let missing = merge.missing_shards();
    if !missing.is_empty() {
        verdict.status = StepStatus::Exception;
        verdict.presentation.status = StepStatus::Exception;
        verdict.has_valid_results = false;
        for index in missing {
            if let Some(Some(url)) = view_urls.get(&index) {
                verdict
                    .presentation
                    .link(format!("missing shard #{index}"), url.clone());
            }
            if verdict.failed_shards.insert(index) {
                verdict
                    .failures
                    .push(ShardFailure::new(index, "missing from merged results"));
            }
        }
    }

    verdict
        .presentation
        .logs
        .insert("Merge script log".to_string(), merge.log);
    verdict.merged_result = merge.merged;
}

fn task_text(task: &DispatchedTask) -> Vec<String> {
    let mut lines = Vec::new();
    if let Some(id) = task.spec.dimensions.get("id") {
        lines.push(format!("Bot id: '{id}'"));
    }
    if let Some(os) = task.spec.os() {
        lines.push(format!("Run on OS: '{os}'"));
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{build_task_spec, BuildInfo, EngineDefaults, TaskParams};
    use crate::types::TaskState;

    fn task(shards: u32) -> DispatchedTask {
        let mut params = TaskParams::new("unit_tests", vec!["./t".into()]);
        params.dimensions.insert("os".into(), Some("Linux".into()));
        params.shards = shards;
        let spec = build_task_spec(&EngineDefaults::default(), &BuildInfo::default(), params).unwrap();
        let trigger_output = (0..shards)
            .map(|i| (i, handle(i)))
            .collect();
        DispatchedTask::new(spec, trigger_output, "unit_tests".into())
    }

    fn handle(index: u32) -> ShardHandle {
        ShardHandle {
            task_id: format!("id{index}"),
            shard_index: index,
            name: format!("unit_tests:4:{index}"),
            view_url: Some(format!("https://tasks/task?id=id{index}")),
            invocation: None,
        }
    }

    fn completed(index: u32, exit_code: i64) -> CollectedShard {
        let mut record = ShardRecord::new(format!("id{index}"), TaskState::Completed);
        record.exit_code = Some(exit_code);
        CollectedShard {
            handle: handle(index),
            record: Some(record),
        }
    }

    const OPTS: PresentationOptions = PresentationOptions {
        show_outputs_ref: true,
    };

    #[test]
    fn nonzero_exit_is_failure_with_valid_results() {
        let task = task(4);
        let shards = vec![completed(0, 0), completed(1, 0), completed(2, 1), completed(3, 0)];
        let verdict = assemble_verdict(&task, &shards, OPTS);

        assert_eq!(verdict.status, StepStatus::Failure);
        assert!(verdict.has_valid_results);
        assert_eq!(verdict.failed_shards, BTreeSet::from([2]));
        assert_eq!(verdict.failures[0].reason, "exit code 1");
        assert!(verdict
            .presentation
            .links
            .iter()
            .any(|l| l.label == "shard #2 (failed)"));
    }

    #[test]
    fn missing_shard_is_exception_without_valid_results() {
        let task = task(4);
        let mut shards = vec![completed(0, 0), completed(1, 0), completed(2, 0), completed(3, 0)];
        shards[1].record = None;
        let verdict = assemble_verdict(&task, &shards, OPTS);

        assert_eq!(verdict.status, StepStatus::Exception);
        assert!(!verdict.has_valid_results);
        assert!(verdict.failed_shards.contains(&1));
        assert_eq!(verdict.failures.len(), 1);
    }

    #[test]
    fn merge_reported_missing_shards_invalidate_results() {
        let task = task(2);
        let shards = vec![completed(0, 0), completed(1, 0)];
        let mut verdict = assemble_verdict(&task, &shards, OPTS);
        assert_eq!(verdict.status, StepStatus::Success);

        let urls = task
            .trigger_output
            .iter()
            .map(|(i, h)| (*i, h.view_url.clone()))
            .collect();
        apply_merge_output(
            &mut verdict,
            MergeOutput {
                merged: Some(serde_json::json!({"missing_shards": [1]})),
                log: "merged".into(),
                exit_code: Some(0),
            },
            &urls,
        );

        assert_eq!(verdict.status, StepStatus::Exception);
        assert!(!verdict.has_valid_results);
        assert_eq!(verdict.failed_shards, BTreeSet::from([1]));
        assert!(verdict
            .presentation
            .links
            .iter()
            .any(|l| l.label == "missing shard #1"));
        assert_eq!(
            verdict.presentation.logs.get("Merge script log").map(String::as_str),
            Some("merged")
        );
    }
}
