// tests/local_backend.rs
#![cfg(unix)]

use std::error::Error;
use std::path::Path;

use tokio_util::sync::CancellationToken;

use shardrun::backend::{LocalBackend, LocalBackendConfig};
use shardrun::cli::CliArgs;
use shardrun::collect::{CollectOptions, ShardOutcome};
use shardrun::engine::Engine;
use shardrun::errors::ShardrunError;
use shardrun::request::{BuildInfo, DimensionSet};
use shardrun::run;
use shardrun::types::StepStatus;
use shardrun_test_utils::{fast_options, init_tracing, with_timeout, TaskParamsBuilder};

type TestResult = Result<(), Box<dyn Error>>;

fn local_engine(root: &Path) -> Engine<LocalBackend> {
    let backend = LocalBackend::new(
        LocalBackendConfig {
            bot_dimensions: DimensionSet::from_pairs([
                ("os", "Linux"),
                ("cpu", "x86-64"),
                ("id", "local"),
            ]),
            work_dir: root.join("work"),
            server: Some("https://tasks.example.com".to_string()),
            bot_id: "local".to_string(),
        },
        CancellationToken::new(),
    );
    Engine::new(backend, BuildInfo::default(), fast_options(&root.join("out"))).unwrap()
}

fn sh(script: &str) -> Vec<&str> {
    vec!["sh", "-c", script]
}

#[tokio::test]
async fn sharded_processes_write_results_that_get_merged() -> TestResult {
    init_tracing();
    let root = tempfile::tempdir()?;
    let engine = local_engine(root.path());

    let spec = engine.task(
        TaskParamsBuilder::new("echo_tests")
            .shards(2)
            .command(&sh(
                r#"printf '{"shard":%s}' "$GTEST_SHARD_INDEX" > "$ISOLATED_OUTDIR/output.json""#,
            ))
            .build(),
    )?;
    let mut task = engine.trigger(spec).await?;
    let verdict = with_timeout(engine.collect(&mut task, CollectOptions::default())).await?;

    assert_eq!(verdict.status, StepStatus::Success);
    assert!(verdict.has_valid_results);
    let merged = verdict.merged_result.unwrap();
    let shards: Vec<u64> = merged
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|v| v["shard"].as_u64())
        .collect();
    assert_eq!(shards, vec![0, 1]);
    assert!(verdict
        .presentation
        .links
        .iter()
        .all(|l| l.url.starts_with("https://tasks.example.com/task?id=")));
    Ok(())
}

#[tokio::test]
async fn process_exit_code_is_reported() -> TestResult {
    init_tracing();
    let root = tempfile::tempdir()?;
    let engine = local_engine(root.path());

    let spec = engine.task(TaskParamsBuilder::new("failing").command(&sh("exit 3")).build())?;
    let mut task = engine.trigger(spec).await?;
    let verdict = with_timeout(engine.collect(&mut task, CollectOptions::default())).await?;

    assert_eq!(verdict.status, StepStatus::Failure);
    assert_eq!(verdict.failures[0].reason, "exit code 3");
    assert!(verdict.has_valid_results);
    Ok(())
}

#[tokio::test]
async fn unmatched_dimensions_expire_the_shard() -> TestResult {
    init_tracing();
    let root = tempfile::tempdir()?;
    let engine = local_engine(root.path());

    let spec = engine.task(
        TaskParamsBuilder::new("mac_only")
            .dimension("os", Some("Mac"))
            .command(&sh("true"))
            .build(),
    )?;
    let mut task = engine.trigger(spec).await?;
    let verdict = with_timeout(engine.collect(&mut task, CollectOptions::default())).await?;

    assert_eq!(verdict.status, StepStatus::Exception);
    assert_eq!(verdict.outcomes[&0], ShardOutcome::Expired);
    assert!(!verdict.has_valid_results);
    Ok(())
}

#[tokio::test]
async fn fallback_slice_runs_when_the_primary_cannot() -> TestResult {
    init_tracing();
    let root = tempfile::tempdir()?;
    let engine = local_engine(root.path());

    let spec = engine.task(
        TaskParamsBuilder::new("gpu_or_cpu")
            .dimension("gpu", Some("nvidia"))
            .optional_dimension(60, "gpu", "none")
            .command(&sh("true"))
            .build(),
    )?;
    let mut task = engine.trigger(spec).await?;
    let verdict = with_timeout(engine.collect(&mut task, CollectOptions::default())).await?;

    // The fallback does not match either (bot has no gpu=none), so it
    // expires; dropping the key entirely lets it run.
    assert_eq!(verdict.outcomes[&0], ShardOutcome::Expired);

    let mut params = TaskParamsBuilder::new("gpu_optional")
        .dimension("gpu", Some("nvidia"))
        .command(&sh("true"))
        .build();
    params
        .optional_dimensions
        .entry(60)
        .or_default()
        .insert("gpu".to_string(), None);
    let spec = engine.task(params)?;
    let mut task = engine.trigger(spec).await?;
    let verdict = with_timeout(engine.collect(&mut task, CollectOptions::default())).await?;
    assert_eq!(verdict.outcomes[&0], ShardOutcome::Ok);
    Ok(())
}

#[tokio::test]
async fn trigger_scripts_are_rejected_locally() -> TestResult {
    init_tracing();
    let root = tempfile::tempdir()?;
    let engine = local_engine(root.path());

    let spec = engine.task(
        TaskParamsBuilder::new("devices")
            .trigger_script("custom_trigger.py", false)
            .build(),
    )?;
    let err = engine.trigger(spec).await.unwrap_err();
    assert!(matches!(err, ShardrunError::Submission { shard_index: 0, .. }));
    assert!(err.is_infra());
    Ok(())
}

fn write_config(root: &Path, command: &str) -> std::io::Result<String> {
    let path = root.join("Shardrun.toml");
    let config = format!(
        r#"
[engine]
output_dir = "{out}"

[engine.poll]
initial_delay = "5ms"
max_delay = "20ms"

[local]
work_dir = "{work}"
dimensions = {{ os = "Linux", cpu = "x86-64" }}

[task.smoke]
command = ["sh", "-c", {command:?}]
dimensions = {{ os = "Linux" }}
shards = 2
"#,
        out = root.join("out").display(),
        work = root.join("work").display(),
    );
    std::fs::write(&path, config)?;
    Ok(path.display().to_string())
}

fn args(config: String, dry_run: bool) -> CliArgs {
    CliArgs {
        config,
        task: None,
        retries: None,
        log_level: None,
        dry_run,
    }
}

#[tokio::test]
async fn dry_run_submits_nothing() -> TestResult {
    init_tracing();
    let root = tempfile::tempdir()?;
    let config = write_config(root.path(), "touch ran")?;

    with_timeout(run(args(config, true))).await?;

    assert!(!root.path().join("work").exists());
    Ok(())
}

#[tokio::test]
async fn run_collects_every_configured_task() -> TestResult {
    init_tracing();
    let root = tempfile::tempdir()?;
    let config = write_config(
        root.path(),
        r#"echo '{"passed":true}' > "$ISOLATED_OUTDIR/output.json""#,
    )?;

    with_timeout(run(args(config, false))).await?;

    let task_dirs: Vec<_> = std::fs::read_dir(root.path().join("out"))?.collect();
    assert_eq!(task_dirs.len(), 1);
    let task_dir = task_dirs[0].as_ref().unwrap().path();
    assert!(task_dir.join("summary.json").is_file());
    assert!(task_dir.join("output.json").is_file());
    Ok(())
}

#[tokio::test]
async fn run_fails_when_a_shard_fails() -> TestResult {
    init_tracing();
    let root = tempfile::tempdir()?;
    let config = write_config(root.path(), r#"test "$GTEST_SHARD_INDEX" = 0"#)?;

    let err = with_timeout(run(args(config, false))).await.unwrap_err();
    assert!(matches!(err, ShardrunError::TestFailure { .. }));
    assert_eq!(err.exit_code(), 1);
    Ok(())
}
