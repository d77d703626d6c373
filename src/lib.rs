// src/lib.rs

pub mod backend;
pub mod cli;
pub mod collect;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod errors;
pub mod fs;
pub mod inputs;
pub mod logging;
pub mod merge;
pub mod request;
pub mod retry;
pub mod types;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{LocalBackend, LocalBackendConfig, TaskBackend};
use crate::cli::CliArgs;
use crate::collect::{CollectOptions, CollectVerdict};
use crate::config::loader::load_and_validate;
use crate::config::model::{ConfigFile, TaskConfig};
use crate::dispatch::DispatchedTask;
use crate::engine::Engine;
use crate::errors::{Result, ShardrunError};
use crate::request::TaskSpec;
use crate::retry::retry_spec;

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading
/// - the local backend and the engine
/// - trigger of every selected task, then collect + retry per task
/// - Ctrl-C handling
pub async fn run(args: CliArgs) -> Result<()> {
    let config_path = PathBuf::from(&args.config);
    let cfg = load_and_validate(&config_path)?;
    let selected = select_tasks(&cfg, args.task.as_deref())?;

    let cancel = CancellationToken::new();
    let backend = LocalBackend::new(
        LocalBackendConfig {
            bot_dimensions: cfg.local.dimensions.clone(),
            work_dir: cfg.local.work_dir.clone(),
            server: cfg.server.clone(),
            bot_id: cfg.local.bot_id.clone(),
        },
        cancel.clone(),
    );

    let mut engine =
        Engine::new(backend, cfg.build.clone(), cfg.engine.clone())?.with_cancellation(cancel.clone());
    if let Some(profile) = &cfg.profile {
        engine.configure(profile)?;
    }
    cfg.defaults.apply(engine.defaults_mut())?;

    let root_dir = config_root_dir(&config_path);
    let mut specs = Vec::with_capacity(selected.len());
    for task in selected {
        let mut params = task.params.clone();
        if let Some(dir) = &task.input_dir {
            let dir = root_dir.join(dir);
            let digest = inputs::digest_dir(&dir, &task.input_exclude)?;
            let input = digest.input_ref();
            engine.backend().register_input(&input, dir);
            params.input = Some(input);
        }
        specs.push((task, engine.task(params)?));
    }

    if args.dry_run {
        print_dry_run(&engine, &specs)?;
        return Ok(());
    }

    // Ctrl-C → cancel running shards and the collect wait.
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for Ctrl+C");
                return;
            }
            info!("Ctrl+C received; cancelling");
            cancel.cancel();
        });
    }

    // Trigger everything first so tasks run concurrently, then collect.
    let mut dispatched = Vec::with_capacity(specs.len());
    for (task, spec) in specs {
        dispatched.push((task, engine.trigger(spec).await?));
    }

    let mut first_error = None;
    for (task, dispatched_task) in dispatched {
        let retries = args.retries.unwrap_or(task.retries);
        if let Err(err) = collect_with_retries(&engine, task, dispatched_task, retries).await {
            error!(task = %task.name, error = %err, "task failed");
            if matches!(err, ShardrunError::Cancelled) {
                return Err(err);
            }
            first_error.get_or_insert(err);
        }
    }

    if let Some(stats) = engine.report_stats() {
        println!();
        println!("{stats}");
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn select_tasks<'a>(cfg: &'a ConfigFile, name: Option<&str>) -> Result<Vec<&'a TaskConfig>> {
    match name {
        Some(name) => cfg
            .tasks
            .get(name)
            .map(|task| vec![task])
            .ok_or_else(|| {
                ShardrunError::InvalidConfig(format!(
                    "unknown task '{name}'; known tasks: {}",
                    cfg.tasks.keys().cloned().collect::<Vec<_>>().join(", ")
                ))
            }),
        None => Ok(cfg.tasks.values().collect()),
    }
}

/// Collect `task`, re-dispatching only its failed shards up to `retries`
/// times. The last collect decides the result.
async fn collect_with_retries<B: TaskBackend>(
    engine: &Engine<B>,
    task: &TaskConfig,
    mut dispatched: DispatchedTask,
    retries: u32,
) -> Result<()> {
    let options = CollectOptions {
        failure_as_exception: task.failure_as_exception,
        ignore_task_failure: task.ignore_task_failure,
    };

    let verbose = engine.options().verbose;
    let mut attempt = 0;
    loop {
        let result = engine.collect(&mut dispatched, options).await;
        let retryable = match &result {
            Ok(verdict) => {
                print_verdict(verdict, verbose);
                true
            }
            Err(err) => {
                if let Some(verdict) = err.verdict() {
                    print_verdict(verdict, verbose);
                }
                err.verdict().is_some()
            }
        };

        if !retryable || attempt >= retries || dispatched.failed_shards.is_empty() {
            return result.map(|_| ());
        }

        attempt += 1;
        info!(
            task = %task.name,
            attempt,
            shards = ?dispatched.failed_shards,
            "retrying failed shards"
        );
        let spec = retry_spec(Arc::new(dispatched))?;
        dispatched = engine.trigger(spec).await?;
    }
}

/// Verdict on stdout; captured logs only with `verbose`.
fn print_verdict(verdict: &CollectVerdict, verbose: bool) {
    println!("[{}] {}", verdict.status, verdict.step_name);
    for line in &verdict.presentation.step_text {
        println!("    {line}");
    }
    for link in &verdict.presentation.links {
        println!("    {}: {}", link.label, link.url);
    }
    for failure in &verdict.failures {
        println!("    {failure}");
    }
    if !verdict.has_valid_results {
        println!("    (results are incomplete)");
    }
    for (name, log) in &verdict.presentation.logs {
        if log.trim().is_empty() {
            continue;
        }
        if verbose {
            println!("    --- {name} ---");
            for line in log.lines() {
                println!("    {line}");
            }
        } else {
            debug!(log = %name, "{log}");
        }
    }
}

/// Figure out the directory relative `input_dir` paths are resolved against.
///
/// - If the config path has a non-empty parent (e.g. "ci/Shardrun.toml"),
///   we use that directory.
/// - If it's just a bare filename like "Shardrun.toml" (parent = ""),
///   we fall back to the current working directory "."
fn config_root_dir(config_path: &Path) -> PathBuf {
    match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    }
}

/// Dry-run output: the shard requests every selected task would submit.
fn print_dry_run<B: TaskBackend>(engine: &Engine<B>, specs: &[(&TaskConfig, TaskSpec)]) -> Result<()> {
    println!("shardrun dry-run");
    println!("  output_dir = {:?}", engine.options().output_dir);
    println!();

    for (task, spec) in specs {
        let requests = engine.shard_requests(spec)?;
        println!("task {} ({} of {} shards):", task.name, requests.len(), spec.shards);
        println!("  identity: {}", spec.task_name());
        println!("{}", serde_json::to_string_pretty(&requests)?);
    }

    debug!("dry-run complete (no submission)");
    Ok(())
}
