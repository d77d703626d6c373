// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, ValueEnum};

/// Command-line arguments for `shardrun`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "shardrun",
    version,
    about = "Trigger sharded tasks, collect their results and retry failed shards.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// Default: `Shardrun.toml` in the current working directory.
    #[arg(long, value_name = "PATH", default_value = "Shardrun.toml")]
    pub config: String,

    /// Run only the task with this name.
    #[arg(long, value_name = "NAME")]
    pub task: Option<String>,

    /// Override the per-task `retries` setting for failed shards.
    #[arg(long, value_name = "N")]
    pub retries: Option<u32>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `SHARDRUN_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Parse + validate, print the shard requests, but don't submit anything.
    #[arg(long)]
    pub dry_run: bool,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
