// src/logging.rs

//! Diagnostics for a shardrun invocation.
//!
//! Stdout carries the per-task verdict blocks printed by [`crate::run`];
//! everything here goes to stderr. Engine events carry structured fields
//! (`task`, `shard`, `task_id`, `attempt`) so one shard can be followed
//! from submission through polling to its merge. Merge script logs are
//! only echoed at `debug` unless `[engine] verbose` prints them with the
//! verdict.
//!
//! `--log-level` wins over `SHARDRUN_LOG`; an unset or unparsable
//! variable means `info`.

use anyhow::Result;
use tracing::Level;
use tracing_subscriber::fmt;

use crate::cli::LogLevel;

const LOG_ENV: &str = "SHARDRUN_LOG";

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(cli_level: Option<LogLevel>) -> Result<()> {
    let level = resolve_level(cli_level, std::env::var(LOG_ENV).ok().as_deref());

    fmt()
        .with_max_level(level)
        .with_target(level >= Level::DEBUG)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("installing tracing subscriber: {e}"))?;

    Ok(())
}

fn resolve_level(cli_level: Option<LogLevel>, env: Option<&str>) -> Level {
    match cli_level {
        Some(LogLevel::Error) => Level::ERROR,
        Some(LogLevel::Warn) => Level::WARN,
        Some(LogLevel::Info) => Level::INFO,
        Some(LogLevel::Debug) => Level::DEBUG,
        Some(LogLevel::Trace) => Level::TRACE,
        None => env
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(Level::INFO),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_beats_environment_and_bad_values_fall_back_to_info() {
        assert_eq!(resolve_level(Some(LogLevel::Warn), Some("trace")), Level::WARN);
        assert_eq!(resolve_level(None, Some(" debug ")), Level::DEBUG);
        assert_eq!(resolve_level(None, Some("chatty")), Level::INFO);
        assert_eq!(resolve_level(None, None), Level::INFO);
    }
}
