// src/collect/stats.rs

//! Observational timing statistics. Nothing here affects a verdict.

use std::fmt;

use crate::collect::record::ShardRecord;

/// `NNs` below a minute, `Xm Ys` otherwise.
pub fn fmt_time(seconds: f64) -> String {
    let total = seconds.round() as i64;
    let (mins, secs) = (total.div_euclid(60), total.rem_euclid(60));
    if mins > 0 {
        format!("{mins}m {secs}s")
    } else {
        format!("{secs}s")
    }
}

/// Timing of one shard that ran to completion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShardTiming {
    pub index: u32,
    /// Wall clock from start to completion.
    pub duration: f64,
    /// Command runtime as reported by the shard.
    pub runtime: f64,
    /// `duration - runtime`.
    pub overhead: f64,
}

impl ShardTiming {
    /// Timing of a shard that started, completed and reported a runtime.
    pub fn of(index: u32, record: &ShardRecord) -> Option<Self> {
        let runtime = record.duration.filter(|d| *d > 0.0)?;
        let duration = record.wall_clock_secs()?;
        Some(Self {
            index,
            duration,
            runtime,
            overhead: duration - runtime,
        })
    }
}

/// Aggregate timing over the shards of one collect.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeStats {
    pub shard_count: usize,
    /// Longest pending time and the shard it belongs to.
    pub max_pending: Option<(f64, u32)>,
    pub max: Option<ShardTiming>,
    pub min: Option<ShardTiming>,
    pub total_duration: f64,
    pub total_runtime: f64,
    pub total_overhead: f64,
}

impl TimeStats {
    pub fn from_records(shards: &[(u32, Option<&ShardRecord>)]) -> Self {
        let mut stats = TimeStats {
            shard_count: shards.len(),
            ..Default::default()
        };

        for (index, record) in shards {
            let Some(record) = record.filter(|r| r.started_ts.is_some()) else {
                continue;
            };

            if let Some(pending) = record.pending_secs() {
                if stats.max_pending.is_none_or(|(max, _)| pending > max) {
                    stats.max_pending = Some((pending, *index));
                }
            }

            let Some(timing) = ShardTiming::of(*index, record) else {
                continue;
            };
            stats.total_duration += timing.duration;
            stats.total_runtime += timing.runtime;
            stats.total_overhead += timing.overhead;
            if stats.max.is_none_or(|m| timing.duration > m.duration) {
                stats.max = Some(timing);
            }
            if stats.min.is_none_or(|m| timing.duration < m.duration) {
                stats.min = Some(timing);
            }
        }

        stats
    }

    /// Lines appended to the collect step text.
    pub fn step_text_lines(&self) -> Vec<String> {
        let sharded = self.shard_count > 1;
        let mut lines = Vec::new();

        // Short pending times are noise.
        if let Some((pending, index)) = self.max_pending.filter(|(p, _)| *p > 10.0) {
            if sharded {
                lines.push(format!(
                    "Max pending time: {} (shard #{index})",
                    fmt_time(pending)
                ));
            } else {
                lines.push(format!("Pending time: {}", fmt_time(pending)));
            }
        }

        if let Some(max) = self.max.filter(|m| m.duration > 0.0) {
            let (prefix, suffix) = if sharded {
                ("Max s", format!(" (shard #{})", max.index))
            } else {
                ("S", String::new())
            };
            lines.push(format!(
                "{prefix}hard runtime ({}) + overhead ({}): {}{suffix}",
                fmt_time(max.runtime),
                fmt_time(max.overhead),
                fmt_time(max.duration)
            ));
        }

        if sharded {
            if let Some(min) = self.min {
                lines.push(format!(
                    "Min shard runtime ({}) + overhead ({}): {} (shard #{})",
                    fmt_time(min.runtime),
                    fmt_time(min.overhead),
                    fmt_time(min.duration),
                    min.index
                ));
            }
            lines.push(format!(
                "Total shard runtime ({}) + overhead ({}): {}",
                fmt_time(self.total_runtime),
                fmt_time(self.total_overhead),
                fmt_time(self.total_duration)
            ));
        }

        lines
    }
}

/// Engine-wide shard runtime statistics across every collect so far.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineStats {
    pub total_shards: usize,
    pub total_runtime: f64,
    pub min: f64,
    pub mean: f64,
    pub max: f64,
}

impl EngineStats {
    /// `None` when no shard reported a runtime.
    pub fn from_durations(durations: &[f64]) -> Option<Self> {
        if durations.is_empty() {
            return None;
        }
        let total: f64 = durations.iter().sum();
        let min = durations.iter().copied().fold(f64::INFINITY, f64::min);
        let max = durations.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Some(Self {
            total_shards: durations.len(),
            total_runtime: total,
            min,
            mean: total / durations.len() as f64,
            max,
        })
    }
}

impl fmt::Display for EngineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Total shards: {}", self.total_shards)?;
        writeln!(f, "Total runtime: {}", fmt_time(self.total_runtime))?;
        write!(
            f,
            "Min/mean/max: {} / {} / {}",
            fmt_time(self.min),
            fmt_time(self.mean),
            fmt_time(self.max)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskState;

    fn timed(started: &str, completed: &str, runtime: f64) -> ShardRecord {
        let mut r = ShardRecord::new("t", TaskState::Completed);
        r.created_ts = Some("2020-01-01T00:00:00".into());
        r.started_ts = Some(started.into());
        r.completed_ts = Some(completed.into());
        r.duration = Some(runtime);
        r
    }

    #[test]
    fn fmt_time_switches_to_minutes() {
        assert_eq!(fmt_time(0.4), "0s");
        assert_eq!(fmt_time(59.0), "59s");
        assert_eq!(fmt_time(60.0), "1m 0s");
        assert_eq!(fmt_time(125.6), "2m 6s");
    }

    #[test]
    fn sharded_stats_report_max_min_and_totals() {
        let a = timed("2020-01-01T00:00:20", "2020-01-01T00:01:20", 50.0);
        let b = timed("2020-01-01T00:00:05", "2020-01-01T00:00:35", 25.0);
        let shards = [(0, Some(&a)), (1, None), (2, Some(&b))];

        let stats = TimeStats::from_records(&shards);
        assert_eq!(stats.max_pending, Some((20.0, 0)));
        assert_eq!(stats.max.unwrap().index, 0);
        assert_eq!(stats.min.unwrap().index, 2);
        assert_eq!(stats.total_duration, 90.0);

        let lines = stats.step_text_lines();
        assert_eq!(lines[0], "Max pending time: 20s (shard #0)");
        assert_eq!(
            lines[1],
            "Max shard runtime (50s) + overhead (10s): 1m 0s (shard #0)"
        );
        assert_eq!(
            lines[3],
            "Total shard runtime (1m 15s) + overhead (15s): 1m 30s"
        );
    }

    #[test]
    fn engine_stats_summary() {
        let stats = EngineStats::from_durations(&[10.0, 20.0, 90.0]).unwrap();
        assert_eq!(stats.total_shards, 3);
        assert_eq!(
            stats.to_string(),
            "Total shards: 3\nTotal runtime: 2m 0s\nMin/mean/max: 10s / 40s / 1m 30s"
        );
        assert!(EngineStats::from_durations(&[]).is_none());
    }
}
