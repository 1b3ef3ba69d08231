// stress-core/src/metrics.rs
// Per-stressor metrics aggregation and the run summary

use crate::error::*;
use crate::supervisor::{BatchStatus, FailCause, ProcState, ProcessRecord, StopReason, StressorBatch};
use crate::worker::WorkerStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

/// How much detail the summary carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricsMode {
    Off,
    #[default]
    Brief,
    Full,
}

impl FromStr for MetricsMode {
    type Err = StressError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "off" | "none" => Ok(MetricsMode::Off),
            "brief" => Ok(MetricsMode::Brief),
            "full" => Ok(MetricsMode::Full),
            _ => Err(crate::config_error!(
                "metrics",
                format!("unknown mode '{s}', available: off, brief, full")
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceMetrics {
    pub instance: u32,
    pub pid: Option<i32>,
    pub bogo_ops: u64,
    pub elapsed_secs: f64,
    pub user_secs: f64,
    pub system_secs: f64,
    pub state: ProcState,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StressorMetrics {
    pub name: String,
    pub class: String,
    pub requested: u32,
    pub started: u32,
    pub bogo_ops: u64,
    /// Last finish minus first start
    pub elapsed_secs: f64,
    pub ops_per_sec: f64,
    pub user_secs: f64,
    pub system_secs: f64,
    pub status: BatchStatus,
    /// Terminal state per instance, `Pending` for instances never started
    pub states: Vec<ProcState>,
    /// Full mode only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instances: Option<Vec<InstanceMetrics>>,
}

impl StressorMetrics {
    pub fn failed_instances(&self) -> usize {
        self.states.iter().filter(|s| s.is_failure()).count()
    }

    pub fn verification_failed(&self) -> bool {
        self.states
            .iter()
            .any(|s| *s == ProcState::ExitedFail(FailCause::Verification))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunTotals {
    pub bogo_ops: u64,
    pub instances_started: u32,
    pub instances_failed: usize,
    pub user_secs: f64,
    pub system_secs: f64,
}

/// Fold records and counter snapshots into per-stressor metrics.
///
/// Pure: the same inputs always give the same output.
pub fn aggregate(
    batches: &[StressorBatch],
    records: &[ProcessRecord],
    counters: &[u64],
    mode: MetricsMode,
) -> Vec<StressorMetrics> {
    batches
        .iter()
        .enumerate()
        .map(|(idx, batch)| {
            let owned: Vec<&ProcessRecord> = records.iter().filter(|r| r.stressor == idx).collect();
            let ops_of = |r: &ProcessRecord| counters.get(r.slot).copied().unwrap_or(0);

            let first_start: Option<Instant> = owned.iter().map(|r| r.started).min();
            let last_finish: Option<Instant> = owned.iter().filter_map(|r| r.finished).max();
            let elapsed_secs = match (first_start, last_finish) {
                (Some(start), Some(finish)) => finish.saturating_duration_since(start).as_secs_f64(),
                _ => 0.0,
            };

            let bogo_ops: u64 = owned.iter().map(|r| ops_of(*r)).sum();
            let ops_per_sec = if elapsed_secs > 0.0 {
                bogo_ops as f64 / elapsed_secs
            } else {
                0.0
            };

            let find = |instance: u32| owned.iter().find(|r| r.instance == instance).copied();
            let states = (0..batch.requested)
                .map(|i| find(i).map(|r| r.state).unwrap_or(ProcState::Pending))
                .collect();

            let instances = (mode == MetricsMode::Full).then(|| {
                (0..batch.requested)
                    .map(|i| match find(i) {
                        Some(r) => InstanceMetrics {
                            instance: i,
                            pid: Some(r.pid),
                            bogo_ops: ops_of(r),
                            elapsed_secs: r.elapsed().as_secs_f64(),
                            user_secs: r.user_time.as_secs_f64(),
                            system_secs: r.system_time.as_secs_f64(),
                            state: r.state,
                        },
                        None => InstanceMetrics {
                            instance: i,
                            pid: None,
                            bogo_ops: 0,
                            elapsed_secs: 0.0,
                            user_secs: 0.0,
                            system_secs: 0.0,
                            state: ProcState::Pending,
                        },
                    })
                    .collect()
            });

            StressorMetrics {
                name: batch.name.to_string(),
                class: batch.class.to_string(),
                requested: batch.requested,
                started: owned.len() as u32,
                bogo_ops,
                elapsed_secs,
                ops_per_sec,
                user_secs: owned.iter().map(|r| r.user_time.as_secs_f64()).sum(),
                system_secs: owned.iter().map(|r| r.system_time.as_secs_f64()).sum(),
                status: batch.status.clone(),
                states,
                instances,
            }
        })
        .collect()
}

pub fn totals(stressors: &[StressorMetrics]) -> RunTotals {
    stressors.iter().fold(RunTotals::default(), |mut acc, s| {
        acc.bogo_ops += s.bogo_ops;
        acc.instances_started += s.started;
        acc.instances_failed += s.failed_instances();
        acc.user_secs += s.user_secs;
        acc.system_secs += s.system_secs;
        acc
    })
}

/// Outcome of one harness run
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub duration_secs: f64,
    /// None for a dry run
    pub stop_reason: Option<StopReason>,
    pub aborted: bool,
    pub interrupted: bool,
    pub dry_run: bool,
    pub metrics: MetricsMode,
    pub times: bool,
    pub stressors: Vec<StressorMetrics>,
    pub totals: RunTotals,
}

impl RunResult {
    /// Process exit status for the runner.
    ///
    /// Nonzero only when a requested stressor started no instance at all
    /// or an instance failed verification.
    pub fn exit_code(&self) -> i32 {
        if self.stressors.iter().any(|s| s.verification_failed()) {
            return WorkerStatus::EXIT_VERIFY_FAILED;
        }
        if !self.dry_run && self.stressors.iter().any(|s| s.requested > 0 && s.started == 0) {
            return WorkerStatus::EXIT_FAILED;
        }
        0
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write the summary through `tracing`
    pub fn log_summary(&self) {
        info!(
            "Run {} ({}) finished in {:.2}s: {}",
            self.run_id,
            self.started_at.to_rfc3339(),
            self.duration_secs,
            self.stop_reason
                .map(|r| r.to_string())
                .unwrap_or_else(|| "dry run".to_string())
        );

        for s in &self.stressors {
            match &s.status {
                BatchStatus::Skipped(reason) => warn!("{}: skipped, {}", s.name, reason),
                BatchStatus::Partial(reason) => warn!(
                    "{}: started {} of {} instances, {}",
                    s.name, s.started, s.requested, reason
                ),
                _ => {}
            }
            if s.failed_instances() > 0 {
                warn!("{}: {} of {} instances failed", s.name, s.failed_instances(), s.started);
            }
        }

        if self.metrics == MetricsMode::Off {
            return;
        }

        info!(
            "{:<12} {:>14} {:>10} {:>14}{}",
            "stressor",
            "bogo ops",
            "real (s)",
            "ops/s (real)",
            if self.times { "    usr (s)    sys (s)" } else { "" }
        );
        for s in &self.stressors {
            let times = if self.times {
                format!(" {:>10.2} {:>10.2}", s.user_secs, s.system_secs)
            } else {
                String::new()
            };
            info!(
                "{:<12} {:>14} {:>10.2} {:>14.2}{}",
                s.name, s.bogo_ops, s.elapsed_secs, s.ops_per_sec, times
            );

            for i in s.instances.iter().flatten() {
                info!(
                    "  #{:<4} pid {:>8} {:>14} {:>10.2}  {}",
                    i.instance,
                    i.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
                    i.bogo_ops,
                    i.elapsed_secs,
                    i.state
                );
            }
        }

        if self.times {
            info!(
                "CPU time: {:.2}s user, {:.2}s system over {} instances",
                self.totals.user_secs, self.totals.system_secs, self.totals.instances_started
            );
        }
        if self.aborted {
            warn!("Run aborted after repeated failures");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::StressClass;
    use crate::supervisor::ShortfallReason;
    use proptest::prelude::*;
    use std::time::Duration;

    fn record(stressor: usize, instance: u32, slot: usize, base: Instant, start_ms: u64, end_ms: u64, state: ProcState) -> ProcessRecord {
        ProcessRecord {
            pid: 1000 + slot as i32,
            stressor,
            instance,
            slot,
            started: base + Duration::from_millis(start_ms),
            finished: Some(base + Duration::from_millis(end_ms)),
            state,
            user_time: Duration::from_millis(10),
            system_time: Duration::from_millis(5),
        }
    }

    fn sample() -> (Vec<StressorBatch>, Vec<ProcessRecord>, Vec<u64>) {
        let base = Instant::now();
        let mut a = StressorBatch::new("a", StressClass::CPU, 2, 1000);
        a.launched = 2;
        a.status = BatchStatus::Complete;
        let mut b = StressorBatch::new("b", StressClass::IO, 3, 0);
        b.launched = 1;
        b.status = BatchStatus::Partial(ShortfallReason::AbortThreshold);

        let records = vec![
            record(0, 0, 0, base, 0, 1500, ProcState::ExitedOk),
            record(0, 1, 1, base, 100, 2000, ProcState::ExitedOk),
            record(1, 0, 2, base, 200, 400, ProcState::ExitedFail(FailCause::Verification)),
        ];
        (vec![a, b], records, vec![1000, 1000, 7])
    }

    #[test]
    fn test_brief_aggregation() {
        let (batches, records, counters) = sample();
        let metrics = aggregate(&batches, &records, &counters, MetricsMode::Brief);

        assert_eq!(metrics.len(), 2);
        let a = &metrics[0];
        assert_eq!(a.bogo_ops, 2000);
        assert_eq!(a.started, 2);
        assert!((a.elapsed_secs - 2.0).abs() < 1e-9);
        assert!((a.ops_per_sec - 1000.0).abs() < 1e-6);
        assert!(a.instances.is_none());

        let b = &metrics[1];
        assert_eq!(b.states.len(), 3);
        assert_eq!(b.states[1], ProcState::Pending);
        assert_eq!(b.failed_instances(), 1);
        assert!(b.verification_failed());
    }

    #[test]
    fn test_full_mode_reports_unstarted_instances() {
        let (batches, records, counters) = sample();
        let metrics = aggregate(&batches, &records, &counters, MetricsMode::Full);

        let instances = metrics[1].instances.as_ref().unwrap();
        assert_eq!(instances.len(), 3);
        assert_eq!(instances[0].bogo_ops, 7);
        assert_eq!(instances[2].state, ProcState::Pending);
        assert_eq!(instances[2].bogo_ops, 0);
        assert_eq!(instances[2].elapsed_secs, 0.0);
        assert_eq!(instances[2].pid, None);
    }

    #[test]
    fn test_zero_elapsed_gives_zero_rate() {
        let batch = StressorBatch::new("idle", StressClass::OS, 1, 0);
        let metrics = aggregate(&[batch], &[], &[], MetricsMode::Brief);
        assert_eq!(metrics[0].ops_per_sec, 0.0);
        assert_eq!(metrics[0].elapsed_secs, 0.0);
        assert_eq!(metrics[0].started, 0);
    }

    #[test]
    fn test_totals_and_exit_code() {
        let (batches, records, counters) = sample();
        let stressors = aggregate(&batches, &records, &counters, MetricsMode::Brief);
        let totals = totals(&stressors);
        assert_eq!(totals.bogo_ops, 2007);
        assert_eq!(totals.instances_started, 3);
        assert_eq!(totals.instances_failed, 1);

        let result = RunResult {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            duration_secs: 2.0,
            stop_reason: Some(StopReason::AllExited),
            aborted: false,
            interrupted: false,
            dry_run: false,
            metrics: MetricsMode::Brief,
            times: true,
            stressors,
            totals,
        };
        assert_eq!(result.exit_code(), WorkerStatus::EXIT_VERIFY_FAILED);

        let json = result.to_json().unwrap();
        assert!(json.contains("\"stop_reason\": \"all_exited\""));
        assert!(json.contains("\"exited_fail\""));
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("FULL".parse::<MetricsMode>().unwrap(), MetricsMode::Full);
        assert_eq!(MetricsMode::default(), MetricsMode::Brief);
        assert!("verbose".parse::<MetricsMode>().is_err());
    }

    proptest! {
        #[test]
        fn prop_aggregation_is_idempotent(
            counters in proptest::collection::vec(0u64..1_000_000, 1..16),
            finish_ms in proptest::collection::vec(0u64..5000, 1..16),
        ) {
            let base = Instant::now();
            let n = counters.len().min(finish_ms.len());
            let mut batch = StressorBatch::new("p", StressClass::CPU, n as u32 + 1, 0);
            batch.launched = n as u32;
            let records: Vec<_> = (0..n)
                .map(|i| record(0, i as u32, i, base, 0, finish_ms[i], ProcState::ExitedOk))
                .collect();
            let batches = vec![batch];

            let first = aggregate(&batches, &records, &counters, MetricsMode::Full);
            let second = aggregate(&batches, &records, &counters, MetricsMode::Full);
            prop_assert_eq!(&first, &second);
            prop_assert_eq!(first[0].bogo_ops, counters[..n].iter().sum::<u64>());
            prop_assert_eq!(first[0].states[n], ProcState::Pending);
        }
    }
}
