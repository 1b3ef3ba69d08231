// stress-core/src/harness.rs
// Run orchestration: plan, map the region, supervise, aggregate

use crate::cancel::StopToken;
use crate::error::*;
use crate::isolation::IsolationSettings;
use crate::metrics::{self, MetricsMode, RunResult};
use crate::registry::Registry;
use crate::shared::SharedRegion;
use crate::supervisor::{
    Forker, ShortfallReason, StopReason, StressorBatch, Supervisor, SystemForker,
};
use crate::sync::Semaphore;
use crate::{DEFAULT_GRACE, DEFAULT_TIMEOUT, PROCS_MAX};
use chrono::Utc;
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// One requested stressor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StressorRequest {
    pub stressor: String,
    pub instances: u32,
    /// Bogo-op ceiling per instance, 0 for unbounded
    pub max_ops: u64,
}

/// Run-wide knobs
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub timeout: Duration,
    /// Delay between consecutive forks
    pub backoff: Duration,
    /// Time workers get to honor the stop request before SIGKILL
    pub grace: Duration,
    pub verify: bool,
    pub metrics: MetricsMode,
    /// Run stressors one after another, each with the full timeout
    pub sequential: bool,
    pub dry_run: bool,
    /// Report user/system CPU time
    pub times: bool,
    pub isolation: IsolationSettings,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            backoff: Duration::ZERO,
            grace: DEFAULT_GRACE,
            verify: false,
            metrics: MetricsMode::default(),
            sequential: false,
            dry_run: false,
            times: false,
            isolation: IsolationSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub stressors: Vec<StressorRequest>,
    pub settings: RunSettings,
}

impl RunRequest {
    pub fn new(settings: RunSettings) -> Self {
        Self {
            stressors: Vec::new(),
            settings,
        }
    }

    /// Append a stressor request
    pub fn with(mut self, stressor: &str, instances: u32, max_ops: u64) -> Self {
        self.stressors.push(StressorRequest {
            stressor: stressor.to_string(),
            instances,
            max_ops,
        });
        self
    }

    pub fn total_instances(&self) -> usize {
        self.stressors.iter().map(|s| s.instances as usize).sum()
    }
}

/// Owns the registry and the interrupt token; runs requests
pub struct Harness {
    registry: Registry,
    token: StopToken,
}

impl Harness {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            token: StopToken::new(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Token for interrupting runs of this harness from another thread
    pub fn stop_token(&self) -> StopToken {
        self.token.clone()
    }

    /// Resolve a request into batches without touching any process
    pub fn plan(&self, request: &RunRequest) -> Result<Vec<StressorBatch>> {
        let total = request.total_instances();
        if total > PROCS_MAX {
            return Err(StressError::TooManyInstances {
                requested: total,
                max: PROCS_MAX,
            });
        }

        request
            .stressors
            .iter()
            .map(|req| {
                let info = self.registry.get(&req.stressor)?;
                Ok(StressorBatch::new(info.name, info.class, req.instances, req.max_ops))
            })
            .collect()
    }

    pub fn run(&self, request: &RunRequest) -> Result<RunResult> {
        self.run_with(request, SystemForker)
    }

    /// Run with a custom process source
    #[instrument(skip_all, fields(stressors = request.stressors.len()))]
    pub fn run_with<F: Forker>(&self, request: &RunRequest, forker: F) -> Result<RunResult> {
        let settings = &request.settings;
        let mut batches = self.plan(request)?;
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let clock = Instant::now();

        info!(
            "Run {} dispatching {} instances of {} stressors{}",
            run_id,
            request.total_instances(),
            batches.len(),
            if settings.sequential { " sequentially" } else { "" }
        );

        if settings.dry_run {
            for batch in &mut batches {
                batch.fall_short(ShortfallReason::DryRun);
            }
            let stressors = metrics::aggregate(&batches, &[], &[], settings.metrics);
            return Ok(RunResult {
                run_id,
                started_at,
                duration_secs: clock.elapsed().as_secs_f64(),
                stop_reason: None,
                aborted: false,
                interrupted: false,
                dry_run: true,
                metrics: settings.metrics,
                times: settings.times,
                totals: metrics::totals(&stressors),
                stressors,
            });
        }

        let region = SharedRegion::create(request.total_instances())?;
        if let Err(e) = Semaphore::init(&region, 1) {
            if e.is_fatal() {
                return Err(e);
            }
            warn!("{}; stressors needing it will skip", e);
        }

        let mut supervisor = Supervisor::new(
            &region,
            &self.registry,
            settings,
            self.token.clone(),
            forker,
            batches,
        );

        let stop_reason = if settings.sequential {
            self.run_sequential(&mut supervisor, &region, settings.timeout)?
        } else {
            let deadline = deadline_after(clock, settings.timeout);
            supervisor.launch_all()?;
            supervisor.supervise(deadline)
        };

        let aborted = supervisor.aborted();
        let counters = region.snapshot_counters();
        let (batches, records) = supervisor.into_parts();
        let stressors = metrics::aggregate(&batches, &records, &counters, settings.metrics);

        Ok(RunResult {
            run_id,
            started_at,
            duration_secs: clock.elapsed().as_secs_f64(),
            stop_reason: Some(stop_reason),
            aborted,
            interrupted: region.was_interrupted() || self.token.is_interrupted(),
            dry_run: false,
            metrics: settings.metrics,
            times: settings.times,
            totals: metrics::totals(&stressors),
            stressors,
        })
    }

    /// One stressor at a time, each with the full timeout.
    ///
    /// The abort counter carries across stressors.
    fn run_sequential<F: Forker>(
        &self,
        supervisor: &mut Supervisor<'_, F>,
        region: &SharedRegion,
        timeout: Duration,
    ) -> Result<StopReason> {
        let mut overall = StopReason::AllExited;

        for batch in 0..supervisor.batches().len() {
            if self.token.is_interrupted() {
                supervisor.skip_remaining(batch, ShortfallReason::Interrupted);
                overall = StopReason::Interrupted;
                break;
            }
            if supervisor.aborted() {
                supervisor.skip_remaining(batch, ShortfallReason::AbortThreshold);
                break;
            }

            supervisor.launch(batch)?;
            let reason = supervisor.supervise(deadline_after(Instant::now(), timeout));
            info!("{}: {}", supervisor.batches()[batch].name, reason);

            match reason {
                StopReason::Interrupted => {
                    supervisor.skip_remaining(batch + 1, ShortfallReason::Interrupted);
                    return Ok(StopReason::Interrupted);
                }
                StopReason::Deadline => overall = StopReason::Deadline,
                StopReason::AllExited => {}
            }
            region.reset_stop();
        }
        Ok(overall)
    }
}

/// `start + timeout`, or no deadline when that is past the clock's range
fn deadline_after(start: Instant, timeout: Duration) -> Option<Instant> {
    let deadline = start.checked_add(timeout);
    if deadline.is_none() {
        warn!("Timeout {:?} is beyond the monotonic clock, running without a deadline", timeout);
    }
    deadline
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_rejects_unknown_stressor() {
        let harness = Harness::new(Registry::with_builtin());
        let request = RunRequest::default().with("cpu", 1, 0).with("warp-drive", 1, 0);
        assert!(matches!(
            harness.plan(&request),
            Err(StressError::UnknownStressor(name)) if name == "warp-drive"
        ));
    }

    #[test]
    fn test_plan_rejects_too_many_instances() {
        let harness = Harness::new(Registry::with_builtin());
        let request = RunRequest::default()
            .with("cpu", PROCS_MAX as u32, 0)
            .with("noop", 1, 0);
        assert!(matches!(
            harness.plan(&request),
            Err(StressError::TooManyInstances { requested, .. }) if requested == PROCS_MAX + 1
        ));
    }

    #[test]
    fn test_plan_keeps_request_order_and_classes() {
        let harness = Harness::new(Registry::with_builtin());
        let request = RunRequest::default().with("null", 2, 0).with("cpu", 3, 500);
        let batches = harness.plan(&request).unwrap();

        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].name, "null");
        assert_eq!(batches[1].requested, 3);
        assert_eq!(batches[1].max_ops, 500);
        assert_eq!(batches[1].class, crate::registry::StressClass::CPU);
    }

    #[test]
    fn test_deadline_after_out_of_range_timeout() {
        let now = Instant::now();
        assert_eq!(deadline_after(now, Duration::from_secs(5)), Some(now + Duration::from_secs(5)));
        assert_eq!(deadline_after(now, Duration::MAX), None);
        let huge = crate::config::parse_duration("18446744073709551615").unwrap();
        assert_eq!(deadline_after(now, huge), None);
    }

    #[test]
    fn test_dry_run_forks_nothing() {
        let harness = Harness::new(Registry::with_builtin());
        let settings = RunSettings {
            dry_run: true,
            ..RunSettings::default()
        };
        let request = RunRequest::new(settings).with("cpu", 2, 0);

        // Scoped to this thread so forked workers in other tests never inherit it
        let subscriber = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter("debug")
            .finish();
        let result = tracing::subscriber::with_default(subscriber, || harness.run(&request)).unwrap();

        assert!(result.dry_run);
        assert_eq!(result.stop_reason, None);
        assert_eq!(result.totals.instances_started, 0);
        assert_eq!(result.exit_code(), 0);
        assert_eq!(
            result.stressors[0].status,
            crate::supervisor::BatchStatus::Skipped(ShortfallReason::DryRun)
        );
    }
}
