// stress-core/src/supervisor.rs
// Process supervisor: fork workers, watch the deadline, reap and classify exits

use crate::cancel::StopToken;
use crate::error::*;
use crate::harness::RunSettings;
use crate::registry::{Registry, StressClass};
use crate::shared::SharedRegion;
use crate::worker::{self, WorkerLaunch, STOP_SIGNAL};
use crate::ABORT_FAILURES;
use crossbeam_channel::{after, at, bounded, never, select, Receiver};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{ForkResult, Pid};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

/// Source of new processes
pub trait Forker {
    /// Fork the calling process.
    ///
    /// # Safety
    /// Same contract as `fork(2)` in a multi-threaded program: the child
    /// must restrict itself to async-signal-safe work until it exits.
    unsafe fn fork(&mut self) -> nix::Result<ForkResult>;
}

/// Real `fork(2)`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemForker;

impl Forker for SystemForker {
    unsafe fn fork(&mut self) -> nix::Result<ForkResult> {
        nix::unistd::fork()
    }
}

/// Why an instance ended in failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailCause {
    /// Workload returned `Failed`
    Reported,
    /// Workload returned `VerifyFailed`
    Verification,
    ExitCode(i32),
    /// Terminated by a signal the harness did not send
    Signal(i32),
    /// The process could not be waited for
    Lost,
}

impl fmt::Display for FailCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailCause::Reported => write!(f, "reported failure"),
            FailCause::Verification => write!(f, "verification failure"),
            FailCause::ExitCode(code) => write!(f, "exit code {code}"),
            FailCause::Signal(sig) => write!(f, "signal {sig}"),
            FailCause::Lost => write!(f, "lost"),
        }
    }
}

/// Per-instance lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcState {
    /// Not started
    Pending,
    Forked,
    Running,
    ExitedOk,
    ExitedFail(FailCause),
    /// Died from the harness's stop signal
    Killed,
    /// Needed the forced kill after the grace period
    TimedOut,
}

impl ProcState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ProcState::Pending | ProcState::Forked | ProcState::Running)
    }

    pub fn is_failure(self) -> bool {
        matches!(self, ProcState::ExitedFail(_))
    }
}

impl fmt::Display for ProcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcState::Pending => write!(f, "not started"),
            ProcState::Forked => write!(f, "forked"),
            ProcState::Running => write!(f, "running"),
            ProcState::ExitedOk => write!(f, "exited ok"),
            ProcState::ExitedFail(cause) => write!(f, "failed ({cause})"),
            ProcState::Killed => write!(f, "killed"),
            ProcState::TimedOut => write!(f, "timed out"),
        }
    }
}

/// One forked worker
#[derive(Debug, Clone)]
pub struct ProcessRecord {
    pub pid: i32,
    /// Index of the owning batch
    pub stressor: usize,
    pub instance: u32,
    pub slot: usize,
    pub started: Instant,
    pub finished: Option<Instant>,
    pub state: ProcState,
    pub user_time: Duration,
    pub system_time: Duration,
}

impl ProcessRecord {
    /// Wall time from fork to reap; zero until reaped
    pub fn elapsed(&self) -> Duration {
        self.finished
            .map(|f| f.saturating_duration_since(self.started))
            .unwrap_or_default()
    }
}

/// Why a stressor has fewer instances than requested
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShortfallReason {
    ForkFailed(String),
    AbortThreshold,
    Interrupted,
    DryRun,
}

impl fmt::Display for ShortfallReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShortfallReason::ForkFailed(e) => write!(f, "fork failed: {e}"),
            ShortfallReason::AbortThreshold => {
                write!(f, "{ABORT_FAILURES} consecutive failures, launching stopped")
            }
            ShortfallReason::Interrupted => write!(f, "interrupted"),
            ShortfallReason::DryRun => write!(f, "dry run"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum BatchStatus {
    Planned,
    Complete,
    Partial(ShortfallReason),
    Skipped(ShortfallReason),
}

/// All instances of one requested stressor
#[derive(Debug, Clone)]
pub struct StressorBatch {
    pub name: &'static str,
    pub class: StressClass,
    pub requested: u32,
    pub max_ops: u64,
    pub launched: u32,
    pub status: BatchStatus,
}

impl StressorBatch {
    pub fn new(name: &'static str, class: StressClass, requested: u32, max_ops: u64) -> Self {
        Self {
            name,
            class,
            requested,
            max_ops,
            launched: 0,
            status: BatchStatus::Planned,
        }
    }

    pub(crate) fn fall_short(&mut self, reason: ShortfallReason) {
        self.status = if self.launched == 0 {
            BatchStatus::Skipped(reason)
        } else {
            BatchStatus::Partial(reason)
        };
    }
}

/// What ended a supervision phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    AllExited,
    Deadline,
    Interrupted,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::AllExited => write!(f, "all workers exited"),
            StopReason::Deadline => write!(f, "deadline reached"),
            StopReason::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// Bookkeeping for a process that has not been reaped yet
#[derive(Debug, Clone, Copy)]
struct LiveProc {
    record: usize,
    stop_sent: bool,
    forced: bool,
}

type LiveTable = Arc<Mutex<HashMap<i32, LiveProc>>>;

/// Map a raw wait status to a terminal state
pub(crate) fn classify(status: libc::c_int, stop_sent: bool, forced: bool) -> ProcState {
    if libc::WIFEXITED(status) {
        match libc::WEXITSTATUS(status) {
            0 => ProcState::ExitedOk,
            1 => ProcState::ExitedFail(FailCause::Reported),
            2 => ProcState::ExitedFail(FailCause::Verification),
            code => ProcState::ExitedFail(FailCause::ExitCode(code)),
        }
    } else if libc::WIFSIGNALED(status) {
        let sig = libc::WTERMSIG(status);
        if sig == libc::SIGKILL && forced {
            ProcState::TimedOut
        } else if sig == STOP_SIGNAL as libc::c_int && stop_sent {
            ProcState::Killed
        } else {
            ProcState::ExitedFail(FailCause::Signal(sig))
        }
    } else {
        ProcState::ExitedFail(FailCause::Lost)
    }
}

fn timeval_to_duration(tv: libc::timeval) -> Duration {
    Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
}

/// Wait until any child has exited without reaping it.
///
/// Returns the pid of the exited child, or `None` when `block` is false and
/// nothing has exited yet. Leaving the zombie in place keeps the pid
/// reserved, so the watchdog can never signal a recycled pid while we
/// update the live table.
fn wait_any_exited(block: bool) -> io::Result<Option<i32>> {
    let mut flags = libc::WEXITED | libc::WNOWAIT;
    if !block {
        flags |= libc::WNOHANG;
    }
    loop {
        let mut info: libc::siginfo_t = unsafe { mem::zeroed() };
        let rc = unsafe { libc::waitid(libc::P_ALL, 0, &mut info, flags) };
        if rc == 0 {
            let pid = unsafe { info.si_pid() };
            return Ok((pid != 0).then_some(pid));
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
    }
}

/// Reap a child this supervisor did not fork so it cannot block later waits
fn reap_foreign(pid: i32) {
    let mut status: libc::c_int = 0;
    unsafe { libc::waitpid(pid, &mut status, 0) };
    warn!("Reaped unknown child {} (status {:#x})", pid, status);
}

/// Send `signal` to every live worker, marking each one reached
fn signal_live(live: &Mutex<HashMap<i32, LiveProc>>, signal: Signal, mark: fn(&mut LiveProc)) -> usize {
    let mut live = live.lock();
    let mut sent = 0;
    for (pid, proc_) in live.iter_mut() {
        match kill(Pid::from_raw(*pid), signal) {
            Ok(()) => {
                mark(proc_);
                sent += 1;
            }
            Err(Errno::ESRCH) => {}
            Err(e) => warn!("Failed to send {} to {}: {}", signal, pid, e),
        }
    }
    sent
}

/// Waits for the deadline or an interrupt, then runs the two-phase stop
fn watchdog(
    region: &SharedRegion,
    token: &StopToken,
    live: &Mutex<HashMap<i32, LiveProc>>,
    done: &Receiver<()>,
    deadline: Option<Instant>,
    grace: Duration,
) -> StopReason {
    let reason = if token.is_interrupted() {
        StopReason::Interrupted
    } else {
        let interrupts = token.events();
        let timer = deadline.map(at).unwrap_or_else(never);
        select! {
            recv(done) -> _ => return StopReason::AllExited,
            recv(interrupts) -> _ => StopReason::Interrupted,
            recv(timer) -> _ => StopReason::Deadline,
        }
    };

    region.request_stop(reason == StopReason::Interrupted);
    let signalled = signal_live(live, STOP_SIGNAL, |p| p.stop_sent = true);
    info!("{}: stop requested, {} workers signalled", reason, signalled);

    let grace_timer = after(grace);
    select! {
        recv(done) -> _ => return reason,
        recv(grace_timer) -> _ => {}
    }

    let killed = signal_live(live, Signal::SIGKILL, |p| p.forced = true);
    if killed > 0 {
        warn!("{} workers still running after {:?} grace, killed", killed, grace);
    }
    reason
}

/// Forks and supervises the workers of one run
pub struct Supervisor<'r, F: Forker = SystemForker> {
    region: &'r SharedRegion,
    registry: &'r Registry,
    settings: &'r RunSettings,
    token: StopToken,
    forker: F,
    batches: Vec<StressorBatch>,
    records: Vec<ProcessRecord>,
    live: LiveTable,
    next_slot: usize,
    consecutive_failures: u32,
    aborted: bool,
    any_forked: bool,
}

impl<'r, F: Forker> Supervisor<'r, F> {
    pub fn new(
        region: &'r SharedRegion,
        registry: &'r Registry,
        settings: &'r RunSettings,
        token: StopToken,
        forker: F,
        batches: Vec<StressorBatch>,
    ) -> Self {
        Self {
            region,
            registry,
            settings,
            token,
            forker,
            batches,
            records: Vec::new(),
            live: Arc::new(Mutex::new(HashMap::new())),
            next_slot: 0,
            consecutive_failures: 0,
            aborted: false,
            any_forked: false,
        }
    }

    pub fn batches(&self) -> &[StressorBatch] {
        &self.batches
    }

    pub fn records(&self) -> &[ProcessRecord] {
        &self.records
    }

    /// True once the consecutive-failure threshold was hit
    pub fn aborted(&self) -> bool {
        self.aborted
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }

    pub fn into_parts(mut self) -> (Vec<StressorBatch>, Vec<ProcessRecord>) {
        (mem::take(&mut self.batches), mem::take(&mut self.records))
    }

    /// Fork every instance of one batch in index order.
    ///
    /// Returns an error only when the run cannot proceed at all: the first
    /// fork of the run failed or the region has no free slot.
    #[instrument(skip(self), fields(stressor = self.batches[batch].name))]
    pub fn launch(&mut self, batch: usize) -> Result<()> {
        let (name, requested, max_ops) = {
            let b = &self.batches[batch];
            (b.name, b.requested, b.max_ops)
        };
        let info = self.registry.get(name)?.clone();

        for instance in 0..requested {
            if self.any_forked && !self.settings.backoff.is_zero() {
                std::thread::sleep(self.settings.backoff);
            }
            self.reap(false);

            if self.token.is_interrupted() {
                self.batches[batch].fall_short(ShortfallReason::Interrupted);
                return Ok(());
            }
            if self.aborted {
                self.batches[batch].fall_short(ShortfallReason::AbortThreshold);
                return Ok(());
            }

            let slot = self.next_slot;
            if slot >= self.region.slots() {
                return Err(StressError::TooManyInstances {
                    requested: slot + 1,
                    max: self.region.slots(),
                });
            }

            match unsafe { self.forker.fork() } {
                Ok(ForkResult::Child) => worker::run_worker(WorkerLaunch {
                    info: &info,
                    region: self.region,
                    isolation: &self.settings.isolation,
                    slot,
                    instance,
                    max_ops,
                    verify: self.settings.verify,
                }),
                Ok(ForkResult::Parent { child }) => self.track(batch, instance, slot, child),
                Err(source) => {
                    let err = StressError::Fork {
                        stressor: name.to_string(),
                        instance,
                        source,
                    };
                    // Losing the very first fork leaves nothing to run
                    if err.is_fatal() || !self.any_forked {
                        error!("{}", err);
                        return Err(err);
                    }
                    warn!(
                        "{}; continuing with {} of {} instances",
                        err, self.batches[batch].launched, requested
                    );
                    self.batches[batch].fall_short(ShortfallReason::ForkFailed(source.to_string()));
                    return Ok(());
                }
            }
        }

        self.batches[batch].status = BatchStatus::Complete;
        debug!("{}: launched {} instances", name, requested);
        Ok(())
    }

    /// Launch every planned batch in order
    pub fn launch_all(&mut self) -> Result<()> {
        for batch in 0..self.batches.len() {
            self.launch(batch)?;
        }
        Ok(())
    }

    /// Mark every batch from `from` on as skipped
    pub fn skip_remaining(&mut self, from: usize, reason: ShortfallReason) {
        for batch in self.batches.iter_mut().skip(from) {
            if batch.status == BatchStatus::Planned {
                batch.fall_short(reason.clone());
            }
        }
    }

    fn track(&mut self, batch: usize, instance: u32, slot: usize, child: Pid) {
        let pid = child.as_raw();
        let idx = self.records.len();
        self.records.push(ProcessRecord {
            pid,
            stressor: batch,
            instance,
            slot,
            started: Instant::now(),
            finished: None,
            state: ProcState::Forked,
            user_time: Duration::ZERO,
            system_time: Duration::ZERO,
        });
        self.live.lock().insert(
            pid,
            LiveProc {
                record: idx,
                stop_sent: false,
                forced: false,
            },
        );
        self.records[idx].state = ProcState::Running;

        self.next_slot += 1;
        self.any_forked = true;
        self.batches[batch].launched += 1;
        debug!("Forked {} instance {} as pid {} (slot {})", self.batches[batch].name, instance, pid, slot);
    }

    /// Block until every live worker has ended, stopping them at `deadline`
    /// or on interrupt. `None` waits without a deadline.
    #[instrument(skip(self))]
    pub fn supervise(&mut self, deadline: Option<Instant>) -> StopReason {
        debug!("Supervising {} workers", self.live_count());
        let (done_tx, done_rx) = bounded::<()>(0);
        let live = Arc::clone(&self.live);
        let region = self.region;
        let token = self.token.clone();
        let grace = self.settings.grace;

        std::thread::scope(|scope| {
            let guard = scope.spawn(move || {
                watchdog(region, &token, &live, &done_rx, deadline, grace)
            });
            self.reap_all();
            drop(done_tx);
            guard.join().unwrap_or(StopReason::AllExited)
        })
    }

    /// Blocking reap of every forked worker
    pub fn reap_all(&mut self) {
        self.reap(true);
    }

    /// Collect exited children in the order they exit
    fn reap(&mut self, block: bool) {
        while self.records.iter().any(|r| r.finished.is_none()) {
            let pid = match wait_any_exited(block) {
                Ok(Some(pid)) => pid,
                Ok(None) => return,
                Err(e) => {
                    self.lose_unfinished(&e);
                    return;
                }
            };

            let live = self.live.lock().remove(&pid);
            match live {
                Some(proc_) => self.collect(pid, proc_),
                None => reap_foreign(pid),
            }
        }
    }

    /// Reap `pid`, already removed from the live table, and record its end
    fn collect(&mut self, pid: i32, proc_: LiveProc) {
        let mut status: libc::c_int = 0;
        let mut usage: libc::rusage = unsafe { mem::zeroed() };
        let rc = unsafe { libc::wait4(pid, &mut status, 0, &mut usage) };
        if rc != pid {
            warn!("wait4({}) failed: {}", pid, io::Error::last_os_error());
            self.finish(proc_.record, ProcState::ExitedFail(FailCause::Lost), None);
            return;
        }
        self.finish(
            proc_.record,
            classify(status, proc_.stop_sent, proc_.forced),
            Some(&usage),
        );
    }

    /// No child is left to wait for, yet some records never ended
    fn lose_unfinished(&mut self, err: &io::Error) {
        let lost: Vec<usize> = (0..self.records.len())
            .filter(|&idx| self.records[idx].finished.is_none())
            .collect();
        for idx in lost {
            let pid = self.records[idx].pid;
            warn!("Lost track of pid {}: {}", pid, err);
            self.live.lock().remove(&pid);
            self.finish(idx, ProcState::ExitedFail(FailCause::Lost), None);
        }
    }

    fn finish(&mut self, idx: usize, state: ProcState, usage: Option<&libc::rusage>) {
        let record = &mut self.records[idx];
        record.finished = Some(Instant::now());
        record.state = state;
        if let Some(usage) = usage {
            record.user_time = timeval_to_duration(usage.ru_utime);
            record.system_time = timeval_to_duration(usage.ru_stime);
        }

        let name = self.batches[record.stressor].name;
        match state {
            ProcState::ExitedOk => self.consecutive_failures = 0,
            ProcState::ExitedFail(cause) => {
                warn!("{} instance {} (pid {}) failed: {}", name, record.instance, record.pid, cause);
                self.consecutive_failures += 1;
                if self.consecutive_failures >= ABORT_FAILURES && !self.aborted {
                    self.aborted = true;
                    error!(
                        "{} consecutive failures, no further instances will be launched",
                        self.consecutive_failures
                    );
                }
            }
            _ => debug!("{} instance {} (pid {}) {}", name, record.instance, record.pid, state),
        }
    }
}

impl<F: Forker> Drop for Supervisor<'_, F> {
    fn drop(&mut self) {
        // Never leave workers behind on an early return
        if self.records.iter().any(|r| r.finished.is_none()) {
            signal_live(&self.live, Signal::SIGKILL, |p| p.forced = true);
            self.reap_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_exit_codes() {
        assert_eq!(classify(0, false, false), ProcState::ExitedOk);
        assert_eq!(classify(1 << 8, false, false), ProcState::ExitedFail(FailCause::Reported));
        assert_eq!(classify(2 << 8, false, false), ProcState::ExitedFail(FailCause::Verification));
        assert_eq!(classify(42 << 8, false, false), ProcState::ExitedFail(FailCause::ExitCode(42)));
    }

    #[test]
    fn test_classify_signals() {
        let kill = libc::SIGKILL;
        let alrm = libc::SIGALRM;
        assert_eq!(classify(kill, true, true), ProcState::TimedOut);
        assert_eq!(classify(kill, true, false), ProcState::ExitedFail(FailCause::Signal(kill)));
        assert_eq!(classify(alrm, true, false), ProcState::Killed);
        assert_eq!(classify(alrm, false, false), ProcState::ExitedFail(FailCause::Signal(alrm)));
        assert_eq!(
            classify(libc::SIGSEGV, true, true),
            ProcState::ExitedFail(FailCause::Signal(libc::SIGSEGV))
        );
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ProcState::Pending.to_string(), "not started");
        assert_eq!(ProcState::ExitedFail(FailCause::Signal(9)).to_string(), "failed (signal 9)");
        assert!(ProcState::TimedOut.is_terminal());
        assert!(!ProcState::Running.is_terminal());
    }

    #[test]
    fn test_batch_shortfall() {
        let mut batch = StressorBatch::new("cpu", StressClass::CPU, 4, 0);
        batch.fall_short(ShortfallReason::AbortThreshold);
        assert_eq!(batch.status, BatchStatus::Skipped(ShortfallReason::AbortThreshold));

        batch.launched = 2;
        batch.fall_short(ShortfallReason::Interrupted);
        assert_eq!(batch.status, BatchStatus::Partial(ShortfallReason::Interrupted));
    }

    #[test]
    fn test_timeval_conversion() {
        let tv = libc::timeval {
            tv_sec: 2,
            tv_usec: 500_000,
        };
        assert_eq!(timeval_to_duration(tv), Duration::from_millis(2500));
    }
}
