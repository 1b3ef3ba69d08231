// stress-core/src/worker.rs
// Worker contract and the child-side entry point

use crate::error::*;
use crate::isolation::{self, IsolationSettings};
use crate::registry::StressorInfo;
use crate::shared::SharedRegion;
use crate::sync::{Semaphore, WaitSlots};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, error, warn};

/// Signal the supervisor sends to ask running workers to stop
pub const STOP_SIGNAL: Signal = Signal::SIGALRM;

/// Uniform workload entry point
pub type StressFn = fn(&mut StressArgs<'_>) -> WorkerStatus;

static STOP_SIGNALLED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_stop_signal(_: libc::c_int) {
    STOP_SIGNALLED.store(true, Ordering::Relaxed);
}

/// True once this process received the stop signal
pub fn stop_signalled() -> bool {
    STOP_SIGNALLED.load(Ordering::Relaxed)
}

fn install_stop_handler() -> Result<()> {
    let stop = SigAction::new(
        SigHandler::Handler(handle_stop_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    // Interrupts belong to the supervisor, which turns them into the stop flag
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());

    unsafe {
        sigaction(STOP_SIGNAL, &stop).map_err(|source| StressError::Signal {
            operation: "install stop handler".to_string(),
            source,
        })?;
        sigaction(Signal::SIGINT, &ignore).map_err(|source| StressError::Signal {
            operation: "ignore SIGINT".to_string(),
            source,
        })?;
    }
    Ok(())
}

/// How a workload ended; crosses the process boundary as the exit code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Completed,
    Failed,
    VerifyFailed,
}

impl WorkerStatus {
    pub const EXIT_COMPLETED: i32 = 0;
    pub const EXIT_FAILED: i32 = 1;
    pub const EXIT_VERIFY_FAILED: i32 = 2;

    pub fn exit_code(self) -> i32 {
        match self {
            WorkerStatus::Completed => Self::EXIT_COMPLETED,
            WorkerStatus::Failed => Self::EXIT_FAILED,
            WorkerStatus::VerifyFailed => Self::EXIT_VERIFY_FAILED,
        }
    }
}

/// Single-writer handle on one bogo-op counter slot
pub struct Counter<'a> {
    cell: &'a AtomicU64,
}

impl<'a> Counter<'a> {
    pub fn new(cell: &'a AtomicU64) -> Self {
        Self { cell }
    }

    /// Count one unit of work
    pub fn inc(&mut self) {
        self.add(1);
    }

    pub fn add(&mut self, n: u64) {
        // Plain load + store: this process is the only writer
        let value = self.cell.load(Ordering::Relaxed);
        self.cell.store(value.wrapping_add(n), Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.cell.load(Ordering::Relaxed)
    }
}

/// Everything a workload receives
pub struct StressArgs<'a> {
    pub counter: Counter<'a>,
    pub instance: u32,
    pub max_ops: u64,
    pub name: &'a str,
    pub verify: bool,
    slot: usize,
    region: &'a SharedRegion,
}

impl<'a> StressArgs<'a> {
    pub fn new(
        region: &'a SharedRegion,
        slot: usize,
        instance: u32,
        max_ops: u64,
        name: &'a str,
        verify: bool,
    ) -> Result<Self> {
        Ok(Self {
            counter: Counter::new(region.counter(slot)?),
            instance,
            max_ops,
            name,
            verify,
            slot,
            region,
        })
    }

    /// False once the run is stopping or the ceiling is reached
    pub fn keep_running(&self) -> bool {
        if self.region.stop_requested() || stop_signalled() {
            return false;
        }
        self.max_ops == 0 || self.counter.get() < self.max_ops
    }

    /// This instance's slot; also its own wait-word index
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn region(&self) -> &'a SharedRegion {
        self.region
    }

    pub fn wait_slots(&self) -> WaitSlots<'a> {
        WaitSlots::new(self.region)
    }

    /// The run's semaphore, if it initialized
    pub fn semaphore(&self) -> Option<Semaphore<'a>> {
        Semaphore::open(self.region)
    }
}

/// What a forked child needs to become a worker
pub(crate) struct WorkerLaunch<'a> {
    pub info: &'a StressorInfo,
    pub region: &'a SharedRegion,
    pub isolation: &'a IsolationSettings,
    pub slot: usize,
    pub instance: u32,
    pub max_ops: u64,
    pub verify: bool,
}

/// Child side of a fork: isolate, run the workload, exit with its status
pub(crate) fn run_worker(launch: WorkerLaunch<'_>) -> ! {
    let name = launch.info.name;

    isolation::apply(launch.isolation, name);
    if let Err(e) = install_stop_handler() {
        warn!("{}: {}", name, e);
    }

    let status = match StressArgs::new(
        launch.region,
        launch.slot,
        launch.instance,
        launch.max_ops,
        name,
        launch.verify,
    ) {
        Ok(mut args) => {
            let func = launch.info.func;
            match panic::catch_unwind(AssertUnwindSafe(|| func(&mut args))) {
                Ok(status) => status,
                Err(_) => {
                    error!("{}: instance {} panicked", name, launch.instance);
                    WorkerStatus::Failed
                }
            }
        }
        Err(e) => {
            error!("{}: {}", name, e);
            WorkerStatus::Failed
        }
    };

    debug!(
        "{}: instance {} finished with {:?} after {} bogo ops",
        name,
        launch.instance,
        status,
        launch.region.counter_value(launch.slot)
    );

    // Skip atexit handlers and destructors inherited from the supervisor
    unsafe { libc::_exit(status.exit_code()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(WorkerStatus::Completed.exit_code(), 0);
        assert_eq!(WorkerStatus::Failed.exit_code(), 1);
        assert_eq!(WorkerStatus::VerifyFailed.exit_code(), 2);
    }

    #[test]
    fn test_keep_running_respects_ceiling() {
        let region = SharedRegion::create(2).unwrap();
        let mut args = StressArgs::new(&region, 1, 0, 3, "test", false).unwrap();

        let mut units = 0;
        loop {
            args.counter.inc();
            units += 1;
            if !args.keep_running() {
                break;
            }
        }

        assert_eq!(units, 3);
        assert_eq!(region.counter_value(1), 3);
        assert_eq!(region.counter_value(0), 0);
    }

    #[test]
    fn test_keep_running_respects_stop_flag() {
        let region = SharedRegion::create(1).unwrap();
        let args = StressArgs::new(&region, 0, 0, 0, "test", false).unwrap();
        assert!(args.keep_running());

        region.request_stop(false);
        assert!(!args.keep_running());
    }

    #[test]
    fn test_args_reject_bad_slot() {
        let region = SharedRegion::create(1).unwrap();
        assert!(StressArgs::new(&region, 4, 0, 0, "test", false).is_err());
    }
}
