// stress-core/src/sync.rs
// Cross-process synchronization primitives built on the shared region

use crate::error::*;
use crate::shared::SharedRegion;
use crate::PROCS_MAX;
use std::io;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{debug, warn};

const FUTEX_BITSET_MATCH_ANY: u32 = u32::MAX;

/// Cap for wait deadlines; fits `time_t` and a nanosecond `u64`
const WAIT_FOREVER: Duration = Duration::from_secs(i32::MAX as u64);

/// Current CLOCK_MONOTONIC reading
pub fn monotonic_now() -> Duration {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
}

/// Result of waiting on a wait-word slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A notifier woke us
    Woken,
    /// The word no longer held the expected value
    Changed,
    /// The slot deadline passed
    TimedOut,
    /// A signal arrived and the run is stopping
    Interrupted,
}

/// Wait/notify words shared by all processes of a run
pub struct WaitSlots<'a> {
    region: &'a SharedRegion,
}

impl<'a> WaitSlots<'a> {
    pub fn new(region: &'a SharedRegion) -> Self {
        Self { region }
    }

    pub fn len(&self) -> usize {
        PROCS_MAX
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn load(&self, slot: usize) -> Result<u32> {
        Ok(self.region.wait_word(slot)?.load(Ordering::Acquire))
    }

    /// Deadline recorded by the most recent wait on `slot`
    pub fn deadline(&self, slot: usize) -> Result<Option<Duration>> {
        let nanos = self.region.wait_deadline(slot)?.load(Ordering::Acquire);
        Ok((nanos != 0).then(|| Duration::from_nanos(nanos)))
    }

    /// Store `value` and wake every waiter; returns how many were woken
    pub fn notify(&self, slot: usize, value: u32) -> Result<usize> {
        let word = self.region.wait_word(slot)?;
        word.store(value, Ordering::Release);

        let woken = unsafe {
            libc::syscall(
                libc::SYS_futex,
                word.as_ptr(),
                libc::FUTEX_WAKE,
                i32::MAX,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0u32,
            )
        };
        if woken < 0 {
            return Err(StressError::Io {
                operation: format!("futex wake on slot {slot}"),
                source: io::Error::last_os_error(),
            });
        }
        Ok(woken as usize)
    }

    /// Block while the word at `slot` equals `expected`, for at most `timeout`.
    ///
    /// The deadline is computed once on CLOCK_MONOTONIC and handed to the
    /// kernel as an absolute time, so retries after EINTR never extend it.
    pub fn wait(&self, slot: usize, expected: u32, timeout: Duration) -> Result<WaitOutcome> {
        let word = self.region.wait_word(slot)?;
        let deadline = monotonic_now().saturating_add(timeout).min(WAIT_FOREVER);
        self.region
            .wait_deadline(slot)?
            .store(deadline.as_nanos() as u64, Ordering::Release);

        let abs = libc::timespec {
            tv_sec: deadline.as_secs() as libc::time_t,
            tv_nsec: deadline.subsec_nanos() as libc::c_long,
        };

        loop {
            if word.load(Ordering::Acquire) != expected {
                return Ok(WaitOutcome::Changed);
            }

            let rc = unsafe {
                libc::syscall(
                    libc::SYS_futex,
                    word.as_ptr(),
                    libc::FUTEX_WAIT_BITSET,
                    expected,
                    &abs as *const libc::timespec,
                    std::ptr::null::<u32>(),
                    FUTEX_BITSET_MATCH_ANY,
                )
            };
            if rc == 0 {
                return Ok(WaitOutcome::Woken);
            }

            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => return Ok(WaitOutcome::Changed),
                Some(libc::ETIMEDOUT) => return Ok(WaitOutcome::TimedOut),
                Some(libc::EINTR) => {
                    if self.region.stop_requested() || crate::worker::stop_signalled() {
                        return Ok(WaitOutcome::Interrupted);
                    }
                }
                _ => {
                    return Err(StressError::Io {
                        operation: format!("futex wait on slot {slot}"),
                        source: err,
                    })
                }
            }
        }
    }
}

/// Outcome of a blocking semaphore wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemWait {
    Acquired,
    Interrupted,
}

/// Process-shared counting semaphore stored in the shared region
pub struct Semaphore<'a> {
    region: &'a SharedRegion,
}

impl<'a> Semaphore<'a> {
    /// Initialize the region's semaphore with `value`.
    ///
    /// Must run before forking any worker that uses it. Failure is recorded
    /// in the region so dependent stressors can bail out on their own.
    pub fn init(region: &'a SharedRegion, value: u32) -> Result<Self> {
        let rc = unsafe { libc::sem_init(region.sem_ptr(), 1, value) };
        if rc != 0 {
            region.set_sem_ok(false);
            let source = io::Error::last_os_error();
            warn!("Semaphore {} init failed: {}", region.sem_name(), source);
            return Err(StressError::Semaphore {
                name: region.sem_name().to_string(),
                operation: "init",
                source,
            });
        }
        region.set_sem_ok(true);
        debug!("Semaphore {} initialized to {}", region.sem_name(), value);
        Ok(Self { region })
    }

    /// Handle to an already initialized semaphore
    pub fn open(region: &'a SharedRegion) -> Option<Self> {
        region.sem_ok().then_some(Self { region })
    }

    pub fn name(&self) -> &str {
        self.region.sem_name()
    }

    fn error(&self, operation: &'static str) -> StressError {
        StressError::Semaphore {
            name: self.name().to_string(),
            operation,
            source: io::Error::last_os_error(),
        }
    }

    pub fn post(&self) -> Result<()> {
        if unsafe { libc::sem_post(self.region.sem_ptr()) } != 0 {
            return Err(self.error("post"));
        }
        Ok(())
    }

    /// Blocking wait; a signal while the run is stopping ends the wait
    pub fn wait(&self) -> Result<SemWait> {
        loop {
            if unsafe { libc::sem_wait(self.region.sem_ptr()) } == 0 {
                return Ok(SemWait::Acquired);
            }
            if io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
                return Err(self.error("wait"));
            }
            if self.region.stop_requested() || crate::worker::stop_signalled() {
                return Ok(SemWait::Interrupted);
            }
        }
    }

    /// Non-blocking wait; `false` when the count is zero
    pub fn try_wait(&self) -> Result<bool> {
        if unsafe { libc::sem_trywait(self.region.sem_ptr()) } == 0 {
            return Ok(true);
        }
        match io::Error::last_os_error().raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(false),
            _ => Err(self.error("trywait")),
        }
    }

    pub fn value(&self) -> Result<i32> {
        let mut value = 0;
        if unsafe { libc::sem_getvalue(self.region.sem_ptr(), &mut value) } != 0 {
            return Err(self.error("getvalue"));
        }
        Ok(value)
    }
}
