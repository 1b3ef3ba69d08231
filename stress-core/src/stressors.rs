// stress-core/src/stressors.rs
// Built-in reference workloads

use crate::registry::{StressClass, StressorInfo};
use crate::sync::{SemWait, WaitOutcome};
use crate::worker::{StressArgs, WorkerStatus};
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{error, warn};

const CACHE_STRIDE: usize = 64;
const NULL_WRITE_SIZE: usize = 4096;
const FUTEX_TIMEOUT: Duration = Duration::from_millis(1);

/// Every reference workload, in registration order
pub fn builtin() -> Vec<StressorInfo> {
    vec![
        StressorInfo {
            name: "noop",
            func: stress_noop,
            class: StressClass::OS,
        },
        StressorInfo {
            name: "cpu",
            func: stress_cpu,
            class: StressClass::CPU,
        },
        StressorInfo {
            name: "cache",
            func: stress_cache,
            class: StressClass::CPU_CACHE,
        },
        StressorInfo {
            name: "futex",
            func: stress_futex,
            class: StressClass::SCHEDULER | StressClass::OS,
        },
        StressorInfo {
            name: "sem",
            func: stress_sem,
            class: StressClass::OS | StressClass::SCHEDULER,
        },
        StressorInfo {
            name: "yield",
            func: stress_yield,
            class: StressClass::SCHEDULER | StressClass::OS,
        },
        StressorInfo {
            name: "null",
            func: stress_null,
            class: StressClass::IO,
        },
    ]
}

/// Count units as fast as possible
fn stress_noop(args: &mut StressArgs<'_>) -> WorkerStatus {
    loop {
        args.counter.inc();
        if !args.keep_running() {
            break;
        }
    }
    WorkerStatus::Completed
}

/// Integer square root by Newton iteration
fn isqrt(n: u64) -> u64 {
    if n < 2 {
        return n;
    }
    let mut x = n;
    let mut y = (x + 1) / 2;
    while y < x {
        x = y;
        y = (x + n / x) / 2;
    }
    x
}

fn stress_cpu(args: &mut StressArgs<'_>) -> WorkerStatus {
    let mut seed = u64::from(args.instance).wrapping_mul(0x9e37_79b9_7f4a_7c15) | 1;
    loop {
        for _ in 0..256 {
            // xorshift64
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;

            let n = seed >> 16;
            let root = isqrt(n);
            if args.verify && (root * root > n || (root + 1) * (root + 1) <= n) {
                error!("{}: isqrt({}) gave {}", args.name, n, root);
                return WorkerStatus::VerifyFailed;
            }
        }
        args.counter.inc();
        if !args.keep_running() {
            break;
        }
    }
    WorkerStatus::Completed
}

/// Stride through the shared cache buffer
fn stress_cache(args: &mut StressArgs<'_>) -> WorkerStatus {
    let cache = args.region().cache_buffer();
    let mut offset = (args.instance as usize * CACHE_STRIDE) % cache.len();
    loop {
        for _ in 0..1024 {
            let cell = &cache[offset];
            let value = cell.load(Ordering::Relaxed);
            cell.store(value.wrapping_add(1), Ordering::Relaxed);
            offset = (offset + CACHE_STRIDE + 1) % cache.len();
        }
        args.counter.inc();
        if !args.keep_running() {
            break;
        }
    }
    WorkerStatus::Completed
}

/// Bump and wake our own wait word, then wait on it briefly
fn stress_futex(args: &mut StressArgs<'_>) -> WorkerStatus {
    let slots = args.wait_slots();
    let slot = args.slot();
    loop {
        let value = match slots.load(slot) {
            Ok(v) => v.wrapping_add(1),
            Err(e) => {
                error!("{}: {}", args.name, e);
                return WorkerStatus::Failed;
            }
        };
        if let Err(e) = slots.notify(slot, value) {
            error!("{}: {}", args.name, e);
            return WorkerStatus::Failed;
        }
        match slots.wait(slot, value, FUTEX_TIMEOUT) {
            Ok(WaitOutcome::Interrupted) => break,
            Ok(_) => {}
            Err(e) => {
                error!("{}: {}", args.name, e);
                return WorkerStatus::Failed;
            }
        }
        args.counter.inc();
        if !args.keep_running() {
            break;
        }
    }
    WorkerStatus::Completed
}

fn stress_sem(args: &mut StressArgs<'_>) -> WorkerStatus {
    let Some(sem) = args.semaphore() else {
        warn!("{}: semaphore unavailable, skipping", args.name);
        return WorkerStatus::Completed;
    };

    loop {
        match sem.wait() {
            Ok(SemWait::Acquired) => {}
            Ok(SemWait::Interrupted) => break,
            Err(e) => {
                error!("{}: {}", args.name, e);
                return WorkerStatus::Failed;
            }
        }
        args.counter.inc();
        if let Err(e) = sem.post() {
            error!("{}: {}", args.name, e);
            return WorkerStatus::Failed;
        }
        if !args.keep_running() {
            break;
        }
    }
    WorkerStatus::Completed
}

fn stress_yield(args: &mut StressArgs<'_>) -> WorkerStatus {
    loop {
        std::thread::yield_now();
        args.counter.inc();
        if !args.keep_running() {
            break;
        }
    }
    WorkerStatus::Completed
}

fn stress_null(args: &mut StressArgs<'_>) -> WorkerStatus {
    let mut null = match OpenOptions::new().write(true).open("/dev/null") {
        Ok(f) => f,
        Err(e) => {
            error!("{}: open /dev/null: {}", args.name, e);
            return WorkerStatus::Failed;
        }
    };
    let buffer = [0xa5u8; NULL_WRITE_SIZE];
    loop {
        if let Err(e) = null.write_all(&buffer) {
            if e.kind() == std::io::ErrorKind::Interrupted {
                if !args.keep_running() {
                    break;
                }
                continue;
            }
            error!("{}: write /dev/null: {}", args.name, e);
            return WorkerStatus::Failed;
        }
        args.counter.inc();
        if !args.keep_running() {
            break;
        }
    }
    WorkerStatus::Completed
}
