// stress-core/src/lib.rs
// Process orchestration and shared-memory synchronization for the stress harness

use std::time::Duration;

pub mod cancel;
pub mod config;
pub mod error;
pub mod harness;
pub mod isolation;
pub mod metrics;
pub mod registry;
pub mod shared;
pub mod stressors;
pub mod supervisor;
pub mod sync;
pub mod worker;


pub use cancel::StopToken;
pub use config::HarnessConfig;
pub use error::{ErrorPolicy, ErrorScope, Result, StressError};
pub use harness::{Harness, RunRequest, RunSettings, StressorRequest};
pub use isolation::{IoClass, IoPriority, IsolationReport, IsolationSettings, SchedPolicy};
pub use metrics::{InstanceMetrics, MetricsMode, RunResult, RunTotals, StressorMetrics};
pub use registry::{Registry, StressClass, StressorInfo};
pub use shared::SharedRegion;
pub use supervisor::{
    BatchStatus, FailCause, Forker, ProcState, ProcessRecord, ShortfallReason, StopReason,
    StressorBatch, Supervisor, SystemForker,
};
pub use sync::{SemWait, Semaphore, WaitOutcome, WaitSlots};
pub use worker::{Counter, StressArgs, StressFn, WorkerStatus};

/// Hard bound on concurrently launched instances per run
pub const PROCS_MAX: usize = 1024;

/// Consecutive failed exits after which launching stops
pub const ABORT_FAILURES: u32 = 5;

/// Size of the shared cache buffer in bytes
pub const MEM_CACHE_SIZE: usize = 65536 * 32;

/// One day
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60 * 60 * 24);

/// Longest accepted run timeout, one hundred years
pub const MAX_TIMEOUT: Duration = Duration::from_secs(100 * 365 * 60 * 60 * 24);

/// How long stopped workers may take before they are killed
pub const DEFAULT_GRACE: Duration = Duration::from_secs(2);

/// Accepted range for a nonzero per-instance bogo-op ceiling
pub const MIN_OPS: u64 = 100;
pub const MAX_OPS: u64 = 100_000_000;
