// stress-core/src/isolation.rs
// Per-worker resource isolation applied right after fork

use crate::error::*;
use serde::{Deserialize, Serialize};
use std::ffi::CString;
use std::fmt;
use std::io;
use std::str::FromStr;
use tracing::{debug, warn};

const OOM_SCORE_ADJ_PATH: &str = "/proc/self/oom_score_adj";
const IOPRIO_CLASS_SHIFT: i32 = 13;
const IOPRIO_WHO_PROCESS: i32 = 1;

/// Scheduling policy for workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedPolicy {
    Other,
    Batch,
    Idle,
    Fifo,
    Rr,
}

impl SchedPolicy {
    fn as_raw(self) -> libc::c_int {
        match self {
            SchedPolicy::Other => libc::SCHED_OTHER,
            SchedPolicy::Batch => libc::SCHED_BATCH,
            SchedPolicy::Idle => libc::SCHED_IDLE,
            SchedPolicy::Fifo => libc::SCHED_FIFO,
            SchedPolicy::Rr => libc::SCHED_RR,
        }
    }

    pub fn is_realtime(self) -> bool {
        matches!(self, SchedPolicy::Fifo | SchedPolicy::Rr)
    }

    /// Valid static priority range for this policy
    pub fn priority_range(self) -> (i32, i32) {
        if !self.is_realtime() {
            return (0, 0);
        }
        let raw = self.as_raw();
        unsafe { (libc::sched_get_priority_min(raw), libc::sched_get_priority_max(raw)) }
    }
}

impl FromStr for SchedPolicy {
    type Err = StressError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "other" | "normal" => Ok(SchedPolicy::Other),
            "batch" => Ok(SchedPolicy::Batch),
            "idle" => Ok(SchedPolicy::Idle),
            "fifo" => Ok(SchedPolicy::Fifo),
            "rr" => Ok(SchedPolicy::Rr),
            _ => Err(crate::config_error!(
                "sched",
                format!("unknown policy '{s}', available: other, batch, idle, fifo, rr")
            )),
        }
    }
}

/// I/O scheduling class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IoClass {
    #[serde(alias = "rt")]
    Realtime,
    #[serde(alias = "be")]
    BestEffort,
    Idle,
}

impl IoClass {
    fn as_raw(self) -> i32 {
        match self {
            IoClass::Realtime => 1,
            IoClass::BestEffort => 2,
            IoClass::Idle => 3,
        }
    }
}

impl FromStr for IoClass {
    type Err = StressError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "realtime" | "rt" => Ok(IoClass::Realtime),
            "besteffort" | "be" => Ok(IoClass::BestEffort),
            "idle" => Ok(IoClass::Idle),
            _ => Err(crate::config_error!(
                "ionice_class",
                format!("unknown class '{s}', available: realtime, besteffort, idle")
            )),
        }
    }
}

/// Requested I/O priority; level 0 is highest, 7 lowest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoPriority {
    pub class: IoClass,
    pub level: u8,
}

impl IoPriority {
    fn as_raw(self) -> i32 {
        // The idle class ignores the level
        let level = match self.class {
            IoClass::Idle => 0,
            _ => i32::from(self.level),
        };
        (self.class.as_raw() << IOPRIO_CLASS_SHIFT) | level
    }
}

/// Tuning applied to every worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolationSettings {
    /// Keep the inherited process name
    pub keep_name: bool,
    pub disable_coredump: bool,
    /// Make workers the OOM killer's first choice
    pub oom_killable: bool,
    pub sched: Option<SchedPolicy>,
    pub sched_priority: Option<i32>,
    pub ionice: Option<IoPriority>,
}

impl Default for IsolationSettings {
    fn default() -> Self {
        Self {
            keep_name: false,
            disable_coredump: false,
            oom_killable: true,
            sched: None,
            sched_priority: None,
            ionice: None,
        }
    }
}

/// Which isolation steps took effect in a worker
#[derive(Debug, Default)]
pub struct IsolationReport {
    pub applied: Vec<&'static str>,
    pub failures: Vec<StressError>,
}

impl IsolationReport {
    fn record(&mut self, step: &'static str, result: Result<()>) {
        match result {
            Ok(()) => self.applied.push(step),
            Err(e) => {
                warn!("{}", e);
                self.failures.push(e);
            }
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for IsolationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "applied [{}], {} failed",
            self.applied.join(", "),
            self.failures.len()
        )
    }
}

fn os_failure(step: &'static str, err: io::Error) -> StressError {
    StressError::Isolation {
        step,
        details: err.to_string(),
    }
}

/// Apply every requested step in order; failures are logged, never fatal
pub fn apply(settings: &IsolationSettings, name: &str) -> IsolationReport {
    let mut report = IsolationReport::default();

    if !settings.keep_name {
        report.record("name", set_proc_name(&format!("stress-{name}")));
    }
    if settings.disable_coredump {
        report.record("coredump", disable_coredump());
    }
    report.record("oom", set_oom_adjustment(settings.oom_killable));
    if let Some(policy) = settings.sched {
        report.record("sched", set_sched(policy, settings.sched_priority.unwrap_or(0)));
    }
    if let Some(ionice) = settings.ionice {
        report.record("ionice", set_iopriority(ionice));
    }
    report.record("pdeathsig", set_parent_death_signal());

    debug!("{}: isolation {}", name, report);
    report
}

/// Rename the calling thread as seen in ps/top (15 bytes max)
pub fn set_proc_name(name: &str) -> Result<()> {
    let truncated: String = name.chars().filter(|c| *c != '\0').take(15).collect();
    let c_name = CString::new(truncated).map_err(|e| StressError::Isolation {
        step: "name",
        details: e.to_string(),
    })?;
    if unsafe { libc::prctl(libc::PR_SET_NAME, c_name.as_ptr() as libc::c_ulong, 0, 0, 0) } != 0 {
        return Err(os_failure("name", io::Error::last_os_error()));
    }
    Ok(())
}

/// Stop crashing workers from filling the disk with cores
pub fn disable_coredump() -> Result<()> {
    let limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::setrlimit(libc::RLIMIT_CORE, &limit) } != 0 {
        return Err(os_failure("coredump", io::Error::last_os_error()));
    }
    if unsafe { libc::prctl(libc::PR_SET_DUMPABLE, 0, 0, 0, 0) } != 0 {
        return Err(os_failure("coredump", io::Error::last_os_error()));
    }
    Ok(())
}

/// Value written to oom_score_adj for a worker
pub fn oom_score_for(killable: bool) -> i32 {
    if killable {
        1000
    } else {
        0
    }
}

pub fn set_oom_adjustment(killable: bool) -> Result<()> {
    std::fs::write(OOM_SCORE_ADJ_PATH, oom_score_for(killable).to_string())
        .map_err(|e| os_failure("oom", e))
}

pub fn set_sched(policy: SchedPolicy, priority: i32) -> Result<()> {
    let (min, max) = policy.priority_range();
    if priority < min || priority > max {
        return Err(StressError::Isolation {
            step: "sched",
            details: format!("priority {priority} outside {min}..={max} for {policy:?}"),
        });
    }

    let param = libc::sched_param {
        sched_priority: priority,
    };
    if unsafe { libc::sched_setscheduler(0, policy.as_raw(), &param) } != 0 {
        let err = io::Error::last_os_error();
        let hint = if policy.is_realtime() && !nix::unistd::Uid::effective().is_root() {
            " (realtime policies usually need root)"
        } else {
            ""
        };
        return Err(StressError::Isolation {
            step: "sched",
            details: format!("{err}{hint}"),
        });
    }
    Ok(())
}

pub fn set_iopriority(priority: IoPriority) -> Result<()> {
    if priority.level > 7 {
        return Err(StressError::Isolation {
            step: "ionice",
            details: format!("level {} outside 0..=7", priority.level),
        });
    }
    let rc = unsafe {
        libc::syscall(
            libc::SYS_ioprio_set,
            IOPRIO_WHO_PROCESS,
            0,
            priority.as_raw(),
        )
    };
    if rc != 0 {
        return Err(os_failure("ionice", io::Error::last_os_error()));
    }
    Ok(())
}

/// Take the worker down with the supervisor instead of leaving an orphan
pub fn set_parent_death_signal() -> Result<()> {
    if unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong, 0, 0, 0) } != 0 {
        return Err(os_failure("pdeathsig", io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_parsing() {
        assert_eq!("FIFO".parse::<SchedPolicy>().unwrap(), SchedPolicy::Fifo);
        assert_eq!("normal".parse::<SchedPolicy>().unwrap(), SchedPolicy::Other);
        assert!("deadline".parse::<SchedPolicy>().is_err());
    }

    #[test]
    fn test_priority_ranges() {
        assert_eq!(SchedPolicy::Batch.priority_range(), (0, 0));
        let (min, max) = SchedPolicy::Fifo.priority_range();
        assert!(min >= 1 && max >= min);
    }

    #[test]
    fn test_out_of_range_priority_is_rejected_before_syscall() {
        let err = set_sched(SchedPolicy::Other, 5).unwrap_err();
        assert!(matches!(err, StressError::Isolation { step: "sched", .. }));
    }

    #[test]
    fn test_ioprio_encoding() {
        let be = IoPriority {
            class: IoClass::BestEffort,
            level: 4,
        };
        assert_eq!(be.as_raw(), (2 << 13) | 4);

        let idle = IoPriority {
            class: IoClass::Idle,
            level: 6,
        };
        assert_eq!(idle.as_raw(), 3 << 13);

        assert_eq!("be".parse::<IoClass>().unwrap(), IoClass::BestEffort);
        assert_eq!("rt".parse::<IoClass>().unwrap(), IoClass::Realtime);
    }

    #[test]
    fn test_ionice_level_bound() {
        let err = set_iopriority(IoPriority {
            class: IoClass::BestEffort,
            level: 9,
        })
        .unwrap_err();
        assert!(err.to_string().contains("outside 0..=7"));
    }

    #[test]
    fn test_oom_scores() {
        assert_eq!(oom_score_for(true), 1000);
        assert_eq!(oom_score_for(false), 0);
    }

    #[test]
    fn test_report_collects_failures() {
        let mut report = IsolationReport::default();
        report.record("name", Ok(()));
        report.record(
            "sched",
            Err(StressError::Isolation {
                step: "sched",
                details: "EPERM".to_string(),
            }),
        );

        assert!(!report.is_clean());
        assert_eq!(report.applied, vec!["name"]);
        assert_eq!(report.to_string(), "applied [name], 1 failed");
    }
}
