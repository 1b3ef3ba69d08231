// stress-core/src/registry.rs
// Stressor registry: id -> workload entry point, class and name

use crate::error::*;
use crate::worker::StressFn;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;
use std::str::FromStr;

/// Bit set of subsystem classes a stressor exercises
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StressClass(u32);

impl StressClass {
    pub const CPU: Self = Self(0x001);
    pub const MEMORY: Self = Self(0x002);
    pub const CPU_CACHE: Self = Self(0x004);
    pub const IO: Self = Self(0x008);
    pub const NETWORK: Self = Self(0x010);
    pub const SCHEDULER: Self = Self(0x020);
    pub const VM: Self = Self(0x040);
    pub const INTERRUPT: Self = Self(0x080);
    pub const OS: Self = Self(0x100);

    const NAMES: [(Self, &'static str); 9] = [
        (Self::CPU, "cpu"),
        (Self::MEMORY, "memory"),
        (Self::CPU_CACHE, "cpu-cache"),
        (Self::IO, "io"),
        (Self::NETWORK, "network"),
        (Self::SCHEDULER, "scheduler"),
        (Self::VM, "vm"),
        (Self::INTERRUPT, "interrupt"),
        (Self::OS, "os"),
    ];

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Names of every class set in this mask
    pub fn names(self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(class, _)| self.contains(*class))
            .map(|(_, name)| *name)
            .collect()
    }

    pub fn all_names() -> impl Iterator<Item = &'static str> {
        Self::NAMES.iter().map(|(_, name)| *name)
    }
}

impl BitOr for StressClass {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl FromStr for StressClass {
    type Err = StressError;

    fn from_str(s: &str) -> Result<Self> {
        Self::NAMES
            .iter()
            .find(|(_, name)| name.eq_ignore_ascii_case(s))
            .map(|(class, _)| *class)
            .ok_or_else(|| {
                crate::config_error!(
                    "class",
                    format!(
                        "unknown class '{}', available: {}",
                        s,
                        Self::all_names().collect::<Vec<_>>().join(", ")
                    )
                )
            })
    }
}

impl fmt::Display for StressClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.names().join("|"))
    }
}

/// A registered stressor
#[derive(Clone)]
pub struct StressorInfo {
    pub name: &'static str,
    pub func: StressFn,
    pub class: StressClass,
}

impl fmt::Debug for StressorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StressorInfo")
            .field("name", &self.name)
            .field("class", &self.class)
            .finish()
    }
}

/// Ordered map of stressor id to its workload
#[derive(Debug, Clone, Default)]
pub struct Registry {
    stressors: IndexMap<&'static str, StressorInfo>,
}

impl Registry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in reference workloads
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        for info in crate::stressors::builtin() {
            registry.register(info);
        }
        registry
    }

    /// Add or replace a stressor
    pub fn register(&mut self, info: StressorInfo) {
        self.stressors.insert(info.name, info);
    }

    pub fn get(&self, name: &str) -> Result<&StressorInfo> {
        self.stressors
            .get(name)
            .ok_or_else(|| StressError::UnknownStressor(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.stressors.contains_key(name)
    }

    /// Stressors belonging to `class`, in registration order
    pub fn in_class(&self, class: StressClass) -> Vec<&StressorInfo> {
        self.stressors
            .values()
            .filter(|info| info.class.intersects(class))
            .collect()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.stressors.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StressorInfo> {
        self.stressors.values()
    }

    pub fn len(&self) -> usize {
        self.stressors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stressors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{StressArgs, WorkerStatus};

    fn idle(_: &mut StressArgs<'_>) -> WorkerStatus {
        WorkerStatus::Completed
    }

    #[test]
    fn test_class_parse_and_display() {
        assert_eq!("cpu".parse::<StressClass>().unwrap(), StressClass::CPU);
        assert_eq!("CPU-Cache".parse::<StressClass>().unwrap(), StressClass::CPU_CACHE);
        assert!("gpu".parse::<StressClass>().is_err());

        let mixed = StressClass::IO | StressClass::OS;
        assert_eq!(mixed.to_string(), "io|os");
        assert!(mixed.contains(StressClass::IO));
        assert!(!mixed.contains(StressClass::CPU));
    }

    #[test]
    fn test_builtin_registry() {
        let registry = Registry::with_builtin();
        for name in ["noop", "cpu", "cache", "futex", "sem", "yield", "null"] {
            assert!(registry.contains(name), "missing {name}");
        }
        assert!(matches!(
            registry.get("nope"),
            Err(StressError::UnknownStressor(name)) if name == "nope"
        ));
    }

    #[test]
    fn test_register_and_class_lookup() {
        let mut registry = Registry::new();
        registry.register(StressorInfo {
            name: "idle-a",
            func: idle,
            class: StressClass::SCHEDULER,
        });
        registry.register(StressorInfo {
            name: "idle-b",
            func: idle,
            class: StressClass::CPU | StressClass::SCHEDULER,
        });
        registry.register(StressorInfo {
            name: "idle-c",
            func: idle,
            class: StressClass::IO,
        });

        let sched: Vec<_> = registry
            .in_class(StressClass::SCHEDULER)
            .iter()
            .map(|i| i.name)
            .collect();
        assert_eq!(sched, vec!["idle-a", "idle-b"]);
        assert_eq!(registry.names(), vec!["idle-a", "idle-b", "idle-c"]);
    }
}
