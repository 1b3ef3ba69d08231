// stress-core/src/config.rs
// Configuration loading, validation and resolution into a run request

use crate::error::*;
use crate::harness::{RunRequest, RunSettings, StressorRequest};
use crate::isolation::{IoClass, IoPriority, IsolationSettings, SchedPolicy};
use crate::metrics::MetricsMode;
use crate::registry::{Registry, StressClass};
use crate::{MAX_OPS, MAX_TIMEOUT, MIN_OPS, PROCS_MAX};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A duration given either as plain seconds or as a suffixed string
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DurationValue {
    Seconds(u64),
    Text(String),
}

impl DurationValue {
    pub fn to_duration(&self) -> Result<Duration> {
        match self {
            DurationValue::Seconds(secs) => Ok(Duration::from_secs(*secs)),
            DurationValue::Text(text) => parse_duration(text),
        }
    }
}

impl From<&str> for DurationValue {
    fn from(s: &str) -> Self {
        DurationValue::Text(s.to_string())
    }
}

impl fmt::Display for DurationValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DurationValue::Seconds(secs) => write!(f, "{secs}s"),
            DurationValue::Text(text) => write!(f, "{text}"),
        }
    }
}

/// Parse `N[us|ms|s|m|h|d|y]`; a bare number is seconds
pub fn parse_duration(text: &str) -> Result<Duration> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);

    let value: u64 = digits
        .parse()
        .map_err(|_| StressError::Parse(format!("invalid duration '{text}'")))?;

    let secs_per_unit: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "us" => return Ok(Duration::from_micros(value)),
        "ms" => return Ok(Duration::from_millis(value)),
        "" | "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 24 * 60 * 60,
        "y" => 365 * 24 * 60 * 60,
        other => {
            return Err(StressError::Parse(format!(
                "invalid duration unit '{other}' in '{text}', use us, ms, s, m, h, d or y"
            )))
        }
    };

    value
        .checked_mul(secs_per_unit)
        .map(Duration::from_secs)
        .ok_or_else(|| StressError::Parse(format!("duration '{text}' overflows")))
}

/// Top-level configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub run: RunConfig,
    pub isolation: IsolationConfig,
    #[serde(rename = "stressor")]
    pub stressors: Vec<StressorEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub timeout: DurationValue,
    pub backoff: DurationValue,
    pub grace: DurationValue,
    pub verify: bool,
    pub metrics: MetricsMode,
    /// Run every selected stressor alone with this many instances
    pub sequential: Option<u32>,
    pub dry_run: bool,
    pub keep_name: bool,
    pub times: bool,
    /// Select every registered stressor in this class
    pub class: Option<String>,
    /// Spread this many instances over randomly chosen stressors
    pub random: Option<u32>,
    /// Instances per stressor for class selection, 0 for one per CPU
    pub instances: u32,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            timeout: "1d".into(),
            backoff: DurationValue::Seconds(0),
            grace: "2s".into(),
            verify: false,
            metrics: MetricsMode::Brief,
            sequential: None,
            dry_run: false,
            keep_name: false,
            times: false,
            class: None,
            random: None,
            instances: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationConfig {
    pub disable_coredump: bool,
    pub oom_killable: bool,
    pub sched: Option<SchedPolicy>,
    pub sched_priority: Option<i32>,
    pub ionice_class: Option<IoClass>,
    pub ionice_level: Option<u8>,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            disable_coredump: false,
            oom_killable: true,
            sched: None,
            sched_priority: None,
            ionice_class: None,
            ionice_level: None,
        }
    }
}

/// One `[[stressor]]` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StressorEntry {
    pub name: String,
    /// 0 for one per CPU
    #[serde(default = "default_instances")]
    pub instances: u32,
    /// Bogo-op ceiling per instance, 0 for unbounded
    #[serde(default)]
    pub ops: u64,
}

fn default_instances() -> u32 {
    1
}

/// Instance count with 0 meaning one per online CPU
pub fn resolve_instances(n: u32) -> u32 {
    if n == 0 {
        num_cpus::get() as u32
    } else {
        n
    }
}

impl HarnessConfig {
    /// Load from a TOML file, falling back to defaults when it does not exist
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let config = Self::from_toml_str(&content)?;
                info!("Loaded configuration from {}", path.display());
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Config file {} not found, using defaults", path.display());
                Ok(Self::default())
            }
            Err(source) => Err(StressError::Io {
                operation: format!("read {}", path.display()),
                source,
            }),
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| StressError::Serialization {
            context: "TOML encoding".to_string(),
            source: Box::new(e),
        })
    }

    /// Run every validation rule against this configuration, resolving
    /// selections with the built-in registry
    pub fn validate(&self) -> ValidationReport {
        self.validate_with(&Registry::with_builtin())
    }

    /// Run every validation rule, resolving selections against `registry`
    pub fn validate_with(&self, registry: &Registry) -> ValidationReport {
        let mut issues = Vec::new();
        for rule in validation_rules() {
            let result = (rule.validator)(self, registry);
            if !result.is_valid {
                debug!("Rule {} ({}) not satisfied", rule.name, rule.description);
                issues.push(ValidationIssue {
                    rule_name: rule.name,
                    severity: rule.severity,
                    message: result.message,
                });
            }
        }

        let is_valid = issues.iter().all(|i| i.severity < ValidationSeverity::Error);
        debug!("Configuration validated: {} issues", issues.len());
        ValidationReport { is_valid, issues }
    }

    /// Validate and resolve selections into a concrete run request
    pub fn to_request(&self, registry: &Registry) -> Result<RunRequest> {
        let report = self.validate_with(registry);
        for issue in &report.issues {
            match issue.severity {
                ValidationSeverity::Info => debug!("{}", issue),
                ValidationSeverity::Warning => warn!("{}", issue),
                _ => {}
            }
        }
        if let Some(issue) = report.first_error() {
            return Err(crate::config_error!(issue.rule_name, issue.message.clone()));
        }

        let settings = self.settings()?;
        let stressors = self.select(registry)?;

        let total: usize = stressors.iter().map(|s| s.instances as usize).sum();
        if total > PROCS_MAX {
            return Err(StressError::TooManyInstances {
                requested: total,
                max: PROCS_MAX,
            });
        }

        Ok(RunRequest { stressors, settings })
    }

    fn settings(&self) -> Result<RunSettings> {
        let ionice = match (self.isolation.ionice_class, self.isolation.ionice_level) {
            (Some(class), level) => Some(IoPriority {
                class,
                level: level.unwrap_or(4),
            }),
            (None, Some(level)) => Some(IoPriority {
                class: IoClass::BestEffort,
                level,
            }),
            (None, None) => None,
        };

        Ok(RunSettings {
            timeout: self.run.timeout.to_duration()?,
            backoff: self.run.backoff.to_duration()?,
            grace: self.run.grace.to_duration()?,
            verify: self.run.verify,
            metrics: self.run.metrics,
            sequential: self.run.sequential.is_some(),
            dry_run: self.run.dry_run,
            times: self.run.times,
            isolation: IsolationSettings {
                keep_name: self.run.keep_name,
                disable_coredump: self.isolation.disable_coredump,
                oom_killable: self.isolation.oom_killable,
                sched: self.isolation.sched,
                sched_priority: self.isolation.sched_priority,
                ionice,
            },
        })
    }

    fn select(&self, registry: &Registry) -> Result<Vec<StressorRequest>> {
        let mut selected: Vec<StressorRequest> = self
            .stressors
            .iter()
            .map(|entry| {
                registry.get(&entry.name)?;
                Ok(StressorRequest {
                    stressor: entry.name.clone(),
                    instances: resolve_instances(entry.instances),
                    max_ops: entry.ops,
                })
            })
            .collect::<Result<_>>()?;

        if let Some(class) = &self.run.class {
            let class: StressClass = class.parse()?;
            let instances = resolve_instances(self.run.instances);
            for info in registry.in_class(class) {
                selected.push(StressorRequest {
                    stressor: info.name.to_string(),
                    instances,
                    max_ops: 0,
                });
            }
        }

        if let Some(count) = self.run.random {
            selected.extend(random_selection(registry, resolve_instances(count)));
        }

        if let Some(per_stressor) = self.run.sequential {
            let instances = resolve_instances(per_stressor);
            if selected.is_empty() {
                // Sequential mode with no explicit choice walks the whole registry
                selected = registry
                    .names()
                    .into_iter()
                    .map(|name| StressorRequest {
                        stressor: name.to_string(),
                        instances,
                        max_ops: 0,
                    })
                    .collect();
            } else {
                for request in &mut selected {
                    request.instances = instances;
                }
            }
        }

        Ok(selected)
    }
}

/// Distribute `count` instances over randomly picked stressors
fn random_selection(registry: &Registry, count: u32) -> Vec<StressorRequest> {
    let names = registry.names();
    if names.is_empty() {
        return Vec::new();
    }

    let mut picks = vec![0u32; names.len()];
    for _ in 0..count {
        picks[fastrand::usize(..names.len())] += 1;
    }

    names
        .into_iter()
        .zip(picks)
        .filter(|(_, instances)| *instances > 0)
        .map(|(name, instances)| StressorRequest {
            stressor: name.to_string(),
            instances,
            max_ops: 0,
        })
        .collect()
}

/// Validation severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ValidationSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Configuration validation rule
#[derive(Debug, Clone)]
pub struct ValidationRule {
    pub name: &'static str,
    pub description: &'static str,
    pub validator: fn(&HarnessConfig, &Registry) -> ValidationResult,
    pub severity: ValidationSeverity,
}

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub message: String,
}

impl ValidationResult {
    fn ok() -> Self {
        Self {
            is_valid: true,
            message: String::new(),
        }
    }

    fn fail(message: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ValidationIssue {
    pub rule_name: &'static str,
    pub severity: ValidationSeverity,
    pub message: String,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}: {}", self.severity, self.rule_name, self.message)
    }
}

#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    /// Most severe blocking issue, if any
    pub fn first_error(&self) -> Option<&ValidationIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity >= ValidationSeverity::Error)
            .max_by_key(|i| i.severity)
    }
}

/// Instances the run will need slots for.
///
/// Slots are never reused, so sequential mode needs one set per selected
/// stressor.
fn planned_instances(config: &HarnessConfig, registry: &Registry) -> usize {
    if let Ok(selected) = config.select(registry) {
        return selected.iter().map(|s| s.instances as usize).sum();
    }

    // Unresolvable selections are reported by other rules; count what is known
    let explicit = config.stressors.len();
    match config.run.sequential {
        Some(n) => resolve_instances(n) as usize * explicit.max(1),
        None => {
            let counts: usize = config
                .stressors
                .iter()
                .map(|s| resolve_instances(s.instances) as usize)
                .sum();
            counts + config.run.random.map(resolve_instances).unwrap_or(0) as usize
        }
    }
}

fn validation_rules() -> Vec<ValidationRule> {
    vec![
        ValidationRule {
            name: "durations",
            description: "Timeout, backoff and grace must parse",
            validator: |config, _| {
                let run = &config.run;
                for (field, value) in [("timeout", &run.timeout), ("backoff", &run.backoff), ("grace", &run.grace)] {
                    if let Err(e) = value.to_duration() {
                        return ValidationResult::fail(format!("{field}: {e}"));
                    }
                }
                ValidationResult::ok()
            },
            severity: ValidationSeverity::Error,
        },
        ValidationRule {
            name: "timeout_nonzero",
            description: "A zero timeout would stop every worker at once",
            validator: |config, _| match config.run.timeout.to_duration() {
                Ok(t) if t.is_zero() => ValidationResult::fail("timeout must be greater than zero"),
                _ => ValidationResult::ok(),
            },
            severity: ValidationSeverity::Error,
        },
        ValidationRule {
            name: "timeout_range",
            description: "The timeout must leave room for a deadline on the monotonic clock",
            validator: |config, _| match config.run.timeout.to_duration() {
                Ok(t) if t > MAX_TIMEOUT => ValidationResult::fail(format!(
                    "timeout {}s exceeds the maximum of {}s",
                    t.as_secs(),
                    MAX_TIMEOUT.as_secs()
                )),
                _ => ValidationResult::ok(),
            },
            severity: ValidationSeverity::Error,
        },
        ValidationRule {
            name: "selection",
            description: "At least one stressor must be selected",
            validator: |config, _| {
                if config.stressors.is_empty()
                    && config.run.class.is_none()
                    && config.run.random.is_none()
                    && config.run.sequential.is_none()
                {
                    ValidationResult::fail("no stressors selected")
                } else {
                    ValidationResult::ok()
                }
            },
            severity: ValidationSeverity::Error,
        },
        ValidationRule {
            name: "ops_range",
            description: "Nonzero op ceilings must stay within the accepted range",
            validator: |config, _| {
                for entry in &config.stressors {
                    if entry.ops != 0 && !(MIN_OPS..=MAX_OPS).contains(&entry.ops) {
                        return ValidationResult::fail(format!(
                            "{}: ops {} outside {}..={}",
                            entry.name, entry.ops, MIN_OPS, MAX_OPS
                        ));
                    }
                }
                ValidationResult::ok()
            },
            severity: ValidationSeverity::Error,
        },
        ValidationRule {
            name: "instance_budget",
            description: "Total instances must fit the shared slot table",
            validator: |config, registry| {
                let total = planned_instances(config, registry);
                if total > PROCS_MAX {
                    ValidationResult::fail(format!("{total} instances requested, maximum is {PROCS_MAX}"))
                } else {
                    ValidationResult::ok()
                }
            },
            severity: ValidationSeverity::Critical,
        },
        ValidationRule {
            name: "class",
            description: "Class names must be known",
            validator: |config, _| match &config.run.class {
                Some(class) => match class.parse::<StressClass>() {
                    Ok(_) => ValidationResult::ok(),
                    Err(e) => ValidationResult::fail(e.to_string()),
                },
                None => ValidationResult::ok(),
            },
            severity: ValidationSeverity::Error,
        },
        ValidationRule {
            name: "sched_priority",
            description: "Scheduling priority must suit the policy",
            validator: |config, _| {
                let iso = &config.isolation;
                match (iso.sched, iso.sched_priority) {
                    (None, Some(_)) => ValidationResult::fail("sched_priority is ignored without sched"),
                    (Some(policy), Some(prio)) => {
                        let (min, max) = policy.priority_range();
                        if prio < min || prio > max {
                            ValidationResult::fail(format!(
                                "priority {prio} outside {min}..={max} for {policy:?}"
                            ))
                        } else {
                            ValidationResult::ok()
                        }
                    }
                    _ => ValidationResult::ok(),
                }
            },
            severity: ValidationSeverity::Error,
        },
        ValidationRule {
            name: "ionice_level",
            description: "I/O priority level must be 0..=7",
            validator: |config, _| match config.isolation.ionice_level {
                Some(level) if level > 7 => {
                    ValidationResult::fail(format!("ionice level {level} outside 0..=7"))
                }
                _ => ValidationResult::ok(),
            },
            severity: ValidationSeverity::Error,
        },
        ValidationRule {
            name: "sequential_overrides",
            description: "Sequential mode replaces per-stressor instance counts",
            validator: |config, _| {
                if config.run.sequential.is_some() && config.stressors.iter().any(|s| s.instances != 1) {
                    ValidationResult::fail("per-stressor instance counts are ignored in sequential mode")
                } else {
                    ValidationResult::ok()
                }
            },
            severity: ValidationSeverity::Warning,
        },
        ValidationRule {
            name: "realtime_privileges",
            description: "Realtime scheduling normally needs root",
            validator: |config, _| match config.isolation.sched {
                Some(policy) if policy.is_realtime() && !nix::unistd::Uid::effective().is_root() => {
                    ValidationResult::fail(format!("{policy:?} will likely fail without root"))
                }
                _ => ValidationResult::ok(),
            },
            severity: ValidationSeverity::Warning,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SAMPLE: &str = r#"
[run]
timeout = "90s"
backoff = "10ms"
verify = true
metrics = "full"
times = true

[isolation]
disable_coredump = true
ionice_class = "be"
ionice_level = 6

[[stressor]]
name = "cpu"
instances = 4
ops = 1000

[[stressor]]
name = "null"
"#;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("2d").unwrap(), Duration::from_secs(172_800));
        assert_eq!(parse_duration("1y").unwrap(), Duration::from_secs(31_536_000));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("40us").unwrap(), Duration::from_micros(40));
        assert!(parse_duration("5 fortnights").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn test_load_sample() {
        let config = HarnessConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.stressors.len(), 2);
        assert_eq!(config.stressors[1].instances, 1);
        assert_eq!(config.stressors[1].ops, 0);
        assert_eq!(config.run.metrics, MetricsMode::Full);

        let request = config.to_request(&Registry::with_builtin()).unwrap();
        assert_eq!(request.settings.timeout, Duration::from_secs(90));
        assert_eq!(request.settings.backoff, Duration::from_millis(10));
        assert!(request.settings.verify);
        assert_eq!(
            request.settings.isolation.ionice,
            Some(IoPriority {
                class: IoClass::BestEffort,
                level: 6
            })
        );
        assert_eq!(request.stressors[0].instances, 4);
        assert_eq!(request.stressors[0].max_ops, 1000);
    }

    #[test]
    fn test_plain_seconds_and_missing_file() {
        let config = HarnessConfig::from_toml_str("[run]\ntimeout = 30\n").unwrap();
        assert_eq!(config.run.timeout.to_duration().unwrap(), Duration::from_secs(30));

        let config = HarnessConfig::load("/nonexistent/stress.toml").unwrap();
        assert!(config.stressors.is_empty());
    }

    #[test]
    fn test_default_round_trips_through_toml() {
        let text = HarnessConfig::default().to_toml_string().unwrap();
        let parsed = HarnessConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed.run.timeout, DurationValue::Text("1d".to_string()));
        assert!(parsed.isolation.oom_killable);
    }

    #[test]
    fn test_empty_selection_is_rejected() {
        let report = HarnessConfig::default().validate();
        assert!(!report.is_valid);
        assert_eq!(report.first_error().unwrap().rule_name, "selection");
    }

    #[test]
    fn test_ops_range_rule() {
        let mut config = HarnessConfig::from_toml_str(SAMPLE).unwrap();
        config.stressors[0].ops = 99;
        let err = config.to_request(&Registry::with_builtin()).unwrap_err();
        assert!(err.to_string().contains("ops_range"));

        config.stressors[0].ops = MAX_OPS;
        assert!(config.validate().is_valid);
    }

    #[test]
    fn test_instance_budget_is_critical() {
        let mut config = HarnessConfig::default();
        config.stressors.push(StressorEntry {
            name: "noop".to_string(),
            instances: PROCS_MAX as u32 + 1,
            ops: 0,
        });
        let report = config.validate();
        assert_eq!(report.first_error().unwrap().severity, ValidationSeverity::Critical);
    }

    #[test]
    fn test_sequential_budget_counts_every_stressor() {
        let mut config = HarnessConfig::default();
        config.run.sequential = Some(600);
        for name in ["cpu", "noop"] {
            config.stressors.push(StressorEntry {
                name: name.to_string(),
                instances: 1,
                ops: 0,
            });
        }

        let report = config.validate();
        let issue = report.first_error().unwrap();
        assert_eq!(issue.rule_name, "instance_budget");
        assert!(issue.message.starts_with("1200 instances"));
        assert!(matches!(
            config.to_request(&Registry::with_builtin()),
            Err(StressError::Config { field, .. }) if field == "instance_budget"
        ));

        config.run.sequential = Some(500);
        assert!(config.validate().is_valid);
    }

    #[test]
    fn test_sequential_registry_walk_is_budgeted() {
        let registry = Registry::with_builtin();
        let mut config = HarnessConfig::default();
        config.run.sequential = Some((PROCS_MAX / registry.len() + 1) as u32);

        let report = config.validate_with(&registry);
        assert_eq!(report.first_error().unwrap().rule_name, "instance_budget");
    }

    #[test]
    fn test_timeout_range_rule() {
        let mut config = HarnessConfig::from_toml_str(SAMPLE).unwrap();
        for huge in ["18446744073709551615", "584942417355y", "101y"] {
            config.run.timeout = DurationValue::Text(huge.to_string());
            let report = config.validate();
            assert_eq!(report.first_error().unwrap().rule_name, "timeout_range", "{huge}");
        }

        config.run.timeout = DurationValue::Text("100y".to_string());
        assert!(config.validate().is_valid);
    }

    #[test]
    fn test_ionice_level_rule() {
        let mut config = HarnessConfig::from_toml_str(SAMPLE).unwrap();
        config.isolation.ionice_level = Some(8);
        assert_eq!(config.validate().first_error().unwrap().rule_name, "ionice_level");
    }

    #[test]
    fn test_unknown_stressor() {
        let mut config = HarnessConfig::default();
        config.stressors.push(StressorEntry {
            name: "flux".to_string(),
            instances: 1,
            ops: 0,
        });
        assert!(matches!(
            config.to_request(&Registry::with_builtin()),
            Err(StressError::UnknownStressor(_))
        ));
    }

    #[test]
    fn test_class_selection() {
        let mut config = HarnessConfig::default();
        config.run.class = Some("scheduler".to_string());
        config.run.instances = 2;
        let request = config.to_request(&Registry::with_builtin()).unwrap();

        let names: Vec<_> = request.stressors.iter().map(|s| s.stressor.as_str()).collect();
        assert_eq!(names, vec!["futex", "sem", "yield"]);
        assert!(request.stressors.iter().all(|s| s.instances == 2));

        config.run.class = Some("gpu".to_string());
        assert!(config.to_request(&Registry::with_builtin()).is_err());
    }

    #[test]
    fn test_random_selection_distributes_all_instances() {
        let mut config = HarnessConfig::default();
        config.run.random = Some(12);
        let registry = Registry::with_builtin();
        let request = config.to_request(&registry).unwrap();

        assert_eq!(request.total_instances(), 12);
        assert!(request.stressors.iter().all(|s| registry.contains(&s.stressor)));
    }

    #[test]
    fn test_sequential_without_selection_runs_registry() {
        let mut config = HarnessConfig::default();
        config.run.sequential = Some(1);
        let registry = Registry::with_builtin();
        let request = config.to_request(&registry).unwrap();

        assert!(request.settings.sequential);
        assert_eq!(request.stressors.len(), registry.len());
        assert!(request.stressors.iter().all(|s| s.instances == 1));
    }

    #[test]
    fn test_zero_instances_means_one_per_cpu() {
        assert_eq!(resolve_instances(0), num_cpus::get() as u32);
        assert_eq!(resolve_instances(3), 3);
    }

    proptest! {
        #[test]
        fn prop_suffixed_durations_scale(n in 0u64..1_000_000) {
            prop_assert_eq!(parse_duration(&n.to_string()).unwrap(), Duration::from_secs(n));
            prop_assert_eq!(parse_duration(&format!("{n}m")).unwrap(), Duration::from_secs(n * 60));
            prop_assert_eq!(parse_duration(&format!("{n}ms")).unwrap(), Duration::from_millis(n));
        }

        #[test]
        fn prop_garbage_never_panics(s in "\\PC*") {
            let _ = parse_duration(&s);
        }
    }
}
