// stress-runner/src/cli.rs
// Command line definition and overrides on top of the config file

use anyhow::{bail, Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use stress_core::config::{DurationValue, StressorEntry};
use stress_core::{HarnessConfig, IoClass, MetricsMode, SchedPolicy};

pub fn command() -> Command {
    Command::new("stressforge")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Multi-process system stress harness")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("PATH")
                .help("Configuration file path"),
        )
        .arg(
            Arg::new("stressor")
                .short('s')
                .long("stressor")
                .value_name("NAME[:INSTANCES[:OPS]]")
                .help("Run a stressor; 0 instances means one per CPU")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("timeout")
                .short('t')
                .long("timeout")
                .value_name("DURATION")
                .help("Stop after this long, e.g. 60s, 5m, 1h"),
        )
        .arg(
            Arg::new("backoff")
                .long("backoff")
                .value_name("DURATION")
                .help("Delay between forks, e.g. 10ms"),
        )
        .arg(
            Arg::new("grace")
                .long("grace")
                .value_name("DURATION")
                .help("Time stopped workers get before SIGKILL"),
        )
        .arg(
            Arg::new("metrics")
                .short('M')
                .long("metrics")
                .value_name("MODE")
                .value_parser(["off", "brief", "full"])
                .help("Summary detail"),
        )
        .arg(
            Arg::new("verify")
                .long("verify")
                .help("Have workloads verify their results")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("sequential")
                .long("sequential")
                .value_name("N")
                .value_parser(clap::value_parser!(u32))
                .help("Run stressors one at a time with N instances each"),
        )
        .arg(
            Arg::new("class")
                .long("class")
                .value_name("CLASS")
                .help("Run every stressor in a class"),
        )
        .arg(
            Arg::new("instances")
                .long("instances")
                .value_name("N")
                .value_parser(clap::value_parser!(u32))
                .help("Instances per stressor for --class"),
        )
        .arg(
            Arg::new("random")
                .long("random")
                .value_name("N")
                .value_parser(clap::value_parser!(u32))
                .help("Spread N instances over random stressors"),
        )
        .arg(
            Arg::new("dry-run")
                .short('n')
                .long("dry-run")
                .help("Plan the run without forking")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("keep-name")
                .short('k')
                .long("keep-name")
                .help("Do not rename worker processes")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("times")
                .long("times")
                .help("Report user and system CPU time")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("no-coredump")
                .long("no-coredump")
                .help("Disable core dumps in workers")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("sched")
                .long("sched")
                .value_name("POLICY")
                .help("Worker scheduling policy: other, batch, idle, fifo, rr"),
        )
        .arg(
            Arg::new("sched-prio")
                .long("sched-prio")
                .value_name("PRIO")
                .value_parser(clap::value_parser!(i32))
                .help("Static priority for fifo/rr"),
        )
        .arg(
            Arg::new("ionice-class")
                .long("ionice-class")
                .value_name("CLASS")
                .help("I/O class: realtime, besteffort, idle"),
        )
        .arg(
            Arg::new("ionice-level")
                .long("ionice-level")
                .value_name("LEVEL")
                .value_parser(clap::value_parser!(u8))
                .help("I/O priority level 0 (high) to 7 (low)"),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .value_name("PATH")
                .help("Write the run summary as JSON, '-' for stdout"),
        )
        .arg(
            Arg::new("list")
                .long("list")
                .help("List available stressors and exit")
                .action(ArgAction::SetTrue),
        )
}

/// Parse `name[:instances[:ops]]`
pub fn parse_stressor_spec(spec: &str) -> Result<StressorEntry> {
    let mut parts = spec.split(':');
    let name = parts.next().unwrap_or_default().trim();
    if name.is_empty() {
        bail!("empty stressor name in '{spec}'");
    }

    let instances = match parts.next() {
        Some(n) => n
            .parse()
            .with_context(|| format!("invalid instance count in '{spec}'"))?,
        None => 1,
    };
    let ops = match parts.next() {
        Some(n) => n
            .parse()
            .with_context(|| format!("invalid op count in '{spec}'"))?,
        None => 0,
    };
    if parts.next().is_some() {
        bail!("too many fields in '{spec}', expected name[:instances[:ops]]");
    }

    Ok(StressorEntry {
        name: name.to_string(),
        instances,
        ops,
    })
}

/// Command line values take precedence over the config file
pub fn apply_overrides(matches: &ArgMatches, config: &mut HarnessConfig) -> Result<()> {
    if let Some(specs) = matches.get_many::<String>("stressor") {
        config.stressors = specs
            .map(|s| parse_stressor_spec(s))
            .collect::<Result<_>>()?;
    }

    let run = &mut config.run;
    for (arg, field) in [
        ("timeout", &mut run.timeout),
        ("backoff", &mut run.backoff),
        ("grace", &mut run.grace),
    ] {
        if let Some(value) = matches.get_one::<String>(arg) {
            *field = DurationValue::Text(value.clone());
        }
    }

    if let Some(mode) = matches.get_one::<String>("metrics") {
        run.metrics = mode.parse::<MetricsMode>()?;
    }
    if let Some(n) = matches.get_one::<u32>("sequential") {
        run.sequential = Some(*n);
    }
    if let Some(class) = matches.get_one::<String>("class") {
        run.class = Some(class.clone());
    }
    if let Some(n) = matches.get_one::<u32>("instances") {
        run.instances = *n;
    }
    if let Some(n) = matches.get_one::<u32>("random") {
        run.random = Some(*n);
    }
    run.verify |= matches.get_flag("verify");
    run.dry_run |= matches.get_flag("dry-run");
    run.keep_name |= matches.get_flag("keep-name");
    run.times |= matches.get_flag("times");

    let isolation = &mut config.isolation;
    isolation.disable_coredump |= matches.get_flag("no-coredump");
    if let Some(policy) = matches.get_one::<String>("sched") {
        isolation.sched = Some(policy.parse::<SchedPolicy>()?);
    }
    if let Some(prio) = matches.get_one::<i32>("sched-prio") {
        isolation.sched_priority = Some(*prio);
    }
    if let Some(class) = matches.get_one::<String>("ionice-class") {
        isolation.ionice_class = Some(class.parse::<IoClass>()?);
    }
    if let Some(level) = matches.get_one::<u8>("ionice-level") {
        isolation.ionice_level = Some(*level);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    #[test]
    fn test_stressor_specs() {
        let entry = parse_stressor_spec("cpu").unwrap();
        assert_eq!((entry.name.as_str(), entry.instances, entry.ops), ("cpu", 1, 0));

        let entry = parse_stressor_spec("cache:4:1000").unwrap();
        assert_eq!((entry.instances, entry.ops), (4, 1000));

        assert!(parse_stressor_spec(":2").is_err());
        assert!(parse_stressor_spec("cpu:x").is_err());
        assert!(parse_stressor_spec("cpu:1:2:3").is_err());
    }

    #[test]
    fn test_command_is_well_formed() {
        command().debug_assert();
    }

    #[test]
    fn test_overrides_replace_file_values() {
        let mut config = HarnessConfig::from_toml_str(
            "[run]\ntimeout = \"1h\"\n[[stressor]]\nname = \"noop\"\ninstances = 8\n",
        )
        .unwrap();
        let matches = command()
            .try_get_matches_from([
                "stressforge", "-s", "cpu:2:500", "-s", "null", "-t", "30s", "--metrics", "full",
                "--times", "--sched", "batch", "--ionice-class", "idle",
            ])
            .unwrap();

        apply_overrides(&matches, &mut config).unwrap();

        assert_eq!(config.stressors.len(), 2);
        assert_eq!(config.stressors[0].ops, 500);
        assert_eq!(config.run.timeout.to_duration().unwrap(), Duration::from_secs(30));
        assert_eq!(config.run.metrics, MetricsMode::Full);
        assert!(config.run.times);
        assert_eq!(config.isolation.sched, Some(SchedPolicy::Batch));
        assert_eq!(config.isolation.ionice_class, Some(IoClass::Idle));
    }

    #[test]
    fn test_unknown_policy_is_rejected() {
        let mut config = HarnessConfig::default();
        let matches = command()
            .try_get_matches_from(["stressforge", "--sched", "deadline"])
            .unwrap();
        assert!(apply_overrides(&matches, &mut config).is_err());
    }

    proptest! {
        #[test]
        fn prop_specs_round_trip(name in "[a-z][a-z-]{0,12}", n in 0u32..2048, ops in 0u64..1_000_000) {
            let entry = parse_stressor_spec(&format!("{name}:{n}:{ops}")).unwrap();
            prop_assert_eq!(entry.name, name);
            prop_assert_eq!(entry.instances, n);
            prop_assert_eq!(entry.ops, ops);
        }
    }
}
