// stress-runner/src/main.rs
// stressforge - multi-process system stress harness

use anyhow::{Context, Result};
use stress_core::{Harness, HarnessConfig, Registry, RunResult};
use sysinfo::{CpuExt, System, SystemExt};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod cli;

const DEFAULT_CONFIG: &str = "stressforge.toml";

fn main() -> Result<()> {
    // Initialize logging; RUST_LOG overrides the default level
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let matches = cli::command().get_matches();
    let registry = Registry::with_builtin();

    if matches.get_flag("list") {
        for info in registry.iter() {
            println!("{:<10} {}", info.name, info.class);
        }
        return Ok(());
    }

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or(DEFAULT_CONFIG);
    let mut config = HarnessConfig::load(config_path)
        .with_context(|| format!("failed to load {config_path}"))?;
    cli::apply_overrides(&matches, &mut config)?;

    let request = config.to_request(&registry)?;
    log_host_baseline();

    let harness = Harness::new(registry);
    let token = harness.stop_token();
    ctrlc::set_handler(move || token.interrupt()).context("failed to install interrupt handler")?;

    let result = harness.run(&request)?;
    result.log_summary();

    if let Some(target) = matches.get_one::<String>("json") {
        write_json(&result, target)?;
    }

    let code = result.exit_code();
    if code != 0 {
        warn!("Exiting with status {}", code);
        std::process::exit(code);
    }
    Ok(())
}

fn write_json(result: &RunResult, target: &str) -> Result<()> {
    let json = result.to_json()?;
    if target == "-" {
        println!("{json}");
    } else {
        std::fs::write(target, json).with_context(|| format!("failed to write {target}"))?;
        info!("Summary written to {}", target);
    }
    Ok(())
}

fn log_host_baseline() {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.refresh_cpu();

    let load = sys.load_average();
    info!(
        "Host {} (kernel {}): {} CPUs, {} MiB memory ({} MiB available), load {:.2} {:.2} {:.2}",
        sys.host_name().unwrap_or_else(|| "unknown".to_string()),
        sys.kernel_version().unwrap_or_else(|| "unknown".to_string()),
        sys.cpus().len(),
        sys.total_memory() / (1024 * 1024),
        sys.available_memory() / (1024 * 1024),
        load.one,
        load.five,
        load.fifteen
    );
    if let Some(cpu) = sys.cpus().first() {
        info!("CPU: {} @ {} MHz", cpu.brand(), cpu.frequency());
    }
}
