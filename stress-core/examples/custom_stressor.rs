// stress-core/examples/custom_stressor.rs
// Register a custom workload next to the built-ins and run it for a few seconds
// Run with: cargo run -p stress-core --example custom_stressor

use std::time::Duration;
use stress_core::*;
use tracing::info;

/// Hash a small buffer over and over
fn stress_fnv(args: &mut StressArgs<'_>) -> WorkerStatus {
    let data: Vec<u8> = (0..4096u32).map(|i| (i.wrapping_mul(31) ^ args.instance) as u8).collect();
    let mut expected = None;

    loop {
        let hash = data
            .iter()
            .fold(0xcbf2_9ce4_8422_2325u64, |h, b| (h ^ u64::from(*b)).wrapping_mul(0x100_0000_01b3));
        if args.verify {
            match expected {
                None => expected = Some(hash),
                Some(h) if h != hash => return WorkerStatus::VerifyFailed,
                _ => {}
            }
        }

        args.counter.inc();
        if !args.keep_running() {
            break;
        }
    }
    WorkerStatus::Completed
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .init();

    let mut registry = Registry::with_builtin();
    registry.register(StressorInfo {
        name: "fnv",
        func: stress_fnv,
        class: StressClass::CPU,
    });

    let settings = RunSettings {
        timeout: Duration::from_secs(3),
        verify: true,
        metrics: MetricsMode::Full,
        times: true,
        ..RunSettings::default()
    };
    let request = RunRequest::new(settings)
        .with("fnv", 2, 0)
        .with("cache", 1, 0)
        .with("futex", 1, 5000);

    let harness = Harness::new(registry);
    info!("Running {} instances for 3s", request.total_instances());
    let result = harness.run(&request)?;
    result.log_summary();

    info!("Exit status would be {}", result.exit_code());
    Ok(())
}
