//! `bufferbloat` driver entry point.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use bufferbloat::cli::Cli;
use bufferbloat::driver::Driver;
use bufferbloat::emulator::NetnsEmulator;
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.to_config();
    let tools = cli.tools_config()?;

    tracing::info!(
        bw_net = config.bottleneck_bandwidth_mbit,
        delay_ms = config.delay_ms,
        maxq = config.max_queue_packets,
        time = ?config.duration,
        dir = %config.output_dir.display(),
        cong = %config.congestion_control,
        "bufferbloat starting"
    );

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || {
            eprintln!("\nReceived shutdown signal, ending measurement early...");
            stop.store(true, Ordering::SeqCst);
        })
        .context("failed to install signal handler")?;
    }

    let emulator = NetnsEmulator::new(&tools);
    let mut driver = Driver::new(config, tools, emulator)
        .context("invalid configuration")?
        .with_stop_flag(stop);
    let report = driver.run()?;

    if cli.json {
        println!("{}", serde_json::to_string(&report)?);
    }
    Ok(())
}
