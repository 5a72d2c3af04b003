//! Queue-depth sampler.
//!
//! Appends `<unix_seconds>,<backlog_packets>` to `--out` every
//! `--interval-ms` until interrupted or `--count` records are written.

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bloat_netsim::qdisc::qdisc_stats;
use bufferbloat::qmon::QueueMonitor;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "bloat-qmon", about = "Sample the backlog of an interface's qdiscs")]
struct Cli {
    /// Interface to watch.
    #[arg(long)]
    iface: String,

    /// Sampling period in milliseconds.
    #[arg(long, default_value_t = 100, value_parser = clap::value_parser!(u64).range(1..))]
    interval_ms: u64,

    /// Output file (truncated).
    #[arg(long)]
    out: PathBuf,

    /// Stop after this many records.
    #[arg(long)]
    count: Option<u64>,

    /// `tc` binary.
    #[arg(long, default_value = "tc")]
    tc: String,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst))
            .context("failed to install signal handler")?;
    }

    let file = File::create(&cli.out)
        .with_context(|| format!("failed to create {}", cli.out.display()))?;
    let tc = cli.tc.clone();
    let iface = cli.iface.clone();
    let mut monitor = QueueMonitor::new(
        BufWriter::new(file),
        move || qdisc_stats(&tc, &iface),
        Duration::from_millis(cli.interval_ms),
    );

    tracing::info!(iface = %cli.iface, interval_ms = cli.interval_ms, out = %cli.out.display(), "sampling");
    let written = monitor.run(cli.count, &stop)?;
    tracing::info!(records = written, "sampler stopped");
    Ok(())
}
