//! Experiment driver.
//!
//! Owns one run end to end: builds the dumbbell, brings the network up,
//! launches the auxiliary processes, runs the foreground measurement loop,
//! prints the summary and tears everything down again.
//!
//! Only topology construction and network start abort a run. Once the
//! network is up, every path (including an early return or a panic
//! unwinding through the driver) goes through [`Driver::teardown`] and ends
//! in [`Phase::Done`].

use std::fmt;
use std::fs;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::{ConfigError, ExperimentConfig};
use crate::emulator::{CommandSpec, Emulator};
use crate::launch::{content_url, Launcher, HTTP_PORT};
use crate::measure::{fetch_command, timed_fetch, ForegroundLoop, LatencySamples};
use crate::process::{AuxKind, ProcessTable};
use crate::stats::LatencySummary;
use crate::tools::ToolsConfig;
use crate::topology::{build_dumbbell, DumbbellParams, Topology, HOST_A, HOST_B};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    NetworkStarting,
    NetworkUp,
    AuxiliaryProcessesLaunching,
    Measuring,
    Aggregating,
    TearingDown,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    /// Successful fetch times, seconds, in order.
    pub samples: Vec<f64>,
    /// Fetches that failed.
    pub missing: usize,
    /// `None` when no fetch succeeded.
    pub summary: Option<LatencySummary>,
    /// Auxiliary processes that never launched.
    pub degraded: Vec<AuxKind>,
}

pub struct Driver<E: Emulator> {
    config: ExperimentConfig,
    tools: ToolsConfig,
    emulator: E,
    phase: Phase,
    history: Vec<Phase>,
    table: ProcessTable,
    network_up: bool,
    stop: Option<Arc<AtomicBool>>,
}

impl<E: Emulator> Driver<E> {
    /// Validates `config` before anything is touched.
    pub fn new(config: ExperimentConfig, tools: ToolsConfig, emulator: E) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            tools,
            emulator,
            phase: Phase::Idle,
            history: vec![Phase::Idle],
            table: ProcessTable::new(),
            network_up: false,
            stop: None,
        })
    }

    /// Cuts the measurement window short once `flag` is set (Ctrl-C).
    pub fn with_stop_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.stop = Some(flag);
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Every phase entered so far, in order.
    pub fn history(&self) -> &[Phase] {
        &self.history
    }

    pub fn emulator(&self) -> &E {
        &self.emulator
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    fn enter(&mut self, phase: Phase) {
        info!(from = %self.phase, to = %phase, "phase");
        self.phase = phase;
        self.history.push(phase);
    }

    /// Runs the experiment once.
    pub fn run(&mut self) -> anyhow::Result<RunReport> {
        if self.phase != Phase::Idle {
            bail!("driver already used (phase {})", self.phase);
        }

        self.enter(Phase::NetworkStarting);
        let topology = match self.start_network() {
            Ok(topology) => topology,
            Err(e) => {
                self.enter(Phase::Done);
                return Err(e);
            }
        };
        self.network_up = true;

        self.enter(Phase::NetworkUp);
        self.check_network(&topology);

        self.enter(Phase::AuxiliaryProcessesLaunching);
        let degraded = self.launch_all(&topology);

        self.enter(Phase::Measuring);
        let samples = self.measure();

        self.enter(Phase::Aggregating);
        let summary = LatencySummary::from_samples(&samples.values, samples.missing);
        match &summary {
            Some(summary) => println!("{summary}"),
            None => println!(
                "fetch time: no successful fetches (missing={})",
                samples.missing
            ),
        }

        self.teardown();

        Ok(RunReport {
            samples: samples.values,
            missing: samples.missing,
            summary,
            degraded,
        })
    }

    fn start_network(&mut self) -> anyhow::Result<Topology> {
        let config = &self.config;
        let topology = build_dumbbell(&DumbbellParams {
            cpu: config.cpu_limit,
            host_bandwidth_mbit: config.host_bandwidth_mbit,
            bottleneck_bandwidth_mbit: config.bottleneck_bandwidth_mbit,
            delay_ms: config.delay_ms,
            max_queue_packets: config.max_queue_packets,
        })
        .context("failed to build topology")?;

        fs::create_dir_all(&config.output_dir).with_context(|| {
            format!(
                "failed to create output directory {}",
                config.output_dir.display()
            )
        })?;

        if let Err(first) = self.emulator.start(&topology) {
            // usually leftovers from an earlier run still holding the names
            warn!(error = %first, "network start failed, resetting and retrying once");
            if let Err(e) = self.emulator.cleanup() {
                warn!(error = %e, "reset failed");
            }
            if let Err(second) = self.emulator.start(&topology) {
                error!(error = %second, "network start failed again");
                if let Err(e) = self.emulator.cleanup() {
                    warn!(error = %e, "reset failed");
                }
                return Err(anyhow!(second).context("failed to start the emulated network"));
            }
        }
        Ok(topology)
    }

    /// Diagnostics only; nothing here fails the run.
    fn check_network(&self, topology: &Topology) {
        for link in topology.links() {
            info!(
                a = %link.a_iface,
                b = %link.b_iface,
                bw_mbit = link.params.bandwidth_mbit,
                delay = ?link.params.propagation_delay,
                max_queue = ?link.params.max_queue_packets,
                bottleneck = link.is_bottleneck(),
                "link"
            );
        }

        match self.emulator.ping_all() {
            Ok(loss) if loss > 0.0 => warn!(loss_pct = loss, "reachability check dropped packets"),
            Ok(_) => info!("all hosts reachable"),
            Err(e) => warn!(error = %e, "reachability check failed"),
        }

        for host in topology.hosts() {
            match self.emulator.host_ip(&host.name) {
                Some(ip) => info!(host = %host.name, %ip, "address"),
                None => warn!(host = %host.name, "no address"),
            }
            let sysctl = CommandSpec::new(self.tools.sysctl.as_str()).arg("-w").arg(format!(
                "net.ipv4.tcp_congestion_control={}",
                self.config.congestion_control
            ));
            match self.emulator.run(&host.name, &sysctl) {
                Ok(out) if out.success => {}
                Ok(out) => warn!(
                    host = %host.name,
                    stderr = %out.stderr.trim(),
                    "failed to set congestion control"
                ),
                Err(e) => warn!(host = %host.name, error = %e, "failed to set congestion control"),
            }
        }
    }

    /// Launches every auxiliary process in order and returns the kinds that
    /// did not come up.
    fn launch_all(&mut self, topology: &Topology) -> Vec<AuxKind> {
        let launcher = Launcher::new(&self.emulator, &self.config, &self.tools, topology);
        let table = &mut self.table;

        // sampler first so early queue build-up is recorded
        launched("queue sampler", launcher.queue_sampler(table));
        launched("bulk flow", launcher.bulk_flow(table));
        launched("latency probe", launcher.latency_probe(table));
        launched("content server", launcher.content_server(table));

        for kind in table.exited() {
            warn!(%kind, "exited right after launch");
        }

        let degraded: Vec<AuxKind> = AuxKind::ALL
            .into_iter()
            .filter(|kind| !table.contains(*kind))
            .collect();
        if !degraded.is_empty() {
            warn!(?degraded, "running without some instrumentation");
        }
        degraded
    }

    fn measure(&self) -> LatencySamples {
        let timing = &self.config.timing;
        let cmd = self
            .emulator
            .host_ip(HOST_A)
            .map(|ip| fetch_command(&self.tools, &content_url(ip, HTTP_PORT)));
        let emulator = &self.emulator;

        let fetch = || match &cmd {
            Some(cmd) => timed_fetch(emulator, HOST_B, cmd),
            None => Err(anyhow!("content server host has no address")),
        };
        let mut foreground = ForegroundLoop::new(fetch, self.config.duration, timing.fetch_interval);
        if let Some(flag) = &self.stop {
            foreground = foreground.with_stop_flag(flag.clone());
        }
        foreground.collect()
    }

    /// Best-effort teardown. Reaches [`Phase::Done`] whatever fails along
    /// the way, and stops the network at most once.
    pub fn teardown(&mut self) {
        if matches!(self.phase, Phase::Idle | Phase::Done) {
            return;
        }
        self.enter(Phase::TearingDown);
        let grace = self.config.timing.stop_grace;

        for mut sampler in self.table.take(AuxKind::QueueSampler) {
            sampler.stop(grace);
        }
        for mut process in self.table.drain() {
            process.stop(grace);
        }

        if self.network_up {
            self.network_up = false;
            if let Err(e) = self.emulator.stop() {
                warn!(error = %e, "network stop failed");
            }
        }

        for pattern in safety_net_patterns(&self.tools) {
            if let Err(e) = self.emulator.kill_matching(&pattern) {
                warn!(pattern, error = %e, "kill by pattern failed");
            }
        }

        self.enter(Phase::Done);
    }
}

impl<E: Emulator> Drop for Driver<E> {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn launched(what: &str, result: anyhow::Result<()>) {
    if let Err(e) = result {
        warn!(what, error = %format!("{e:#}"), "launch failed, continuing degraded");
    }
}

/// `pkill -f` patterns for processes that may outlive their handle: the
/// queue sampler, the content server, the latency prober and the bulk-flow
/// endpoints. Handles usually point at `sudo`, so killing the handle alone
/// can orphan the command it wraps.
///
/// The first character is bracketed so the pattern does not match the
/// `sudo pkill` command line carrying it.
pub fn safety_net_patterns(tools: &ToolsConfig) -> Vec<String> {
    [
        basename(&tools.qmon),
        tools.httpd_name(),
        format!("{} -c", basename(&tools.ping)),
        basename(&tools.iperf),
    ]
    .iter()
    .filter_map(|p| bracket_first(&escape_regex(p)))
    .collect()
}

fn basename(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

fn escape_regex(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if "\\.^$|?*+()[]{}".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn bracket_first(pattern: &str) -> Option<String> {
    let mut chars = pattern.chars();
    let first = chars.next()?;
    if first == '\\' {
        // escaped metacharacter; leave as is
        return Some(pattern.to_string());
    }
    Some(format!("[{first}]{}", chars.as_str()))
}
