//! Launchers for the auxiliary processes.
//!
//! Each launcher starts one role on its virtual host and records the handle
//! in the driver's [`ProcessTable`]. Servers are polled for a listening
//! socket before anything that depends on them is started.

use std::net::Ipv4Addr;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use tracing::{info, warn};

use crate::config::ExperimentConfig;
use crate::emulator::{CommandSpec, Emulator};
use crate::process::{AuxKind, AuxProcess, ProcessTable};
use crate::tools::ToolsConfig;
use crate::topology::{Topology, HOST_A, HOST_B, SWITCH};

/// Bulk-flow server port (iperf default).
pub const BULK_PORT: u16 = 5001;
/// Content server port.
pub const HTTP_PORT: u16 = 80;
/// Bulk-flow client lifetime; far longer than any run, it is stopped at
/// teardown.
pub const BULK_CLIENT_SECS: u32 = 3600;

const READINESS_POLL: Duration = Duration::from_millis(100);

/// URL of the content server's index page.
pub fn content_url(ip: Ipv4Addr, port: u16) -> String {
    if port == 80 {
        format!("http://{ip}/")
    } else {
        format!("http://{ip}:{port}/")
    }
}

pub struct Launcher<'a, E: Emulator + ?Sized> {
    emulator: &'a E,
    config: &'a ExperimentConfig,
    tools: &'a ToolsConfig,
    topology: &'a Topology,
}

impl<'a, E: Emulator + ?Sized> Launcher<'a, E> {
    pub fn new(
        emulator: &'a E,
        config: &'a ExperimentConfig,
        tools: &'a ToolsConfig,
        topology: &'a Topology,
    ) -> Self {
        Self {
            emulator,
            config,
            tools,
            topology,
        }
    }

    fn ip(&self, node: &str) -> anyhow::Result<Ipv4Addr> {
        self.emulator
            .host_ip(node)
            .ok_or_else(|| anyhow!("no address for {node}"))
    }

    fn spawn(
        &self,
        table: &mut ProcessTable,
        kind: AuxKind,
        node: &str,
        cmd: CommandSpec,
    ) -> anyhow::Result<()> {
        info!(%kind, node, cmd = %cmd, "starting");
        let process = self
            .emulator
            .spawn(node, &cmd)
            .with_context(|| format!("failed to start {kind} on {node}"))?;
        table.push(AuxProcess {
            kind,
            host: node.to_string(),
            command_line: cmd.command_line(),
            process,
            started_at: Instant::now(),
        });
        Ok(())
    }

    /// Samples the bottleneck queue from inside the switch.
    pub fn queue_sampler(&self, table: &mut ProcessTable) -> anyhow::Result<()> {
        let out = self.config.queue_file();
        let cmd = CommandSpec::new(self.tools.qmon.as_str())
            .arg("--iface")
            .arg(self.topology.bottleneck_iface())
            .arg("--interval-ms")
            .arg(self.config.timing.sample_interval.as_millis().to_string())
            .arg("--out")
            .arg(out.to_string_lossy());
        self.spawn(table, AuxKind::QueueSampler, SWITCH, cmd)
    }

    /// Starts the bulk-flow server on `h2`, waits for it to listen, then the
    /// long-lived client on `h1`.
    pub fn bulk_flow(&self, table: &mut ProcessTable) -> anyhow::Result<()> {
        let buffer = self.config.socket_buffer.as_str();
        let server = CommandSpec::new(self.tools.iperf.as_str()).args(["-s", "-w", buffer]);
        self.spawn(table, AuxKind::BulkFlowServer, HOST_B, server)?;
        self.wait_for_listener(HOST_B, BULK_PORT);

        let client = CommandSpec::new(self.tools.iperf.as_str())
            .arg("-c")
            .arg(self.ip(HOST_B)?.to_string())
            .arg("-p")
            .arg(BULK_PORT.to_string())
            .arg("-t")
            .arg(BULK_CLIENT_SECS.to_string())
            .args(["-i", "1", "-w", buffer])
            .args(["-Z", self.config.congestion_control.as_str()]);
        self.spawn(table, AuxKind::BulkFlowClient, HOST_A, client)
    }

    /// Pings `h2` from `h1` for the whole window, raw output to `ping.txt`.
    pub fn latency_probe(&self, table: &mut ProcessTable) -> anyhow::Result<()> {
        let cmd = CommandSpec::new(self.tools.ping.as_str())
            .arg("-c")
            .arg(self.config.probe_count().to_string())
            .arg("-i")
            .arg(self.config.timing.probe_interval.as_secs_f64().to_string())
            .arg(self.ip(HOST_B)?.to_string())
            .stdout_to(self.config.ping_file());
        self.spawn(table, AuxKind::LatencyProbe, HOST_A, cmd)
    }

    /// Serves the static root from `h1` and waits for it to listen.
    pub fn content_server(&self, table: &mut ProcessTable) -> anyhow::Result<()> {
        // the server runs under `ip netns exec`, possibly via sudo, so hand it
        // an absolute path
        let root = self.config.http_root.canonicalize().with_context(|| {
            format!(
                "content root {} is not accessible",
                self.config.http_root.display()
            )
        })?;
        let cmd = CommandSpec::new(self.tools.httpd.as_str())
            .arg("--port")
            .arg(HTTP_PORT.to_string())
            .arg("--root")
            .arg(root.to_string_lossy());
        self.spawn(table, AuxKind::ContentServer, HOST_A, cmd)?;
        self.wait_for_listener(HOST_A, HTTP_PORT);
        Ok(())
    }

    /// Polls `ss` on `node` until something listens on TCP `port`.
    ///
    /// Gives up after the readiness budget, pauses for the settle delay and
    /// returns `false`; the caller carries on regardless.
    pub fn wait_for_listener(&self, node: &str, port: u16) -> bool {
        let timing = &self.config.timing;
        let cmd = CommandSpec::new(self.tools.ss.as_str()).arg("-Hltn")
            .arg(format!("sport = :{port}"));
        let deadline = Instant::now() + timing.readiness_timeout;

        loop {
            match self.emulator.run(node, &cmd) {
                Ok(out) if out.success && !out.stdout.trim().is_empty() => {
                    info!(node, port, "listener ready");
                    return true;
                }
                Ok(_) => {}
                Err(e) => warn!(node, port, error = %e, "readiness probe failed"),
            }
            if Instant::now() >= deadline {
                break;
            }
            thread::sleep(READINESS_POLL);
        }

        warn!(node, port, settle = ?timing.settle, "no listener before deadline, settling instead");
        thread::sleep(timing.settle);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timing;
    use crate::test_util::{Event, StubEmulator};
    use crate::topology::{build_dumbbell, DumbbellParams};

    fn setup() -> (StubEmulator, ExperimentConfig, ToolsConfig, Topology) {
        let mut config = ExperimentConfig::new(1.5, 10.0, std::env::temp_dir());
        config.duration = Duration::from_secs(15);
        config.http_root = std::env::temp_dir();
        config.timing = Timing {
            readiness_timeout: Duration::from_millis(200),
            settle: Duration::from_millis(10),
            ..Timing::default()
        };
        let topo = build_dumbbell(&DumbbellParams {
            cpu: None,
            host_bandwidth_mbit: 1000.0,
            bottleneck_bandwidth_mbit: 1.5,
            delay_ms: 10.0,
            max_queue_packets: 20,
        })
        .unwrap();
        let mut emu = StubEmulator::new();
        emu.start(&topo).unwrap();
        (emu, config, ToolsConfig::default(), topo)
    }

    #[test]
    fn content_url_omits_default_port() {
        let ip = Ipv4Addr::new(10, 0, 0, 1);
        assert_eq!(content_url(ip, 80), "http://10.0.0.1/");
        assert_eq!(content_url(ip, 8080), "http://10.0.0.1:8080/");
    }

    #[test]
    fn queue_sampler_watches_the_switch_side_of_the_bottleneck() {
        let (emu, config, tools, topo) = setup();
        let mut table = ProcessTable::new();
        Launcher::new(&emu, &config, &tools, &topo)
            .queue_sampler(&mut table)
            .unwrap();

        let entry = table.iter().next().unwrap();
        assert_eq!(entry.kind, AuxKind::QueueSampler);
        assert_eq!(entry.host, SWITCH);
        assert!(entry.command_line.contains("--iface s0-eth2"));
        assert!(entry.command_line.contains("--interval-ms 100"));
        assert!(entry.command_line.ends_with("q.txt"));
    }

    #[test]
    fn bulk_flow_starts_server_before_client() {
        let (emu, config, tools, topo) = setup();
        let mut table = ProcessTable::new();
        Launcher::new(&emu, &config, &tools, &topo)
            .bulk_flow(&mut table)
            .unwrap();

        let entries: Vec<_> = table.iter().collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, AuxKind::BulkFlowServer);
        assert_eq!(entries[0].host, HOST_B);
        assert_eq!(entries[0].command_line, "iperf -s -w 16m");
        assert_eq!(entries[1].kind, AuxKind::BulkFlowClient);
        assert_eq!(entries[1].host, HOST_A);
        assert_eq!(
            entries[1].command_line,
            "iperf -c 10.0.0.2 -p 5001 -t 3600 -i 1 -w 16m -Z reno"
        );

        // readiness probe ran between the two spawns
        let events = emu.log.events();
        let probe = events
            .iter()
            .position(|e| matches!(e, Event::Run { program, .. } if program == "ss"))
            .unwrap();
        assert!(emu.log.spawn_index("iperf").unwrap() < probe);
    }

    #[test]
    fn latency_probe_spans_the_window() {
        let (emu, config, tools, topo) = setup();
        let mut table = ProcessTable::new();
        Launcher::new(&emu, &config, &tools, &topo)
            .latency_probe(&mut table)
            .unwrap();
        let entry = table.iter().next().unwrap();
        assert_eq!(entry.command_line, "ping -c 150 -i 0.1 10.0.0.2");
        assert_eq!(entry.host, HOST_A);
    }

    #[test]
    fn content_server_gets_an_absolute_root() {
        let (emu, config, tools, topo) = setup();
        let mut table = ProcessTable::new();
        Launcher::new(&emu, &config, &tools, &topo)
            .content_server(&mut table)
            .unwrap();
        let entry = table.iter().next().unwrap();
        assert_eq!(entry.kind, AuxKind::ContentServer);
        assert!(entry.command_line.contains("--port 80 --root /"));
    }

    #[test]
    fn missing_content_root_is_a_launch_error() {
        let (emu, mut config, tools, topo) = setup();
        config.http_root = "/nonexistent/bufferbloat/http".into();
        let mut table = ProcessTable::new();
        let err = Launcher::new(&emu, &config, &tools, &topo)
            .content_server(&mut table)
            .unwrap_err();
        assert!(err.to_string().contains("not accessible"));
        assert!(table.is_empty());
    }

    #[test]
    fn readiness_gives_up_after_the_budget() {
        let (mut emu, config, tools, topo) = setup();
        emu.listening = false;
        let started = Instant::now();
        let ready = Launcher::new(&emu, &config, &tools, &topo).wait_for_listener(HOST_A, 80);
        assert!(!ready);
        assert!(started.elapsed() >= Duration::from_millis(200));
    }
}
