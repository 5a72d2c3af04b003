//! Linux network-namespace emulator.
//!
//! One namespace per node, veth pairs for links, a bridge in every switch
//! namespace, and `tc` shaping on both ends of every link. Hosts get
//! `10.0.0.<n>/8` in declaration order.

use std::collections::HashMap;
use std::fs::File;
use std::net::Ipv4Addr;
use std::os::unix::process::CommandExt;
use std::process::Stdio;

use bloat_netsim::namespace::{delete_namespace, host_command, list_namespaces, Namespace};
use bloat_netsim::shaping::apply_shaping;
use tracing::{debug, info, warn};

use super::{CmdOutput, CommandSpec, Emulator, EmulatorError, Process};
use crate::tools::ToolsConfig;
use crate::topology::Topology;

/// Bridge created inside every switch namespace.
const BRIDGE: &str = "br0";

pub struct NetnsEmulator {
    tools: ToolsConfig,
    namespaces: HashMap<String, Namespace>,
    addresses: HashMap<String, Ipv4Addr>,
}

impl NetnsEmulator {
    pub fn new(tools: &ToolsConfig) -> Self {
        Self {
            tools: tools.clone(),
            namespaces: HashMap::new(),
            addresses: HashMap::new(),
        }
    }

    fn namespace(&self, node: &str) -> Result<&Namespace, EmulatorError> {
        if self.namespaces.is_empty() {
            return Err(EmulatorError::NotRunning);
        }
        self.namespaces
            .get(node)
            .ok_or_else(|| EmulatorError::UnknownNode(node.to_string()))
    }

    fn build(&mut self, topology: &Topology) -> std::io::Result<()> {
        let sudo = self.tools.use_sudo;

        for node in topology.nodes() {
            let ns = Namespace::new(&self.tools.namespace_for(&node.name), sudo)?;
            if let Some(cpu) = node.cpu {
                warn!(node = %node.name, cpu, "cpu limits are not enforced by the netns emulator");
            }
            self.namespaces.insert(node.name.clone(), ns);
        }

        for link in topology.links() {
            let a = &self.namespaces[&link.a];
            let b = &self.namespaces[&link.b];
            a.add_veth_pair(b, &link.a_iface, &link.b_iface)?;

            let shaping = link.params.shaping();
            apply_shaping(a, &link.a_iface, &shaping)?;
            apply_shaping(b, &link.b_iface, &shaping)?;
            debug!(a = %link.a_iface, b = %link.b_iface, ?shaping, "link up");
        }

        for switch in topology.switches() {
            let ports = topology.ifaces_of(&switch.name);
            self.namespaces[&switch.name].add_bridge(BRIDGE, &ports)?;
        }

        for (idx, host) in topology.hosts().enumerate() {
            let ip = Ipv4Addr::new(10, 0, 0, idx as u8 + 1);
            for iface in topology.ifaces_of(&host.name) {
                self.namespaces[&host.name].add_address(iface, &format!("{ip}/8"))?;
            }
            self.addresses.insert(host.name.clone(), ip);
        }

        Ok(())
    }
}

impl Emulator for NetnsEmulator {
    fn cleanup(&mut self) -> Result<(), EmulatorError> {
        self.namespaces.clear();
        self.addresses.clear();

        let sudo = self.tools.use_sudo;
        for name in list_namespaces(sudo)? {
            if name.starts_with(&self.tools.name_prefix) {
                info!(netns = %name, "removing stale namespace");
                if let Err(e) = delete_namespace(&name, sudo) {
                    warn!(netns = %name, error = %e, "failed to remove stale namespace");
                }
            }
        }
        Ok(())
    }

    fn start(&mut self, topology: &Topology) -> Result<(), EmulatorError> {
        if !self.namespaces.is_empty() {
            return Err(EmulatorError::Start("network already running".into()));
        }
        if let Err(e) = self.build(topology) {
            // dropping the namespaces deletes them
            self.namespaces.clear();
            self.addresses.clear();
            return Err(EmulatorError::Start(e.to_string()));
        }
        info!(nodes = self.namespaces.len(), "network started");
        Ok(())
    }

    fn stop(&mut self) -> Result<(), EmulatorError> {
        if self.namespaces.is_empty() {
            return Ok(());
        }
        let count = self.namespaces.len();
        self.namespaces.clear();
        self.addresses.clear();
        info!(nodes = count, "network stopped");
        Ok(())
    }

    fn host_ip(&self, node: &str) -> Option<Ipv4Addr> {
        self.addresses.get(node).copied()
    }

    fn ping_all(&self) -> Result<f64, EmulatorError> {
        let mut sent = 0u32;
        let mut lost = 0u32;
        let mut hosts: Vec<(&String, &Ipv4Addr)> = self.addresses.iter().collect();
        hosts.sort();

        for (src, _) in &hosts {
            for (dst, ip) in &hosts {
                if src == dst {
                    continue;
                }
                let cmd = CommandSpec::new(self.tools.ping.as_str())
                    .args(["-c", "1", "-W", "1"])
                    .arg(ip.to_string());
                sent += 1;
                let out = self.run(src, &cmd)?;
                if !out.success {
                    lost += 1;
                }
                info!(from = %src, to = %dst, reachable = out.success, "ping");
            }
        }

        if sent == 0 {
            return Ok(0.0);
        }
        Ok(f64::from(lost) * 100.0 / f64::from(sent))
    }

    fn run(&self, node: &str, cmd: &CommandSpec) -> Result<CmdOutput, EmulatorError> {
        let ns = self.namespace(node)?;
        let output = ns
            .command(&cmd.program)
            .args(&cmd.args)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| EmulatorError::Command {
                node: node.to_string(),
                program: cmd.program.clone(),
                source,
            })?;
        Ok(CmdOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn spawn(&self, node: &str, cmd: &CommandSpec) -> Result<Box<dyn Process>, EmulatorError> {
        let ns = self.namespace(node)?;
        let command_error = |source| EmulatorError::Command {
            node: node.to_string(),
            program: cmd.program.clone(),
            source,
        };

        let stdout = match &cmd.stdout {
            Some(path) => Stdio::from(File::create(path).map_err(command_error)?),
            None => Stdio::null(),
        };
        let child = ns
            .command(&cmd.program)
            .args(&cmd.args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(Stdio::null())
            // own process group: sudo relays SIGINT only from outside it
            .process_group(0)
            .spawn()
            .map_err(command_error)?;
        debug!(node, pid = child.id(), cmd = %cmd, "spawned");
        Ok(Box::new(child))
    }

    fn kill_matching(&self, pattern: &str) -> Result<(), EmulatorError> {
        let output = host_command("pkill", self.tools.use_sudo)
            .args(["-9", "-f", pattern])
            .output()?;
        // pkill exits 1 when nothing matched
        match output.status.code() {
            Some(0) => info!(pattern, "killed lingering processes"),
            Some(1) => debug!(pattern, "no lingering processes"),
            _ => warn!(
                pattern,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "pkill failed"
            ),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{build_dumbbell, DumbbellParams, HOST_A, HOST_B};
    use bloat_netsim::test_util::netns_sudo;

    #[test]
    fn commands_need_a_running_network() {
        let emu = NetnsEmulator::new(&ToolsConfig::default());
        let err = emu.run(HOST_A, &CommandSpec::new("true")).unwrap_err();
        assert!(matches!(err, EmulatorError::NotRunning));
        assert!(emu.host_ip(HOST_A).is_none());
    }

    #[test]
    fn stop_without_start_is_a_no_op() {
        let mut emu = NetnsEmulator::new(&ToolsConfig::default());
        emu.stop().unwrap();
        emu.stop().unwrap();
    }

    #[test]
    fn dumbbell_comes_up_and_down() {
        let Some(sudo) = netns_sudo() else {
            eprintln!("Skipping test, insufficient privileges or missing tools");
            return;
        };

        let tools = ToolsConfig {
            use_sudo: sudo,
            name_prefix: format!("bbt{}-", std::process::id() % 1000),
            ..ToolsConfig::default()
        };
        let topo = build_dumbbell(&DumbbellParams {
            cpu: None,
            host_bandwidth_mbit: 1000.0,
            bottleneck_bandwidth_mbit: 10.0,
            delay_ms: 1.0,
            max_queue_packets: 50,
        })
        .unwrap();

        let mut emu = NetnsEmulator::new(&tools);
        emu.cleanup().unwrap();
        emu.start(&topo).expect("network start");
        assert_eq!(emu.host_ip(HOST_A), Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(emu.host_ip(HOST_B), Some(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(emu.ping_all().unwrap(), 0.0);
        emu.stop().unwrap();
        assert!(emu.host_ip(HOST_A).is_none());
    }
}
