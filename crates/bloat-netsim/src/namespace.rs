use std::io;
use std::process::{Command, Output};

use tracing::debug;

/// Builds a host-level command, optionally wrapped in `sudo`.
pub fn host_command(program: &str, sudo: bool) -> Command {
    if sudo {
        let mut cmd = Command::new("sudo");
        cmd.arg(program);
        cmd
    } else {
        Command::new(program)
    }
}

/// Turns a failed command into an `io::Error` carrying its stderr.
fn check(output: Output, what: &str) -> io::Result<()> {
    if output.status.success() {
        return Ok(());
    }
    Err(io::Error::other(format!(
        "Failed to {}: {}",
        what,
        String::from_utf8_lossy(&output.stderr).trim()
    )))
}

/// Lists the names of all namespaces known to `ip netns`.
///
/// Output lines look like `bb-h1 (id: 3)`; only the name is kept.
pub fn list_namespaces(sudo: bool) -> io::Result<Vec<String>> {
    let output = host_command("ip", sudo).args(["netns", "list"]).output()?;
    if !output.status.success() {
        return Err(io::Error::other(format!(
            "Failed to list netns: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(parse_netns_list(&String::from_utf8_lossy(&output.stdout)))
}

fn parse_netns_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

/// Deletes a namespace by name without owning it.
pub fn delete_namespace(name: &str, sudo: bool) -> io::Result<()> {
    let output = host_command("ip", sudo)
        .args(["netns", "del", name])
        .output()?;
    check(output, &format!("delete netns {name}"))
}

/// A Linux network namespace managed via `ip netns`.
///
/// Creates the namespace on construction, initializes loopback, and
/// deletes the namespace on drop. Supports executing commands inside
/// the namespace, veth links to other namespaces, and bridges.
#[derive(Debug)]
pub struct Namespace {
    pub name: String,
    sudo: bool,
}

impl Namespace {
    pub fn new(name: &str, sudo: bool) -> io::Result<Self> {
        // stale namespace from an earlier run
        let _ = host_command("ip", sudo).args(["netns", "del", name]).output();

        let output = host_command("ip", sudo)
            .args(["netns", "add", name])
            .output()?;
        check(output, &format!("create netns {name}"))?;

        let ns = Self {
            name: name.to_string(),
            sudo,
        };
        let _ = ns.exec("ip", &["link", "set", "lo", "up"]);
        debug!(netns = %ns.name, "namespace created");
        Ok(ns)
    }

    /// A command that runs `program` inside this namespace.
    pub fn command(&self, program: &str) -> Command {
        let mut cmd = host_command("ip", self.sudo);
        cmd.args(["netns", "exec", &self.name, program]);
        cmd
    }

    pub fn exec(&self, program: &str, args: &[&str]) -> io::Result<Output> {
        self.command(program).args(args).output()
    }

    fn exec_checked(&self, args: &[&str], what: &str) -> io::Result<()> {
        let output = self.exec("ip", args)?;
        check(output, what)
    }

    /// Creates a veth pair with `local` in this namespace and `peer` in
    /// `other`, and brings both ends up. No addresses are assigned.
    pub fn add_veth_pair(&self, other: &Namespace, local: &str, peer: &str) -> io::Result<()> {
        // leftovers in the host namespace
        let _ = host_command("ip", self.sudo)
            .args(["link", "del", local])
            .output();

        let output = host_command("ip", self.sudo)
            .args(["link", "add", local, "type", "veth", "peer", "name", peer])
            .output()?;
        check(output, &format!("create veth pair {local}/{peer}"))?;

        let output = host_command("ip", self.sudo)
            .args(["link", "set", local, "netns", &self.name])
            .output()?;
        check(output, &format!("move {local} into {}", self.name))?;

        let output = host_command("ip", self.sudo)
            .args(["link", "set", peer, "netns", &other.name])
            .output()?;
        check(output, &format!("move {peer} into {}", other.name))?;

        self.exec_checked(&["link", "set", local, "up"], &format!("set {local} up"))?;
        other.exec_checked(&["link", "set", peer, "up"], &format!("set {peer} up"))?;
        Ok(())
    }

    /// Assigns an address in CIDR notation (`10.0.0.1/8`) to an interface.
    pub fn add_address(&self, interface: &str, cidr: &str) -> io::Result<()> {
        self.exec_checked(
            &["addr", "add", cidr, "dev", interface],
            &format!("assign {cidr} to {interface}"),
        )
    }

    /// Creates a Linux bridge and enslaves `ports` to it.
    pub fn add_bridge(&self, bridge: &str, ports: &[&str]) -> io::Result<()> {
        self.exec_checked(
            &["link", "add", bridge, "type", "bridge"],
            &format!("create bridge {bridge}"),
        )?;
        for port in ports {
            self.exec_checked(
                &["link", "set", port, "master", bridge],
                &format!("attach {port} to {bridge}"),
            )?;
        }
        self.exec_checked(&["link", "set", bridge, "up"], &format!("set {bridge} up"))
    }
}

impl Drop for Namespace {
    fn drop(&mut self) {
        let _ = host_command("ip", self.sudo)
            .args(["netns", "del", &self.name])
            .status();
        debug!(netns = %self.name, "namespace deleted");
    }
}
