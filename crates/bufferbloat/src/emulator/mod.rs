//! The network emulation engine seen by the driver.
//!
//! [`Emulator`] is the narrow surface the experiment needs: reset, start and
//! stop a topology, resolve host addresses, and run commands on virtual
//! hosts either to completion or in the background. [`netns::NetnsEmulator`]
//! implements it with Linux network namespaces.

pub mod netns;

use std::fmt;
use std::io;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::Child;

use thiserror::Error;

use crate::topology::Topology;

pub use netns::NetnsEmulator;

#[derive(Debug, Error)]
pub enum EmulatorError {
    #[error("network start failed: {0}")]
    Start(String),
    #[error("network is not running")]
    NotRunning,
    #[error("unknown node {0}")]
    UnknownNode(String),
    #[error("failed to run {program} on {node}: {source}")]
    Command {
        node: String,
        program: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A command to run on a virtual host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Redirect stdout to this file (created or truncated). Background
    /// processes discard stdout otherwise.
    pub stdout: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdout_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout = Some(path.into());
        self
    }

    /// The full command line, space separated.
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command_line())?;
        if let Some(path) = &self.stdout {
            write!(f, " > {}", path.display())?;
        }
        Ok(())
    }
}

/// Captured result of a command run to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// A background process started on a virtual host.
pub trait Process {
    fn id(&self) -> Option<u32>;

    /// Whether the process has exited (reaping it if so).
    fn has_exited(&mut self) -> io::Result<bool>;

    /// Asks the process to stop (SIGINT).
    fn interrupt(&mut self) -> io::Result<()>;

    /// Forcibly stops and reaps the process.
    fn kill(&mut self) -> io::Result<()>;
}

impl Process for Child {
    fn id(&self) -> Option<u32> {
        Some(Child::id(self))
    }

    fn has_exited(&mut self) -> io::Result<bool> {
        Ok(self.try_wait()?.is_some())
    }

    fn interrupt(&mut self) -> io::Result<()> {
        let pid = Child::id(self) as libc::pid_t;
        // SAFETY: `pid` is our own child, not yet reaped (we hold the
        // `Child`), so it cannot have been recycled for another process.
        let rc = unsafe { libc::kill(pid, libc::SIGINT) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn kill(&mut self) -> io::Result<()> {
        Child::kill(self)?;
        self.wait()?;
        Ok(())
    }
}

/// The emulation engine.
pub trait Emulator {
    /// Removes anything a previous run may have left behind.
    fn cleanup(&mut self) -> Result<(), EmulatorError>;

    /// Instantiates `topology`: nodes, links, addresses and shaping.
    fn start(&mut self, topology: &Topology) -> Result<(), EmulatorError>;

    /// Tears down every node and link created by [`Emulator::start`].
    fn stop(&mut self) -> Result<(), EmulatorError>;

    fn host_ip(&self, node: &str) -> Option<Ipv4Addr>;

    /// All-pairs reachability test between hosts. Returns the percentage of
    /// probes that got no reply.
    fn ping_all(&self) -> Result<f64, EmulatorError>;

    /// Runs a command on `node` and waits for it.
    fn run(&self, node: &str, cmd: &CommandSpec) -> Result<CmdOutput, EmulatorError>;

    /// Starts a command on `node` in the background.
    fn spawn(&self, node: &str, cmd: &CommandSpec) -> Result<Box<dyn Process>, EmulatorError>;

    /// Force-kills every host process whose command line matches `pattern`
    /// (an extended regular expression).
    fn kill_matching(&self, pattern: &str) -> Result<(), EmulatorError>;
}
