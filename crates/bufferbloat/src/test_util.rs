//! Recording stubs for exercising the driver without namespaces.
//!
//! [`StubEmulator`] answers the commands the experiment issues (`curl`,
//! `ss`, `sysctl`, ...) from canned values and records every call, with a
//! timestamp, into a shared [`EventLog`].

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::Ipv4Addr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::emulator::{CmdOutput, CommandSpec, Emulator, EmulatorError, Process};
use crate::topology::Topology;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Cleanup,
    Start,
    Stop,
    Spawn { node: String, program: String },
    Run { node: String, program: String },
    KillMatching { pattern: String },
    Interrupt { process: String },
    Kill { process: String },
}

/// Shared, timestamped call log.
#[derive(Debug, Clone, Default)]
pub struct EventLog(Rc<RefCell<Vec<(Instant, Event)>>>);

impl EventLog {
    pub fn push(&self, event: Event) {
        self.0.borrow_mut().push((Instant::now(), event));
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.borrow().iter().map(|(_, e)| e.clone()).collect()
    }

    pub fn count(&self, event: &Event) -> usize {
        self.0.borrow().iter().filter(|(_, e)| e == event).count()
    }

    /// Position in the log of the first spawn whose program ends with `suffix`.
    pub fn spawn_index(&self, suffix: &str) -> Option<usize> {
        self.0.borrow().iter().position(|(_, e)| {
            matches!(e, Event::Spawn { program, .. } if program.ends_with(suffix))
        })
    }

    /// Time of the first spawn whose program ends with `suffix` and whose
    /// node is `node`.
    pub fn spawn_time(&self, node: &str, suffix: &str) -> Option<Instant> {
        self.0.borrow().iter().find_map(|(at, e)| match e {
            Event::Spawn { node: n, program } if n == node && program.ends_with(suffix) => {
                Some(*at)
            }
            _ => None,
        })
    }

    /// Signals delivered to the stub process named `process`.
    pub fn process_events(&self, process: &str) -> Vec<&'static str> {
        self.0
            .borrow()
            .iter()
            .filter_map(|(_, e)| match e {
                Event::Interrupt { process: p } if p == process => Some("interrupt"),
                Event::Kill { process: p } if p == process => Some("kill"),
                _ => None,
            })
            .collect()
    }
}

/// A fake background process.
pub struct StubProcess {
    name: String,
    log: EventLog,
    exits_on_interrupt: bool,
    exited: bool,
}

impl StubProcess {
    pub fn new(name: impl Into<String>, log: EventLog, exits_on_interrupt: bool) -> Self {
        Self {
            name: name.into(),
            log,
            exits_on_interrupt,
            exited: false,
        }
    }
}

impl Process for StubProcess {
    fn id(&self) -> Option<u32> {
        None
    }

    fn has_exited(&mut self) -> io::Result<bool> {
        Ok(self.exited)
    }

    fn interrupt(&mut self) -> io::Result<()> {
        self.log.push(Event::Interrupt {
            process: self.name.clone(),
        });
        if self.exits_on_interrupt {
            self.exited = true;
        }
        Ok(())
    }

    fn kill(&mut self) -> io::Result<()> {
        self.log.push(Event::Kill {
            process: self.name.clone(),
        });
        self.exited = true;
        Ok(())
    }
}

/// Emulator stand-in with injectable failures.
pub struct StubEmulator {
    pub log: EventLog,
    /// Number of upcoming `start` calls that fail.
    pub start_failures: u32,
    pub stop_fails: bool,
    /// Spawns of programs ending with any of these suffixes fail.
    pub failing_spawns: Vec<String>,
    /// Whether spawned stub processes honour SIGINT.
    pub processes_exit_on_interrupt: bool,
    /// Successive `curl` outcomes; once drained every fetch takes
    /// `default_fetch_secs`.
    pub fetch_results: RefCell<VecDeque<Result<f64, String>>>,
    pub default_fetch_secs: f64,
    /// Whether `ss` reports a listener.
    pub listening: bool,
    running: bool,
    addresses: HashMap<String, Ipv4Addr>,
}

impl Default for StubEmulator {
    fn default() -> Self {
        Self {
            log: EventLog::default(),
            start_failures: 0,
            stop_fails: false,
            failing_spawns: Vec::new(),
            processes_exit_on_interrupt: true,
            fetch_results: RefCell::new(VecDeque::new()),
            default_fetch_secs: 0.25,
            listening: true,
            running: false,
            addresses: HashMap::new(),
        }
    }
}

impl StubEmulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    fn next_fetch(&self) -> CmdOutput {
        let result = self
            .fetch_results
            .borrow_mut()
            .pop_front()
            .unwrap_or(Ok(self.default_fetch_secs));
        match result {
            Ok(secs) => CmdOutput {
                success: true,
                stdout: format!("{secs:.6}"),
                stderr: String::new(),
            },
            Err(msg) => CmdOutput {
                success: false,
                stdout: "0.000000".into(),
                stderr: msg,
            },
        }
    }

    /// Plays the part of the collaborators that write artifacts: the queue
    /// sampler's `--out` file and a redirected stdout.
    fn write_artifacts(cmd: &CommandSpec) {
        if let Some(pos) = cmd.args.iter().position(|a| a == "--out") {
            if let Some(path) = cmd.args.get(pos + 1) {
                let _ = std::fs::write(path, "1700000000.000000,0\n1700000000.100000,3\n");
            }
        }
        if let Some(path) = &cmd.stdout {
            let _ = std::fs::write(path, "PING 10.0.0.2 (10.0.0.2) 56(84) bytes of data.\n");
        }
    }
}

impl Emulator for StubEmulator {
    fn cleanup(&mut self) -> Result<(), EmulatorError> {
        self.log.push(Event::Cleanup);
        self.running = false;
        self.addresses.clear();
        Ok(())
    }

    fn start(&mut self, topology: &Topology) -> Result<(), EmulatorError> {
        self.log.push(Event::Start);
        if self.start_failures > 0 {
            self.start_failures -= 1;
            return Err(EmulatorError::Start("stale virtual interfaces".into()));
        }
        for (idx, host) in topology.hosts().enumerate() {
            self.addresses
                .insert(host.name.clone(), Ipv4Addr::new(10, 0, 0, idx as u8 + 1));
        }
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), EmulatorError> {
        self.log.push(Event::Stop);
        self.running = false;
        self.addresses.clear();
        if self.stop_fails {
            return Err(EmulatorError::Io(io::Error::other("namespace busy")));
        }
        Ok(())
    }

    fn host_ip(&self, node: &str) -> Option<Ipv4Addr> {
        self.addresses.get(node).copied()
    }

    fn ping_all(&self) -> Result<f64, EmulatorError> {
        if !self.running {
            return Err(EmulatorError::NotRunning);
        }
        Ok(0.0)
    }

    fn run(&self, node: &str, cmd: &CommandSpec) -> Result<CmdOutput, EmulatorError> {
        if !self.running {
            return Err(EmulatorError::NotRunning);
        }
        self.log.push(Event::Run {
            node: node.to_string(),
            program: cmd.program.clone(),
        });

        if cmd.program.ends_with("curl") {
            return Ok(self.next_fetch());
        }
        if cmd.program.ends_with("ss") {
            let stdout = if self.listening {
                "LISTEN 0      128          0.0.0.0:80        0.0.0.0:*\n".to_string()
            } else {
                String::new()
            };
            return Ok(CmdOutput {
                success: true,
                stdout,
                stderr: String::new(),
            });
        }
        Ok(CmdOutput {
            success: true,
            ..Default::default()
        })
    }

    fn spawn(&self, node: &str, cmd: &CommandSpec) -> Result<Box<dyn Process>, EmulatorError> {
        if !self.running {
            return Err(EmulatorError::NotRunning);
        }
        self.log.push(Event::Spawn {
            node: node.to_string(),
            program: cmd.program.clone(),
        });
        if self
            .failing_spawns
            .iter()
            .any(|suffix| cmd.program.ends_with(suffix.as_str()))
        {
            return Err(EmulatorError::Command {
                node: node.to_string(),
                program: cmd.program.clone(),
                source: io::Error::new(io::ErrorKind::NotFound, "no such binary"),
            });
        }
        Self::write_artifacts(cmd);
        // keep spawn timestamps strictly ordered
        std::thread::sleep(Duration::from_millis(1));
        Ok(Box::new(StubProcess::new(
            cmd.command_line(),
            self.log.clone(),
            self.processes_exit_on_interrupt,
        )))
    }

    fn kill_matching(&self, pattern: &str) -> Result<(), EmulatorError> {
        self.log.push(Event::KillMatching {
            pattern: pattern.to_string(),
        });
        Ok(())
    }
}
