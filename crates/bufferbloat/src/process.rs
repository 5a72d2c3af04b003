//! Handle table for the auxiliary processes of one run.

use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::emulator::Process;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuxKind {
    QueueSampler,
    BulkFlowServer,
    BulkFlowClient,
    LatencyProbe,
    ContentServer,
}

impl AuxKind {
    /// Every kind, in launch order.
    pub const ALL: [AuxKind; 5] = [
        AuxKind::QueueSampler,
        AuxKind::BulkFlowServer,
        AuxKind::BulkFlowClient,
        AuxKind::LatencyProbe,
        AuxKind::ContentServer,
    ];
}

impl fmt::Display for AuxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AuxKind::QueueSampler => "queue-sampler",
            AuxKind::BulkFlowServer => "bulk-flow-server",
            AuxKind::BulkFlowClient => "bulk-flow-client",
            AuxKind::LatencyProbe => "latency-probe",
            AuxKind::ContentServer => "content-server",
        })
    }
}

pub struct AuxProcess {
    pub kind: AuxKind,
    pub host: String,
    /// Command line as launched; doubles as the kill pattern at teardown.
    pub command_line: String,
    pub process: Box<dyn Process>,
    pub started_at: Instant,
}

impl fmt::Debug for AuxProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuxProcess")
            .field("kind", &self.kind)
            .field("host", &self.host)
            .field("pid", &self.process.id())
            .field("command_line", &self.command_line)
            .finish()
    }
}

impl AuxProcess {
    /// SIGINT, then wait up to `grace` for the process to exit, then SIGKILL.
    pub fn stop(&mut self, grace: Duration) {
        match self.process.has_exited() {
            Ok(true) => {
                info!(kind = %self.kind, host = %self.host, "already exited");
                return;
            }
            Ok(false) => {}
            Err(e) => warn!(kind = %self.kind, error = %e, "error checking process status"),
        }

        if let Err(e) = self.process.interrupt() {
            warn!(kind = %self.kind, error = %e, "failed to interrupt");
        } else if wait_for_exit(self.process.as_mut(), grace) {
            info!(kind = %self.kind, host = %self.host, "exited cleanly");
            return;
        }

        warn!(kind = %self.kind, host = %self.host, "didn't exit cleanly, killing");
        if let Err(e) = self.process.kill() {
            warn!(kind = %self.kind, error = %e, "kill failed");
        }
    }
}

fn wait_for_exit(process: &mut dyn Process, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        match process.has_exited() {
            Ok(true) => return true,
            Ok(false) => {}
            Err(_) => return false,
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(50));
    }
}

/// Every auxiliary process launched during a run, in launch order.
#[derive(Debug, Default)]
pub struct ProcessTable {
    entries: Vec<AuxProcess>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, process: AuxProcess) {
        info!(
            kind = %process.kind,
            host = %process.host,
            pid = ?process.process.id(),
            "launched"
        );
        self.entries.push(process);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AuxProcess> {
        self.entries.iter()
    }

    pub fn contains(&self, kind: AuxKind) -> bool {
        self.entries.iter().any(|p| p.kind == kind)
    }

    pub fn started_at(&self, kind: AuxKind) -> Option<Instant> {
        self.entries
            .iter()
            .find(|p| p.kind == kind)
            .map(|p| p.started_at)
    }

    /// Kinds whose process has already exited.
    pub fn exited(&mut self) -> Vec<AuxKind> {
        self.entries
            .iter_mut()
            .filter_map(|p| matches!(p.process.has_exited(), Ok(true)).then_some(p.kind))
            .collect()
    }

    /// Removes and returns every entry of `kind`.
    pub fn take(&mut self, kind: AuxKind) -> Vec<AuxProcess> {
        let (taken, kept) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|p| p.kind == kind);
        self.entries = kept;
        taken
    }

    /// Removes and returns every remaining entry.
    pub fn drain(&mut self) -> Vec<AuxProcess> {
        std::mem::take(&mut self.entries)
    }
}
