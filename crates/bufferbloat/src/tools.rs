//! External tool configuration.
//!
//! Which binaries implement each auxiliary role, and how the emulator gains
//! privileges. Loaded from an optional TOML file; every field has a default.
//!
//! ```toml
//! use_sudo = false
//! name_prefix = "bb-"
//!
//! [binaries]
//! iperf = "/usr/bin/iperf"
//! qmon = "/opt/bufferbloat/bloat-qmon"
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

/// Overrides the path of the queue sampler binary.
pub const QMON_BIN_ENV: &str = "BLOAT_QMON_BIN";
/// Overrides the path of the content server binary.
pub const HTTPD_BIN_ENV: &str = "BLOAT_HTTPD_BIN";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ToolsConfigInput {
    pub use_sudo: Option<bool>,
    pub name_prefix: Option<String>,
    pub binaries: BinariesInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BinariesInput {
    pub iperf: Option<String>,
    pub ping: Option<String>,
    pub curl: Option<String>,
    pub ss: Option<String>,
    pub sysctl: Option<String>,
    pub qmon: Option<String>,
    pub httpd: Option<String>,
}

/// Resolved tool configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolsConfig {
    /// Prefix privileged commands with `sudo`.
    pub use_sudo: bool,
    /// Prefix for namespace names, so cleanup only touches our own.
    pub name_prefix: String,
    pub iperf: String,
    pub ping: String,
    pub curl: String,
    pub ss: String,
    pub sysctl: String,
    pub qmon: String,
    pub httpd: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        ToolsConfigInput::default().resolve()
    }
}

impl ToolsConfigInput {
    pub fn resolve(self) -> ToolsConfig {
        let b = self.binaries;
        let prefix = self
            .name_prefix
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "bb-".to_string());

        ToolsConfig {
            use_sudo: self.use_sudo.unwrap_or(true),
            name_prefix: prefix,
            iperf: non_empty(b.iperf).unwrap_or_else(|| "iperf".into()),
            ping: non_empty(b.ping).unwrap_or_else(|| "ping".into()),
            curl: non_empty(b.curl).unwrap_or_else(|| "curl".into()),
            ss: non_empty(b.ss).unwrap_or_else(|| "ss".into()),
            sysctl: non_empty(b.sysctl).unwrap_or_else(|| "sysctl".into()),
            qmon: non_empty(b.qmon).unwrap_or_else(|| companion_binary(QMON_BIN_ENV, "bloat-qmon")),
            httpd: non_empty(b.httpd)
                .unwrap_or_else(|| companion_binary(HTTPD_BIN_ENV, "bloat-httpd")),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Locates one of the binaries shipped with this crate: the environment
/// override if set, otherwise a sibling of the running executable, otherwise
/// the bare name for `$PATH` lookup.
///
/// Commands run through `sudo ip netns exec`, where `$PATH` is often reset,
/// so an absolute path is preferred.
fn companion_binary(env: &str, name: &str) -> String {
    if let Ok(path) = std::env::var(env) {
        if !path.trim().is_empty() {
            return path;
        }
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(name)))
        .filter(|candidate| candidate.exists())
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string())
}

impl ToolsConfig {
    pub fn from_toml_str(toml_str: &str) -> anyhow::Result<Self> {
        let input: ToolsConfigInput =
            toml::from_str(toml_str).context("invalid tool configuration")?;
        Ok(input.resolve())
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read tool configuration {}", path.display()))?;
        Self::from_toml_str(&text)
            .with_context(|| format!("in tool configuration {}", path.display()))
    }

    /// Namespace name backing a topology node.
    pub fn namespace_for(&self, node: &str) -> String {
        format!("{}{}", self.name_prefix, node)
    }

    /// File name of the content server binary, used as a kill pattern.
    pub fn httpd_name(&self) -> String {
        PathBuf::from(&self.httpd)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.httpd.clone())
    }
}
