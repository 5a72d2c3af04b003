//! Parsing of `tc -s qdisc show dev <iface>` statistics.
//!
//! Each qdisc block starts with a header line (`qdisc <kind> <handle> ...`)
//! followed by indented statistics, one of which is
//! ` backlog <bytes>b <packets>p requeues <n>`.

use std::io;
use std::process::Command;

/// Backlog reported for one qdisc.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QdiscBacklog {
    pub kind: String,
    pub handle: String,
    pub packets: u32,
}

/// Extracts the backlog of every qdisc in `tc -s qdisc show` output, in the
/// order `tc` printed them. Blocks without a parseable backlog are skipped.
pub fn parse_backlogs(output: &str) -> Vec<QdiscBacklog> {
    let mut backlogs = Vec::new();
    let mut current: Option<(String, String)> = None;

    for line in output.lines() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix("qdisc ") {
            let mut words = rest.split_whitespace();
            current = match (words.next(), words.next()) {
                (Some(kind), Some(handle)) => Some((kind.to_string(), handle.to_string())),
                _ => None,
            };
            continue;
        }

        if let Some(rest) = trimmed.strip_prefix("backlog ") {
            let Some((kind, handle)) = current.take() else {
                continue;
            };
            let packets = rest
                .split_whitespace()
                .find_map(|word| word.strip_suffix('p'))
                .and_then(|n| n.parse::<u32>().ok());
            if let Some(packets) = packets {
                backlogs.push(QdiscBacklog {
                    kind,
                    handle,
                    packets,
                });
            }
        }
    }

    backlogs
}

/// Queue depth in packets for an interface shaped with HTB + netem.
///
/// The netem qdisc holds the packets waiting behind the rate limiter, so its
/// backlog is preferred; otherwise the first qdisc that reports one is used.
pub fn queue_depth(output: &str) -> Option<u32> {
    let backlogs = parse_backlogs(output);
    backlogs
        .iter()
        .find(|b| b.kind == "netem")
        .or_else(|| backlogs.first())
        .map(|b| b.packets)
}

/// Runs `<tc> -s qdisc show dev <interface>` in the current namespace and
/// returns the raw statistics text.
pub fn qdisc_stats(tc: &str, interface: &str) -> io::Result<String> {
    let output = Command::new(tc)
        .args(["-s", "qdisc", "show", "dev", interface])
        .output()?;
    if !output.status.success() {
        return Err(io::Error::other(format!(
            "Failed to read qdisc stats for {}: {}",
            interface,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
