//! Helpers for tests that touch real namespaces.
//!
//! These tests need `ip netns` and either root or passwordless sudo. When
//! neither is available they should print a notice and return early.

use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};

static NS_SEQ: AtomicU32 = AtomicU32::new(0);

fn lists_namespaces(mut cmd: Command) -> bool {
    cmd.args(["netns", "list"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}

/// Whether privileged tests can run, and if so whether `ip` must go through
/// `sudo`. Root runs `ip` directly; anyone else needs `sudo -n` to succeed.
pub fn netns_sudo() -> Option<bool> {
    // SAFETY: geteuid has no preconditions and cannot fail.
    if unsafe { libc::geteuid() } == 0 {
        return lists_namespaces(Command::new("ip")).then_some(false);
    }
    let mut sudo = Command::new("sudo");
    sudo.args(["-n", "ip"]);
    lists_namespaces(sudo).then_some(true)
}

/// Namespace name unique to this test process, at most 15 bytes.
pub fn unique_ns_name(prefix: &str) -> String {
    let seq = NS_SEQ.fetch_add(1, Ordering::Relaxed);
    let mut name = format!("{prefix}_{:x}_{seq}", std::process::id() % 0xFFFF);
    name.truncate(15);
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_fit_the_netns_limit() {
        let long = unique_ns_name("bb_long_prefix");
        assert!(long.len() <= 15);
        assert!(long.starts_with("bb_long_prefix"));

        assert_ne!(unique_ns_name("x"), unique_ns_name("x"));
    }
}
