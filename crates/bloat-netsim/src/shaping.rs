use crate::namespace::Namespace;
use std::io;

/// Handle of the root HTB qdisc installed by [`apply_shaping`].
pub const HTB_HANDLE: &str = "5:";
/// Class carrying the rate limit; netem hangs below it.
pub const HTB_CLASS: &str = "5:1";
/// Handle of the netem qdisc.
pub const NETEM_HANDLE: &str = "10:";

/// Shaping parameters for one end of an emulated link.
///
/// Each present field adds one piece of the qdisc chain:
/// - `rate_mbit` installs a root HTB with a single default class at that rate;
/// - `delay_ms` and `queue_limit` go on a netem qdisc (below the HTB class
///   when a rate is set, at the root otherwise).
///
/// The netem `limit` is the interface queue that fills up under load. When
/// `queue_limit` is `None` netem keeps its kernel default (1000 packets).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkShaping {
    pub rate_mbit: Option<f64>,
    pub delay_ms: Option<f64>,
    pub queue_limit: Option<u32>,
}

impl LinkShaping {
    pub fn is_empty(&self) -> bool {
        self.rate_mbit.is_none() && self.delay_ms.is_none() && self.queue_limit.is_none()
    }
}

/// The `tc` argument lists that realize `shaping` on `interface`, in order.
///
/// Does not include the initial `qdisc del`; an empty shaping yields no
/// commands.
pub fn shaping_commands(interface: &str, shaping: &LinkShaping) -> Vec<Vec<String>> {
    let mut commands = Vec::new();
    if shaping.is_empty() {
        return commands;
    }

    let netem_parent = if let Some(rate) = shaping.rate_mbit {
        commands.push(strings(&[
            "qdisc", "add", "dev", interface, "root", "handle", HTB_HANDLE, "htb", "default", "1",
        ]));
        let mut class = strings(&[
            "class", "add", "dev", interface, "parent", HTB_HANDLE, "classid", HTB_CLASS, "htb",
        ]);
        class.push("rate".into());
        class.push(format!("{}Mbit", rate));
        class.push("burst".into());
        class.push("15k".into());
        commands.push(class);
        vec!["parent".to_string(), HTB_CLASS.to_string()]
    } else {
        vec!["root".to_string()]
    };

    if shaping.delay_ms.is_some() || shaping.queue_limit.is_some() {
        let mut netem = strings(&["qdisc", "add", "dev", interface]);
        netem.extend(netem_parent);
        netem.extend(strings(&["handle", NETEM_HANDLE, "netem"]));
        if let Some(delay) = shaping.delay_ms {
            netem.push("delay".into());
            netem.push(format!("{}ms", delay));
        }
        if let Some(limit) = shaping.queue_limit {
            netem.push("limit".into());
            netem.push(limit.to_string());
        }
        commands.push(netem);
    }

    commands
}

fn strings(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Applies link shaping to an interface inside a namespace using `tc`.
///
/// Removes any existing root qdisc first (best effort), then installs the
/// chain described by [`shaping_commands`]. An empty [`LinkShaping`] just
/// clears the interface.
pub fn apply_shaping(ns: &Namespace, interface: &str, shaping: &LinkShaping) -> io::Result<()> {
    let _ = ns.exec("tc", &["qdisc", "del", "dev", interface, "root"]);

    for command in shaping_commands(interface, shaping) {
        let args: Vec<&str> = command.iter().map(|s| s.as_str()).collect();
        let output = ns.exec("tc", &args)?;
        if !output.status.success() {
            return Err(io::Error::other(format!(
                "Failed to apply tc shaping: {}\nCommand: tc {}",
                String::from_utf8_lossy(&output.stderr),
                args.join(" ")
            )));
        }
    }

    tracing::debug!(netns = %ns.name, interface, ?shaping, "link shaping applied");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{netns_sudo, unique_ns_name};

    fn joined(commands: &[Vec<String>]) -> Vec<String> {
        commands.iter().map(|c| c.join(" ")).collect()
    }

    #[test]
    fn empty_shaping_installs_nothing() {
        assert!(shaping_commands("s0-eth2", &LinkShaping::default()).is_empty());
    }

    #[test]
    fn rate_delay_and_limit_build_htb_then_netem() {
        let shaping = LinkShaping {
            rate_mbit: Some(1.5),
            delay_ms: Some(10.0),
            queue_limit: Some(20),
        };
        assert_eq!(
            joined(&shaping_commands("s0-eth2", &shaping)),
            vec![
                "qdisc add dev s0-eth2 root handle 5: htb default 1",
                "class add dev s0-eth2 parent 5: classid 5:1 htb rate 1.5Mbit burst 15k",
                "qdisc add dev s0-eth2 parent 5:1 handle 10: netem delay 10ms limit 20",
            ]
        );
    }

    #[test]
    fn rate_without_queue_cap_keeps_netem_default_limit() {
        let shaping = LinkShaping {
            rate_mbit: Some(1000.0),
            delay_ms: Some(2.5),
            queue_limit: None,
        };
        let cmds = joined(&shaping_commands("h1-eth0", &shaping));
        assert_eq!(cmds.len(), 3);
        assert_eq!(
            cmds[2],
            "qdisc add dev h1-eth0 parent 5:1 handle 10: netem delay 2.5ms"
        );
    }

    #[test]
    fn delay_only_puts_netem_at_root() {
        let shaping = LinkShaping {
            delay_ms: Some(5.0),
            ..Default::default()
        };
        assert_eq!(
            joined(&shaping_commands("veth0", &shaping)),
            vec!["qdisc add dev veth0 root handle 10: netem delay 5ms"]
        );
    }

    // Helper to extract ping time from output
    fn get_ping_time(output: &str) -> Option<f32> {
        // "64 bytes from 1.2.3.4: icmp_seq=1 ttl=64 time=102 ms"
        for line in output.lines() {
            if let Some(idx) = line.find("time=") {
                let rest = &line[idx + 5..];
                if let Some(end) = rest.find(' ') {
                    return rest[..end].parse::<f32>().ok();
                }
            }
        }
        None
    }

    #[test]
    fn test_shaping_adds_delay() {
        let Some(sudo) = netns_sudo() else {
            eprintln!("Skipping test_shaping_adds_delay, insufficient privileges");
            return;
        };

        let ns1 = Namespace::new(&unique_ns_name("bb_sh_a"), sudo).expect("Failed to create ns1");
        let ns2 = Namespace::new(&unique_ns_name("bb_sh_b"), sudo).expect("Failed to create ns2");

        let suffix = std::process::id() % 10_000;
        let a = format!("sha{suffix}");
        let b = format!("shb{suffix}");
        ns1.add_veth_pair(&ns2, &a, &b).expect("Failed to create link");
        ns1.add_address(&a, "10.201.1.1/24").expect("addr a");
        ns2.add_address(&b, "10.201.1.2/24").expect("addr b");

        let shaping = LinkShaping {
            rate_mbit: Some(5.0),
            delay_ms: Some(50.0),
            queue_limit: Some(100),
        };
        if let Err(err) = apply_shaping(&ns1, &a, &shaping) {
            let msg = err.to_string();
            if msg.contains("qdisc kind is unknown") {
                eprintln!("Skipping test_shaping_adds_delay, netem qdisc not available");
                return;
            }
            panic!("Failed to apply shaping: {}", err);
        }

        let out = ns1
            .exec("ping", &["-c", "3", "-i", "0.2", "10.201.1.2"])
            .expect("Failed to exec ping");
        let stdout = String::from_utf8_lossy(&out.stdout);
        assert!(out.status.success(), "Ping failed: {}", stdout);

        let rtt = get_ping_time(&stdout).expect("Could not parse ping time");
        assert!(rtt >= 45.0, "RTT {} ms is less than the 50ms delay", rtt);
    }
}
