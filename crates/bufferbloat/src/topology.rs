//! Dumbbell topology description.
//!
//! ```text
//!   h1 ──(host link)── s0 ──(bottleneck)── h2
//!  h1-eth0        s0-eth1  s0-eth2        h2-eth0
//! ```
//!
//! The description is pure data: building it has no side effects, and the
//! emulator turns it into namespaces and shaped veth pairs on start.

use std::time::Duration;

use bloat_netsim::shaping::LinkShaping;
use thiserror::Error;

pub const HOST_A: &str = "h1";
pub const HOST_B: &str = "h2";
pub const SWITCH: &str = "s0";

/// Largest propagation delay accepted, in ms.
pub const MAX_DELAY_MS: f64 = 60_000.0;

#[derive(Debug, Error, PartialEq)]
pub enum TopologyError {
    #[error("{link} bandwidth must be positive (got {value} Mb/s)")]
    Bandwidth { link: &'static str, value: f64 },
    #[error("propagation delay must be between 0 and 60000 ms (got {0} ms)")]
    Delay(f64),
    #[error("bottleneck queue must hold at least one packet")]
    QueueLength,
    #[error("cpu limit must be in (0, 1] (got {0})")]
    CpuLimit(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Host,
    Switch,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub name: String,
    pub kind: NodeKind,
    /// Fraction of one CPU the host may use.
    pub cpu: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinkParams {
    pub bandwidth_mbit: f64,
    pub propagation_delay: Duration,
    pub max_queue_packets: Option<u32>,
}

impl LinkParams {
    /// `tc` shaping for each end of the link.
    pub fn shaping(&self) -> LinkShaping {
        LinkShaping {
            rate_mbit: Some(self.bandwidth_mbit),
            delay_ms: Some(self.propagation_delay.as_secs_f64() * 1000.0),
            queue_limit: self.max_queue_packets,
        }
    }
}

/// A link between two nodes. `a_iface` lives on `a`, `b_iface` on `b`.
#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    pub a: String,
    pub a_iface: String,
    pub b: String,
    pub b_iface: String,
    pub params: LinkParams,
}

impl Link {
    pub fn is_bottleneck(&self) -> bool {
        self.params.max_queue_packets.is_some()
    }

    /// The interface this link attaches to `node`, if any.
    pub fn iface_on(&self, node: &str) -> Option<&str> {
        if self.a == node {
            Some(&self.a_iface)
        } else if self.b == node {
            Some(&self.b_iface)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Topology {
    nodes: Vec<Node>,
    links: Vec<Link>,
}

impl Topology {
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn hosts(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.kind == NodeKind::Host)
    }

    pub fn switches(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.kind == NodeKind::Switch)
    }

    /// The queue-constrained link. A dumbbell has exactly one.
    pub fn bottleneck(&self) -> &Link {
        self.links
            .iter()
            .find(|l| l.is_bottleneck())
            .unwrap_or(&self.links[self.links.len() - 1])
    }

    /// Switch-side interface of the bottleneck, where the queue builds up.
    pub fn bottleneck_iface(&self) -> &str {
        let link = self.bottleneck();
        link.iface_on(SWITCH).unwrap_or(&link.a_iface)
    }

    /// All interfaces attached to `node`, in link order.
    pub fn ifaces_of(&self, node: &str) -> Vec<&str> {
        self.links.iter().filter_map(|l| l.iface_on(node)).collect()
    }
}

/// Inputs for [`build_dumbbell`].
#[derive(Debug, Clone, PartialEq)]
pub struct DumbbellParams {
    pub cpu: Option<f64>,
    pub host_bandwidth_mbit: f64,
    pub bottleneck_bandwidth_mbit: f64,
    pub delay_ms: f64,
    pub max_queue_packets: u32,
}

/// Declares `h1`, `h2` and switch `s0`, with an unconstrained link
/// `h1 ↔ s0` and the bottleneck `s0 ↔ h2`.
///
/// Only the bottleneck carries a queue cap; the host link keeps the
/// kernel's default queue.
pub fn build_dumbbell(params: &DumbbellParams) -> Result<Topology, TopologyError> {
    for (link, value) in [
        ("host link", params.host_bandwidth_mbit),
        ("bottleneck", params.bottleneck_bandwidth_mbit),
    ] {
        if !(value.is_finite() && value > 0.0) {
            return Err(TopologyError::Bandwidth { link, value });
        }
    }
    if !(0.0..=MAX_DELAY_MS).contains(&params.delay_ms) {
        return Err(TopologyError::Delay(params.delay_ms));
    }
    if params.max_queue_packets == 0 {
        return Err(TopologyError::QueueLength);
    }
    if let Some(cpu) = params.cpu {
        if !(cpu > 0.0 && cpu <= 1.0) {
            return Err(TopologyError::CpuLimit(cpu));
        }
    }

    let delay = Duration::try_from_secs_f64(params.delay_ms / 1000.0)
        .map_err(|_| TopologyError::Delay(params.delay_ms))?;
    let host = |name: &str| Node {
        name: name.to_string(),
        kind: NodeKind::Host,
        cpu: params.cpu,
    };

    // Switch ports are numbered in link order: the host link gets s0-eth1,
    // the bottleneck s0-eth2.
    let nodes = vec![
        host(HOST_A),
        host(HOST_B),
        Node {
            name: SWITCH.to_string(),
            kind: NodeKind::Switch,
            cpu: None,
        },
    ];
    let links = vec![
        Link {
            a: HOST_A.to_string(),
            a_iface: format!("{HOST_A}-eth0"),
            b: SWITCH.to_string(),
            b_iface: format!("{SWITCH}-eth1"),
            params: LinkParams {
                bandwidth_mbit: params.host_bandwidth_mbit,
                propagation_delay: delay,
                max_queue_packets: None,
            },
        },
        Link {
            a: SWITCH.to_string(),
            a_iface: format!("{SWITCH}-eth2"),
            b: HOST_B.to_string(),
            b_iface: format!("{HOST_B}-eth0"),
            params: LinkParams {
                bandwidth_mbit: params.bottleneck_bandwidth_mbit,
                propagation_delay: delay,
                max_queue_packets: Some(params.max_queue_packets),
            },
        },
    ];

    Ok(Topology { nodes, links })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> DumbbellParams {
        DumbbellParams {
            cpu: None,
            host_bandwidth_mbit: 1000.0,
            bottleneck_bandwidth_mbit: 1.5,
            delay_ms: 10.0,
            max_queue_packets: 20,
        }
    }

    #[test]
    fn exactly_one_link_is_queue_capped() {
        let topo = build_dumbbell(&params()).unwrap();
        assert_eq!(topo.links().len(), 2);
        assert_eq!(topo.links().iter().filter(|l| l.is_bottleneck()).count(), 1);

        let bottleneck = topo.bottleneck();
        assert_eq!(bottleneck.params.max_queue_packets, Some(20));
        assert_eq!(bottleneck.params.bandwidth_mbit, 1.5);
        assert_eq!(topo.bottleneck_iface(), "s0-eth2");
    }

    #[test]
    fn nodes_and_interfaces() {
        let topo = build_dumbbell(&params()).unwrap();
        let hosts: Vec<_> = topo.hosts().map(|n| n.name.as_str()).collect();
        assert_eq!(hosts, vec!["h1", "h2"]);
        assert_eq!(topo.switches().count(), 1);
        assert_eq!(topo.ifaces_of(SWITCH), vec!["s0-eth1", "s0-eth2"]);
        assert_eq!(topo.ifaces_of(HOST_A), vec!["h1-eth0"]);
        assert_eq!(topo.ifaces_of(HOST_B), vec!["h2-eth0"]);
    }

    #[test]
    fn delay_is_applied_to_both_links() {
        let topo = build_dumbbell(&params()).unwrap();
        for link in topo.links() {
            assert_eq!(link.params.propagation_delay, Duration::from_millis(10));
        }
        let shaping = topo.bottleneck().params.shaping();
        assert_eq!(shaping.rate_mbit, Some(1.5));
        assert_eq!(shaping.queue_limit, Some(20));
        assert!((shaping.delay_ms.unwrap() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn rejects_bad_parameters() {
        let mut p = params();
        p.bottleneck_bandwidth_mbit = 0.0;
        assert!(matches!(
            build_dumbbell(&p),
            Err(TopologyError::Bandwidth { link: "bottleneck", .. })
        ));

        let mut p = params();
        p.bottleneck_bandwidth_mbit = -3.0;
        assert!(build_dumbbell(&p).is_err());

        let mut p = params();
        p.delay_ms = -1.0;
        assert_eq!(build_dumbbell(&p), Err(TopologyError::Delay(-1.0)));

        let mut p = params();
        p.max_queue_packets = 0;
        assert_eq!(build_dumbbell(&p), Err(TopologyError::QueueLength));

        let mut p = params();
        p.cpu = Some(1.5);
        assert_eq!(build_dumbbell(&p), Err(TopologyError::CpuLimit(1.5)));
    }

    #[test]
    fn oversized_delay_is_an_error_not_a_panic() {
        for delay in [1e30, f64::MAX, MAX_DELAY_MS + 1.0, f64::NAN] {
            let mut p = params();
            p.delay_ms = delay;
            assert!(matches!(build_dumbbell(&p), Err(TopologyError::Delay(_))));
        }
        let mut p = params();
        p.delay_ms = MAX_DELAY_MS;
        assert!(build_dumbbell(&p).is_ok());
    }

    #[test]
    fn zero_delay_is_allowed() {
        let mut p = params();
        p.delay_ms = 0.0;
        let topo = build_dumbbell(&p).unwrap();
        assert_eq!(topo.bottleneck().params.propagation_delay, Duration::ZERO);
    }
}
