//! Network emulation primitives for queueing experiments.
//!
//! Provides Linux network namespace management, in-namespace bridges,
//! `tc` link shaping (HTB rate limit plus netem delay and queue limit),
//! and parsing of `tc -s qdisc` statistics for queue-depth sampling.

pub mod namespace;
pub mod qdisc;
pub mod shaping;

pub mod test_util;
