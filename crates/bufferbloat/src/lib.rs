//! Bufferbloat experiment harness.
//!
//! Builds a two-host dumbbell (`h1 -- s0 -- h2`) whose switch-to-`h2` link
//! is a shaped bottleneck, saturates it with a long-lived bulk TCP flow, and
//! measures how long short foreground fetches take while the queue is full.
//! Queue depth and ping RTTs are recorded to the output directory alongside.
//!
//! [`driver::Driver`] runs the experiment against any [`emulator::Emulator`];
//! [`emulator::NetnsEmulator`] is the Linux network-namespace implementation.

pub mod cli;
pub mod config;
pub mod driver;
pub mod emulator;
pub mod launch;
pub mod measure;
pub mod process;
pub mod qmon;
pub mod stats;
pub mod tools;
pub mod topology;

pub mod test_util;
