//! Experiment configuration.
//!
//! [`ExperimentConfig`] is built once (usually from the CLI), validated by
//! [`ExperimentConfig::validate`] before any resource is acquired, and then
//! handed to the driver, which never mutates it.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::topology::MAX_DELAY_MS;

/// Name of the queue-depth sample stream inside the output directory.
pub const QUEUE_FILE: &str = "q.txt";
/// Name of the raw latency-probe log inside the output directory.
pub const PING_FILE: &str = "ping.txt";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{name} bandwidth must be a positive number of Mb/s (got {value})")]
    Bandwidth { name: &'static str, value: f64 },
    #[error("propagation delay must be between 0 and 60000 ms (got {0})")]
    Delay(f64),
    #[error("experiment duration must be non-zero")]
    ZeroDuration,
    #[error("experiment duration {duration:?} is shorter than the {interval:?} fetch interval")]
    DurationBelowInterval {
        duration: Duration,
        interval: Duration,
    },
    #[error("max queue length must be at least one packet")]
    QueueLength,
    #[error("congestion control algorithm name is empty")]
    Congestion,
    #[error("invalid socket buffer size {0:?} (expected e.g. 16m, 512k, 65536)")]
    BufferSize(String),
    #[error("output directory path is empty")]
    OutputDir,
    #[error("{0} must be non-zero")]
    Timing(&'static str),
}

/// Pacing knobs for the run. Defaults match the classic experiment; tests
/// shrink them.
#[derive(Debug, Clone, PartialEq)]
pub struct Timing {
    /// Pause between foreground fetches.
    pub fetch_interval: Duration,
    /// Pause between readiness polls, and the fallback settle delay.
    pub settle: Duration,
    /// Budget for a freshly launched server to start listening.
    pub readiness_timeout: Duration,
    /// How long a process gets to exit after SIGINT before SIGKILL.
    pub stop_grace: Duration,
    /// Queue sampler period.
    pub sample_interval: Duration,
    /// Latency prober period.
    pub probe_interval: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            fetch_interval: Duration::from_secs(5),
            settle: Duration::from_secs(1),
            readiness_timeout: Duration::from_secs(5),
            stop_grace: Duration::from_secs(2),
            sample_interval: Duration::from_millis(100),
            probe_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentConfig {
    /// Bandwidth of the unconstrained host link (Mb/s).
    pub host_bandwidth_mbit: f64,
    /// Bandwidth of the bottleneck link (Mb/s).
    pub bottleneck_bandwidth_mbit: f64,
    /// Propagation delay applied at both ends of each link (ms).
    pub delay_ms: f64,
    pub output_dir: PathBuf,
    /// Lower bound on the measurement window.
    pub duration: Duration,
    /// Bottleneck queue capacity (packets).
    pub max_queue_packets: u32,
    pub congestion_control: String,
    /// Socket buffer hint for the bulk flow, iperf syntax (`16m`).
    pub socket_buffer: String,
    /// Directory served by the content server.
    pub http_root: PathBuf,
    /// Optional CPU fraction per endpoint.
    pub cpu_limit: Option<f64>,
    pub timing: Timing,
}

impl ExperimentConfig {
    /// A configuration with the CLI defaults for everything but the
    /// required values.
    pub fn new(bottleneck_bandwidth_mbit: f64, delay_ms: f64, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            host_bandwidth_mbit: 1000.0,
            bottleneck_bandwidth_mbit,
            delay_ms,
            output_dir: output_dir.into(),
            duration: Duration::from_secs(10),
            max_queue_packets: 100,
            congestion_control: "reno".to_string(),
            socket_buffer: "16m".to_string(),
            http_root: PathBuf::from("http"),
            cpu_limit: None,
            timing: Timing::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_bandwidth("host link", self.host_bandwidth_mbit)?;
        check_bandwidth("bottleneck", self.bottleneck_bandwidth_mbit)?;
        if !(0.0..=MAX_DELAY_MS).contains(&self.delay_ms) {
            return Err(ConfigError::Delay(self.delay_ms));
        }
        if self.output_dir.as_os_str().is_empty() {
            return Err(ConfigError::OutputDir);
        }
        if self.max_queue_packets == 0 {
            return Err(ConfigError::QueueLength);
        }
        if self.congestion_control.trim().is_empty() {
            return Err(ConfigError::Congestion);
        }
        if !is_buffer_size(&self.socket_buffer) {
            return Err(ConfigError::BufferSize(self.socket_buffer.clone()));
        }

        let timing = &self.timing;
        for (name, value) in [
            ("fetch interval", timing.fetch_interval),
            ("sample interval", timing.sample_interval),
            ("probe interval", timing.probe_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Timing(name));
            }
        }

        if self.duration.is_zero() {
            return Err(ConfigError::ZeroDuration);
        }
        if self.duration < timing.fetch_interval {
            return Err(ConfigError::DurationBelowInterval {
                duration: self.duration,
                interval: timing.fetch_interval,
            });
        }
        Ok(())
    }

    pub fn queue_file(&self) -> PathBuf {
        self.output_dir.join(QUEUE_FILE)
    }

    pub fn ping_file(&self) -> PathBuf {
        self.output_dir.join(PING_FILE)
    }

    /// Number of echo requests that spans the whole measurement window.
    pub fn probe_count(&self) -> u64 {
        let interval = self.timing.probe_interval.as_micros().max(1);
        let count = self.duration.as_micros() / interval;
        (count as u64).max(1)
    }
}

fn check_bandwidth(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::Bandwidth { name, value })
    }
}

/// `<digits>[kKmMgG]?`, the size syntax iperf accepts for `-w`.
fn is_buffer_size(s: &str) -> bool {
    let digits = s.strip_suffix(['k', 'K', 'm', 'M', 'g', 'G']).unwrap_or(s);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> ExperimentConfig {
        ExperimentConfig::new(1.5, 10.0, "out")
    }

    #[test]
    fn defaults_validate() {
        assert_eq!(valid().validate(), Ok(()));
    }

    #[test]
    fn zero_duration_is_rejected() {
        let mut cfg = valid();
        cfg.duration = Duration::ZERO;
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroDuration));
    }

    #[test]
    fn duration_shorter_than_fetch_interval_is_rejected() {
        let mut cfg = valid();
        cfg.duration = Duration::from_secs(4);
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::DurationBelowInterval { .. })
        ));

        cfg.duration = Duration::from_secs(5);
        assert_eq!(cfg.validate(), Ok(()));
    }

    #[test]
    fn bandwidths_must_be_positive_and_finite() {
        for bad in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let mut cfg = valid();
            cfg.bottleneck_bandwidth_mbit = bad;
            assert!(matches!(
                cfg.validate(),
                Err(ConfigError::Bandwidth { name: "bottleneck", .. })
            ));

            let mut cfg = valid();
            cfg.host_bandwidth_mbit = bad;
            assert!(matches!(
                cfg.validate(),
                Err(ConfigError::Bandwidth { name: "host link", .. })
            ));
        }
    }

    #[test]
    fn negative_delay_is_rejected_zero_is_fine() {
        let mut cfg = valid();
        cfg.delay_ms = -0.5;
        assert_eq!(cfg.validate(), Err(ConfigError::Delay(-0.5)));
        cfg.delay_ms = 0.0;
        assert_eq!(cfg.validate(), Ok(()));
    }

    #[test]
    fn huge_delay_is_rejected() {
        for bad in [1e30, f64::INFINITY, f64::NAN, MAX_DELAY_MS + 0.5] {
            let mut cfg = valid();
            cfg.delay_ms = bad;
            assert!(matches!(cfg.validate(), Err(ConfigError::Delay(_))), "{bad}");
        }
    }

    #[test]
    fn buffer_size_syntax() {
        assert!(is_buffer_size("16m"));
        assert!(is_buffer_size("512K"));
        assert!(is_buffer_size("65536"));
        assert!(!is_buffer_size("m"));
        assert!(!is_buffer_size("16mb"));
        assert!(!is_buffer_size(""));
        assert!(!is_buffer_size("-1"));
    }

    #[test]
    fn other_rejections() {
        let mut cfg = valid();
        cfg.max_queue_packets = 0;
        assert_eq!(cfg.validate(), Err(ConfigError::QueueLength));

        let mut cfg = valid();
        cfg.congestion_control = "  ".into();
        assert_eq!(cfg.validate(), Err(ConfigError::Congestion));

        let mut cfg = valid();
        cfg.output_dir = PathBuf::new();
        assert_eq!(cfg.validate(), Err(ConfigError::OutputDir));

        let mut cfg = valid();
        cfg.timing.fetch_interval = Duration::ZERO;
        assert_eq!(cfg.validate(), Err(ConfigError::Timing("fetch interval")));
    }

    #[test]
    fn probe_count_covers_the_window() {
        let mut cfg = valid();
        cfg.duration = Duration::from_secs(15);
        assert_eq!(cfg.probe_count(), 150);
        assert_eq!(cfg.queue_file(), PathBuf::from("out/q.txt"));
        assert_eq!(cfg.ping_file(), PathBuf::from("out/ping.txt"));
    }
}
