//! Command line of the `bufferbloat` driver.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::config::ExperimentConfig;
use crate::tools::ToolsConfig;

/// Bufferbloat experiment: a bulk TCP flow fills a shaped bottleneck while
/// short fetches measure the queuing delay interactive traffic sees.
#[derive(Parser, Debug)]
#[command(name = "bufferbloat", version, about)]
pub struct Cli {
    /// Bandwidth of the host link (Mb/s).
    #[arg(short = 'B', long, default_value_t = 1000.0)]
    pub bw_host: f64,

    /// Bandwidth of the bottleneck link (Mb/s).
    #[arg(short = 'b', long)]
    pub bw_net: f64,

    /// Link propagation delay (ms).
    #[arg(long)]
    pub delay: f64,

    /// Directory for q.txt and ping.txt.
    #[arg(short = 'd', long)]
    pub dir: PathBuf,

    /// Duration of the measurement window (s).
    #[arg(short = 't', long, default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..))]
    pub time: u64,

    /// Max buffer size of the bottleneck interface (packets).
    #[arg(long, default_value_t = 100)]
    pub maxq: u32,

    /// TCP congestion control algorithm.
    #[arg(long, default_value = "reno")]
    pub cong: String,

    /// Socket buffer size for the bulk flow (iperf syntax).
    #[arg(long, default_value = "16m")]
    pub buffer_size: String,

    /// Tool configuration (TOML): binary paths, sudo, namespace prefix.
    #[arg(long)]
    pub tools: Option<PathBuf>,

    /// Directory served to the foreground fetches.
    #[arg(long, default_value = "http")]
    pub http_root: PathBuf,

    /// Also print the run report as one JSON line.
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

impl Cli {
    /// Experiment configuration with default timing. Not yet validated.
    pub fn to_config(&self) -> ExperimentConfig {
        let mut config = ExperimentConfig::new(self.bw_net, self.delay, self.dir.clone());
        config.host_bandwidth_mbit = self.bw_host;
        config.duration = Duration::from_secs(self.time);
        config.max_queue_packets = self.maxq;
        config.congestion_control = self.cong.clone();
        config.socket_buffer = self.buffer_size.clone();
        config.http_root = self.http_root.clone();
        config
    }

    pub fn tools_config(&self) -> anyhow::Result<ToolsConfig> {
        match &self.tools {
            Some(path) => ToolsConfig::load(path),
            None => Ok(ToolsConfig::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_flags_and_defaults() {
        let cli = Cli::try_parse_from([
            "bufferbloat", "--bw-net", "1.5", "--delay", "10", "--dir", "out",
        ])
        .unwrap();
        let config = cli.to_config();
        assert_eq!(config.bottleneck_bandwidth_mbit, 1.5);
        assert_eq!(config.host_bandwidth_mbit, 1000.0);
        assert_eq!(config.delay_ms, 10.0);
        assert_eq!(config.duration, Duration::from_secs(10));
        assert_eq!(config.max_queue_packets, 100);
        assert_eq!(config.congestion_control, "reno");
        assert_eq!(config.socket_buffer, "16m");
        assert_eq!(config.http_root, PathBuf::from("http"));
        assert!(!cli.json);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn short_flags() {
        let cli = Cli::try_parse_from([
            "bufferbloat", "-B", "100", "-b", "1.5", "--delay", "10", "-d", "out", "-t", "15",
            "--maxq", "20", "--cong", "cubic",
        ])
        .unwrap();
        let config = cli.to_config();
        assert_eq!(config.host_bandwidth_mbit, 100.0);
        assert_eq!(config.duration, Duration::from_secs(15));
        assert_eq!(config.max_queue_packets, 20);
        assert_eq!(config.congestion_control, "cubic");
    }

    #[test]
    fn missing_required_flag_is_an_error() {
        assert!(Cli::try_parse_from(["bufferbloat", "--delay", "10", "--dir", "out"]).is_err());
        assert!(Cli::try_parse_from(["bufferbloat", "--bw-net", "1", "--delay", "10"]).is_err());
    }

    #[test]
    fn zero_time_is_rejected_at_parse() {
        assert!(Cli::try_parse_from([
            "bufferbloat", "--bw-net", "1.5", "--delay", "10", "--dir", "out", "--time", "0",
        ])
        .is_err());
    }

    #[test]
    fn time_shorter_than_fetch_interval_fails_validation() {
        let cli = Cli::try_parse_from([
            "bufferbloat", "--bw-net", "1.5", "--delay", "10", "--dir", "out", "--time", "3",
        ])
        .unwrap();
        assert!(cli.to_config().validate().is_err());
    }
}
