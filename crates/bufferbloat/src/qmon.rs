//! Queue-depth sampler behind the `bloat-qmon` binary.
//!
//! Polls `tc -s qdisc` for one interface at a fixed period and appends a
//! `<unix_seconds>,<backlog_packets>` line per tick.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bloat_netsim::qdisc::queue_depth;
use tracing::warn;

pub fn format_record(unix_secs: f64, depth: u32) -> String {
    format!("{unix_secs:.6},{depth}\n")
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

pub struct QueueMonitor<W, S> {
    out: W,
    stats: S,
    interval: Duration,
}

impl<W, S> QueueMonitor<W, S>
where
    W: Write,
    S: FnMut() -> io::Result<String>,
{
    /// `stats` returns the raw `tc -s qdisc show` text for the interface.
    pub fn new(out: W, stats: S, interval: Duration) -> Self {
        Self {
            out,
            stats,
            interval,
        }
    }

    /// Takes one sample. Returns the depth written, or `None` when `tc`
    /// failed or reported nothing usable (nothing is written then).
    pub fn sample_once(&mut self) -> io::Result<Option<u32>> {
        let text = match (self.stats)() {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "tc failed, skipping sample");
                return Ok(None);
            }
        };
        let Some(depth) = queue_depth(&text) else {
            warn!("no backlog in tc output, skipping sample");
            return Ok(None);
        };
        self.out.write_all(format_record(unix_now(), depth).as_bytes())?;
        self.out.flush()?;
        Ok(Some(depth))
    }

    /// Samples until `stop` is set or `count` records have been written.
    /// Returns the number of records written.
    pub fn run(&mut self, count: Option<u64>, stop: &AtomicBool) -> io::Result<u64> {
        let mut written = 0u64;
        let mut next_tick = Instant::now();
        while !stop.load(Ordering::SeqCst) {
            if count.is_some_and(|c| written >= c) {
                break;
            }
            if self.sample_once()?.is_some() {
                written += 1;
            }
            next_tick += self.interval;
            let now = Instant::now();
            if next_tick > now {
                thread::sleep(next_tick - now);
            } else {
                // fell behind; don't burst to catch up
                next_tick = now;
            }
        }
        Ok(written)
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NETEM_STATS: &str = "\
qdisc htb 5: root refcnt 2 r2q 10 default 0x1 direct_packets_stat 0 direct_qlen 1000
 Sent 1234 bytes 10 pkt (dropped 0, overlimits 3 requeues 0)
 backlog 0b 0p requeues 0
qdisc netem 10: parent 5:1 limit 20 delay 10ms
 Sent 1234 bytes 10 pkt (dropped 0, overlimits 0 requeues 0)
 backlog 15140b 7p requeues 0
";

    #[test]
    fn record_format() {
        assert_eq!(format_record(1700000000.5, 7), "1700000000.500000,7\n");
    }

    #[test]
    fn writes_one_line_per_sample() {
        let mut mon = QueueMonitor::new(
            Vec::new(),
            || Ok(NETEM_STATS.to_string()),
            Duration::from_millis(1),
        );
        let stop = AtomicBool::new(false);
        assert_eq!(mon.run(Some(3), &stop).unwrap(), 3);

        let text = String::from_utf8(mon.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        for line in lines {
            let (ts, depth) = line.split_once(',').unwrap();
            assert!(ts.parse::<f64>().unwrap() > 0.0);
            assert_eq!(depth, "7");
        }
    }

    #[test]
    fn unusable_output_is_skipped() {
        let mut calls = 0;
        let mut mon = QueueMonitor::new(
            Vec::new(),
            || {
                calls += 1;
                if calls == 1 {
                    Err(io::Error::other("Cannot find device"))
                } else if calls == 2 {
                    Ok("garbage".to_string())
                } else {
                    Ok(NETEM_STATS.to_string())
                }
            },
            Duration::from_millis(1),
        );
        assert_eq!(mon.sample_once().unwrap(), None);
        assert_eq!(mon.sample_once().unwrap(), None);
        assert_eq!(mon.sample_once().unwrap(), Some(7));
        assert_eq!(String::from_utf8(mon.into_inner()).unwrap().lines().count(), 1);
    }

    #[test]
    fn stop_flag_ends_sampling() {
        let mut mon = QueueMonitor::new(
            Vec::new(),
            || Ok(NETEM_STATS.to_string()),
            Duration::from_millis(1),
        );
        let stop = AtomicBool::new(true);
        assert_eq!(mon.run(None, &stop).unwrap(), 0);
    }
}
