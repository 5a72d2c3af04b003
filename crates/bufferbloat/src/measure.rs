//! Foreground measurement loop.
//!
//! Repeatedly times a fetch of the content server's index page from the
//! non-server endpoint, pausing between fetches so measurement traffic does
//! not itself fill the bottleneck queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context};
use tracing::{debug, warn};

use crate::emulator::{CommandSpec, Emulator};
use crate::tools::ToolsConfig;

/// Longest single sleep while pacing; bounds how late a stop request is seen.
const PAUSE_SLICE: Duration = Duration::from_millis(100);

/// `curl` invocation that discards the body and prints only the total time.
pub fn fetch_command(tools: &ToolsConfig, url: &str) -> CommandSpec {
    CommandSpec::new(tools.curl.as_str())
        .args(["-o", "/dev/null", "-s", "-w", "%{time_total}"])
        .arg(url)
}

/// Parses curl's `%{time_total}` output (seconds, decimal).
pub fn parse_fetch_time(stdout: &str) -> Option<f64> {
    let secs: f64 = stdout.trim().parse().ok()?;
    (secs.is_finite() && secs >= 0.0).then_some(secs)
}

/// Runs one timed fetch on `node`, returning its duration in seconds.
pub fn timed_fetch<E: Emulator + ?Sized>(
    emulator: &E,
    node: &str,
    cmd: &CommandSpec,
) -> anyhow::Result<f64> {
    let out = emulator
        .run(node, cmd)
        .with_context(|| format!("fetch from {node} failed to run"))?;
    if !out.success {
        bail!("fetch failed: {}", out.stderr.trim());
    }
    parse_fetch_time(&out.stdout)
        .ok_or_else(|| anyhow!("unparseable fetch time {:?}", out.stdout.trim()))
}

/// One cycle of the loop.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub index: usize,
    /// Time since the loop started, taken when the fetch returned.
    pub elapsed: Duration,
    /// `None` when the fetch failed.
    pub fetch_secs: Option<f64>,
}

/// Lazy, finite sequence of [`Sample`]s.
///
/// Each `next` fetches, pauses for the interval, then checks the elapsed
/// time, so the final cycle can overrun `duration` by up to one interval.
pub struct ForegroundLoop<F> {
    fetch: F,
    duration: Duration,
    interval: Duration,
    stop: Option<Arc<AtomicBool>>,
    started: Instant,
    index: usize,
    done: bool,
}

impl<F> ForegroundLoop<F>
where
    F: FnMut() -> anyhow::Result<f64>,
{
    pub fn new(fetch: F, duration: Duration, interval: Duration) -> Self {
        Self {
            fetch,
            duration,
            interval,
            stop: None,
            started: Instant::now(),
            index: 0,
            done: false,
        }
    }

    /// Ends the loop early once `flag` is set.
    pub fn with_stop_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.stop = Some(flag);
        self
    }

    fn stopped(&self) -> bool {
        self.stop
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    /// Sleeps for the interval in short slices; false if a stop was requested.
    fn pause(&self) -> bool {
        let deadline = Instant::now() + self.interval;
        loop {
            if self.stopped() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(PAUSE_SLICE));
        }
    }
}

impl<F> Iterator for ForegroundLoop<F>
where
    F: FnMut() -> anyhow::Result<f64>,
{
    type Item = Sample;

    fn next(&mut self) -> Option<Sample> {
        if self.done || self.stopped() {
            self.done = true;
            return None;
        }

        let fetch_secs = match (self.fetch)() {
            Ok(secs) => {
                debug!(index = self.index, secs, "fetch");
                Some(secs)
            }
            Err(e) => {
                warn!(index = self.index, error = %e, "fetch failed, sample missing");
                None
            }
        };
        let sample = Sample {
            index: self.index,
            elapsed: self.started.elapsed(),
            fetch_secs,
        };
        self.index += 1;

        if !self.pause() {
            self.done = true;
            return Some(sample);
        }

        let elapsed = self.started.elapsed();
        if elapsed >= self.duration {
            self.done = true;
        } else {
            println!("{:.1}s left...", (self.duration - elapsed).as_secs_f64());
        }
        Some(sample)
    }
}

/// Successful fetch times plus a count of failed fetches.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LatencySamples {
    pub values: Vec<f64>,
    pub missing: usize,
}

impl FromIterator<Sample> for LatencySamples {
    fn from_iter<I: IntoIterator<Item = Sample>>(iter: I) -> Self {
        let mut samples = LatencySamples::default();
        for sample in iter {
            match sample.fetch_secs {
                Some(secs) => samples.values.push(secs),
                None => samples.missing += 1,
            }
        }
        samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_command_prints_only_total_time() {
        let cmd = fetch_command(&ToolsConfig::default(), "http://10.0.0.1/");
        assert_eq!(
            cmd.command_line(),
            "curl -o /dev/null -s -w %{time_total} http://10.0.0.1/"
        );
    }

    #[test]
    fn parses_curl_time_total() {
        assert_eq!(parse_fetch_time("0.123456"), Some(0.123456));
        assert_eq!(parse_fetch_time(" 1.5\n"), Some(1.5));
        assert_eq!(parse_fetch_time(""), None);
        assert_eq!(parse_fetch_time("-1"), None);
        assert_eq!(parse_fetch_time("NaN"), None);
    }

    #[test]
    fn loop_runs_until_duration_then_stops() {
        let mut calls = 0;
        let samples: Vec<Sample> = ForegroundLoop::new(
            || {
                calls += 1;
                Ok(0.01)
            },
            Duration::from_millis(100),
            Duration::from_millis(30),
        )
        .collect();

        // 30 ms cycles against a 100 ms window: the last one overruns
        assert!((2..=4).contains(&samples.len()));
        assert_eq!(calls, samples.len());
        assert!(samples.last().unwrap().elapsed < Duration::from_millis(100));
        assert_eq!(samples.last().unwrap().index, samples.len() - 1);
    }

    #[test]
    fn window_equal_to_interval_yields_one_sample() {
        let samples: LatencySamples = ForegroundLoop::new(
            || Ok(0.5),
            Duration::from_millis(20),
            Duration::from_millis(20),
        )
        .collect();
        assert_eq!(samples.values, vec![0.5]);
        assert_eq!(samples.missing, 0);
    }

    #[test]
    fn failed_fetches_are_missing_not_fatal() {
        let mut n = 0;
        let samples: LatencySamples = ForegroundLoop::new(
            || -> anyhow::Result<f64> {
                n += 1;
                if n % 2 == 0 {
                    bail!("connection refused")
                }
                Ok(0.2)
            },
            Duration::from_millis(60),
            Duration::from_millis(10),
        )
        .collect();
        assert!(samples.missing >= 1);
        assert!(!samples.values.is_empty());
    }

    #[test]
    fn stop_flag_ends_the_loop_early() {
        let flag = Arc::new(AtomicBool::new(false));
        let setter = flag.clone();
        let samples: Vec<Sample> = ForegroundLoop::new(
            move || {
                setter.store(true, Ordering::SeqCst);
                Ok(0.1)
            },
            Duration::from_secs(60),
            Duration::from_secs(5),
        )
        .with_stop_flag(flag)
        .collect();
        assert_eq!(samples.len(), 1);
    }
}
