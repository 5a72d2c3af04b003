//! Result aggregation.

use std::fmt;

use serde::Serialize;

/// Mean and standard deviation of `values`, or `None` if empty.
///
/// The deviation is the *population* form: squared deviations are divided
/// by `n`, not `n - 1`. This understates spread for small sample sets and is
/// not the usual estimator, but existing reports were produced this way.
pub fn mean_stddev(values: &[f64]) -> Option<(f64, f64)> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    Some((mean, variance.sqrt()))
}

/// Headline numbers for one run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencySummary {
    /// Successful fetches.
    pub samples: usize,
    /// Failed fetches.
    pub missing: usize,
    /// Seconds.
    pub mean: f64,
    /// Seconds, population form.
    pub stddev: f64,
}

impl LatencySummary {
    pub fn from_samples(values: &[f64], missing: usize) -> Option<Self> {
        let (mean, stddev) = mean_stddev(values)?;
        Some(Self {
            samples: values.len(),
            missing,
            mean,
            stddev,
        })
    }
}

impl fmt::Display for LatencySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fetch time: mean {:.3}s stddev {:.3}s (n={}, missing={})",
            self.mean, self.stddev, self.samples, self.missing
        )
    }
}
