//! Sample aggregation
//!
//! Collapses a set of per-sample values into summary statistics. Percentiles
//! use linear interpolation between the two closest ranks; the standard
//! deviation is the sample estimate (`n - 1` denominator).

pub mod persist;

use serde::{Deserialize, Serialize};

pub use persist::{write_samples, write_samples_best_effort};

/// Summary of a non-empty sample set
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SummaryStats {
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub p25: f64,
    pub p75: f64,
    pub p99: f64,
}

/// Aggregation result: statistics, or "not applicable" for an empty set
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricSummary {
    NotApplicable,
    Stats(SummaryStats),
}

impl MetricSummary {
    /// Summarize `values`; non-finite values are excluded first
    pub fn from_values(values: &[f64]) -> Self {
        let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        if sorted.is_empty() {
            return MetricSummary::NotApplicable;
        }
        sorted.sort_by(f64::total_cmp);

        let count = sorted.len();
        let mean = sorted.iter().sum::<f64>() / count as f64;
        let std = if count > 1 {
            let ss: f64 = sorted.iter().map(|v| (v - mean).powi(2)).sum();
            (ss / (count - 1) as f64).sqrt()
        } else {
            0.0
        };

        MetricSummary::Stats(SummaryStats {
            count,
            mean,
            median: percentile(&sorted, 0.5),
            std,
            min: sorted[0],
            max: sorted[count - 1],
            p25: percentile(&sorted, 0.25),
            p75: percentile(&sorted, 0.75),
            p99: percentile(&sorted, 0.99),
        })
    }

    pub fn stats(&self) -> Option<&SummaryStats> {
        match self {
            MetricSummary::Stats(s) => Some(s),
            MetricSummary::NotApplicable => None,
        }
    }

    pub fn is_applicable(&self) -> bool {
        matches!(self, MetricSummary::Stats(_))
    }
}

/// Quantile `q` in `[0, 1]` of ascending `sorted` values, linearly
/// interpolated; `NaN` for an empty slice
pub fn percentile(sorted: &[f64], q: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        n => {
            let pos = q.clamp(0.0, 1.0) * (n - 1) as f64;
            let lo = pos.floor() as usize;
            let hi = pos.ceil() as usize;
            let frac = pos - lo as f64;
            sorted[lo] + (sorted[hi] - sorted[lo]) * frac
        }
    }
}

/// Arithmetic mean, `None` for an empty slice
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Population standard deviation, `None` for an empty slice
pub fn population_std(values: &[f64]) -> Option<f64> {
    let m = mean(values)?;
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    Some(var.sqrt())
}
