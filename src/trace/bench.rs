//! Serving benchmark results (`bench_results.jsonl`)
//!
//! The serving benchmark writes one JSON object per run. A results file
//! must hold exactly one non-blank line; anything else is malformed.

use std::path::Path;

use serde::Deserialize;

use crate::error::{io_context, MetricError, MetricResult};

/// Fields of one benchmark run that the serving metrics read
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct BenchRecord {
    /// Per-request time to first token (s)
    #[serde(default)]
    pub ttfts: Vec<Option<f64>>,
    /// Per-request inter-token latencies (s)
    #[serde(default)]
    pub itls: Vec<Vec<f64>>,

    pub mean_ttft_ms: Option<f64>,
    pub median_ttft_ms: Option<f64>,
    pub std_ttft_ms: Option<f64>,
    pub p99_ttft_ms: Option<f64>,

    pub mean_tpot_ms: Option<f64>,
    pub median_tpot_ms: Option<f64>,
    pub std_tpot_ms: Option<f64>,
    pub p99_tpot_ms: Option<f64>,

    /// Wall time of the run (s)
    pub duration: Option<f64>,
    /// Completed requests
    pub completed: Option<u64>,
    #[serde(default)]
    pub total_input_tokens: u64,
    #[serde(default)]
    pub total_output_tokens: u64,
    pub request_throughput: Option<f64>,
    pub total_throughput: Option<f64>,
}

impl BenchRecord {
    /// Load the single record of a results file
    pub fn load(path: impl AsRef<Path>) -> MetricResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| io_context(e, path))?;
        Self::parse(path, &text)
    }

    /// Parse results text; `path` is only used for diagnostics
    pub fn parse(path: impl AsRef<Path>, text: &str) -> MetricResult<Self> {
        let path = path.as_ref();
        let lines: Vec<&str> = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();

        match lines.as_slice() {
            [] => Err(MetricError::malformed(path, "no record found")),
            [line] => Ok(serde_json::from_str(line)?),
            more => Err(MetricError::malformed(
                path,
                format!("expected exactly 1 record, found {}", more.len()),
            )),
        }
    }

    /// TTFT values in milliseconds, nulls dropped
    pub fn ttfts_ms(&self) -> Vec<f64> {
        self.ttfts.iter().flatten().map(|t| t * 1000.0).collect()
    }

    /// Per-request TPOT in milliseconds: the mean inter-token latency of
    /// each request that produced more than one token
    pub fn tpots_ms(&self) -> Vec<f64> {
        self.itls
            .iter()
            .filter(|itl| !itl.is_empty())
            .map(|itl| itl.iter().sum::<f64>() / itl.len() as f64 * 1000.0)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_record() {
        let text = "\n{\"ttfts\": [0.1, 0.2], \"mean_ttft_ms\": 150.0, \"duration\": 10.0, \"completed\": 2}\n\n";
        let record = BenchRecord::parse("bench_results.jsonl", text).unwrap();
        assert_eq!(record.mean_ttft_ms, Some(150.0));
        assert_eq!(record.completed, Some(2));
        assert_eq!(record.ttfts_ms(), vec![100.0, 200.0]);
        assert_eq!(record.total_input_tokens, 0);
    }

    #[test]
    fn test_zero_and_many_records() {
        let err = BenchRecord::parse("b.jsonl", "\n  \n").unwrap_err();
        assert!(err.to_string().contains("no record found"));

        let err = BenchRecord::parse("b.jsonl", "{}\n{}\n").unwrap_err();
        assert!(err.to_string().contains("expected exactly 1 record, found 2"));
        assert!(err.is_data_error());
    }

    #[test]
    fn test_invalid_json_is_data_error() {
        let err = BenchRecord::parse("b.jsonl", "{not json").unwrap_err();
        assert!(matches!(err, MetricError::Json(_)));
        assert!(err.is_data_error());
    }

    #[test]
    fn test_tpots_skip_empty_requests() {
        let record = BenchRecord {
            itls: vec![vec![0.01, 0.03], vec![], vec![0.02]],
            ..Default::default()
        };
        let tpots = record.tpots_ms();
        assert_eq!(tpots.len(), 2);
        assert!((tpots[0] - 20.0).abs() < 1e-9);
        assert!((tpots[1] - 20.0).abs() < 1e-9);
    }
}
