//! Serving latency and throughput from the benchmark results record

use tracing::{debug, warn};

use super::MetricValue;
use crate::config::PipelineConfig;
use crate::error::{MetricError, MetricResult};
use crate::stats::{mean, population_std};
use crate::trace::{BenchRecord, TraceDir};

/// Agreement required between recomputed and recorded TPOT statistics (ms)
const TPOT_TOLERANCE_MS: f64 = 1e-4;

fn load(dir: &TraceDir) -> MetricResult<BenchRecord> {
    BenchRecord::load(dir.bench_results())
}

fn required(dir: &TraceDir, field: &str, value: Option<f64>) -> MetricResult<MetricValue> {
    value
        .map(MetricValue::Scalar)
        .ok_or_else(|| MetricError::malformed(dir.bench_results(), format!("missing field '{}'", field)))
}

/// Time to first token, as recorded by the benchmark client
pub fn ttft(dir: &TraceDir, _config: &PipelineConfig) -> MetricResult<MetricValue> {
    let record = load(dir)?;
    debug!(requests = record.ttfts_ms().len(), "loaded TTFT values");
    Ok(MetricValue::table([
        ("mean_ttft_ms", required(dir, "mean_ttft_ms", record.mean_ttft_ms)?),
        ("median_ttft_ms", required(dir, "median_ttft_ms", record.median_ttft_ms)?),
        ("std_ttft_ms", required(dir, "std_ttft_ms", record.std_ttft_ms)?),
        ("p99_ttft_ms", required(dir, "p99_ttft_ms", record.p99_ttft_ms)?),
    ]))
}

/// Time per output token
///
/// Per-request TPOT is recomputed from the inter-token latencies and
/// checked against the recorded statistics; the recorded values are
/// returned.
pub fn tpot(dir: &TraceDir, _config: &PipelineConfig) -> MetricResult<MetricValue> {
    let record = load(dir)?;
    let tpots = record.tpots_ms();

    let checks = [
        ("mean", mean(&tpots), record.mean_tpot_ms),
        ("std", population_std(&tpots), record.std_tpot_ms),
    ];
    for (stat, computed, recorded) in checks {
        if let (Some(computed), Some(recorded)) = (computed, recorded) {
            if (computed - recorded).abs() > TPOT_TOLERANCE_MS {
                warn!(stat, computed, recorded, "recomputed TPOT disagrees with the record");
            }
        }
    }

    Ok(MetricValue::table([
        ("mean_tpot_ms", required(dir, "mean_tpot_ms", record.mean_tpot_ms)?),
        ("median_tpot_ms", required(dir, "median_tpot_ms", record.median_tpot_ms)?),
        ("std_tpot_ms", required(dir, "std_tpot_ms", record.std_tpot_ms)?),
        ("p99_tpot_ms", required(dir, "p99_tpot_ms", record.p99_tpot_ms)?),
    ]))
}

/// Requests and tokens per second over the benchmark duration
pub fn throughput(dir: &TraceDir, _config: &PipelineConfig) -> MetricResult<MetricValue> {
    let record = load(dir)?;
    let duration = record.duration.unwrap_or(0.0);
    if !(duration > 0.0) {
        return Ok(MetricValue::not_applicable("benchmark duration is not positive"));
    }
    let completed = record
        .completed
        .ok_or_else(|| MetricError::malformed(dir.bench_results(), "missing field 'completed'"))?;

    let input = record.total_input_tokens as f64;
    let output = record.total_output_tokens as f64;
    let mut entries = vec![
        ("duration_s", MetricValue::Scalar(duration)),
        ("completed", MetricValue::Scalar(completed as f64)),
        ("requests_per_sec", MetricValue::Scalar(completed as f64 / duration)),
        ("input_tokens_per_sec", MetricValue::Scalar(input / duration)),
        ("output_tokens_per_sec", MetricValue::Scalar(output / duration)),
        ("total_tokens_per_sec", MetricValue::Scalar((input + output) / duration)),
    ];
    if let Some(v) = record.request_throughput {
        entries.push(("json_request_throughput", MetricValue::Scalar(v)));
    }
    if let Some(v) = record.total_throughput {
        entries.push(("json_total_throughput", MetricValue::Scalar(v)));
    }
    Ok(MetricValue::table(entries))
}
