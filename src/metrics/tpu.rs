//! TPU metrics from XLA profiler traces (`*.trace.json`, optionally gzipped)
//!
//! XLA traces use the Chrome trace layout. Op events carry cost-model
//! arguments: `model_flops`, `raw_bytes_accessed` / `bytes_accessed`,
//! `device_duration_ps` and `hlo_category`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde_json::Value;
use tracing::debug;

use super::MetricValue;
use crate::config::PipelineConfig;
use crate::error::{MetricError, MetricResult};
use crate::trace::{KinetoTrace, TraceDir, TraceEvent};
use crate::workload::Parallelism;

/// Communication op keys, most specific first
const COMM_KEYS: [&str; 10] = [
    "collective-permute-start",
    "collective-permute-done",
    "collective-permute",
    "reduce-scatter",
    "all-reduce",
    "all-gather",
    "all_gather",
    "all-to-all",
    "send",
    "recv",
];

/// Integer view of a cost-model argument; floats truncate, strings parse
fn arg_int(event: &TraceEvent, name: &str) -> Option<i64> {
    match event.arg(name)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
        }
        _ => None,
    }
}

fn comm_type(event: &TraceEvent) -> Option<&'static str> {
    if let Some(category) = event.arg_str("hlo_category") {
        if let Some(key) = COMM_KEYS.iter().find(|k| **k == category) {
            return Some(*key);
        }
    }
    let lower = event.name.to_ascii_lowercase();
    COMM_KEYS.iter().copied().find(|k| lower.contains(k))
}

/// Device time of an op in µs; the picosecond device duration wins over `dur`
fn op_duration_us(event: &TraceEvent) -> Option<f64> {
    event
        .arg_f64("device_duration_ps")
        .map(|ps| ps / 1e6)
        .or(event.dur)
}

fn only_trace(dir: &TraceDir) -> MetricResult<PathBuf> {
    let mut files = dir.xla_trace_files()?;
    match files.len() {
        0 => Err(MetricError::SourceNotFound(dir.path().join("*.trace.json"))),
        1 => Ok(files.remove(0)),
        n => Err(MetricError::malformed(
            dir.path(),
            format!("expected one *.trace.json[.gz], found {}", n),
        )),
    }
}

fn first_trace(dir: &TraceDir) -> MetricResult<PathBuf> {
    dir.xla_trace_files()?
        .into_iter()
        .next()
        .ok_or_else(|| MetricError::SourceNotFound(dir.path().join("*.trace.json")))
}

#[derive(Debug, Default)]
struct CommTotals {
    total_us: f64,
    count: usize,
}

/// Time spent in each kind of communication op
pub fn comm_kernel_breakdown(dir: &TraceDir, _config: &PipelineConfig) -> MetricResult<MetricValue> {
    let trace = KinetoTrace::load(only_trace(dir)?)?;

    let mut per_type: BTreeMap<&'static str, CommTotals> = BTreeMap::new();
    for event in trace.complete_events() {
        let Some(kind) = comm_type(event) else {
            continue;
        };
        let Some(us) = op_duration_us(event) else {
            continue;
        };
        let totals = per_type.entry(kind).or_default();
        totals.total_us += us;
        totals.count += 1;
    }
    if per_type.is_empty() {
        return Ok(MetricValue::not_applicable("no communication ops in the trace"));
    }

    let total_us: f64 = per_type.values().map(|t| t.total_us).sum();
    let total_events: usize = per_type.values().map(|t| t.count).sum();
    debug!(types = per_type.len(), total_events, "communication breakdown");

    let breakdown = MetricValue::table(per_type.into_iter().map(|(kind, t)| {
        (
            kind,
            MetricValue::table([
                ("total_us", MetricValue::Scalar(t.total_us)),
                ("count", MetricValue::Scalar(t.count as f64)),
                ("avg_us", MetricValue::Scalar(t.total_us / t.count as f64)),
            ]),
        )
    }));
    Ok(MetricValue::table([
        ("breakdown", breakdown),
        ("total_communication_time_us", MetricValue::Scalar(total_us)),
        ("total_events", MetricValue::Scalar(total_events as f64)),
    ]))
}

/// Cost-model totals of one XLA trace
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct XlaTraceSummary {
    /// First op start to last op end (s)
    pub wall_s: f64,
    /// Union of the intervals of ops with FLOPs (s)
    pub active_s: f64,
    pub total_bytes: u64,
    pub total_flops: u64,
}

impl XlaTraceSummary {
    pub fn from_trace(trace: &KinetoTrace) -> Self {
        let mut first_us = f64::INFINITY;
        let mut last_us = f64::NEG_INFINITY;
        let mut total_bytes = 0u64;
        let mut total_flops = 0u64;
        let mut busy: Vec<(f64, f64)> = Vec::new();

        for event in trace.events().iter().filter(|e| e.ph != "M") {
            let Some(ts) = event.ts else {
                continue;
            };
            let dur = event.dur_us();
            first_us = first_us.min(ts);
            last_us = last_us.max(ts + dur);

            let bytes = arg_int(event, "raw_bytes_accessed")
                .filter(|b| *b > 0)
                .or_else(|| arg_int(event, "bytes_accessed"));
            if let Some(b) = bytes.filter(|b| *b > 0) {
                total_bytes += b as u64;
            }
            if let Some(f) = arg_int(event, "model_flops").filter(|f| *f > 0) {
                total_flops += f as u64;
                if dur > 0.0 {
                    busy.push((ts, ts + dur));
                }
            }
        }

        let wall_s = if last_us > first_us {
            (last_us - first_us) * 1e-6
        } else {
            0.0
        };
        XlaTraceSummary {
            wall_s,
            active_s: union_length(busy) * 1e-6,
            total_bytes,
            total_flops,
        }
    }
}

/// Total length of the union of intervals
fn union_length(mut intervals: Vec<(f64, f64)>) -> f64 {
    intervals.sort_by(|a, b| a.0.total_cmp(&b.0));
    let mut total = 0.0;
    let mut current: Option<(f64, f64)> = None;
    for (s, e) in intervals {
        current = match current {
            Some((cs, ce)) if s <= ce => Some((cs, ce.max(e))),
            Some((cs, ce)) => {
                total += ce - cs;
                Some((s, e))
            }
            None => Some((s, e)),
        };
    }
    if let Some((cs, ce)) = current {
        total += ce - cs;
    }
    total
}

fn summarize(dir: &TraceDir) -> MetricResult<XlaTraceSummary> {
    let path = first_trace(dir)?;
    let summary = XlaTraceSummary::from_trace(&KinetoTrace::load(&path)?);
    debug!(trace = %path.display(), ?summary, "summarized XLA trace");
    Ok(summary)
}

/// Bytes accessed per second of wall time (GB/s)
pub fn estimated_bandwidth(dir: &TraceDir, _config: &PipelineConfig) -> MetricResult<MetricValue> {
    let summary = summarize(dir)?;
    if !(summary.wall_s > 0.0) {
        return Ok(MetricValue::not_applicable("trace has no wall time"));
    }
    Ok(MetricValue::Scalar(summary.total_bytes as f64 / 1e9 / summary.wall_s))
}

/// Model FLOPs utilization of the time ops were running, in percent
///
/// The chip count is the TP degree from the run name.
pub fn tpu_mfu(dir: &TraceDir, config: &PipelineConfig) -> MetricResult<MetricValue> {
    let summary = summarize(dir)?;
    if !(summary.active_s > 0.0) {
        return Ok(MetricValue::not_applicable("no ops with model FLOPs"));
    }
    let chips = Parallelism::from_run_name(dir.name()).tp.max(1) as f64;
    let active_tflops = summary.total_flops as f64 / 1e12 / summary.active_s;
    Ok(MetricValue::Scalar(
        active_tflops / (config.peak_tflops_per_chip * chips) * 100.0,
    ))
}
