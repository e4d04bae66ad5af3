//! Per-rank communication accounting over Kineto traces

use std::collections::BTreeMap;
use std::path::PathBuf;

use tracing::{debug, warn};

use super::{round_to, MetricValue};
use crate::config::PipelineConfig;
use crate::error::MetricResult;
use crate::trace::{KinetoTrace, TraceDir};

const ITERATION_MARKER: &str = "RedistributeBackward";

/// Parallel dimension a collective serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Window {
    Tp,
    Dp,
    Pp,
    Other,
}

fn classify(name_lower: &str, ts: f64, boundaries: &[(f64, f64)]) -> Window {
    if name_lower.contains("allreduce") {
        // Gradient all-reduce runs inside the backward redistribution
        if boundaries.iter().any(|&(s, e)| ts >= s && ts <= e) {
            Window::Dp
        } else {
            Window::Tp
        }
    } else if ["allgather", "reduce_scatter", "reducescatter", "redistribute"]
        .iter()
        .any(|k| name_lower.contains(k))
    {
        Window::Dp
    } else if name_lower.contains("send") || name_lower.contains("recv") {
        Window::Pp
    } else {
        Window::Other
    }
}

/// Communication seconds per iteration per GPU, split by parallel dimension
///
/// Iterations are delimited by the rank-0 `RedistributeBackward` CPU ops;
/// a trace without them counts as one iteration.
pub fn traffic_window(dir: &TraceDir, _config: &PipelineConfig) -> MetricResult<MetricValue> {
    let traces = dir
        .kineto_rank_files()?
        .iter()
        .map(KinetoTrace::load)
        .collect::<MetricResult<Vec<_>>>()?;
    let Some(rank0) = traces.first() else {
        return Ok(MetricValue::not_applicable("no rank traces"));
    };

    let boundaries: Vec<(f64, f64)> = rank0
        .events()
        .iter()
        .filter(|e| e.name == ITERATION_MARKER && e.cat == "cpu_op")
        .filter_map(|e| e.ts.map(|ts| (ts, ts + e.dur_us())))
        .collect();
    let iterations = boundaries.len().max(1);
    let gpus = traces.len();

    let (mut tp, mut dp, mut pp, mut other, mut total) = (0.0, 0.0, 0.0, 0.0, 0.0);
    for trace in &traces {
        for event in trace.events().iter().filter(|e| e.is_kernel()) {
            let lower = event.name.to_ascii_lowercase();
            if !lower.contains("nccl") {
                continue;
            }
            let (Some(ts), Some(dur)) = (event.ts, event.dur) else {
                continue;
            };
            let secs = dur / 1e6;
            match classify(&lower, ts, &boundaries) {
                Window::Tp => tp += secs,
                Window::Dp => dp += secs,
                Window::Pp => pp += secs,
                Window::Other => other += secs,
            }
            total += secs;
        }
    }
    debug!(iterations, gpus, total_s = total, "accumulated communication time");

    let scale = (iterations * gpus) as f64;
    let per = |v: f64| MetricValue::Scalar(round_to(v / scale, 6));
    Ok(MetricValue::table([
        ("tp_window_sec", per(tp)),
        ("dp_window_sec", per(dp)),
        ("pp_window_sec", per(pp)),
        ("other_comm_window_sec", per(other)),
        ("total_comm_window_sec", per(total)),
    ]))
}

/// Load every trace, skipping unreadable ones
fn load_all(files: &[PathBuf]) -> Vec<KinetoTrace> {
    files
        .iter()
        .filter_map(|path| match KinetoTrace::load(path) {
            Ok(trace) => Some(trace),
            Err(e) => {
                warn!(trace = %path.display(), error = %e, "skipping trace");
                None
            }
        })
        .collect()
}

/// Spread of total kernel time between the slowest and fastest rank
///
/// A rank is a `(file, pid)` pair so that single-file multi-process traces
/// and one-file-per-rank layouts both work.
pub fn straggler(dir: &TraceDir, _config: &PipelineConfig) -> MetricResult<MetricValue> {
    let files = dir.json_files()?;
    let mut per_rank: BTreeMap<String, f64> = BTreeMap::new();
    for trace in load_all(&files) {
        let file = trace.file_name();
        for event in trace.events().iter().filter(|e| e.is_kernel()) {
            let (Some(dur), Some(pid)) = (event.dur, event.pid_label()) else {
                continue;
            };
            *per_rank.entry(format!("{}:{}", file, pid)).or_default() += dur;
        }
    }

    if per_rank.len() < 2 {
        return Ok(MetricValue::not_applicable(format!(
            "need at least two ranks with kernel time, found {}",
            per_rank.len()
        )));
    }
    let min = per_rank.values().copied().fold(f64::INFINITY, f64::min);
    let max = per_rank.values().copied().fold(f64::NEG_INFINITY, f64::max);
    if !(max > 0.0) {
        return Ok(MetricValue::not_applicable("no kernel time recorded"));
    }
    debug!(ranks = per_rank.len(), min_us = min, max_us = max, "per-rank kernel time");

    let mut entries = vec![
        ("straggler_delay", MetricValue::Scalar((max - min) / max)),
        ("ranks", MetricValue::Scalar(per_rank.len() as f64)),
    ];
    entries.push((
        "straggler_slowdown",
        if min > 0.0 {
            MetricValue::Scalar(max / min)
        } else {
            MetricValue::not_applicable("fastest rank recorded no kernel time")
        },
    ));
    Ok(MetricValue::table(entries))
}
