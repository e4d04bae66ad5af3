//! Collective metrics from PyTorch profiler (Kineto) traces

use tracing::{debug, warn};

use super::{load_rank_zero, MetricValue};
use crate::config::PipelineConfig;
use crate::derive::{expected_transfer_time, time_ratio_utilization};
use crate::error::MetricResult;
use crate::stats::MetricSummary;
use crate::trace::{TraceDir, TraceEvent};

const ALLREDUCE_PREFIX: &str = "ncclDevKernel_AllReduce";

const NCCL_PREFIXES: [&str; 6] = [
    "ncclDevKernel_AllReduce",
    "ncclDevKernel_ReduceScatter",
    "ncclDevKernel_AllGather",
    "ncclDevKernel_Broadcast",
    "ncclDevKernel_Reduce",
    "ncclDevKernel_SendRecv",
];

/// Element width in bytes of a profiler dtype name
pub fn dtype_width(dtype: &str) -> Option<u64> {
    match dtype {
        "Float" | "Float32" => Some(4),
        "Double" | "Float64" => Some(8),
        "Half" | "Float16" | "BFloat16" | "BF16" => Some(2),
        _ => None,
    }
}

/// Payload bytes and group size of an all-reduce kernel from its args
fn allreduce_shape(event: &TraceEvent) -> Option<(u64, u32)> {
    let nelems = event.arg_f64("In msg nelems")?;
    if !(nelems > 0.0) {
        return None;
    }
    let width = dtype_width(event.arg_str("dtype")?)?;
    let group = event.arg_f64("Group size")?;
    if !(group >= 1.0) {
        return None;
    }
    Some((nelems as u64 * width, group as u32))
}

/// Expected over observed time of each NCCL all-reduce kernel on rank 0
///
/// The expected time follows the ring model with the configured Kineto
/// link. Kernels with missing or unknown args are skipped.
pub fn kineto_allreduce_utilization(
    dir: &TraceDir,
    config: &PipelineConfig,
) -> MetricResult<MetricValue> {
    let trace = load_rank_zero(dir)?;
    let link = &config.kineto_link;

    let mut values = Vec::new();
    let mut skipped = 0usize;
    for event in trace
        .kernels()
        .filter(|e| e.name.starts_with(ALLREDUCE_PREFIX))
    {
        let ratio = allreduce_shape(event).and_then(|(bytes, n)| {
            let expected = expected_transfer_time(bytes, n, link.latency_s, link.peak_bytes_per_s())?;
            time_ratio_utilization(expected, event.dur_us() / 1e6)
        });
        match ratio {
            Some(r) => values.push(r),
            None => skipped += 1,
        }
    }
    if skipped > 0 {
        warn!(skipped, kept = values.len(), trace = %trace.file_name(), "skipped all-reduce kernels");
    }

    Ok(MetricValue::from_summary(
        MetricSummary::from_values(&values),
        "no NCCL all-reduce kernels with message size, dtype and group size",
    ))
}

/// Share of rank-0 kernel time spent in NCCL collectives
pub fn comm_fraction(dir: &TraceDir, _config: &PipelineConfig) -> MetricResult<MetricValue> {
    let trace = load_rank_zero(dir)?;

    let (mut comm_us, mut compute_us) = (0.0, 0.0);
    for event in trace.kernels().filter(|e| e.dur_us() > 0.0) {
        if NCCL_PREFIXES.iter().any(|p| event.name.starts_with(p)) {
            comm_us += event.dur_us();
        } else {
            compute_us += event.dur_us();
        }
    }
    debug!(comm_us, compute_us, trace = %trace.file_name(), "kernel time split");

    let total = comm_us + compute_us;
    if total <= 0.0 {
        return Ok(MetricValue::not_applicable("no kernel time in the trace"));
    }
    Ok(MetricValue::Scalar(comm_us / total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(args: serde_json::Value) -> TraceEvent {
        TraceEvent::from_value(&json!({
            "name": "ncclDevKernel_AllReduce_Sum_f32_RING_LL",
            "ph": "X",
            "cat": "kernel",
            "ts": 0,
            "dur": 30,
            "args": args,
        }))
        .unwrap()
    }

    #[test]
    fn test_dtype_widths() {
        assert_eq!(dtype_width("Float"), Some(4));
        assert_eq!(dtype_width("Float64"), Some(8));
        assert_eq!(dtype_width("BFloat16"), Some(2));
        assert_eq!(dtype_width("Int8"), None);
    }

    #[test]
    fn test_allreduce_shape() {
        let e = event(json!({"In msg nelems": 1_000_000, "dtype": "Float", "Group size": 4}));
        assert_eq!(allreduce_shape(&e), Some((4_000_000, 4)));

        let e = event(json!({"In msg nelems": 0, "dtype": "Float", "Group size": 4}));
        assert_eq!(allreduce_shape(&e), None);

        let e = event(json!({"In msg nelems": 10, "dtype": "Int8", "Group size": 4}));
        assert_eq!(allreduce_shape(&e), None);

        let e = event(json!({"In msg nelems": 10, "dtype": "Float"}));
        assert_eq!(allreduce_shape(&e), None);
    }
}
