//! Metric families
//!
//! Every family is a pipeline `(TraceDir, PipelineConfig) -> MetricValue`:
//! load the sources it needs, correlate, derive per-sample values and
//! aggregate. Applicability is decided from the workload card (or the
//! directory contents) before any trace is opened.
//!
//! [`evaluate`] wraps a family with the error policy: configuration errors
//! propagate, data errors become [`MetricValue::NotApplicable`] carrying the
//! diagnostic.

mod collective;
mod kernel_time;
mod kineto_bandwidth;
mod mfu;
mod nvlink;
mod serving;
mod tpu;
mod traffic;

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::ser::{Serialize, SerializeMap, Serializer};
use tracing::{error, info};

use crate::config::PipelineConfig;
use crate::error::{MetricError, MetricResult};
use crate::stats::{MetricSummary, SummaryStats};
use crate::trace::{KinetoTrace, TraceDir};

pub use collective::{allgather_utilization, allreduce_utilization};
pub use kernel_time::{classify_kernel, kernel_compute_time, KernelCategory, OperationType};
pub use kineto_bandwidth::{comm_fraction, dtype_width, kineto_allreduce_utilization};
pub use mfu::{mfu, TrainingParams};
pub use nvlink::{alltoall_nvlink, peer_to_peer_nvlink, NvlinkAggregate};
pub use serving::{throughput, tpot, ttft};
pub use tpu::{comm_kernel_breakdown, estimated_bandwidth, tpu_mfu, XlaTraceSummary};
pub use traffic::{straggler, traffic_window};

/// Result of one metric evaluation
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    /// The metric does not apply to this trace; printed as `"n/a"`
    NotApplicable { reason: String },
    Scalar(f64),
    Summary(SummaryStats),
    /// Named sub-results, printed as a JSON object
    Table(BTreeMap<String, MetricValue>),
}

impl MetricValue {
    pub fn not_applicable(reason: impl Into<String>) -> Self {
        MetricValue::NotApplicable {
            reason: reason.into(),
        }
    }

    /// Summary, or "not applicable" with `reason` for an empty sample set
    pub fn from_summary(summary: MetricSummary, reason: impl Into<String>) -> Self {
        match summary {
            MetricSummary::Stats(stats) => MetricValue::Summary(stats),
            MetricSummary::NotApplicable => MetricValue::not_applicable(reason),
        }
    }

    /// Table from `(name, value)` pairs
    pub fn table<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, MetricValue)>,
    {
        MetricValue::Table(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn is_applicable(&self) -> bool {
        !matches!(self, MetricValue::NotApplicable { .. })
    }

    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            MetricValue::Scalar(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_summary(&self) -> Option<&SummaryStats> {
        match self {
            MetricValue::Summary(s) => Some(s),
            _ => None,
        }
    }

    /// Entry of a table value
    pub fn get(&self, key: &str) -> Option<&MetricValue> {
        match self {
            MetricValue::Table(entries) => entries.get(key),
            _ => None,
        }
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Scalar(v)
    }
}

impl Serialize for MetricValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            MetricValue::NotApplicable { .. } => serializer.serialize_str("n/a"),
            MetricValue::Scalar(v) => serializer.serialize_f64(*v),
            MetricValue::Summary(stats) => stats.serialize(serializer),
            MetricValue::Table(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (k, v) in entries {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(s) => f.write_str(&s),
            Err(_) => f.write_str("n/a"),
        }
    }
}

/// Known metric families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Metric {
    AllGatherUtilization,
    AllReduceUtilization,
    AllToAllNvlink,
    PeerToPeerNvlink,
    KinetoAllReduceUtilization,
    CommFraction,
    KernelComputeTime,
    TrafficWindow,
    Straggler,
    Ttft,
    Tpot,
    Throughput,
    CommKernelBreakdown,
    EstimatedBandwidth,
    TpuMfu,
    Mfu,
}

type Pipeline = fn(&TraceDir, &PipelineConfig) -> MetricResult<MetricValue>;

impl Metric {
    pub const ALL: [Metric; 16] = [
        Metric::AllGatherUtilization,
        Metric::AllReduceUtilization,
        Metric::AllToAllNvlink,
        Metric::PeerToPeerNvlink,
        Metric::KinetoAllReduceUtilization,
        Metric::CommFraction,
        Metric::KernelComputeTime,
        Metric::TrafficWindow,
        Metric::Straggler,
        Metric::Ttft,
        Metric::Tpot,
        Metric::Throughput,
        Metric::CommKernelBreakdown,
        Metric::EstimatedBandwidth,
        Metric::TpuMfu,
        Metric::Mfu,
    ];

    /// CLI name
    pub fn name(self) -> &'static str {
        match self {
            Metric::AllGatherUtilization => "allgather-utilization",
            Metric::AllReduceUtilization => "allreduce-utilization",
            Metric::AllToAllNvlink => "alltoall-nvlink",
            Metric::PeerToPeerNvlink => "peer-to-peer-nvlink",
            Metric::KinetoAllReduceUtilization => "kineto-allreduce-utilization",
            Metric::CommFraction => "comm-fraction",
            Metric::KernelComputeTime => "kernel-compute-time",
            Metric::TrafficWindow => "traffic-window",
            Metric::Straggler => "straggler",
            Metric::Ttft => "ttft",
            Metric::Tpot => "tpot",
            Metric::Throughput => "throughput",
            Metric::CommKernelBreakdown => "comm-kernel-breakdown",
            Metric::EstimatedBandwidth => "estimated-bandwidth",
            Metric::TpuMfu => "tpu-mfu",
            Metric::Mfu => "mfu",
        }
    }

    /// One-line description for `--list`
    pub fn description(self) -> &'static str {
        match self {
            Metric::AllGatherUtilization => "NVLink utilization of the logits all-gather (nsys)",
            Metric::AllReduceUtilization => "NVLink utilization of the custom all-reduce (nsys)",
            Metric::AllToAllNvlink => "NVLink throughput during MoE all-to-all windows (nsys)",
            Metric::PeerToPeerNvlink => "NVLink/PCIe throughput of pipeline stages (nsys)",
            Metric::KinetoAllReduceUtilization => "NCCL all-reduce expected/observed time (Kineto)",
            Metric::CommFraction => "share of GPU kernel time spent in NCCL (Kineto)",
            Metric::KernelComputeTime => "communication vs compute kernel time (nsys)",
            Metric::TrafficWindow => "communication seconds per iteration per GPU (Kineto)",
            Metric::Straggler => "slowest vs fastest rank kernel time (Kineto)",
            Metric::Ttft => "time to first token (benchmark results)",
            Metric::Tpot => "time per output token (benchmark results)",
            Metric::Throughput => "requests and tokens per second (benchmark results)",
            Metric::CommKernelBreakdown => "communication op time by type (XLA trace)",
            Metric::EstimatedBandwidth => "bytes accessed over wall time (XLA trace)",
            Metric::TpuMfu => "model FLOPs utilization of active time (XLA trace)",
            Metric::Mfu => "model FLOPs utilization per iteration (Kineto)",
        }
    }

    /// Parse a CLI name; underscores are accepted in place of dashes
    pub fn from_name(name: &str) -> MetricResult<Self> {
        let normalized = name.trim().replace('_', "-");
        Metric::ALL
            .iter()
            .copied()
            .find(|m| m.name() == normalized)
            .ok_or_else(|| MetricError::UnknownMetric(name.to_string()))
    }

    fn pipeline(self) -> Pipeline {
        match self {
            Metric::AllGatherUtilization => allgather_utilization,
            Metric::AllReduceUtilization => allreduce_utilization,
            Metric::AllToAllNvlink => alltoall_nvlink,
            Metric::PeerToPeerNvlink => peer_to_peer_nvlink,
            Metric::KinetoAllReduceUtilization => kineto_allreduce_utilization,
            Metric::CommFraction => comm_fraction,
            Metric::KernelComputeTime => kernel_compute_time,
            Metric::TrafficWindow => traffic_window,
            Metric::Straggler => straggler,
            Metric::Ttft => ttft,
            Metric::Tpot => tpot,
            Metric::Throughput => throughput,
            Metric::CommKernelBreakdown => comm_kernel_breakdown,
            Metric::EstimatedBandwidth => estimated_bandwidth,
            Metric::TpuMfu => tpu_mfu,
            Metric::Mfu => mfu,
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Metric {
    type Err = MetricError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Metric::from_name(s)
    }
}

/// Evaluate one metric on one trace directory
///
/// Data errors (missing files or tables, malformed traces) are logged and
/// reported as "not applicable" with the diagnostic as the reason.
/// Configuration and internal errors propagate.
pub fn evaluate(
    metric: Metric,
    dir: impl AsRef<Path>,
    config: &PipelineConfig,
) -> MetricResult<MetricValue> {
    config.validate()?;
    let dir = dir.as_ref();
    let span = tracing::info_span!("metric", metric = metric.name(), trace = %dir.display());
    let _enter = span.enter();

    let result = TraceDir::new(dir).and_then(|trace| (metric.pipeline())(&trace, config));
    match result {
        Ok(value) => {
            info!(applicable = value.is_applicable(), "metric evaluated");
            Ok(value)
        }
        Err(e) if e.is_data_error() => {
            error!(error = %e, "metric not computable from this trace");
            Ok(MetricValue::not_applicable(e.to_string()))
        }
        Err(e) => Err(e),
    }
}

/// First Kineto rank trace (rank 0)
pub(crate) fn load_rank_zero(dir: &TraceDir) -> MetricResult<KinetoTrace> {
    match dir.kineto_rank_files()?.first() {
        Some(first) => KinetoTrace::load(first),
        None => Err(MetricError::SourceNotFound(dir.path().to_path_buf())),
    }
}

/// Round to `digits` decimal places
pub(crate) fn round_to(value: f64, digits: i32) -> f64 {
    let scale = 10f64.powi(digits);
    (value * scale).round() / scale
}
