//! Per-sample metric derivation
//!
//! Two formulas turn a correlated group of events into a utilization value:
//!
//! - collective bandwidth utilization: payload (GiB) scaled by the
//!   algorithm's topology factor, divided by the observed duration and the
//!   peak link bandwidth
//! - expected-vs-observed time: the ring model
//!   `T_exp = alpha (n-1) + (S/n)(n-1)/B` divided by the observed time
//!
//! Both return `None` for a sample that cannot be evaluated (non-positive
//! duration, empty group, non-finite result); callers drop such samples.

use serde::Serialize;

/// Bytes per GiB
pub const GIB: f64 = 1_073_741_824.0;

/// Collective algorithm, deciding the topology factor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum CollectiveKind {
    AllGather,
    ReduceScatter,
    AllToAll,
    AllReduce,
    Broadcast,
    SendRecv,
}

impl CollectiveKind {
    /// Fraction of the payload each rank moves over the link for a group
    /// of `n` ranks
    pub fn topology_factor(self, n: u32) -> f64 {
        let n = n as f64;
        match self {
            CollectiveKind::AllGather
            | CollectiveKind::ReduceScatter
            | CollectiveKind::AllToAll => (n - 1.0) / n,
            CollectiveKind::AllReduce => 2.0 * (n - 1.0) / n,
            CollectiveKind::Broadcast | CollectiveKind::SendRecv => 1.0,
        }
    }

    /// Recognize an NCCL kernel name such as `ncclDevKernel_AllGather_RING_LL`
    pub fn from_kernel_name(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));
        if has(&["reducescatter", "reduce_scatter"]) {
            Some(CollectiveKind::ReduceScatter)
        } else if has(&["allgather", "all_gather"]) {
            Some(CollectiveKind::AllGather)
        } else if has(&["allreduce", "all_reduce"]) {
            Some(CollectiveKind::AllReduce)
        } else if has(&["alltoall", "all_to_all"]) {
            Some(CollectiveKind::AllToAll)
        } else if has(&["broadcast"]) {
            Some(CollectiveKind::Broadcast)
        } else if lower.contains("sendrecv")
            || lower
                .split(|c: char| !c.is_ascii_alphanumeric())
                .any(|token| token == "send" || token == "recv")
        {
            Some(CollectiveKind::SendRecv)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CollectiveKind::AllGather => "AllGather",
            CollectiveKind::ReduceScatter => "ReduceScatter",
            CollectiveKind::AllToAll => "AllToAll",
            CollectiveKind::AllReduce => "AllReduce",
            CollectiveKind::Broadcast => "Broadcast",
            CollectiveKind::SendRecv => "SendRecv",
        }
    }
}

impl std::fmt::Display for CollectiveKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bandwidth achieved by one collective
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Utilization {
    /// Effective bandwidth in GiB-scaled GB/s
    pub effective_gbps: f64,
    /// `effective_gbps / peak_gbps`
    pub utilization: f64,
}

/// Collective bandwidth utilization
///
/// `effective = bytes / 2^30 * factor(kind, n) / duration_s`,
/// `utilization = effective / peak_gbps`.
pub fn collective_utilization(
    bytes: u64,
    kind: CollectiveKind,
    n: u32,
    duration_s: f64,
    peak_gbps: f64,
) -> Option<Utilization> {
    if n == 0 || !(duration_s > 0.0) || !(peak_gbps > 0.0) {
        return None;
    }
    let payload_gib = bytes as f64 / GIB;
    let effective_gbps = payload_gib * kind.topology_factor(n) / duration_s;
    let utilization = effective_gbps / peak_gbps;
    (effective_gbps.is_finite() && utilization.is_finite()).then_some(Utilization {
        effective_gbps,
        utilization,
    })
}

/// Ring-model transfer time in seconds for `bytes` over a group of `n`
pub fn expected_transfer_time(
    bytes: u64,
    n: u32,
    latency_s: f64,
    peak_bytes_per_s: f64,
) -> Option<f64> {
    if n <= 1 || !(peak_bytes_per_s > 0.0) {
        return None;
    }
    let hops = (n - 1) as f64;
    let t = latency_s * hops + (bytes as f64 / n as f64) * hops / peak_bytes_per_s;
    (t.is_finite() && t > 0.0).then_some(t)
}

/// `expected / observed`, `None` when either time is non-positive
pub fn time_ratio_utilization(expected_s: f64, observed_s: f64) -> Option<f64> {
    if !(expected_s > 0.0) || !(observed_s > 0.0) {
        return None;
    }
    let ratio = expected_s / observed_s;
    ratio.is_finite().then_some(ratio)
}

/// One derived value, written as one CSV row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSample {
    /// Partition key (device id, thread id)
    pub key: i64,
    /// Name of the anchoring event (marker, copy)
    pub anchor: String,
    /// Name of the measured event (kernel)
    pub name: String,
    pub start_ns: i64,
    pub end_ns: i64,
    pub payload_bytes: u64,
    pub duration_s: f64,
    pub effective_bandwidth_gbps: Option<f64>,
    pub value: f64,
}

/// Values of a sample set, in order
pub fn sample_values(samples: &[MetricSample]) -> Vec<f64> {
    samples.iter().map(|s| s.value).collect()
}
