//! Communication versus compute kernel time (nsys)

use std::collections::BTreeMap;

use tracing::debug;

use super::MetricValue;
use crate::config::PipelineConfig;
use crate::derive::CollectiveKind;
use crate::error::{MetricError, MetricResult};
use crate::trace::{EventStream, KernelNameColumn, NamePattern, NsysStore, TraceDir};

/// Broad kernel category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KernelCategory {
    Communication,
    Compute,
}

/// Operation a kernel implements, recognized from its short name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OperationType {
    Collective(CollectiveKind),
    NcclOther,
    CrossDeviceReduce,
    ExpertMoe,
    Attention,
    Gemm,
    Normalization,
    Activation,
    Elementwise,
    Memory,
    Reduce,
    Other,
}

impl OperationType {
    pub fn category(self) -> KernelCategory {
        match self {
            OperationType::Collective(_)
            | OperationType::NcclOther
            | OperationType::CrossDeviceReduce => KernelCategory::Communication,
            _ => KernelCategory::Compute,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperationType::Collective(kind) => kind.as_str(),
            OperationType::NcclOther => "NCCL_Other",
            OperationType::CrossDeviceReduce => "CrossDeviceReduce",
            OperationType::ExpertMoe => "Expert_MoE",
            OperationType::Attention => "Attention",
            OperationType::Gemm => "GEMM",
            OperationType::Normalization => "Normalization",
            OperationType::Activation => "Activation",
            OperationType::Elementwise => "Elementwise",
            OperationType::Memory => "Memory",
            OperationType::Reduce => "Reduce",
            OperationType::Other => "Other",
        }
    }
}

const MOE_PATTERNS: [&str; 6] = [
    "fused_moe_kernel",
    "moe_align_block_size",
    "moe_sum_reduce",
    "gathertopk",
    "topk",
    "expert",
];

const ATTENTION_PATTERNS: [&str; 6] = [
    "attention",
    "flash",
    "_fwd_kernel",
    "_fwd_grouped_kernel",
    "batchqkapplyrotary",
    "flashinfer",
];

/// Classify a kernel by its short name; first matching rule wins
pub fn classify_kernel(name: &str) -> OperationType {
    let lower = name.to_ascii_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if lower.contains("nccl") {
        return CollectiveKind::from_kernel_name(&lower)
            .map_or(OperationType::NcclOther, OperationType::Collective);
    }
    if lower.contains("cross_device_reduce") {
        return OperationType::CrossDeviceReduce;
    }
    if has(&MOE_PATTERNS) {
        return OperationType::ExpertMoe;
    }
    if has(&ATTENTION_PATTERNS) {
        return OperationType::Attention;
    }
    if has(&["gemm", "gemv"]) {
        return OperationType::Gemm;
    }
    if lower.contains("norm") {
        return OperationType::Normalization;
    }
    if has(&["act_and_mul", "activation"]) {
        return OperationType::Activation;
    }
    if has(&["elementwise", "triton_poi", "triton_red"]) {
        return OperationType::Elementwise;
    }
    if has(&["copy", "cat", "index", "scatter", "gather"]) {
        return OperationType::Memory;
    }
    if lower.contains("reduce") {
        return OperationType::Reduce;
    }
    OperationType::Other
}

#[derive(Debug, Default)]
struct OpTotals {
    count: usize,
    time_ns: i64,
}

/// Kernel time breakdown of one nsys export
fn breakdown(kernels: &EventStream) -> Option<Vec<(String, MetricValue)>> {
    let span = kernels.span()?;
    let trace_s = span.duration_ns() as f64 / 1e9;

    let mut comm_ns = 0i64;
    let mut compute_ns = 0i64;
    let mut comm_ops: BTreeMap<OperationType, OpTotals> = BTreeMap::new();
    for kernel in kernels {
        let op = classify_kernel(&kernel.name);
        let d = kernel.duration_ns();
        match op.category() {
            KernelCategory::Communication => {
                comm_ns += d;
                let totals = comm_ops.entry(op).or_default();
                totals.count += 1;
                totals.time_ns += d;
            }
            KernelCategory::Compute => compute_ns += d,
        }
    }

    let comm_s = comm_ns as f64 / 1e9;
    let compute_s = compute_ns as f64 / 1e9;
    let comm_count: usize = comm_ops.values().map(|t| t.count).sum();
    let ratio = if compute_ns > 0 {
        MetricValue::Scalar(comm_s / compute_s)
    } else {
        MetricValue::not_applicable("no compute kernels")
    };
    let per_second = if trace_s > 0.0 {
        MetricValue::Scalar(comm_count as f64 / trace_s)
    } else {
        MetricValue::not_applicable("zero-length trace")
    };

    let mut entries = vec![
        ("total_communication_time_s".to_string(), MetricValue::Scalar(comm_s)),
        ("total_compute_time_s".to_string(), MetricValue::Scalar(compute_s)),
        ("comm_to_compute_ratio".to_string(), ratio),
        ("comm_operations_count".to_string(), MetricValue::Scalar(comm_count as f64)),
        ("comm_ops_per_second".to_string(), per_second),
        ("trace_duration_s".to_string(), MetricValue::Scalar(trace_s)),
        ("num_gpus".to_string(), MetricValue::Scalar(kernels.keys().len() as f64)),
    ];
    for (op, totals) in comm_ops {
        entries.push((format!("{}_count", op.as_str()), MetricValue::Scalar(totals.count as f64)));
        entries.push((
            format!("{}_time_s", op.as_str()),
            MetricValue::Scalar(totals.time_ns as f64 / 1e9),
        ));
    }
    Some(entries)
}

/// Communication and compute kernel time over the whole export
///
/// Qwen split over two pipeline stages reports both nodes with `(Node i)`
/// prefixed keys.
pub fn kernel_compute_time(dir: &TraceDir, config: &PipelineConfig) -> MetricResult<MetricValue> {
    let card = dir.load_card()?;
    if !config.catalog.contains(&card.model_family) {
        return Ok(MetricValue::not_applicable(format!(
            "model family '{}' is not in the catalog",
            card.model_family
        )));
    }

    let nodes: &[u32] = if card.is_two_node_qwen() { &[0, 1] } else { &[0] };
    let mut entries = Vec::new();
    for &node in nodes {
        let path = dir.nsys_db(node);
        let store = NsysStore::open(&path)?;
        let kernels = store.kernels(KernelNameColumn::Short, &NamePattern::any())?;
        let Some(node_entries) = breakdown(&kernels) else {
            return Err(MetricError::malformed(path, "no kernels recorded"));
        };
        debug!(node, kernels = kernels.len(), "classified kernels");

        let prefix = if nodes.len() > 1 {
            format!("(Node {}) ", node)
        } else {
            String::new()
        };
        entries.extend(
            node_entries
                .into_iter()
                .map(|(k, v)| (format!("{}{}", prefix, k), v)),
        );
    }
    Ok(MetricValue::table(entries))
}
