//! NVLink utilization of tensor-parallel collectives (nsys)

use tracing::{debug, warn};

use super::MetricValue;
use crate::config::PipelineConfig;
use crate::correlate::{chain_by_correlation_id, contained_within, AsOfJoin, Correlation, Edge};
use crate::derive::{collective_utilization, sample_values, CollectiveKind, MetricSample};
use crate::error::MetricResult;
use crate::stats::{write_samples_best_effort, MetricSummary};
use crate::trace::{KernelNameColumn, MemcpyFilter, NamePattern, NsysStore, TraceDir};

const LOGITS_MARKER: &str = "%logits_processor%";
const LAUNCH_API: &str = "%cu%Launch%";
const ALLGATHER_KERNEL: &str = "%ncclDevKernel_AllGather_RING_LL%";
const CROSS_DEVICE_REDUCE_KERNEL: &str = "%cross_device_reduce__stage%";

const ALLGATHER_CSV: &str = "bandwidth_utilization_allgather.csv";
const ALLREDUCE_CSV: &str = "bandwidth_utilization_allreduce.csv";

/// Turn correlated (anchor, kernel) groups into samples, dropping the ones
/// the formula rejects
fn collect_samples(
    correlations: &[Correlation<'_>],
    payload_bytes: impl Fn(&Correlation<'_>) -> Option<u64>,
    kind: CollectiveKind,
    group_size: u32,
    peak_gbps: f64,
) -> Vec<MetricSample> {
    let mut samples = Vec::with_capacity(correlations.len());
    let mut discarded = 0usize;
    for c in correlations {
        let kernel = c.matched;
        let Some(bytes) = payload_bytes(c) else {
            discarded += 1;
            continue;
        };
        let duration_s = kernel.duration_s();
        match collective_utilization(bytes, kind, group_size, duration_s, peak_gbps) {
            Some(u) => samples.push(MetricSample {
                key: c.key,
                anchor: c.anchor.name.clone(),
                name: kernel.name.clone(),
                start_ns: kernel.start,
                end_ns: kernel.end,
                payload_bytes: bytes,
                duration_s,
                effective_bandwidth_gbps: Some(u.effective_gbps),
                value: u.utilization,
            }),
            None => discarded += 1,
        }
    }
    if discarded > 0 {
        warn!(discarded, kept = samples.len(), collective = %kind, "discarded invalid samples");
    }
    samples
}

fn finish(
    dir: &TraceDir,
    config: &PipelineConfig,
    csv_name: &str,
    samples: &[MetricSample],
    empty_reason: &str,
) -> MetricValue {
    if config.write_samples {
        write_samples_best_effort(dir.output(csv_name), samples);
    }
    MetricValue::from_summary(MetricSummary::from_values(&sample_values(samples)), empty_reason)
}

/// Utilization of the all-gather that collects the sharded logits
///
/// Kernels are attributed to the `logits_processor` NVTX range through the
/// launching runtime call: marker contains the API call on the same thread,
/// the API call and the kernel share a correlation id.
pub fn allgather_utilization(dir: &TraceDir, config: &PipelineConfig) -> MetricResult<MetricValue> {
    let card = dir.load_card()?;
    let Some(model) = card.model(&config.catalog) else {
        return Ok(MetricValue::not_applicable(format!(
            "model family '{}' is not in the catalog",
            card.model_family
        )));
    };
    if card.parallelism.tp <= 1 {
        return Ok(MetricValue::not_applicable(
            "tensor parallel degree is 1, logits are not gathered",
        ));
    }

    // The logits processor runs on the last pipeline stage
    let node = if card.is_two_node_qwen() { 1 } else { 0 };
    let store = NsysStore::open(dir.nsys_db(node))?;
    let markers = store.nvtx_markers(&NamePattern::new(LOGITS_MARKER)?)?;
    let launches = store.runtime_calls(&NamePattern::new(LAUNCH_API)?)?;
    let kernels = store.kernels(KernelNameColumn::Demangled, &NamePattern::new(ALLGATHER_KERNEL)?)?;

    let marker_launches = contained_within(&markers, &launches);
    let triples = chain_by_correlation_id(&marker_launches, &kernels);
    debug!(
        markers = markers.len(),
        launches = marker_launches.len(),
        kernels = triples.len(),
        "correlated all-gather launches"
    );

    let bytes = model.logits_bytes();
    let group_size = card.parallelism.group_size(config.default_group_size);
    let samples = collect_samples(
        &triples,
        |_| Some(bytes),
        CollectiveKind::AllGather,
        group_size,
        config.link.peak_gbps,
    );
    Ok(finish(
        dir,
        config,
        ALLGATHER_CSV,
        &samples,
        "no all-gather kernels launched inside logits markers",
    ))
}

/// Utilization of the custom all-reduce
///
/// Each device-to-device copy is matched to the first
/// `cross_device_reduce` kernel on the same device starting within the
/// copy-to-kernel tolerance after the copy ends. The copy carries one
/// rank's shard; the reduced payload is the shard times the group size.
pub fn allreduce_utilization(dir: &TraceDir, config: &PipelineConfig) -> MetricResult<MetricValue> {
    let card = dir.load_card()?;
    if card.parallelism.tp <= 1 {
        return Ok(MetricValue::not_applicable(
            "tensor parallel degree is 1, no all-reduce across devices",
        ));
    }

    let store = NsysStore::open(dir.nsys_db(0))?;
    let copies = store.memcpys(&MemcpyFilter::device_to_device())?;
    let kernels = store.kernels(
        KernelNameColumn::Short,
        &NamePattern::new(CROSS_DEVICE_REDUCE_KERNEL)?,
    )?;

    let join = AsOfJoin::forward(Edge::End, Edge::Start)
        .with_tolerance(config.memcpy_kernel_tolerance_ns);
    let pairs = join.join(&copies, &kernels);
    debug!(
        copies = copies.len(),
        kernels = kernels.len(),
        matched = pairs.len(),
        devices = copies.keys().len(),
        "matched copies to all-reduce kernels"
    );

    let group_size = card.parallelism.group_size(config.default_group_size);
    let samples = collect_samples(
        &pairs,
        |c| {
            let shard = u64::try_from(c.anchor.attr_i64("bytes")?).ok()?;
            shard.checked_mul(u64::from(group_size))
        },
        CollectiveKind::AllReduce,
        group_size,
        config.link.peak_gbps,
    );
    Ok(finish(
        dir,
        config,
        ALLREDUCE_CSV,
        &samples,
        "no device-to-device copy followed by an all-reduce kernel",
    ))
}
