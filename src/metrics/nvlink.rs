//! NVLink and PCIe throughput sampled by the GPU metrics collector (nsys)
//!
//! Samples are aggregated per metric name over a set of time windows:
//! min, max and mean of all samples, of the non-zero samples and of the
//! samples above 1 %. The last two filter out idle periods.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;

use super::MetricValue;
use crate::config::PipelineConfig;
use crate::correlate::{AsOfJoin, Edge};
use crate::error::MetricResult;
use crate::stats::write_samples_best_effort;
use crate::trace::{EventStream, KernelNameColumn, NamePattern, NsysStore, TimeWindow, TraceDir};

const SPLITK_KERNEL: &str = "%splitKreduce%";
const MOE_SUM_KERNEL: &str = "%moe_sum_reduce_warp%";

const NVLINK_RX: &str = "NVLink RX Responses User Data [Throughput %]";
const NVLINK_TX: &str = "NVLink TX Responses User Data [Throughput %]";
const PCIE_RX: &str = "PCIe RX Throughput [Throughput %]";
const PCIE_TX: &str = "PCIe TX Throughput [Throughput %]";

const ALLTOALL_CSV: &str = "bandwidth_utilization_alltoall_0.csv";

/// Per-metric aggregate, one CSV row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NvlinkAggregate {
    pub metric_name: String,
    pub min_val: f64,
    pub max_val: f64,
    pub avg_val: f64,
    pub min_no_zero: Option<f64>,
    pub avg_no_zero: Option<f64>,
    pub cnt_no_zero: usize,
    pub min_gt_one: Option<f64>,
    pub avg_gt_one: Option<f64>,
    pub cnt_gt_one: usize,
}

#[derive(Debug, Default)]
struct Filtered {
    min: Option<f64>,
    sum: f64,
    count: usize,
}

impl Filtered {
    fn push(&mut self, v: f64) {
        self.min = Some(self.min.map_or(v, |m| m.min(v)));
        self.sum += v;
        self.count += 1;
    }

    fn avg(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

#[derive(Debug, Default)]
struct Accumulator {
    all: Filtered,
    max: f64,
    no_zero: Filtered,
    gt_one: Filtered,
}

impl Accumulator {
    fn push(&mut self, v: f64) {
        if self.all.count == 0 || v > self.max {
            self.max = v;
        }
        self.all.push(v);
        if v != 0.0 {
            self.no_zero.push(v);
        }
        if v > 1.0 {
            self.gt_one.push(v);
        }
    }

    fn finish(self, metric_name: String) -> NvlinkAggregate {
        NvlinkAggregate {
            metric_name,
            min_val: self.all.min.unwrap_or(0.0),
            max_val: self.max,
            avg_val: self.all.avg().unwrap_or(0.0),
            min_no_zero: self.no_zero.min,
            avg_no_zero: self.no_zero.avg(),
            cnt_no_zero: self.no_zero.count,
            min_gt_one: self.gt_one.min,
            avg_gt_one: self.gt_one.avg(),
            cnt_gt_one: self.gt_one.count,
        }
    }
}

/// Merge overlapping windows; the result is sorted and disjoint
fn merge_windows(mut windows: Vec<TimeWindow>) -> Vec<TimeWindow> {
    windows.sort_by_key(|w| (w.start, w.end));
    let mut merged: Vec<TimeWindow> = Vec::with_capacity(windows.len());
    for w in windows {
        match merged.last_mut() {
            Some(last) if w.start <= last.end => last.end = last.end.max(w.end),
            _ => merged.push(w),
        }
    }
    merged
}

fn in_any(windows: &[TimeWindow], at: i64) -> bool {
    let pos = windows.partition_point(|w| w.end < at);
    windows.get(pos).is_some_and(|w| w.contains_instant(at))
}

/// Aggregate samples per metric name
///
/// With `windows`, only samples inside a window of their own device count;
/// a sample covered by several overlapping windows counts once.
fn aggregate(
    samples: &EventStream,
    windows: Option<&BTreeMap<i64, Vec<TimeWindow>>>,
) -> Vec<NvlinkAggregate> {
    let mut per_metric: BTreeMap<&str, Accumulator> = BTreeMap::new();
    for sample in samples {
        if let Some(windows) = windows {
            let inside = windows
                .get(&sample.key)
                .is_some_and(|w| in_any(w, sample.start));
            if !inside {
                continue;
            }
        }
        let Some(value) = sample.attr_f64("value") else {
            continue;
        };
        per_metric.entry(sample.name.as_str()).or_default().push(value);
    }
    per_metric
        .into_iter()
        .map(|(name, acc)| acc.finish(name.to_string()))
        .collect()
}

/// Headline values of one aggregate; missing filtered values read as 0
fn summary_entries(agg: &NvlinkAggregate, prefix: &str) -> Vec<(String, MetricValue)> {
    let field = |label: &str, v: f64| (format!("{}{} {}", prefix, agg.metric_name, label), MetricValue::Scalar(v));
    vec![
        field("avg_val", agg.avg_val),
        field("max_val", agg.max_val),
        field("avg_gt_one", agg.avg_gt_one.unwrap_or(0.0)),
        field("cnt_gt_one", agg.cnt_gt_one as f64),
        field("min_gt_one", agg.min_gt_one.unwrap_or(0.0)),
    ]
}

fn headline_table(aggregates: &[NvlinkAggregate], wanted: &[&str], prefix: &str) -> Vec<(String, MetricValue)> {
    aggregates
        .iter()
        .filter(|a| wanted.contains(&a.metric_name.as_str()))
        .flat_map(|a| summary_entries(a, prefix))
        .collect()
}

/// NVLink throughput during MoE all-to-all exchanges
///
/// An exchange window opens at a `splitKreduce` kernel and closes at the
/// end of the next `moe_sum_reduce_warp` kernel on the same device.
pub fn alltoall_nvlink(dir: &TraceDir, config: &PipelineConfig) -> MetricResult<MetricValue> {
    let card = dir.load_card()?;
    let is_moe = card.model(&config.catalog).is_some_and(|m| m.has_experts);
    if !is_moe {
        return Ok(MetricValue::not_applicable(format!(
            "model family '{}' has no experts",
            card.model_family
        )));
    }

    let store = NsysStore::open(dir.nsys_db(0))?;
    let Some(span) = store.nvtx_span()? else {
        return Ok(MetricValue::not_applicable("no NVTX ranges bound the run"));
    };
    let split = store
        .kernels(KernelNameColumn::Short, &NamePattern::new(SPLITK_KERNEL)?)?
        .within(span);
    let moe = store
        .kernels(KernelNameColumn::Short, &NamePattern::new(MOE_SUM_KERNEL)?)?
        .within(span);

    let pairs = AsOfJoin::backward(Edge::Start, Edge::End)
        .unbounded()
        .join(&moe, &split);
    let mut windows: BTreeMap<i64, Vec<TimeWindow>> = BTreeMap::new();
    for c in &pairs {
        // anchor = moe kernel, matched = preceding split kernel
        windows
            .entry(c.key)
            .or_default()
            .push(TimeWindow::new(c.matched.start, c.anchor.end));
    }
    let windows: BTreeMap<i64, Vec<TimeWindow>> = windows
        .into_iter()
        .map(|(k, w)| (k, merge_windows(w)))
        .collect();
    debug!(
        split = split.len(),
        moe = moe.len(),
        windows = pairs.len(),
        "built all-to-all windows"
    );

    let samples = store.gpu_metric_samples(&NamePattern::contains("NVLink")?, Some(span))?;
    let aggregates = aggregate(&samples, Some(&windows));
    if config.write_samples {
        write_samples_best_effort(dir.output(ALLTOALL_CSV), &aggregates);
    }

    let entries = headline_table(&aggregates, &[NVLINK_RX, NVLINK_TX], "");
    if entries.is_empty() {
        return Ok(MetricValue::not_applicable(
            "no NVLink samples inside all-to-all windows",
        ));
    }
    Ok(MetricValue::table(entries))
}

fn stage_aggregates(store: &NsysStore) -> MetricResult<Option<Vec<NvlinkAggregate>>> {
    let Some(span) = store.nvtx_span()? else {
        return Ok(None);
    };
    let mut aggregates = Vec::new();
    for needle in ["NVLink", "PCIe"] {
        let samples = store.gpu_metric_samples(&NamePattern::contains(needle)?, Some(span))?;
        aggregates.extend(aggregate(&samples, None));
    }
    Ok(Some(aggregates))
}

/// NVLink and PCIe throughput between pipeline stages
///
/// Aggregated over the whole NVTX span of each node. With two pipeline
/// stages the second node is read too, when its export is present, and
/// keys carry a `(Node i)` prefix.
pub fn peer_to_peer_nvlink(dir: &TraceDir, config: &PipelineConfig) -> MetricResult<MetricValue> {
    let card = dir.load_card()?;
    if card.parallelism.pp <= 1 {
        return Ok(MetricValue::not_applicable(
            "pipeline parallel degree is 1, no stage-to-stage traffic",
        ));
    }

    let mut nodes = vec![0];
    if card.parallelism.pp == 2 && dir.nsys_db(1).is_file() {
        nodes.push(1);
    }

    let wanted = [NVLINK_RX, NVLINK_TX, PCIE_RX, PCIE_TX];
    let mut entries = Vec::new();
    for &node in &nodes {
        let store = NsysStore::open(dir.nsys_db(node))?;
        let Some(aggregates) = stage_aggregates(&store)? else {
            debug!(node, "no NVTX ranges, skipping node");
            continue;
        };
        if config.write_samples {
            write_samples_best_effort(
                dir.output(&format!("bandwidth_utilization_peertopeer_{}.csv", node)),
                &aggregates,
            );
        }
        let prefix = if nodes.len() > 1 {
            format!("(Node {}) ", node)
        } else {
            String::new()
        };
        entries.extend(headline_table(&aggregates, &wanted, &prefix));
    }

    if entries.is_empty() {
        return Ok(MetricValue::not_applicable(
            "no NVLink or PCIe throughput samples inside the NVTX span",
        ));
    }
    Ok(MetricValue::table(entries))
}
