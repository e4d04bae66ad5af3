//! Communication versus compute kernel time over nsys exports

mod common;

use ccl_metrics::{evaluate, Metric, MetricValue, PipelineConfig};
use common::*;
use std::path::Path;

fn scalar(value: &MetricValue, key: &str) -> f64 {
    value
        .get(key)
        .and_then(MetricValue::as_scalar)
        .unwrap_or_else(|| panic!("missing scalar {key} in {value}"))
}

/// 1 ms all-reduce and 3 ms of GEMM on device 0, 0.5 ms all-gather on
/// device 1, spanning 10 ms. Demangled names carry no classification hint.
fn node_export(path: impl AsRef<Path>) -> anyhow::Result<()> {
    let mut nsys = NsysBuilder::create(path)?;
    nsys.kernel_with_names(0, 1_000_000, 0, 1, "ncclDevKernel_AllReduce_Sum_bf16", "void kernel<1>()")?
        .kernel_with_names(1_000_000, 4_000_000, 0, 2, "sm90_xmma_gemm_bf16", "void kernel<2>()")?
        .kernel_with_names(9_500_000, 10_000_000, 1, 3, "ncclDevKernel_AllGather_RING_LL", "void kernel<3>()")?;
    Ok(())
}

#[test]
fn test_kernel_compute_time_breakdown() -> anyhow::Result<()> {
    let (_tmp, run) = create_run_dir("llama_tp2")?;
    write_card(&run, "llama-3.1-8B", 2, 1)?;
    node_export(run.join("nsys_0.sqlite"))?;

    let value = evaluate(Metric::KernelComputeTime, &run, &PipelineConfig::default())?;
    assert!((scalar(&value, "total_communication_time_s") - 0.0015).abs() < 1e-12);
    assert!((scalar(&value, "total_compute_time_s") - 0.003).abs() < 1e-12);
    assert!((scalar(&value, "comm_to_compute_ratio") - 0.5).abs() < 1e-12);
    assert_eq!(scalar(&value, "comm_operations_count"), 2.0);
    assert!((scalar(&value, "trace_duration_s") - 0.01).abs() < 1e-12);
    assert!((scalar(&value, "comm_ops_per_second") - 200.0).abs() < 1e-9);
    assert_eq!(scalar(&value, "num_gpus"), 2.0);
    assert_eq!(scalar(&value, "AllReduce_count"), 1.0);
    assert!((scalar(&value, "AllGather_time_s") - 0.0005).abs() < 1e-12);
    Ok(())
}

#[test]
fn test_kernel_compute_time_two_node_qwen_prefixed() -> anyhow::Result<()> {
    let (_tmp, run) = create_run_dir("qwen_pp2")?;
    write_card(&run, "qwen-32b", 1, 2)?;
    node_export(run.join("nsys_0.sqlite"))?;
    let mut node1 = NsysBuilder::create(run.join("nsys_1.sqlite"))?;
    node1.kernel(0, 2_000_000, 0, 1, "ncclDevKernel_SendRecv")?
        .kernel(2_000_000, 4_000_000, 0, 2, "flash_fwd_kernel")?;

    let value = evaluate(Metric::KernelComputeTime, &run, &PipelineConfig::default())?;
    assert_eq!(scalar(&value, "(Node 0) comm_operations_count"), 2.0);
    assert_eq!(scalar(&value, "(Node 1) comm_operations_count"), 1.0);
    assert_eq!(scalar(&value, "(Node 1) SendRecv_count"), 1.0);
    assert!((scalar(&value, "(Node 1) comm_to_compute_ratio") - 1.0).abs() < 1e-12);
    assert!(value.get("comm_operations_count").is_none());
    Ok(())
}

#[test]
fn test_kernel_compute_time_empty_export_not_applicable() -> anyhow::Result<()> {
    let (_tmp, run) = create_run_dir("llama_tp2")?;
    write_card(&run, "llama-3.1-8B", 2, 1)?;
    NsysBuilder::create(run.join("nsys_0.sqlite"))?;

    let value = evaluate(Metric::KernelComputeTime, &run, &PipelineConfig::default())?;
    match value {
        MetricValue::NotApplicable { reason } => assert!(reason.contains("no kernels recorded")),
        other => panic!("expected n/a, got {}", other),
    }
    Ok(())
}

#[test]
fn test_kernel_compute_time_unknown_family_not_applicable() -> anyhow::Result<()> {
    let (_tmp, run) = create_run_dir("mystery_tp2")?;
    write_card(&run, "mystery-7b", 2, 1)?;
    node_export(run.join("nsys_0.sqlite"))?;

    let value = evaluate(Metric::KernelComputeTime, &run, &PipelineConfig::default())?;
    match value {
        MetricValue::NotApplicable { reason } => assert!(reason.contains("mystery-7b")),
        other => panic!("expected n/a, got {}", other),
    }
    Ok(())
}
