//! Benchmark-results metric pipelines

mod common;

use ccl_metrics::{evaluate, Metric, MetricValue, PipelineConfig};
use common::*;
use serde_json::json;

fn scalar(value: &MetricValue, key: &str) -> f64 {
    value
        .get(key)
        .and_then(MetricValue::as_scalar)
        .unwrap_or_else(|| panic!("missing scalar {key} in {value}"))
}

#[test]
fn test_ttft_reports_recorded_statistics() -> anyhow::Result<()> {
    let (_tmp, run) = create_run_dir("serve")?;
    write_bench(&run, &[bench_record()])?;
    let value = evaluate(Metric::Ttft, &run, &PipelineConfig::default())?;
    assert_eq!(scalar(&value, "mean_ttft_ms"), 150.0);
    assert_eq!(scalar(&value, "median_ttft_ms"), 150.0);
    assert_eq!(scalar(&value, "std_ttft_ms"), 50.0);
    assert_eq!(scalar(&value, "p99_ttft_ms"), 199.0);
    Ok(())
}

#[test]
fn test_tpot_reports_recorded_statistics() -> anyhow::Result<()> {
    let (_tmp, run) = create_run_dir("serve")?;
    let mut record = bench_record();
    // Disagreement with the recomputed value is only logged
    record["mean_tpot_ms"] = json!(25.0);
    write_bench(&run, &[record])?;
    let value = evaluate(Metric::Tpot, &run, &PipelineConfig::default())?;
    assert_eq!(scalar(&value, "mean_tpot_ms"), 25.0);
    assert_eq!(scalar(&value, "p99_tpot_ms"), 20.0);
    Ok(())
}

#[test]
fn test_throughput() -> anyhow::Result<()> {
    let (_tmp, run) = create_run_dir("serve")?;
    write_bench(&run, &[bench_record()])?;
    let value = evaluate(Metric::Throughput, &run, &PipelineConfig::default())?;
    assert_eq!(scalar(&value, "requests_per_sec"), 5.0);
    assert_eq!(scalar(&value, "input_tokens_per_sec"), 5120.0);
    assert_eq!(scalar(&value, "output_tokens_per_sec"), 1280.0);
    assert_eq!(scalar(&value, "total_tokens_per_sec"), 6400.0);
    assert_eq!(scalar(&value, "json_total_throughput"), 6400.0);
    Ok(())
}

#[test]
fn test_throughput_zero_duration_not_applicable() -> anyhow::Result<()> {
    let (_tmp, run) = create_run_dir("serve")?;
    let mut record = bench_record();
    record["duration"] = json!(0.0);
    write_bench(&run, &[record])?;
    let value = evaluate(Metric::Throughput, &run, &PipelineConfig::default())?;
    assert!(!value.is_applicable());
    Ok(())
}

#[test]
fn test_multiple_records_not_applicable() -> anyhow::Result<()> {
    let (_tmp, run) = create_run_dir("serve")?;
    write_bench(&run, &[bench_record(), bench_record()])?;
    let value = evaluate(Metric::Ttft, &run, &PipelineConfig::default())?;
    match value {
        MetricValue::NotApplicable { reason } => assert!(reason.contains("found 2")),
        other => panic!("expected n/a, got {}", other),
    }
    Ok(())
}

#[test]
fn test_missing_results_not_applicable() -> anyhow::Result<()> {
    let (_tmp, run) = create_run_dir("serve")?;
    let value = evaluate(Metric::Throughput, &run, &PipelineConfig::default())?;
    assert!(!value.is_applicable());
    assert_eq!(serde_json::to_string(&value)?, "\"n/a\"");
    Ok(())
}

#[test]
fn test_missing_directory_not_applicable() -> anyhow::Result<()> {
    let value = evaluate(Metric::Ttft, missing_path(), &PipelineConfig::default())?;
    assert!(!value.is_applicable());
    Ok(())
}
