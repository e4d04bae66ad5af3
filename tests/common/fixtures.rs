//! Trace fixtures: nsys SQLite exports, workload cards, JSON traces

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use flate2::write::GzEncoder;
use flate2::Compression;
use rusqlite::{params, Connection};
use serde_json::{json, Value};

// ============================================================================
// nsys SQLite exports
// ============================================================================

/// The subset of the nsys export schema the metric pipelines read
pub const NSYS_SCHEMA: &str = r#"
CREATE TABLE StringIds (id INTEGER PRIMARY KEY, value TEXT NOT NULL);
CREATE TABLE NVTX_EVENTS (start INTEGER NOT NULL, end INTEGER, globalTid INTEGER, text TEXT);
CREATE TABLE CUPTI_ACTIVITY_KIND_RUNTIME (start INTEGER NOT NULL, end INTEGER NOT NULL,
    globalTid INTEGER, correlationId INTEGER, nameId INTEGER NOT NULL);
CREATE TABLE CUPTI_ACTIVITY_KIND_KERNEL (start INTEGER NOT NULL, end INTEGER NOT NULL,
    deviceId INTEGER NOT NULL, correlationId INTEGER, shortName INTEGER NOT NULL,
    demangledName INTEGER NOT NULL);
CREATE TABLE CUPTI_ACTIVITY_KIND_MEMCPY (start INTEGER NOT NULL, end INTEGER NOT NULL,
    bytes INTEGER NOT NULL, deviceId INTEGER NOT NULL, correlationId INTEGER,
    copyKind INTEGER NOT NULL, srcDeviceId INTEGER, dstDeviceId INTEGER);
CREATE TABLE TARGET_INFO_GPU_METRICS (metricId INTEGER NOT NULL, metricName TEXT NOT NULL);
CREATE TABLE GPU_METRICS (timestamp INTEGER NOT NULL, typeId INTEGER NOT NULL,
    metricId INTEGER NOT NULL, value INTEGER);
"#;

/// GPU metrics type id of device `device` (device id in the low byte)
pub fn gpu_type_id(device: i64) -> i64 {
    0x10000 | device
}

/// Writes a synthetic nsys export row by row
pub struct NsysBuilder {
    conn: Connection,
    strings: HashMap<String, i64>,
}

impl NsysBuilder {
    /// Create a new export with the full schema
    pub fn create(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("Failed to create {}", path.as_ref().display()))?;
        conn.execute_batch(NSYS_SCHEMA)
            .context("Failed to create nsys schema")?;
        Ok(NsysBuilder {
            conn,
            strings: HashMap::new(),
        })
    }

    fn string_id(&mut self, value: &str) -> anyhow::Result<i64> {
        if let Some(id) = self.strings.get(value) {
            return Ok(*id);
        }
        let id = self.strings.len() as i64 + 1;
        self.conn
            .execute("INSERT INTO StringIds (id, value) VALUES (?1, ?2)", params![id, value])?;
        self.strings.insert(value.to_string(), id);
        Ok(id)
    }

    pub fn nvtx(&mut self, start: i64, end: i64, tid: i64, text: &str) -> anyhow::Result<&mut Self> {
        self.conn.execute(
            "INSERT INTO NVTX_EVENTS VALUES (?1, ?2, ?3, ?4)",
            params![start, end, tid, text],
        )?;
        Ok(self)
    }

    pub fn runtime(
        &mut self,
        start: i64,
        end: i64,
        tid: i64,
        correlation_id: i64,
        name: &str,
    ) -> anyhow::Result<&mut Self> {
        let name_id = self.string_id(name)?;
        self.conn.execute(
            "INSERT INTO CUPTI_ACTIVITY_KIND_RUNTIME VALUES (?1, ?2, ?3, ?4, ?5)",
            params![start, end, tid, correlation_id, name_id],
        )?;
        Ok(self)
    }

    /// Kernel whose short and demangled names are both `name`
    pub fn kernel(
        &mut self,
        start: i64,
        end: i64,
        device: i64,
        correlation_id: i64,
        name: &str,
    ) -> anyhow::Result<&mut Self> {
        self.kernel_with_names(start, end, device, correlation_id, name, name)
    }

    /// Kernel with distinct short and demangled names
    pub fn kernel_with_names(
        &mut self,
        start: i64,
        end: i64,
        device: i64,
        correlation_id: i64,
        short_name: &str,
        demangled_name: &str,
    ) -> anyhow::Result<&mut Self> {
        let short_id = self.string_id(short_name)?;
        let demangled_id = self.string_id(demangled_name)?;
        self.conn.execute(
            "INSERT INTO CUPTI_ACTIVITY_KIND_KERNEL VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![start, end, device, correlation_id, short_id, demangled_id],
        )?;
        Ok(self)
    }

    pub fn memcpy(
        &mut self,
        start: i64,
        end: i64,
        bytes: i64,
        device: i64,
        copy_kind: i64,
    ) -> anyhow::Result<&mut Self> {
        self.conn.execute(
            "INSERT INTO CUPTI_ACTIVITY_KIND_MEMCPY VALUES (?1, ?2, ?3, ?4, NULL, ?5, ?4, NULL)",
            params![start, end, bytes, device, copy_kind],
        )?;
        Ok(self)
    }

    pub fn gpu_metric(&mut self, metric_id: i64, name: &str) -> anyhow::Result<&mut Self> {
        self.conn.execute(
            "INSERT INTO TARGET_INFO_GPU_METRICS VALUES (?1, ?2)",
            params![metric_id, name],
        )?;
        Ok(self)
    }

    pub fn gpu_sample(
        &mut self,
        timestamp: i64,
        device: i64,
        metric_id: i64,
        value: i64,
    ) -> anyhow::Result<&mut Self> {
        self.conn.execute(
            "INSERT INTO GPU_METRICS VALUES (?1, ?2, ?3, ?4)",
            params![timestamp, gpu_type_id(device), metric_id, value],
        )?;
        Ok(self)
    }
}

pub const NVLINK_RX: &str = "NVLink RX Responses User Data [Throughput %]";
pub const NVLINK_TX: &str = "NVLink TX Responses User Data [Throughput %]";
pub const PCIE_RX: &str = "PCIe RX Throughput [Throughput %]";
pub const PCIE_TX: &str = "PCIe TX Throughput [Throughput %]";

// ============================================================================
// Workload cards
// ============================================================================

/// Write `<run name>.yaml` describing the model family and parallelism
pub fn write_card(run: &Path, family: &str, tp: u32, pp: u32) -> anyhow::Result<()> {
    let name = run
        .file_name()
        .and_then(|n| n.to_str())
        .context("run directory has no name")?;
    let text = format!(
        "workload:\n  model:\n    model_family: {family}\nModel-executor:\n  framework: sglang\n  model_plan_parallelization:\n    tp: {tp}\n    pp: {pp}\n"
    );
    std::fs::write(run.join(format!("{}.yaml", name)), text)?;
    Ok(())
}

// ============================================================================
// Chrome-trace JSON (Kineto, XLA)
// ============================================================================

/// Complete GPU kernel event
pub fn kernel_event(name: &str, ts: f64, dur: f64, pid: i64) -> Value {
    json!({"name": name, "ph": "X", "cat": "kernel", "ts": ts, "dur": dur, "pid": pid, "args": {}})
}

/// Complete GPU kernel event with args
pub fn kernel_event_with_args(name: &str, ts: f64, dur: f64, args: Value) -> Value {
    json!({"name": name, "ph": "X", "cat": "kernel", "ts": ts, "dur": dur, "pid": 0, "args": args})
}

/// Complete CPU op event
pub fn cpu_op(name: &str, ts: f64, dur: f64) -> Value {
    json!({"name": name, "ph": "X", "cat": "cpu_op", "ts": ts, "dur": dur, "pid": 0})
}

/// Write `{"traceEvents": events}`
pub fn write_trace(path: impl AsRef<Path>, events: Vec<Value>) -> anyhow::Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let text = serde_json::to_string(&json!({ "traceEvents": events }))?;
    std::fs::write(path, text).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Write `{"traceEvents": events}` gzip-compressed, as XLA profiles are stored
pub fn write_trace_gz(path: impl AsRef<Path>, events: Vec<Value>) -> anyhow::Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    let mut encoder = GzEncoder::new(file, Compression::default());
    serde_json::to_writer(&mut encoder, &json!({ "traceEvents": events }))?;
    encoder.finish()?;
    Ok(())
}

// ============================================================================
// Benchmark results
// ============================================================================

/// A plausible serving benchmark record
pub fn bench_record() -> Value {
    json!({
        "duration": 10.0,
        "completed": 50,
        "total_input_tokens": 51200,
        "total_output_tokens": 12800,
        "request_throughput": 5.0,
        "total_throughput": 6400.0,
        "ttfts": [0.1, 0.2, null],
        "itls": [[0.01, 0.03], [0.02], []],
        "mean_ttft_ms": 150.0,
        "median_ttft_ms": 150.0,
        "std_ttft_ms": 50.0,
        "p99_ttft_ms": 199.0,
        "mean_tpot_ms": 20.0,
        "median_tpot_ms": 20.0,
        "std_tpot_ms": 0.0,
        "p99_tpot_ms": 20.0
    })
}

/// Write one record per line to `bench_results.jsonl`
pub fn write_bench(run: &Path, records: &[Value]) -> anyhow::Result<()> {
    let mut text = String::new();
    for record in records {
        text.push_str(&serde_json::to_string(record)?);
        text.push('\n');
    }
    std::fs::write(run.join("bench_results.jsonl"), text)?;
    Ok(())
}
