//! Kineto / Chrome-trace JSON reader
//!
//! PyTorch profiler and XLA traces share the Chrome trace layout: either an
//! object with a `traceEvents` array or a bare array of event objects.
//! Timestamps and durations are microseconds; conversion to [`Event`]
//! scales them to nanoseconds.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use serde_json::{Map, Value};
use tracing::debug;

use super::event::{AttrValue, Event, EventStream};
use crate::error::{io_context, MetricError, MetricResult};

/// One raw trace event
#[derive(Debug, Clone, PartialEq)]
pub struct TraceEvent {
    pub name: String,
    /// Phase: `X` complete, `B`/`E` begin/end, `M` metadata, ...
    pub ph: String,
    pub cat: String,
    /// Start (µs)
    pub ts: Option<f64>,
    /// Duration (µs)
    pub dur: Option<f64>,
    /// Process id as written (integer or string)
    pub pid: Option<Value>,
    pub args: Map<String, Value>,
}

fn number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

impl TraceEvent {
    /// Convert a JSON object; anything else is skipped
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        Some(TraceEvent {
            name: text(obj.get("name")),
            ph: text(obj.get("ph")),
            cat: text(obj.get("cat")),
            ts: number(obj.get("ts")),
            dur: number(obj.get("dur")),
            pid: obj.get("pid").filter(|v| !v.is_null()).cloned(),
            args: obj
                .get("args")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
        })
    }

    /// Complete (`ph == "X"`) event
    pub fn is_complete(&self) -> bool {
        self.ph == "X"
    }

    /// GPU kernel (`cat == "kernel"`, any case)
    pub fn is_kernel(&self) -> bool {
        self.cat.eq_ignore_ascii_case("kernel")
    }

    /// Duration in µs, 0 when absent
    pub fn dur_us(&self) -> f64 {
        self.dur.unwrap_or(0.0)
    }

    /// Integer process id; numeric strings are parsed, anything else is `None`
    pub fn pid_i64(&self) -> Option<i64> {
        match self.pid.as_ref()? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Process id as text, for labelling ranks
    pub fn pid_label(&self) -> Option<String> {
        match self.pid.as_ref()? {
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    pub fn arg(&self, name: &str) -> Option<&Value> {
        self.args.get(name)
    }

    /// Numeric argument; numeric strings are parsed
    pub fn arg_f64(&self, name: &str) -> Option<f64> {
        number(self.args.get(name))
    }

    pub fn arg_str(&self, name: &str) -> Option<&str> {
        self.args.get(name).and_then(Value::as_str)
    }

    /// Normalize into an [`Event`] (ns, keyed by pid); `None` without `ts`
    pub fn to_event(&self) -> Option<Event> {
        let ts = self.ts?;
        let start = (ts * 1000.0).round() as i64;
        let end = ((ts + self.dur_us()) * 1000.0).round() as i64;
        let mut event = Event::new(start, end, self.pid_i64().unwrap_or(0), self.name.clone());
        for (key, value) in &self.args {
            let attr = match value {
                Value::Number(n) => match n.as_i64() {
                    Some(i) => AttrValue::Int(i),
                    None => match n.as_f64() {
                        Some(f) => AttrValue::Float(f),
                        None => continue,
                    },
                },
                Value::String(s) => AttrValue::Text(s.clone()),
                _ => continue,
            };
            event.attrs.insert(key.clone(), attr);
        }
        Some(event)
    }
}

/// A loaded trace file
#[derive(Debug, Clone)]
pub struct KinetoTrace {
    path: PathBuf,
    events: Vec<TraceEvent>,
}

impl KinetoTrace {
    /// Read and parse a trace file; `*.gz` files are decompressed
    pub fn load(path: impl AsRef<Path>) -> MetricResult<Self> {
        let path = path.as_ref();
        let text = if path.extension().is_some_and(|ext| ext == "gz") {
            let file = File::open(path).map_err(|e| io_context(e, path))?;
            let mut text = String::new();
            GzDecoder::new(file)
                .read_to_string(&mut text)
                .map_err(|e| MetricError::malformed(path, format!("invalid gzip stream: {}", e)))?;
            text
        } else {
            std::fs::read_to_string(path).map_err(|e| io_context(e, path))?
        };
        let value: Value = serde_json::from_str(&text)
            .map_err(|e| MetricError::malformed(path, format!("invalid JSON: {}", e)))?;
        let trace = Self::from_json(path, &value)?;
        debug!(trace = %path.display(), events = trace.events.len(), "loaded trace");
        Ok(trace)
    }

    /// Accept `{"traceEvents": [...]}` or a bare array
    pub fn from_json(path: impl AsRef<Path>, value: &Value) -> MetricResult<Self> {
        let path = path.as_ref();
        let raw = match value {
            Value::Object(obj) => match obj.get("traceEvents") {
                Some(Value::Array(events)) => events,
                Some(_) => {
                    return Err(MetricError::malformed(path, "traceEvents is not a list"));
                }
                None => {
                    return Err(MetricError::malformed(path, "unrecognized trace format"));
                }
            },
            Value::Array(events) => events,
            _ => return Err(MetricError::malformed(path, "unrecognized trace format")),
        };

        Ok(KinetoTrace {
            path: path.to_path_buf(),
            events: raw.iter().filter_map(TraceEvent::from_value).collect(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name, for labelling
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    /// `ph == "X"` events
    pub fn complete_events(&self) -> impl Iterator<Item = &TraceEvent> {
        self.events.iter().filter(|e| e.is_complete())
    }

    /// Complete GPU kernel events
    pub fn kernels(&self) -> impl Iterator<Item = &TraceEvent> {
        self.complete_events().filter(|e| e.is_kernel())
    }

    /// Kernel events as a sorted stream
    pub fn kernel_stream(&self) -> EventStream {
        EventStream::new(
            self.file_name(),
            self.kernels().filter_map(TraceEvent::to_event).collect(),
        )
    }
}
