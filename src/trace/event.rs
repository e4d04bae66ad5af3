//! Normalized trace events
//!
//! Every loader converts its rows into [`Event`]s with nanosecond start/end
//! timestamps, an integer partition key (thread, device or process id) and a
//! bag of typed attributes. Streams are sorted by start once, at
//! construction, and are read-only afterwards.

use std::collections::BTreeMap;
use std::fmt;

use itertools::Itertools;
use serde::Serialize;

/// Typed attribute value carried by an event
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttrValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl AttrValue {
    /// Integer view; floats are truncated, numeric strings are parsed
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttrValue::Int(v) => Some(*v),
            AttrValue::Float(v) if v.is_finite() => Some(*v as i64),
            AttrValue::Float(_) => None,
            AttrValue::Text(s) => s.trim().parse::<f64>().ok().map(|v| v as i64),
        }
    }

    /// Float view; numeric strings are parsed
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttrValue::Int(v) => Some(*v as f64),
            AttrValue::Float(v) => Some(*v),
            AttrValue::Text(s) => s.trim().parse().ok(),
        }
    }

    /// String view of text attributes only
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Int(v) => write!(f, "{}", v),
            AttrValue::Float(v) => write!(f, "{}", v),
            AttrValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        AttrValue::Float(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Text(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::Text(v)
    }
}

/// One timed occurrence in a trace
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Start timestamp (ns)
    pub start: i64,
    /// End timestamp (ns), never before `start`
    pub end: i64,
    /// Partition key: thread id for markers and API calls, device id for
    /// kernels, copies and metric samples, process id for Kineto events
    pub key: i64,
    /// Marker text, API name, kernel name or metric name
    pub name: String,
    /// Runtime correlation id linking an API call to its kernel
    pub correlation_id: Option<i64>,
    /// Source-specific attributes (bytes, copy kind, metric value, ...)
    pub attrs: BTreeMap<String, AttrValue>,
}

impl Event {
    /// Create an event; a reversed interval is clamped to zero length
    pub fn new(start: i64, end: i64, key: i64, name: impl Into<String>) -> Self {
        Event {
            start,
            end: end.max(start),
            key,
            name: name.into(),
            correlation_id: None,
            attrs: BTreeMap::new(),
        }
    }

    /// Zero-length event (metric samples)
    pub fn instant(at: i64, key: i64, name: impl Into<String>) -> Self {
        Event::new(at, at, key, name)
    }

    pub fn with_correlation_id(mut self, id: i64) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.attrs.insert(name.into(), value.into());
        self
    }

    /// Duration in ns
    pub fn duration_ns(&self) -> i64 {
        self.end - self.start
    }

    /// Duration in seconds
    pub fn duration_s(&self) -> f64 {
        self.duration_ns() as f64 / 1e9
    }

    pub fn attr(&self, name: &str) -> Option<&AttrValue> {
        self.attrs.get(name)
    }

    pub fn attr_i64(&self, name: &str) -> Option<i64> {
        self.attr(name).and_then(AttrValue::as_i64)
    }

    pub fn attr_f64(&self, name: &str) -> Option<f64> {
        self.attr(name).and_then(AttrValue::as_f64)
    }

    pub fn attr_str(&self, name: &str) -> Option<&str> {
        self.attr(name).and_then(AttrValue::as_str)
    }

    /// Whether this event lies entirely inside `window` (inclusive)
    pub fn is_within(&self, window: TimeWindow) -> bool {
        window.contains(self)
    }
}

/// Closed time interval `[start, end]` in ns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: i64,
    pub end: i64,
}

impl TimeWindow {
    pub fn new(start: i64, end: i64) -> Self {
        TimeWindow { start, end }
    }

    /// Window spanning an event
    pub fn of(event: &Event) -> Self {
        TimeWindow::new(event.start, event.end)
    }

    /// Whether `event` starts and ends inside the window
    pub fn contains(&self, event: &Event) -> bool {
        event.start >= self.start && event.end <= self.end
    }

    /// Whether an instant falls inside the window
    pub fn contains_instant(&self, at: i64) -> bool {
        at >= self.start && at <= self.end
    }

    pub fn duration_ns(&self) -> i64 {
        self.end - self.start
    }
}

/// Ordered sequence of events from one source
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventStream {
    /// Where the events came from (table name, file name)
    pub source: String,
    events: Vec<Event>,
}

impl EventStream {
    /// Build a stream; events are stably sorted by start
    pub fn new(source: impl Into<String>, mut events: Vec<Event>) -> Self {
        events.sort_by_key(|e| e.start);
        EventStream {
            source: source.into(),
            events,
        }
    }

    pub fn empty(source: impl Into<String>) -> Self {
        EventStream::new(source, Vec::new())
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Event> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Distinct keys in ascending order
    pub fn keys(&self) -> Vec<i64> {
        self.events.iter().map(|e| e.key).sorted().dedup().collect()
    }

    /// Per-key sub-streams (borrowed), each still sorted by start
    pub fn partition_by_key(&self) -> BTreeMap<i64, Vec<&Event>> {
        let mut parts: BTreeMap<i64, Vec<&Event>> = BTreeMap::new();
        for event in &self.events {
            parts.entry(event.key).or_default().push(event);
        }
        parts
    }

    /// Events lying inside `window`
    pub fn within(&self, window: TimeWindow) -> EventStream {
        EventStream {
            source: self.source.clone(),
            events: self
                .events
                .iter()
                .filter(|e| window.contains(e))
                .cloned()
                .collect(),
        }
    }

    /// Smallest window covering every event, `None` when empty
    pub fn span(&self) -> Option<TimeWindow> {
        let start = self.events.iter().map(|e| e.start).min()?;
        let end = self.events.iter().map(|e| e.end).max()?;
        Some(TimeWindow::new(start, end))
    }

    /// Sum of event durations in ns
    pub fn total_duration_ns(&self) -> i64 {
        self.events.iter().map(Event::duration_ns).sum()
    }
}

impl<'a> IntoIterator for &'a EventStream {
    type Item = &'a Event;
    type IntoIter = std::slice::Iter<'a, Event>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.iter()
    }
}
