//! Read-only access to nsys SQLite exports
//!
//! Each query maps one profiler table onto an [`EventStream`]. Names are
//! resolved through `StringIds` and filtered with a [`NamePattern`] after
//! the rows are read, so a pattern that matches nothing yields an empty
//! stream rather than an error. A missing table is reported as
//! [`MetricError::MissingTable`].

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OpenFlags};
use tracing::debug;

use super::event::{Event, EventStream, TimeWindow};
use super::pattern::NamePattern;
use crate::error::{MetricError, MetricResult};

pub const NVTX_EVENTS: &str = "NVTX_EVENTS";
pub const RUNTIME: &str = "CUPTI_ACTIVITY_KIND_RUNTIME";
pub const KERNEL: &str = "CUPTI_ACTIVITY_KIND_KERNEL";
pub const MEMCPY: &str = "CUPTI_ACTIVITY_KIND_MEMCPY";
pub const GPU_METRICS: &str = "GPU_METRICS";
pub const TARGET_INFO_GPU_METRICS: &str = "TARGET_INFO_GPU_METRICS";
pub const STRING_IDS: &str = "StringIds";

/// `copyKind` of a device-to-device copy
pub const COPY_KIND_DTOD: i64 = 8;

/// Which kernel name column to resolve and match against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelNameColumn {
    /// `shortName`, e.g. `cross_device_reduce_2stage`
    Short,
    /// `demangledName`, the full C++ signature
    Demangled,
}

impl KernelNameColumn {
    fn column(self) -> &'static str {
        match self {
            KernelNameColumn::Short => "shortName",
            KernelNameColumn::Demangled => "demangledName",
        }
    }
}

/// Row filter for memory copies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemcpyFilter {
    /// Keep only this `copyKind`
    pub copy_kind: Option<i64>,
    /// Keep only copies larger than this many bytes
    pub min_bytes: Option<i64>,
}

impl MemcpyFilter {
    /// Device-to-device copies only
    pub fn device_to_device() -> Self {
        MemcpyFilter {
            copy_kind: Some(COPY_KIND_DTOD),
            min_bytes: None,
        }
    }

    pub fn with_min_bytes(mut self, min_bytes: i64) -> Self {
        self.min_bytes = Some(min_bytes);
        self
    }

    fn accepts(&self, copy_kind: i64, bytes: i64) -> bool {
        self.copy_kind.map_or(true, |k| k == copy_kind)
            && self.min_bytes.map_or(true, |m| bytes > m)
    }
}

/// An opened nsys export
///
/// The connection is read-only and released when the store is dropped.
pub struct NsysStore {
    path: PathBuf,
    conn: Connection,
}

impl std::fmt::Debug for NsysStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NsysStore").field("path", &self.path).finish()
    }
}

impl NsysStore {
    /// Open an export read-only
    pub fn open(path: impl AsRef<Path>) -> MetricResult<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(MetricError::SourceNotFound(path.to_path_buf()));
        }
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        debug!(db = %path.display(), "opened nsys export");
        Ok(NsysStore {
            path: path.to_path_buf(),
            conn,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a table (or view) exists in the export
    pub fn has_table(&self, table: &str) -> MetricResult<bool> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM sqlite_master WHERE type IN ('table', 'view') AND name = ?1")?;
        Ok(stmt.exists([table])?)
    }

    fn require_tables(&self, tables: &[&str]) -> MetricResult<()> {
        for table in tables {
            if !self.has_table(table)? {
                return Err(MetricError::MissingTable {
                    table: (*table).to_string(),
                    path: self.path.clone(),
                });
            }
        }
        Ok(())
    }

    fn finish(&self, table: &str, pattern: &NamePattern, events: Vec<Event>) -> EventStream {
        if events.is_empty() {
            debug!(db = %self.path.display(), table, pattern = %pattern, "no rows matched");
        } else {
            debug!(db = %self.path.display(), table, pattern = %pattern, rows = events.len(), "loaded rows");
        }
        EventStream::new(table, events)
    }

    /// NVTX ranges whose text matches `pattern`, keyed by `globalTid`
    pub fn nvtx_markers(&self, pattern: &NamePattern) -> MetricResult<EventStream> {
        self.require_tables(&[NVTX_EVENTS])?;
        let mut stmt = self
            .conn
            .prepare("SELECT start, end, globalTid, text FROM NVTX_EVENTS")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Option<i64>>(1)?,
                row.get::<_, Option<i64>>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (start, end, tid, text) = row?;
            // Instant markers and unnamed ranges carry nothing to contain
            let (Some(end), Some(text)) = (end, text) else {
                continue;
            };
            if pattern.matches(&text) {
                events.push(Event::new(start, end, tid.unwrap_or(0), text));
            }
        }
        Ok(self.finish(NVTX_EVENTS, pattern, events))
    }

    /// Earliest start and latest end over all NVTX ranges
    pub fn nvtx_span(&self) -> MetricResult<Option<TimeWindow>> {
        self.require_tables(&[NVTX_EVENTS])?;
        let (start, end) = self.conn.query_row(
            "SELECT MIN(start), MAX(end) FROM NVTX_EVENTS",
            [],
            |row| Ok((row.get::<_, Option<i64>>(0)?, row.get::<_, Option<i64>>(1)?)),
        )?;
        Ok(match (start, end) {
            (Some(start), Some(end)) => Some(TimeWindow::new(start, end)),
            _ => None,
        })
    }

    /// CUDA runtime API calls whose name matches `pattern`, keyed by `globalTid`
    pub fn runtime_calls(&self, pattern: &NamePattern) -> MetricResult<EventStream> {
        self.require_tables(&[RUNTIME, STRING_IDS])?;
        let mut stmt = self.conn.prepare(
            r#"
            SELECT c.start, c.end, c.globalTid, c.correlationId, s.value
            FROM CUPTI_ACTIVITY_KIND_RUNTIME AS c
            JOIN StringIds AS s ON c.nameId = s.id
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<i64>>(2)?,
                row.get::<_, Option<i64>>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (start, end, tid, correlation_id, name) = row?;
            if !pattern.matches(&name) {
                continue;
            }
            let mut event = Event::new(start, end, tid.unwrap_or(0), name);
            event.correlation_id = correlation_id;
            events.push(event);
        }
        Ok(self.finish(RUNTIME, pattern, events))
    }

    /// GPU kernels whose chosen name column matches `pattern`, keyed by `deviceId`
    pub fn kernels(
        &self,
        column: KernelNameColumn,
        pattern: &NamePattern,
    ) -> MetricResult<EventStream> {
        self.require_tables(&[KERNEL, STRING_IDS])?;
        let sql = format!(
            "SELECT k.start, k.end, k.deviceId, k.correlationId, n.value \
             FROM CUPTI_ACTIVITY_KIND_KERNEL AS k \
             JOIN StringIds AS n ON k.{} = n.id",
            column.column()
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Option<i64>>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (start, end, device, correlation_id, name) = row?;
            if !pattern.matches(&name) {
                continue;
            }
            let mut event = Event::new(start, end, device, name);
            event.correlation_id = correlation_id;
            events.push(event);
        }
        Ok(self.finish(KERNEL, pattern, events))
    }

    /// Memory copies passing `filter`, keyed by `deviceId`
    ///
    /// Attributes: `bytes`, `copyKind`, `srcDeviceId`, `dstDeviceId`.
    pub fn memcpys(&self, filter: &MemcpyFilter) -> MetricResult<EventStream> {
        self.require_tables(&[MEMCPY])?;
        let mut stmt = self.conn.prepare(
            r#"
            SELECT start, end, bytes, deviceId, correlationId, copyKind, srcDeviceId, dstDeviceId
            FROM CUPTI_ACTIVITY_KIND_MEMCPY
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, Option<i64>>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, Option<i64>>(6)?,
                row.get::<_, Option<i64>>(7)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (start, end, bytes, device, correlation_id, copy_kind, src, dst) = row?;
            if !filter.accepts(copy_kind, bytes) {
                continue;
            }
            let mut event = Event::new(start, end, device, "memcpy")
                .with_attr("bytes", bytes)
                .with_attr("copyKind", copy_kind);
            if let Some(src) = src {
                event = event.with_attr("srcDeviceId", src);
            }
            if let Some(dst) = dst {
                event = event.with_attr("dstDeviceId", dst);
            }
            event.correlation_id = correlation_id;
            events.push(event);
        }
        debug!(db = %self.path.display(), rows = events.len(), ?filter, "loaded memory copies");
        Ok(EventStream::new(MEMCPY, events))
    }

    /// GPU metric ids whose name matches `pattern`
    pub fn gpu_metric_names(&self, pattern: &NamePattern) -> MetricResult<BTreeMap<i64, String>> {
        self.require_tables(&[TARGET_INFO_GPU_METRICS])?;
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT metricId, metricName FROM TARGET_INFO_GPU_METRICS")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?;

        let mut names = BTreeMap::new();
        for row in rows {
            let (id, name) = row?;
            if pattern.matches(&name) {
                names.insert(id, name);
            }
        }
        Ok(names)
    }

    /// GPU metric samples for metrics matching `pattern`, optionally
    /// restricted to `window`
    ///
    /// Each sample is a zero-length event keyed by the device id
    /// (`typeId & 0xFF`), named after the metric, with a `value` attribute.
    pub fn gpu_metric_samples(
        &self,
        pattern: &NamePattern,
        window: Option<TimeWindow>,
    ) -> MetricResult<EventStream> {
        let names = self.gpu_metric_names(pattern)?;
        self.require_tables(&[GPU_METRICS])?;
        if names.is_empty() {
            return Ok(self.finish(GPU_METRICS, pattern, Vec::new()));
        }
        let wanted: HashSet<i64> = names.keys().copied().collect();
        let window = window.unwrap_or(TimeWindow::new(i64::MIN, i64::MAX));

        let mut stmt = self.conn.prepare(
            r#"
            SELECT timestamp, typeId, metricId, value
            FROM GPU_METRICS
            WHERE timestamp >= ?1 AND timestamp <= ?2
            "#,
        )?;
        let rows = stmt.query_map(params![window.start, window.end], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Option<f64>>(3)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (timestamp, type_id, metric_id, value) = row?;
            if !wanted.contains(&metric_id) {
                continue;
            }
            let (Some(value), Some(name)) = (value, names.get(&metric_id)) else {
                continue;
            };
            events.push(
                Event::instant(timestamp, type_id & 0xFF, name.as_str())
                    .with_attr("metricId", metric_id)
                    .with_attr("value", value),
            );
        }
        Ok(self.finish(GPU_METRICS, pattern, events))
    }
}
