//! CSV persistence of per-sample tables
//!
//! Each row type is a serde struct; its field names become the header.

use std::path::Path;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::MetricResult;

/// Write `rows` to `path` as CSV, replacing any previous file
pub fn write_samples<T: Serialize, P: AsRef<Path>>(path: P, rows: &[T]) -> MetricResult<()> {
    let mut writer = csv::Writer::from_path(path.as_ref())?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    debug!(path = %path.as_ref().display(), rows = rows.len(), "wrote sample table");
    Ok(())
}

/// Write `rows`, logging and swallowing any failure
///
/// Returns whether the table was written. A failed write never affects the
/// computed metric.
pub fn write_samples_best_effort<T: Serialize, P: AsRef<Path>>(path: P, rows: &[T]) -> bool {
    match write_samples(path.as_ref(), rows) {
        Ok(()) => true,
        Err(e) => {
            warn!(path = %path.as_ref().display(), error = %e, "failed to persist sample table");
            false
        }
    }
}
