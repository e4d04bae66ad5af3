//! Helper functions for tempfile/tempdir usage in tests
//!
//! Wrappers around the tempfile crate with consistent error context.

use anyhow::Context;
use std::path::PathBuf;

/// Create a temp directory with a helpful error message.
pub fn create_temp_dir() -> anyhow::Result<tempfile::TempDir> {
    tempfile::tempdir().context("Failed to create temporary directory for test")
}

/// Create a run directory called `name` inside a fresh temp directory.
///
/// The run name matters: the workload card is `<name>.yaml` and TPU
/// metrics read the TP degree from it. Keep the `TempDir` alive for the
/// duration of the test.
pub fn create_run_dir(name: &str) -> anyhow::Result<(tempfile::TempDir, PathBuf)> {
    let tmp = create_temp_dir()?;
    let run = tmp.path().join(name);
    std::fs::create_dir_all(&run)
        .with_context(|| format!("Failed to create run directory {}", run.display()))?;
    Ok((tmp, run))
}

/// A path that does not exist (for missing-directory tests).
pub fn missing_path() -> PathBuf {
    std::env::temp_dir().join(format!("ccl_metrics_missing_{}", std::process::id()))
}

pub use tempfile::TempDir;
