//! Common test utilities for metric pipeline tests
//!
//! Every test builds its own trace directory inside a `TempDir`:
//! - nsys exports are real SQLite files created with `rusqlite`
//! - Kineto and XLA traces are Chrome-trace JSON
//! - workload cards and benchmark results are written verbatim
//!
//! # Usage
//!
//! ```ignore
//! mod common;
//! use common::*;
//!
//! #[test]
//! fn my_metric_test() -> anyhow::Result<()> {
//!     let (_tmp, run) = create_run_dir("llama_tp4")?;
//!     write_card(&run, "llama-3.1-8B", 4, 1)?;
//!     let mut nsys = NsysBuilder::create(run.join("nsys_0.sqlite"))?;
//!     nsys.kernel(0, 500_000, 0, 1, "ncclDevKernel_AllGather_RING_LL")?;
//!     Ok(())
//! }
//! ```

#![allow(dead_code)]

mod fixtures;
mod tempfile_helpers;

pub use fixtures::*;
pub use tempfile_helpers::*;
