//! Trace sources
//!
//! A trace directory holds every artifact of one profiled run:
//!
//! - `nsys_<node>.sqlite` nsys exports, one per node
//! - `<name>.yaml` workload card
//! - `kineto_trace_<rank>.json` / `kineto_rank<rank>.json` PyTorch traces
//! - `*.trace.json` XLA traces (possibly in subdirectories)
//! - `bench_results.jsonl` serving benchmark results
//! - `*.sh` the job submit script
//!
//! Derived CSV tables are written back into the same directory.

pub mod bench;
pub mod event;
pub mod kineto;
pub mod nsys;
pub mod pattern;

use std::path::{Path, PathBuf};

use crate::error::{io_context, MetricError, MetricResult};
use crate::workload::WorkloadCard;

pub use bench::BenchRecord;
pub use event::{AttrValue, Event, EventStream, TimeWindow};
pub use kineto::{KinetoTrace, TraceEvent};
pub use nsys::{KernelNameColumn, MemcpyFilter, NsysStore};
pub use pattern::NamePattern;

/// Benchmark results file name
pub const BENCH_RESULTS: &str = "bench_results.jsonl";

/// One trace directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceDir {
    root: PathBuf,
    name: String,
}

impl TraceDir {
    /// Wrap a directory; it must exist
    pub fn new(path: impl AsRef<Path>) -> MetricResult<Self> {
        let root = path.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(MetricError::SourceNotFound(root));
        }
        // `.`, `run/` and `sub/..` resolve to the directory's own name
        let canonical = root.canonicalize().map_err(|e| io_context(e, &root))?;
        let name = canonical
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(TraceDir { root, name })
    }

    /// Final path component
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// `nsys_<node>.sqlite`
    pub fn nsys_db(&self, node: u32) -> PathBuf {
        self.root.join(format!("nsys_{}.sqlite", node))
    }

    /// `<name>.yaml`
    pub fn workload_card(&self) -> PathBuf {
        self.root.join(format!("{}.yaml", self.name))
    }

    pub fn load_card(&self) -> MetricResult<WorkloadCard> {
        WorkloadCard::load(self.workload_card())
    }

    pub fn bench_results(&self) -> PathBuf {
        self.root.join(BENCH_RESULTS)
    }

    /// Output file placed next to the inputs
    pub fn output(&self, file: &str) -> PathBuf {
        self.root.join(file)
    }

    fn sorted_entries(&self, keep: impl Fn(&str) -> bool) -> MetricResult<Vec<PathBuf>> {
        let entries = std::fs::read_dir(&self.root).map_err(|e| io_context(e, &self.root))?;
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| io_context(e, &self.root))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if keep(name) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Kineto rank traces sorted by name; rank 0 first. None found is an error.
    pub fn kineto_rank_files(&self) -> MetricResult<Vec<PathBuf>> {
        let files = self.sorted_entries(|name| {
            (name.starts_with("kineto_trace_") || name.starts_with("kineto_rank"))
                && name.ends_with(".json")
        })?;
        if files.is_empty() {
            return Err(MetricError::SourceNotFound(self.root.join("kineto_trace_*.json")));
        }
        Ok(files)
    }

    /// Every `*.json` file directly in the directory, sorted
    pub fn json_files(&self) -> MetricResult<Vec<PathBuf>> {
        self.sorted_entries(|name| name.ends_with(".json"))
    }

    /// First `*.sh` submit script in name order
    pub fn submit_script(&self) -> MetricResult<Option<PathBuf>> {
        Ok(self
            .sorted_entries(|name| name.ends_with(".sh"))?
            .into_iter()
            .next())
    }

    /// `*.trace.json` and `*.trace.json.gz` files anywhere below the
    /// directory, sorted
    pub fn xla_trace_files(&self) -> MetricResult<Vec<PathBuf>> {
        let mut found = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let entries = std::fs::read_dir(&dir).map_err(|e| io_context(e, &dir))?;
            for entry in entries {
                let path = entry.map_err(|e| io_context(e, &dir))?.path();
                if path.is_dir() {
                    pending.push(path);
                } else if path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(".trace.json") || n.ends_with(".trace.json.gz"))
                {
                    found.push(path);
                }
            }
        }
        found.sort();
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let run = tmp.path().join("llama_tp4");
        std::fs::create_dir(&run).unwrap();

        let dir = TraceDir::new(&run).unwrap();
        assert_eq!(dir.name(), "llama_tp4");
        assert_eq!(dir.nsys_db(1), run.join("nsys_1.sqlite"));
        assert_eq!(dir.workload_card(), run.join("llama_tp4.yaml"));
        assert_eq!(dir.bench_results(), run.join("bench_results.jsonl"));
        assert_eq!(dir.output("x.csv"), run.join("x.csv"));
    }

    #[test]
    fn test_name_of_relative_components() {
        let tmp = tempfile::tempdir().unwrap();
        let run = tmp.path().join("qwen_pp2");
        std::fs::create_dir_all(run.join("nested")).unwrap();

        let dir = TraceDir::new(run.join("nested/..")).unwrap();
        assert_eq!(dir.name(), "qwen_pp2");
        assert!(dir.workload_card().ends_with("qwen_pp2.yaml"));
        assert_eq!(TraceDir::new(run.join(".")).unwrap().name(), "qwen_pp2");
    }

    #[test]
    fn test_missing_directory() {
        let err = TraceDir::new("/nonexistent/trace/run").unwrap_err();
        assert!(matches!(err, MetricError::SourceNotFound(_)));
    }

    #[test]
    fn test_rank_files_sorted() {
        let tmp = tempfile::tempdir().unwrap();
        for name in ["kineto_trace_1.json", "kineto_trace_0.json", "other.json", "run.sh"] {
            std::fs::write(tmp.path().join(name), "[]").unwrap();
        }
        let dir = TraceDir::new(tmp.path()).unwrap();
        let ranks = dir.kineto_rank_files().unwrap();
        assert_eq!(ranks.len(), 2);
        assert!(ranks[0].ends_with("kineto_trace_0.json"));
        assert_eq!(dir.json_files().unwrap().len(), 3);
        assert!(dir.submit_script().unwrap().unwrap().ends_with("run.sh"));
    }

    #[test]
    fn test_no_rank_files() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = TraceDir::new(tmp.path()).unwrap();
        assert!(dir.kineto_rank_files().unwrap_err().is_data_error());
        assert!(dir.submit_script().unwrap().is_none());
    }

    #[test]
    fn test_xla_traces_found_recursively() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("plugins/profile/2025_01_01");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("host.trace.json"), "[]").unwrap();
        std::fs::write(tmp.path().join("host.trace.json.gz"), "").unwrap();
        std::fs::write(tmp.path().join("host.json"), "[]").unwrap();

        let dir = TraceDir::new(tmp.path()).unwrap();
        let traces = dir.xla_trace_files().unwrap();
        assert_eq!(traces.len(), 2);
        assert!(traces.iter().any(|p| p.ends_with("plugins/profile/2025_01_01/host.trace.json")));
        assert!(traces.iter().any(|p| p.ends_with("host.trace.json.gz")));
    }
}
