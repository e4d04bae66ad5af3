//! ccl-metrics - collective communication metrics from profiler traces
//!
//! Reads the artifacts of one profiled run (nsys SQLite exports, Kineto
//! JSON, benchmark JSONL, XLA traces), correlates events across sources by
//! time and id, and reduces them to utilization figures.
//!
//! Pipeline: [`trace`] loads event streams, [`correlate`] joins them,
//! [`derive`] turns matched groups into samples, [`stats`] aggregates.
//! [`metrics`] wires the stages into one pipeline per metric family.

#![allow(clippy::too_many_arguments)] // Metric formulas take their inputs explicitly
#![allow(clippy::neg_cmp_op_on_partial_ord)] // `!(x > 0.0)` also rejects NaN

pub mod config;
pub mod correlate;
pub mod derive;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod stats;
pub mod trace;
pub mod workload;

pub use config::{LinkSpec, ModelCatalog, ModelSpec, PipelineConfig};
pub use correlate::{chain_by_correlation_id, contained_within, AsOfJoin, Correlation, Direction, Edge};
pub use derive::{CollectiveKind, MetricSample};
pub use error::{ErrorCategory, MetricError, MetricResult};
pub use metrics::{evaluate, Metric, MetricValue};
pub use stats::{MetricSummary, SummaryStats};
pub use trace::{Event, EventStream, TraceDir};
pub use workload::{Parallelism, WorkloadCard};

#[cfg(test)]
mod library_tests {
    use super::*;

    #[test]
    fn test_every_metric_is_listed_once() {
        let mut names: Vec<&str> = Metric::ALL.iter().map(|m| m.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), Metric::ALL.len());
    }
}
