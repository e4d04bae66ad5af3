//! Model FLOPs utilization of a training run (Kineto + submit script)

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info};

use super::{round_to, MetricValue};
use crate::config::PipelineConfig;
use crate::error::{io_context, MetricError, MetricResult};
use crate::trace::{KinetoTrace, TraceDir};

static BATCH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:GLOBAL_BATCH_SIZE=|--global-batch-size\s+)(\d+)").unwrap());
static SEQ_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:SEQ_LENGTH=|--seq-length\s+)(\d+)").unwrap());
static LAYERS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:NUM_LAYERS=|--num-layers\s+)(\d+)").unwrap());
static HIDDEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:HIDDEN_SIZE=|--hidden-size\s+)(\d+)").unwrap());
static WORLD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:WORLD_SIZE=|--nproc_per_node\s+\d+\s+--nnodes\s+)(\d+)").unwrap()
});

/// Markers counting iterations, tried in order
const ITERATION_MARKERS: [&str; 4] = [
    "RedistributeBackward",
    "fwdbwd",
    "Optimizer.step",
    "ncclDevKernel",
];

/// Model shape and launch size read from the submit script
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainingParams {
    pub global_batch: u64,
    pub seq_length: u64,
    pub num_layers: u64,
    pub hidden_size: u64,
    pub world_size: u64,
}

impl Default for TrainingParams {
    fn default() -> Self {
        TrainingParams {
            global_batch: 32,
            seq_length: 1024,
            num_layers: 32,
            hidden_size: 4096,
            world_size: 8,
        }
    }
}

fn capture(re: &Regex, text: &str) -> Option<u64> {
    re.captures(text)?.get(1)?.as_str().parse().ok()
}

impl TrainingParams {
    /// Parse shell variables or launcher flags; absent values keep their defaults
    pub fn from_script(text: &str) -> Self {
        let d = TrainingParams::default();
        TrainingParams {
            global_batch: capture(&BATCH_RE, text).unwrap_or(d.global_batch),
            seq_length: capture(&SEQ_RE, text).unwrap_or(d.seq_length),
            num_layers: capture(&LAYERS_RE, text).unwrap_or(d.num_layers),
            hidden_size: capture(&HIDDEN_RE, text).unwrap_or(d.hidden_size),
            world_size: capture(&WORLD_RE, text).unwrap_or(d.world_size),
        }
    }

    /// Dense transformer FLOPs per iteration, `2 B S L H^2`
    pub fn flops_per_iteration(&self) -> f64 {
        2.0 * self.global_batch as f64
            * self.seq_length as f64
            * self.num_layers as f64
            * (self.hidden_size as f64).powi(2)
    }
}

/// Number of iterations in the rank-0 trace: occurrences of the first
/// marker that appears at all
fn count_iterations(trace: &KinetoTrace) -> Option<usize> {
    ITERATION_MARKERS.iter().find_map(|marker| {
        let n = trace
            .events()
            .iter()
            .filter(|e| e.name.contains(marker))
            .count();
        (n > 0).then(|| {
            debug!(marker, iterations = n, "counted iterations");
            n
        })
    })
}

/// MFU over all ranks
///
/// Iteration time is the kernel timestamp span across every rank divided by
/// the iteration count; the peak is per GPU times the number of rank traces.
pub fn mfu(dir: &TraceDir, config: &PipelineConfig) -> MetricResult<MetricValue> {
    let script = dir
        .submit_script()?
        .ok_or_else(|| MetricError::SourceNotFound(dir.path().join("*.sh")))?;
    let text = std::fs::read_to_string(&script).map_err(|e| io_context(e, &script))?;
    let params = TrainingParams::from_script(&text);
    debug!(script = %script.display(), ?params, "training parameters");

    let traces = dir
        .kineto_rank_files()?
        .iter()
        .map(KinetoTrace::load)
        .collect::<MetricResult<Vec<_>>>()?;
    let Some(rank0) = traces.first() else {
        return Ok(MetricValue::not_applicable("no rank traces"));
    };
    let iterations = count_iterations(rank0)
        .ok_or_else(|| MetricError::malformed(rank0.path(), "no iteration markers found"))?;

    let (mut first, mut last) = (f64::INFINITY, f64::NEG_INFINITY);
    for ts in traces
        .iter()
        .flat_map(|t| t.events().iter().filter(|e| e.is_kernel()))
        .filter_map(|e| e.ts)
    {
        first = first.min(ts);
        last = last.max(ts);
    }
    let iter_time_s = (last - first) / iterations as f64 / 1e6;
    if !(iter_time_s > 0.0) {
        return Ok(MetricValue::not_applicable("kernel timestamps span no time"));
    }

    let ranks = traces.len() as f64;
    let utilization = params.flops_per_iteration() / (config.peak_tflops_per_gpu * 1e12 * ranks * iter_time_s);
    info!(
        ranks = traces.len(),
        world_size = params.world_size,
        iterations,
        iter_time_s,
        "computed MFU"
    );
    Ok(MetricValue::Scalar(round_to(utilization, 4)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_from_env_style_script() {
        let script = "GLOBAL_BATCH_SIZE=64\nSEQ_LENGTH=2048\nNUM_LAYERS=24\nHIDDEN_SIZE=2048\nWORLD_SIZE=16\n";
        let p = TrainingParams::from_script(script);
        assert_eq!(
            p,
            TrainingParams {
                global_batch: 64,
                seq_length: 2048,
                num_layers: 24,
                hidden_size: 2048,
                world_size: 16,
            }
        );
    }

    #[test]
    fn test_params_from_flags_and_defaults() {
        let script = "torchrun --nproc_per_node 8 --nnodes 2 pretrain.py --global-batch-size 128 --seq-length 4096";
        let p = TrainingParams::from_script(script);
        assert_eq!(p.global_batch, 128);
        assert_eq!(p.seq_length, 4096);
        assert_eq!(p.world_size, 2);
        assert_eq!(p.num_layers, 32);
        assert_eq!(p.hidden_size, 4096);
    }

    #[test]
    fn test_flops_per_iteration() {
        let p = TrainingParams {
            global_batch: 1,
            seq_length: 2,
            num_layers: 3,
            hidden_size: 4,
            world_size: 1,
        };
        assert_eq!(p.flops_per_iteration(), 2.0 * 2.0 * 3.0 * 16.0);
    }
}
