//! Workload descriptor
//!
//! Each trace directory `<name>/` carries a card `<name>.yaml` describing the
//! model family and the parallel layout of the run. Metrics that depend on
//! the layout decide applicability from the card before any trace is opened.
//! Traces without a card (TPU and training runs) encode the layout in the
//! directory name instead; see [`Parallelism::from_run_name`].

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::config::{ModelCatalog, ModelSpec};
use crate::error::{MetricError, MetricResult};

/// Parallel degrees of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Parallelism {
    /// Tensor-parallel degree
    pub tp: u32,
    /// Pipeline-parallel degree
    pub pp: u32,
    /// Expert-parallel degree
    pub ep: Option<u32>,
    /// Data-parallel degree
    pub dp: Option<u32>,
}

impl Default for Parallelism {
    fn default() -> Self {
        Parallelism {
            tp: 1,
            pp: 1,
            ep: None,
            dp: None,
        }
    }
}

// `tp4`, `_tp4`, `TP_8`, `tp=2`; the tag must not be glued to a preceding letter
static TP_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)(?:^|[^a-z])tp[_=]?(\d+)").unwrap());
static PP_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)(?:^|[^a-z])pp[_=]?(\d+)").unwrap());
static EP_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)(?:^|[^a-z])ep[_=]?(\d+)").unwrap());
static DP_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)(?:^|[^a-z])dp[_=]?(\d+)").unwrap());

fn capture_degree(re: &Regex, name: &str) -> Option<u32> {
    re.captures(name)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

impl Parallelism {
    /// Extract degrees from a run name such as `deepseek_ep2_tp1` or
    /// `MODEL_Qwen3-4B,BATCH_64,TP_8`.
    ///
    /// Missing TP and PP default to 1.
    pub fn from_run_name(name: &str) -> Self {
        Parallelism {
            tp: capture_degree(&TP_RE, name).unwrap_or(1),
            pp: capture_degree(&PP_RE, name).unwrap_or(1),
            ep: capture_degree(&EP_RE, name),
            dp: capture_degree(&DP_RE, name),
        }
    }

    /// Group size of a tensor-parallel collective, falling back to
    /// `default` when the card reports no tensor parallelism
    pub fn group_size(&self, default: u32) -> u32 {
        if self.tp > 1 {
            self.tp
        } else {
            default
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawCard {
    workload: RawWorkload,
    #[serde(rename = "Model-executor")]
    model_executor: RawExecutor,
}

#[derive(Debug, Deserialize)]
struct RawWorkload {
    model: RawModel,
}

#[derive(Debug, Deserialize)]
struct RawModel {
    model_family: String,
}

#[derive(Debug, Deserialize)]
struct RawExecutor {
    model_plan_parallelization: RawParallelization,
}

#[derive(Debug, Deserialize)]
struct RawParallelization {
    tp: u32,
    pp: u32,
    #[serde(default)]
    ep: Option<u32>,
    #[serde(default)]
    dp: Option<u32>,
}

/// Parsed workload card
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadCard {
    /// Path the card was read from
    pub path: PathBuf,
    /// Model family string, matched against the catalog
    pub model_family: String,
    /// Parallel layout
    pub parallelism: Parallelism,
}

impl WorkloadCard {
    /// Read and parse a card.
    ///
    /// An absent or unreadable file is `MissingWorkloadCard`; a file without
    /// the expected keys is `InvalidWorkloadCard`. Both abort the invocation.
    pub fn load(path: impl AsRef<Path>) -> MetricResult<Self> {
        let path = path.as_ref();
        let text =
            std::fs::read_to_string(path).map_err(|e| MetricError::MissingWorkloadCard {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        Self::parse(path, &text)
    }

    /// Parse card text; `path` is only used for diagnostics
    pub fn parse(path: impl AsRef<Path>, text: &str) -> MetricResult<Self> {
        let path = path.as_ref();
        let raw: RawCard =
            serde_yaml::from_str(text).map_err(|e| MetricError::InvalidWorkloadCard {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let par = raw.model_executor.model_plan_parallelization;
        if par.tp == 0 || par.pp == 0 {
            return Err(MetricError::InvalidWorkloadCard {
                path: path.to_path_buf(),
                reason: format!("parallel degrees must be >= 1 (tp={}, pp={})", par.tp, par.pp),
            });
        }

        tracing::debug!(
            card = %path.display(),
            model_family = %raw.workload.model.model_family,
            tp = par.tp,
            pp = par.pp,
            "loaded workload card"
        );

        Ok(WorkloadCard {
            path: path.to_path_buf(),
            model_family: raw.workload.model.model_family,
            parallelism: Parallelism {
                tp: par.tp,
                pp: par.pp,
                ep: par.ep,
                dp: par.dp,
            },
        })
    }

    /// Catalog entry for this card's model family
    pub fn model<'c>(&self, catalog: &'c ModelCatalog) -> Option<&'c ModelSpec> {
        catalog.get(&self.model_family)
    }

    /// Qwen with two pipeline stages splits the model across two nodes
    pub fn is_two_node_qwen(&self) -> bool {
        self.model_family == "qwen-32b" && self.parallelism.pp == 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CARD: &str = r#"
workload:
  model:
    model_family: llama-3.1-8B
Model-executor:
  framework: sglang
  model_plan_parallelization:
    tp: 4
    pp: 1
"#;

    #[test]
    fn test_parse_card() {
        let card = WorkloadCard::parse("run.yaml", CARD).unwrap();
        assert_eq!(card.model_family, "llama-3.1-8B");
        assert_eq!(card.parallelism.tp, 4);
        assert_eq!(card.parallelism.pp, 1);
        assert_eq!(card.parallelism.ep, None);
        assert_eq!(card.parallelism.group_size(8), 4);

        let catalog = ModelCatalog::default();
        assert_eq!(card.model(&catalog).map(|m| m.vocab_size), Some(128_256));
    }

    #[test]
    fn test_parse_card_missing_keys() {
        let err = WorkloadCard::parse("run.yaml", "workload: {}\n").unwrap_err();
        assert!(matches!(err, MetricError::InvalidWorkloadCard { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_zero_degree_rejected() {
        let text = CARD.replace("tp: 4", "tp: 0");
        assert!(WorkloadCard::parse("run.yaml", &text).is_err());
    }

    #[test]
    fn test_load_missing_card() {
        let err = WorkloadCard::load("/nonexistent/run/run.yaml").unwrap_err();
        assert!(matches!(err, MetricError::MissingWorkloadCard { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_from_run_name() {
        let p = Parallelism::from_run_name("deepseek_ep2_tp1");
        assert_eq!(p.ep, Some(2));
        assert_eq!(p.tp, 1);
        assert_eq!(p.dp, None);

        let p = Parallelism::from_run_name("MODEL_Qwen_Qwen3-4B,INPUT_1024,BATCH_64,TP_8");
        assert_eq!(p.tp, 8);

        let p = Parallelism::from_run_name("Qwen3-4B-torchxla-vllm-tp4-tpu-group-4");
        assert_eq!(p.tp, 4);

        let p = Parallelism::from_run_name("llama_pp2_dp4");
        assert_eq!(p.pp, 2);
        assert_eq!(p.dp, Some(4));
    }

    #[test]
    fn test_group_size_fallback() {
        assert_eq!(Parallelism::default().group_size(4), 4);
    }

    #[test]
    fn test_two_node_qwen() {
        let text = CARD
            .replace("llama-3.1-8B", "qwen-32b")
            .replace("pp: 1", "pp: 2");
        let card = WorkloadCard::parse("run.yaml", &text).unwrap();
        assert!(card.is_two_node_qwen());
    }
}
