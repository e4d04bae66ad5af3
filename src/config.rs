//! Pipeline configuration
//!
//! [`PipelineConfig`] replaces every hardcoded constant a metric needs:
//! link bandwidths, join tolerances, fallback group size and the table of
//! known model families. It is built once and passed by reference into each
//! metric pipeline.

use std::collections::BTreeMap;

use crate::error::{MetricError, MetricResult};

/// Default tolerance for as-of joins, in trace time units (ns)
pub const DEFAULT_ASOF_TOLERANCE_NS: i64 = 100_000;

/// Maximum delay between a device-to-device copy and the reduce kernel
/// that consumes it
pub const DEFAULT_MEMCPY_KERNEL_TOLERANCE_NS: i64 = 20_000;

/// Physical link used to judge achieved bandwidth
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkSpec {
    /// Peak link bandwidth in GB/s
    pub peak_gbps: f64,
    /// Per-hop latency term in seconds (ring alpha)
    pub latency_s: f64,
}

impl LinkSpec {
    /// NVLink as seen by the intra-node collectives (600 GB/s)
    pub fn nvlink() -> Self {
        LinkSpec {
            peak_gbps: 600.0,
            latency_s: 0.0,
        }
    }

    /// One GPU-GPU pair on a 4 x 25 GB/s NVLink fabric
    pub fn nvlink_pair() -> Self {
        LinkSpec {
            peak_gbps: 100.0,
            latency_s: 0.0,
        }
    }

    /// Peak bandwidth in bytes per second (decimal GB)
    pub fn peak_bytes_per_s(&self) -> f64 {
        self.peak_gbps * 1e9
    }
}

/// What the pipelines need to know about one model family
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    /// Vocabulary size (logits per token)
    pub vocab_size: u64,
    /// Bytes per logit element
    pub element_bytes: u64,
    /// Mixture-of-experts model (all-to-all traffic exists)
    pub has_experts: bool,
}

impl ModelSpec {
    /// Size of one row of logits in bytes
    pub fn logits_bytes(&self) -> u64 {
        self.vocab_size * self.element_bytes
    }
}

/// Known model families, keyed by the `model_family` string of the
/// workload card
#[derive(Debug, Clone, PartialEq)]
pub struct ModelCatalog {
    models: BTreeMap<String, ModelSpec>,
}

impl Default for ModelCatalog {
    fn default() -> Self {
        let mut catalog = ModelCatalog {
            models: BTreeMap::new(),
        };
        catalog.insert(
            "deepseek-v2-lite",
            ModelSpec {
                vocab_size: 102_400,
                element_bytes: 2,
                has_experts: true,
            },
        );
        catalog.insert(
            "llama-3.1-8B",
            ModelSpec {
                vocab_size: 128_256,
                element_bytes: 2,
                has_experts: false,
            },
        );
        catalog.insert(
            "qwen-32b",
            ModelSpec {
                vocab_size: 151_936,
                element_bytes: 2,
                has_experts: false,
            },
        );
        catalog
    }
}

impl ModelCatalog {
    /// Catalog with no entries
    pub fn empty() -> Self {
        ModelCatalog {
            models: BTreeMap::new(),
        }
    }

    /// Add or replace a family
    pub fn insert(&mut self, family: impl Into<String>, spec: ModelSpec) {
        self.models.insert(family.into(), spec);
    }

    /// Look up a family by its exact name
    pub fn get(&self, family: &str) -> Option<&ModelSpec> {
        self.models.get(family)
    }

    /// Whether a family is known
    pub fn contains(&self, family: &str) -> bool {
        self.models.contains_key(family)
    }

    /// Family names in sorted order
    pub fn families(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }
}

/// Configuration shared by every metric pipeline
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Link used by the nsys collective-utilization metrics
    pub link: LinkSpec,

    /// Link used by the Kineto expected-time metric
    pub kineto_link: LinkSpec,

    /// Copy-to-kernel tolerance for the all-reduce pattern (ns)
    pub memcpy_kernel_tolerance_ns: i64,

    /// Group size when the workload card does not state one
    pub default_group_size: u32,

    /// Known model families
    pub catalog: ModelCatalog,

    /// Persist per-sample CSV tables next to the trace
    pub write_samples: bool,

    /// Peak TFLOPS per TPU chip (TPU MFU)
    pub peak_tflops_per_chip: f64,

    /// Peak dense BF16 TFLOPS per GPU (Kineto MFU)
    pub peak_tflops_per_gpu: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            link: LinkSpec::nvlink(),
            kineto_link: LinkSpec::nvlink_pair(),
            memcpy_kernel_tolerance_ns: DEFAULT_MEMCPY_KERNEL_TOLERANCE_NS,
            default_group_size: 4,
            catalog: ModelCatalog::default(),
            write_samples: true,
            peak_tflops_per_chip: 918.0,
            peak_tflops_per_gpu: 312.0,
        }
    }
}

impl PipelineConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the peak bandwidth of the collective link (GB/s)
    pub fn with_link_bandwidth_gbps(mut self, peak_gbps: f64) -> Self {
        self.link.peak_gbps = peak_gbps;
        self
    }

    /// Set the link used for expected-time utilization
    pub fn with_kineto_link(mut self, link: LinkSpec) -> Self {
        self.kineto_link = link;
        self
    }

    /// Set the copy-to-kernel tolerance
    pub fn with_memcpy_kernel_tolerance_ns(mut self, tolerance_ns: i64) -> Self {
        self.memcpy_kernel_tolerance_ns = tolerance_ns;
        self
    }

    /// Set the fallback group size
    pub fn with_default_group_size(mut self, group_size: u32) -> Self {
        self.default_group_size = group_size;
        self
    }

    /// Replace the model catalog
    pub fn with_catalog(mut self, catalog: ModelCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Enable or disable CSV persistence
    pub fn with_write_samples(mut self, write_samples: bool) -> Self {
        self.write_samples = write_samples;
        self
    }

    /// Reject values no pipeline can work with
    pub fn validate(&self) -> MetricResult<()> {
        for (label, link) in [("link", &self.link), ("kineto link", &self.kineto_link)] {
            if !(link.peak_gbps.is_finite() && link.peak_gbps > 0.0) {
                return Err(MetricError::InvalidConfiguration(format!(
                    "{} peak bandwidth must be positive, got {}",
                    label, link.peak_gbps
                )));
            }
            if !(link.latency_s.is_finite() && link.latency_s >= 0.0) {
                return Err(MetricError::InvalidConfiguration(format!(
                    "{} latency must be non-negative, got {}",
                    label, link.latency_s
                )));
            }
        }

        if self.memcpy_kernel_tolerance_ns < 0 {
            return Err(MetricError::InvalidConfiguration(format!(
                "copy-to-kernel tolerance must be non-negative, got {}",
                self.memcpy_kernel_tolerance_ns
            )));
        }

        if self.default_group_size == 0 {
            return Err(MetricError::InvalidConfiguration(
                "group size must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.link.peak_gbps, 600.0);
        assert_eq!(config.kineto_link.peak_gbps, 100.0);
        assert_eq!(config.memcpy_kernel_tolerance_ns, 20_000);
        assert_eq!(config.default_group_size, 4);
        assert!(config.write_samples);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = PipelineConfig::new()
            .with_link_bandwidth_gbps(900.0)
            .with_memcpy_kernel_tolerance_ns(5_000)
            .with_default_group_size(8)
            .with_write_samples(false);

        assert_eq!(config.link.peak_gbps, 900.0);
        assert_eq!(config.memcpy_kernel_tolerance_ns, 5_000);
        assert_eq!(config.default_group_size, 8);
        assert!(!config.write_samples);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(PipelineConfig::new()
            .with_link_bandwidth_gbps(0.0)
            .validate()
            .is_err());
        assert!(PipelineConfig::new()
            .with_memcpy_kernel_tolerance_ns(-1)
            .validate()
            .is_err());
        assert!(PipelineConfig::new()
            .with_default_group_size(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_catalog_lookup() {
        let catalog = ModelCatalog::default();
        assert_eq!(catalog.get("llama-3.1-8B").map(|m| m.logits_bytes()), Some(256_512));
        assert_eq!(catalog.get("qwen-32b").map(|m| m.vocab_size), Some(151_936));
        assert!(catalog.get("deepseek-v2-lite").map(|m| m.has_experts).unwrap_or(false));
        assert!(!catalog.contains("gpt-2"));
        assert_eq!(catalog.families().count(), 3);
    }

    #[test]
    fn test_link_bytes_per_second() {
        assert_eq!(LinkSpec::nvlink_pair().peak_bytes_per_s(), 100e9);
    }
}
