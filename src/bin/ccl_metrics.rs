use std::path::PathBuf;

use anyhow::Context;
use ccl_metrics::logging::{init_with_config, LogFormat, LoggingConfig};
use ccl_metrics::{evaluate, Metric, PipelineConfig};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "ccl-metrics", version)]
#[command(about = "Compute collective-communication metrics from profiler traces", long_about = None)]
struct Cli {
    /// Trace directories to evaluate, in order
    #[arg(long, num_args = 1.., required_unless_present = "list")]
    trace: Vec<PathBuf>,

    /// Metric to compute (see --list)
    #[arg(long, required_unless_present = "list")]
    metric: Option<String>,

    /// Print the known metric names and exit
    #[arg(long)]
    list: bool,

    /// Peak link bandwidth in GB/s for the nsys collective metrics
    #[arg(long)]
    link_bandwidth_gbps: Option<f64>,

    /// Copy-to-kernel as-of tolerance in ns
    #[arg(long)]
    tolerance_ns: Option<i64>,

    /// Group size when the workload card reports no tensor parallelism
    #[arg(long)]
    group_size: Option<u32>,

    /// Do not write per-sample CSV tables
    #[arg(long)]
    no_csv: bool,

    /// Emit logs as JSON on stderr
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    fn pipeline_config(&self) -> PipelineConfig {
        let mut config = PipelineConfig::default().with_write_samples(!self.no_csv);
        if let Some(gbps) = self.link_bandwidth_gbps {
            config = config.with_link_bandwidth_gbps(gbps);
        }
        if let Some(ns) = self.tolerance_ns {
            config = config.with_memcpy_kernel_tolerance_ns(ns);
        }
        if let Some(n) = self.group_size {
            config = config.with_default_group_size(n);
        }
        config
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut logging = LoggingConfig::from_env();
    if cli.json_logs {
        logging = logging.with_format(LogFormat::Json);
    }
    init_with_config(&logging);

    if cli.list {
        for metric in Metric::ALL {
            println!("{:<30} {}", metric.name(), metric.description());
        }
        return Ok(());
    }

    let name = cli.metric.as_deref().context("--metric is required")?;
    let metric = Metric::from_name(name)?;
    let config = cli.pipeline_config();
    config.validate()?;

    let prefix = cli.trace.len() > 1;
    let mut failures = 0usize;
    for dir in &cli.trace {
        match evaluate(metric, dir, &config) {
            Ok(value) => {
                let json = serde_json::to_string(&value)?;
                if prefix {
                    println!("{}: {}", dir.display(), json);
                } else {
                    println!("{}", json);
                }
            }
            Err(e) => {
                failures += 1;
                eprintln!("{}: {} ({} error)", dir.display(), e, e.category());
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{} of {} trace directories failed", failures, cli.trace.len());
    }
    Ok(())
}
