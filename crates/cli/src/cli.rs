use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use strads_core::StradsConfig;

/// Scheduler-driven parallel coordinate descent.
///
/// Runs a coordinator and its scheduler machines in one process, or writes
/// synthetic partition files to feed them.
#[derive(Parser, Debug)]
#[command(name = "strads", version, about = "Dynamic scheduling for parallel coordinate descent")]
pub struct CliArgs {
    #[command(flatten)]
    pub cluster: ClusterArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Cluster shape overrides, applied on top of the config file and the
/// `STRADS_*` environment.
#[derive(Args, Debug, Default)]
pub struct ClusterArgs {
    /// Path to a TOML config file
    #[arg(short = 'c', long, global = true, env = "STRADS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Worker machines
    #[arg(short = 'm', long, global = true)]
    pub worker_machines: Option<usize>,

    /// Threads per worker machine
    #[arg(short = 't', long, global = true)]
    pub worker_threads: Option<usize>,

    /// Scheduler machines
    #[arg(short = 's', long, global = true)]
    pub scheduler_machines: Option<usize>,

    /// Scheduler threads per scheduler machine
    #[arg(short = 'p', long, global = true)]
    pub scheduler_threads: Option<usize>,

    /// Out-of-core column groups (1 disables swapping)
    #[arg(short = 'g', long, global = true)]
    pub ooc_partitions: Option<usize>,

    /// Rounds between out-of-core loads
    #[arg(short = 'e', long, global = true)]
    pub ooc_frequency: Option<u64>,
}

impl ClusterArgs {
    pub fn apply(&self, config: &mut StradsConfig) {
        let c = &mut config.cluster;
        if let Some(v) = self.worker_machines {
            c.worker_machines = v;
        }
        if let Some(v) = self.worker_threads {
            c.threads_per_worker = v;
        }
        if let Some(v) = self.scheduler_machines {
            c.scheduler_machines = v;
        }
        if let Some(v) = self.scheduler_threads {
            c.threads_per_scheduler = v;
        }
        if let Some(v) = self.ooc_partitions {
            c.ooc_partitions = v;
        }
        if let Some(v) = self.ooc_frequency {
            c.ooc_frequency = v;
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the least-squares demo on an in-process cluster
    Run(RunArgs),
    /// Write a synthetic binary partition file
    Gen(GenArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Partition file holding the design matrix; adds a shard under the
    /// configured check alias
    #[arg(long)]
    pub data: Option<PathBuf>,

    /// Number of tasks (matrix columns)
    #[arg(long)]
    pub modelsize: Option<u64>,

    /// Tasks sampled per phase
    #[arg(long)]
    pub maxset: Option<usize>,

    /// Coordinator rounds
    #[arg(long)]
    pub iterations: Option<u64>,

    /// L1 penalty of the demo objective
    #[arg(long, default_value_t = 0.0)]
    pub lambda: f64,

    /// Write the final non-zero coefficients as JSON
    #[arg(long)]
    pub output: Option<PathBuf>,
}

impl RunArgs {
    pub fn apply(&self, config: &mut StradsConfig) {
        if let Some(v) = self.modelsize {
            config.scheduler.modelsize = v;
        }
        if let Some(v) = self.maxset {
            config.scheduler.maxset = v;
        }
        if let Some(v) = self.iterations {
            config.run.iterations = v;
        }
    }
}

#[derive(Args, Debug)]
pub struct GenArgs {
    /// Output file
    pub output: PathBuf,

    #[arg(long, default_value_t = 200)]
    pub rows: u64,

    #[arg(long, default_value_t = 1000)]
    pub cols: u64,

    /// Probability that an entry is non-zero
    #[arg(long, default_value_t = 0.05)]
    pub density: f64,

    #[arg(long, default_value_t = 1)]
    pub seed: u64,
}
