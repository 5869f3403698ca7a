mod cli;
mod cluster;
mod demo;
mod synth;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;

use strads_core::{ShardKind, ShardSpec, StradsConfig, TaskRange};
use strads_dshard::{load_shard, read_size, ShardTag};

use crate::cli::{CliArgs, ClusterArgs, Command, GenArgs, RunArgs};
use crate::demo::LeastSquares;
use crate::synth::Synthetic;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();
    strads_core::config::load_dotenv();

    let args = CliArgs::parse();
    match args.command {
        Command::Run(run) => run_demo(&args.cluster, run),
        Command::Gen(args) => generate(args),
    }
}

/// Config file (or defaults), then `STRADS_*` environment, then flags.
fn load_config(cluster: &ClusterArgs, run: &RunArgs) -> Result<StradsConfig> {
    let mut config = match &cluster.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))?
        }
        None => StradsConfig::default(),
    };
    config.apply_env_overrides();
    cluster.apply(&mut config);

    if let Some(data) = &run.data {
        let alias = config.scheduler.check_alias.clone();
        if run.modelsize.is_none() {
            let (_, maxcol, _) =
                read_size(data).with_context(|| format!("reading {}", data.display()))?;
            config.scheduler.modelsize = maxcol;
        }
        config.shards.retain(|s| s.alias != alias);
        config.shards.push(ShardSpec {
            alias,
            path: data.clone(),
            kind: ShardKind::Sparse,
        });
    }
    run.apply(&mut config);
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn run_demo(cluster: &ClusterArgs, run: RunArgs) -> Result<()> {
    let config = load_config(cluster, &run)?;
    config.log_summary();

    let alias = &config.scheduler.check_alias;
    let Some(spec) = config.shards.iter().find(|s| &s.alias == alias) else {
        bail!("no shard named '{alias}': pass --data or add a [[shards]] entry");
    };
    let modelsize = config.scheduler.modelsize;
    let shard = load_shard(
        &spec.path,
        alias,
        spec.kind,
        TaskRange::new(0, modelsize - 1),
        None,
        ShardTag::whole(),
    )
    .with_context(|| format!("loading {}", spec.path.display()))?;

    let mut handler = LeastSquares::planted(Arc::new(shard), run.lambda)?;
    if let Some(out) = run.output {
        handler = handler.with_output(out);
    }

    let (report, _handler) = cluster::run_cluster(config, handler)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn generate(args: GenArgs) -> Result<()> {
    let spec = Synthetic {
        rows: args.rows,
        cols: args.cols,
        density: args.density,
        seed: args.seed,
    };
    let header = spec
        .write(&args.output)
        .with_context(|| format!("writing {}", args.output.display()))?;
    info!(
        path = %args.output.display(),
        rows = header.maxrow,
        cols = header.maxcol,
        nonzero = header.nonzero,
        "partition file written"
    );
    Ok(())
}
