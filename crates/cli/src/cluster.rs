//! In-process cluster: every scheduler machine on its own thread, connected
//! to the coordinator by a link pair.

use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use tracing::{error, info};

use strads_coordinator::{Coordinator, RoundHandler, RunSummary};
use strads_core::StradsConfig;
use strads_scheduler::{MachineContext, SchedError, SchedulerMachine, SchedulerStats};
use strads_wire::{link_pair, Link};

/// Everything a finished run reports.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub summary: RunSummary,
    pub schedulers: SchedulerStats,
}

type MachineHandle = JoinHandle<Result<SchedulerStats, SchedError>>;

pub fn run_cluster<H: RoundHandler>(config: StradsConfig, handler: H) -> Result<(RunReport, H)> {
    let coord_rank = config.cluster.scheduler_machines as i32;
    let mut links: Vec<Link> = Vec::new();
    let mut handles: Vec<MachineHandle> = Vec::new();

    for mid in 0..config.cluster.scheduler_machines {
        let ctx = MachineContext::from_cluster(mid, &config.cluster, config.scheduler.clone())
            .with_context(|| format!("building context for scheduler machine {mid}"))?;
        let (coord, link) = link_pair(coord_rank, mid as i32);
        let machine = SchedulerMachine::new(Arc::new(ctx), link)
            .with_context(|| format!("starting scheduler machine {mid}"))?;
        let handle = std::thread::Builder::new()
            .name(format!("strads-machine-{mid}"))
            .spawn(move || machine.run())
            .context("spawning scheduler machine thread")?;
        links.push(coord);
        handles.push(handle);
    }

    let mut coordinator = Coordinator::new(config, links, handler)?;
    let outcome = coordinator.run();
    // Dropping the coordinator closes every link, so machines that missed
    // the shutdown fail their next receive instead of blocking.
    let handler = coordinator.into_handler();

    let mut schedulers = SchedulerStats::default();
    let mut machine_err = None;
    for (mid, handle) in handles.into_iter().enumerate() {
        match handle.join() {
            Ok(Ok(stats)) => schedulers.merge(&stats),
            Ok(Err(e)) => {
                error!(mid, error = %e, "scheduler machine failed");
                machine_err.get_or_insert_with(|| anyhow!("scheduler machine {mid}: {e}"));
            }
            Err(_) => {
                machine_err.get_or_insert_with(|| anyhow!("scheduler machine {mid} panicked"));
            }
        }
    }

    let summary = outcome.context("coordinator failed")?;
    if let Some(e) = machine_err {
        return Err(e);
    }
    info!(
        iterations = summary.iterations,
        rounds = schedulers.rounds,
        retention = schedulers.retention(),
        "cluster run complete"
    );
    Ok((
        RunReport {
            summary,
            schedulers,
        },
        handler,
    ))
}

#[cfg(test)]
mod tests {
    use strads_core::{ShardKind, TaskRange};
    use strads_dshard::{load_shard, ShardTag};

    use super::*;
    use crate::demo::LeastSquares;
    use crate::synth::Synthetic;

    #[test]
    fn demo_run_lowers_the_objective() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        Synthetic {
            rows: 80,
            cols: 40,
            density: 0.3,
            seed: 4,
        }
        .write(&path)
        .unwrap();

        let config = StradsConfig::from_toml(&format!(
            r#"
[cluster]
scheduler_machines = 2
threads_per_scheduler = 2

[scheduler]
modelsize = 40
maxset = 3
infthreshold = 0.5
degenerate_policy = "zero"

[run]
iterations = 400
logfreq = 100
switch_iter = 200

[[shards]]
alias = "Acol"
path = {:?}
"#,
            path.to_str().unwrap()
        ))
        .unwrap();

        let shard = load_shard(
            &path,
            "Acol",
            ShardKind::Sparse,
            TaskRange::new(0, 39),
            None,
            ShardTag::whole(),
        )
        .unwrap();
        let mut handler = LeastSquares::planted(Arc::new(shard), 0.0).unwrap();
        let start = handler.objective().unwrap();

        let (report, mut handler) = run_cluster(config, handler).unwrap();
        assert_eq!(report.summary.iterations, 400);
        assert_eq!(report.summary.restarts, 2);
        assert!(report.schedulers.rounds >= 400);

        let end = handler.objective().unwrap();
        assert!(end < start, "objective {start} -> {end}");
        assert_eq!(report.summary.final_objective, Some(end));
    }
}
