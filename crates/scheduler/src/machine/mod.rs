//! The scheduler machine: one dispatch loop per node that multiplexes the
//! phases of its threads onto the coordinator link and demultiplexes the
//! coordinator's weight updates back to the threads.

mod dispatch;
mod handshake;


use std::sync::Arc;

use tracing::{info, warn};

use strads_wire::Endpoint;

use crate::context::MachineContext;
use crate::error::SchedError;
use crate::ooc::OocController;
use crate::stats::SchedulerStats;
use crate::thread::SchedulerThread;

/// One scheduler node: its threads, its link to the coordinator and its
/// out-of-core controller.
pub struct SchedulerMachine<E: Endpoint> {
    pub(super) ctx: Arc<MachineContext>,
    pub(super) link: E,
    pub(super) threads: Vec<SchedulerThread>,
    pub(super) ooc: OocController,
    /// Next thread to poll for a finished phase.
    pub(super) rr: usize,
    /// Set after a shard swap until the next phase carries the flag.
    pub(super) oocdone_pending: bool,
}

impl<E: Endpoint> SchedulerMachine<E> {
    /// Spawn one scheduler thread per local partition.
    pub fn new(ctx: Arc<MachineContext>, link: E) -> Result<Self, SchedError> {
        let threads = (0..ctx.threads())
            .map(|lid| SchedulerThread::spawn(ctx.clone(), lid))
            .collect::<Result<Vec<_>, _>>()?;
        info!(
            mid = ctx.mid,
            threads = threads.len(),
            range = %ctx.machine_range(),
            "scheduler machine started"
        );
        let ooc = OocController::new(ctx.clone());
        Ok(Self {
            ctx,
            link,
            threads,
            ooc,
            rr: 0,
            oocdone_pending: false,
        })
    }

    pub fn context(&self) -> &Arc<MachineContext> {
        &self.ctx
    }

    /// Serve the coordinator until `Shutdown`, then stop the threads and
    /// return their merged statistics.
    pub fn run(mut self) -> Result<SchedulerStats, SchedError> {
        let served = self.serve();
        self.ooc.shutdown();
        // Threads waiting for a column group would never see the shutdown.
        self.ctx.gate.close();

        let mut stats = SchedulerStats::default();
        let mut first_err = served.err();
        for t in self.threads.drain(..) {
            match t.shutdown() {
                Ok(s) => stats.merge(&s),
                Err(e) => {
                    warn!(mid = self.ctx.mid, error = %e, "scheduler thread ended with error");
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }

        if let Some(e) = first_err {
            return Err(e);
        }
        info!(
            mid = self.ctx.mid,
            rounds = stats.rounds,
            sampled = stats.sampled,
            retained = stats.retained,
            cancelled = stats.cancelled,
            unchecked = stats.unchecked_rounds,
            held = stats.held_rounds,
            ooc_swaps = self.ooc.swaps(),
            "scheduler machine stopped"
        );
        Ok(stats)
    }
}
