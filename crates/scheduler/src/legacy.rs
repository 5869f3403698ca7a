//! Delta-stream gate path.
//!
//! Instead of explicit weight-update messages the [`GateThread`] receives
//! per-partition streams of weight deltas, optionally terminated by control
//! entries that retune the base weight and the sample size. Each stream goes
//! to the partition's helper, which samples, screens and answers with a
//! phase. A stream flagged `blockgh` parks the helper on the
//! [`PartitionGate`](crate::PartitionGate) after it has produced its phase;
//! the phase is released only when a `WakeUp` frame for that partition
//! arrives. Helpers also start parked, so every partition must be woken once
//! before its first stream.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use strads_core::TaskId;
use strads_wire::{
    DeltaControls, DeltaEntry, Endpoint, Envelope, IdVal, Message, PhaseMessage, Queue,
    ShardLoaded,
};

use crate::command::MakePhase;
use crate::context::MachineContext;
use crate::error::SchedError;
use crate::ooc::{load_initial, OocController};
use crate::sampler::WeightedSampler;
use crate::stats::SchedulerStats;
use crate::thread::PartitionScreen;

/// Headroom of a delta stream over the sample size.
const SET_RATIO: f64 = 1.5;

const IDLE_BACKOFF: Duration = Duration::from_micros(50);

#[derive(Debug)]
enum HelperCommand {
    Deltas {
        entries: Vec<DeltaEntry>,
        blockgh: bool,
    },
    Shutdown,
}

// ── Helper ──────────────────────────────────────────────────────────

/// Handle to one partition's helper thread.
#[derive(Debug)]
struct GateHelper {
    gid: usize,
    inq: Queue<HelperCommand>,
    outq: Queue<MakePhase>,
    handle: Option<JoinHandle<Result<SchedulerStats, SchedError>>>,
}

impl GateHelper {
    fn spawn(ctx: Arc<MachineContext>, lid: usize) -> Result<Self, SchedError> {
        let gid = ctx.gid(lid);
        let inq = Queue::new("helper-inq");
        let outq = Queue::new("helper-outq");
        let (rx, tx) = (inq.clone(), outq.clone());
        let handle = std::thread::Builder::new()
            .name(format!("strads-helper-{gid}"))
            .spawn(move || {
                let mut worker = HelperWorker::new(ctx.clone(), lid);
                let res = worker.serve(&rx, &tx);
                ctx.gate.retire(lid);
                if let Err(e) = &res {
                    error!(gid, error = %e, "gate helper failed");
                }
                res.map(|()| worker.stats)
            })?;
        Ok(Self {
            gid,
            inq,
            outq,
            handle: Some(handle),
        })
    }

    fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    fn join(&mut self) -> Result<SchedulerStats, SchedError> {
        match self.handle.take() {
            Some(h) => h
                .join()
                .map_err(|_| SchedError::ThreadPanic(format!("strads-helper-{}", self.gid)))?,
            None => Ok(SchedulerStats::default()),
        }
    }
}

struct HelperWorker {
    ctx: Arc<MachineContext>,
    lid: usize,
    gid: usize,
    sampler: WeightedSampler,
    screen: PartitionScreen,
    desired: usize,
    stats: SchedulerStats,
}

impl HelperWorker {
    fn new(ctx: Arc<MachineContext>, lid: usize) -> Self {
        let gid = ctx.gid(lid);
        let range = ctx.thread_range(lid);
        Self {
            sampler: WeightedSampler::from_params(range, gid, &ctx.params),
            screen: PartitionScreen::new(ctx.clone(), lid),
            desired: ctx.params.maxset,
            stats: SchedulerStats::default(),
            ctx,
            lid,
            gid,
        }
    }

    fn max_stream(&self) -> usize {
        (self.desired.max(self.ctx.params.maxset) as f64 * SET_RATIO) as usize
    }

    fn serve(
        &mut self,
        inq: &Queue<HelperCommand>,
        outq: &Queue<MakePhase>,
    ) -> Result<(), SchedError> {
        // Boot parked until the first wake-up.
        self.ctx.gate.park(self.lid);
        debug!(gid = self.gid, "gate helper released");

        loop {
            match inq.pop()? {
                HelperCommand::Deltas { entries, blockgh } => {
                    let Some(task_ids) = self.apply(entries)? else {
                        debug!(gid = self.gid, "gate closed, phase dropped");
                        return Ok(());
                    };
                    if blockgh {
                        self.ctx.gate.park(self.lid);
                    }
                    outq.push(MakePhase {
                        gid: self.gid,
                        task_ids,
                    })?;
                }
                HelperCommand::Shutdown => return Ok(()),
            }
        }
    }

    /// Apply one delta stream and produce the next phase, or `None` when the
    /// gate closed while the partition waited for its columns.
    fn apply(&mut self, entries: Vec<DeltaEntry>) -> Result<Option<Vec<TaskId>>, SchedError> {
        let (deltas, controls) = DeltaControls::strip(entries)?;
        if let Some(bw) = controls.min_unit_change {
            self.sampler.set_base_weight(bw);
        }
        if let Some(d) = controls.desired_change {
            let d = d as usize;
            if d != 0 && d != self.desired {
                if d >= self.sampler.len() {
                    return Err(SchedError::SetSizeTooLarge {
                        setsize: d,
                        len: self.sampler.len(),
                    });
                }
                debug!(gid = self.gid, from = self.desired, to = d, "sample size changed");
                self.desired = d;
            }
        }
        if deltas.len() > self.max_stream() {
            return Err(SchedError::Protocol(format!(
                "delta stream of {} entries for partition {} exceeds {}",
                deltas.len(),
                self.gid,
                self.max_stream()
            )));
        }

        let changes: Vec<IdVal> = deltas.iter().map(|d| IdVal::new(d.idx, d.delta)).collect();
        self.sampler.update_weight(&changes)?;

        let cancelled_before = self.sampler.cancelled();
        let samples = self.sampler.do_sampling(self.desired)?;
        let Some((retained, checked)) =
            self.screen
                .screen(&self.sampler, &samples, self.desired, false)?
        else {
            return Ok(None);
        };
        if self.screen.take_waited() {
            self.stats.held_rounds += 1;
        }
        self.stats.record_round(
            samples.len(),
            retained.len(),
            self.sampler.cancelled() - cancelled_before,
            checked,
        );
        Ok(Some(retained))
    }
}

// ── Gate thread ─────────────────────────────────────────────────────

/// Dispatch loop of the delta-stream path for one scheduler machine.
pub struct GateThread<E: Endpoint> {
    ctx: Arc<MachineContext>,
    link: E,
    helpers: Vec<GateHelper>,
    ooc: OocController,
    rr: usize,
    oocdone_pending: bool,
}

impl<E: Endpoint> GateThread<E> {
    /// Spawn one parked helper per local partition.
    pub fn new(ctx: Arc<MachineContext>, link: E) -> Result<Self, SchedError> {
        for lid in 0..ctx.threads() {
            ctx.gate.request_park(lid);
        }
        let helpers = (0..ctx.threads())
            .map(|lid| GateHelper::spawn(ctx.clone(), lid))
            .collect::<Result<Vec<_>, _>>()?;
        info!(mid = ctx.mid, helpers = helpers.len(), "gate thread started");
        let ooc = OocController::new(ctx.clone());
        Ok(Self {
            ctx,
            link,
            helpers,
            ooc,
            rr: 0,
            oocdone_pending: false,
        })
    }

    pub fn run(mut self) -> Result<SchedulerStats, SchedError> {
        let served = self.serve();
        self.ooc.shutdown();
        self.ctx.gate.close();

        let mut stats = SchedulerStats::default();
        let mut first_err = served.err();
        for (lid, mut h) in self.helpers.drain(..).enumerate() {
            let _ = h.inq.push(HelperCommand::Shutdown);
            // Parked helpers must be released before they can see the shutdown.
            while !h.is_finished() {
                if self.ctx.gate.wake(lid).is_err() {
                    std::thread::sleep(IDLE_BACKOFF);
                }
            }
            match h.join() {
                Ok(s) => stats.merge(&s),
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }
        if let Some(e) = first_err {
            return Err(e);
        }
        info!(mid = self.ctx.mid, rounds = stats.rounds, "gate thread stopped");
        Ok(stats)
    }

    fn serve(&mut self) -> Result<(), SchedError> {
        loop {
            if let Some(env) = self.link.try_recv()? {
                if !self.handle(env)? {
                    return Ok(());
                }
                continue;
            }
            if self.ooc.poll()? {
                self.oocdone_pending = true;
            }
            if !self.forward_phase()? {
                self.check_helpers()?;
                std::thread::sleep(IDLE_BACKOFF);
            }
        }
    }

    /// Returns `false` on shutdown.
    fn handle(&mut self, env: Envelope) -> Result<bool, SchedError> {
        let partition = env.header.partition;
        match env.message {
            Message::DeltaUpdate(entries) => {
                let lid = self.local(partition)?;
                let blockgh = env.header.blockgh;
                if blockgh {
                    self.ctx.gate.request_park(lid);
                }
                self.helpers[lid]
                    .inq
                    .push(HelperCommand::Deltas { entries, blockgh })?;
            }
            Message::WakeUp => {
                let lid = self.local(partition)?;
                self.ctx.gate.wake(lid)?;
            }
            Message::LoadShard(spec) => {
                let shard = load_initial(&self.ctx, &spec)?;
                let ack = ShardLoaded {
                    mid: self.ctx.mid as i32,
                    alias: spec.alias.clone(),
                    nonzero: shard.nonzero(),
                };
                self.ctx.install_shard(shard);
                self.ooc.register(spec);
                self.link.send(Envelope::new(Message::ShardLoaded(ack)))?;
            }
            Message::OocLoad(cmd) => match self.ooc.request(&cmd) {
                Err(SchedError::LoadInFlight) => {
                    warn!(mid = self.ctx.mid, "ooc load already in flight, request dropped");
                }
                other => other?,
            },
            Message::Shutdown => return Ok(false),
            other => {
                return Err(SchedError::Protocol(format!(
                    "unexpected {} on gate thread {}",
                    other.name(),
                    self.ctx.mid
                )))
            }
        }
        Ok(true)
    }

    /// Local helper of global partition `partition`; the partition must
    /// belong to this machine.
    fn local(&self, partition: u64) -> Result<usize, SchedError> {
        self.ctx.lid_of(partition as usize).ok_or_else(|| {
            SchedError::Protocol(format!(
                "partition {partition} does not belong to machine {}",
                self.ctx.mid
            ))
        })
    }

    fn forward_phase(&mut self) -> Result<bool, SchedError> {
        let n = self.helpers.len();
        if n == 0 {
            return Ok(false);
        }
        let lid = self.rr % n;
        self.rr = (lid + 1) % n;
        let Some(phase) = self.helpers[lid].outq.try_pop()? else {
            return Ok(false);
        };
        let oocdone = std::mem::take(&mut self.oocdone_pending);
        let env = Envelope::new(Message::Phase(PhaseMessage {
            mid: self.ctx.mid as i32,
            thrdgid: phase.gid as i32,
            task_ids: phase.task_ids,
        }))
        .with_partition(phase.gid as u64)
        .with_oocdone(oocdone);
        self.link.send(env)?;
        Ok(true)
    }

    fn check_helpers(&mut self) -> Result<(), SchedError> {
        for h in &mut self.helpers {
            if h.is_finished() {
                let gid = h.gid;
                return match h.join() {
                    Err(e) => Err(e),
                    Ok(_) => Err(SchedError::Protocol(format!(
                        "gate helper {gid} stopped without shutdown"
                    ))),
                };
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use strads_core::{PartitionTable, SchedulerParams};
    use strads_wire::{link_pair, Link};

    use super::*;

    const COORD: i32 = 9;

    fn spawn(
        modelsize: u64,
        machines: usize,
        threads: usize,
        mid: usize,
    ) -> (Link, JoinHandle<Result<SchedulerStats, SchedError>>) {
        let params = SchedulerParams {
            modelsize,
            maxset: 4,
            ..SchedulerParams::default()
        };
        let table = PartitionTable::new(modelsize, machines, threads).unwrap();
        let ctx = Arc::new(MachineContext::new(mid, params, table, 1).unwrap());
        let (coord, link) = link_pair(COORD, mid as i32);
        let gate = GateThread::new(ctx, link).unwrap();
        (coord, std::thread::spawn(move || gate.run()))
    }

    fn deltas(ids: impl Iterator<Item = u64>, controls: DeltaControls) -> Vec<DeltaEntry> {
        let mut out: Vec<DeltaEntry> = ids.map(|id| DeltaEntry::new(id, 1.0)).collect();
        controls.append_to(&mut out);
        out
    }

    fn recv_phase(coord: &Link) -> PhaseMessage {
        match coord.recv().unwrap().message {
            Message::Phase(p) => p,
            other => panic!("expected phase, got {}", other.name()),
        }
    }

    #[test]
    fn stream_after_wake_produces_phase() {
        let (coord, handle) = spawn(40, 1, 2, 0);
        coord
            .send(Envelope::new(Message::WakeUp).with_partition(1))
            .unwrap();
        coord
            .send(
                Envelope::new(Message::DeltaUpdate(deltas(
                    20..26,
                    DeltaControls {
                        desired_change: Some(3.0),
                        min_unit_change: Some(0.5),
                    },
                )))
                .with_partition(1),
            )
            .unwrap();

        let phase = recv_phase(&coord);
        assert_eq!(phase.thrdgid, 1);
        assert!(!phase.task_ids.is_empty() && phase.task_ids.len() <= 3);
        assert!(phase.task_ids.iter().all(|id| (20..40).contains(id)));

        coord.send(Envelope::new(Message::Shutdown)).unwrap();
        let stats = handle.join().unwrap().unwrap();
        assert_eq!(stats.rounds, 1);
    }

    #[test]
    fn blocked_phase_waits_for_wake() {
        let (coord, handle) = spawn(40, 1, 2, 0);
        coord
            .send(Envelope::new(Message::WakeUp).with_partition(0))
            .unwrap();
        coord
            .send(
                Envelope::new(Message::DeltaUpdate(deltas(0..4, DeltaControls::default())))
                    .with_partition(0)
                    .with_blockgh(true),
            )
            .unwrap();

        std::thread::sleep(Duration::from_millis(50));
        assert!(coord.try_recv().unwrap().is_none());

        coord
            .send(Envelope::new(Message::WakeUp).with_partition(0))
            .unwrap();
        assert_eq!(recv_phase(&coord).thrdgid, 0);

        coord.send(Envelope::new(Message::Shutdown)).unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn waking_unblocked_partition_is_fatal() {
        let (coord, handle) = spawn(40, 1, 2, 0);
        coord
            .send(Envelope::new(Message::WakeUp).with_partition(0))
            .unwrap();
        coord
            .send(Envelope::new(Message::WakeUp).with_partition(0))
            .unwrap();
        assert!(matches!(
            handle.join().unwrap(),
            Err(SchedError::Protocol(_))
        ));
    }

    #[test]
    fn stream_for_foreign_partition_is_fatal() {
        let (coord, handle) = spawn(40, 2, 2, 1);
        coord
            .send(
                Envelope::new(Message::DeltaUpdate(deltas(0..2, DeltaControls::default())))
                    .with_partition(0),
            )
            .unwrap();
        assert!(matches!(
            handle.join().unwrap(),
            Err(SchedError::Protocol(_))
        ));
    }

    #[test]
    fn delta_outside_partition_is_fatal() {
        let (coord, handle) = spawn(40, 1, 2, 0);
        coord
            .send(Envelope::new(Message::WakeUp).with_partition(0))
            .unwrap();
        coord
            .send(
                Envelope::new(Message::DeltaUpdate(deltas(25..27, DeltaControls::default())))
                    .with_partition(0),
            )
            .unwrap();
        assert!(matches!(
            handle.join().unwrap(),
            Err(SchedError::OutOfRange { id: 25, .. })
        ));
    }
}
