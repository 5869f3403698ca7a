//! One scheduler thread per partition.
//!
//! The thread owns its [`WeightedSampler`]; the machine talks to it only
//! through the inbound command queue and the outbound phase queue.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, error, info, warn};

use strads_core::{TaskId, TaskRange};
use strads_wire::{IdVal, Queue};

use crate::command::{MakePhase, SamplingCommand};
use crate::context::MachineContext;
use crate::error::SchedError;
use crate::interference::InterferenceChecker;
use crate::sampler::WeightedSampler;
use crate::stats::SchedulerStats;

/// Where a scheduler thread is in its command cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    BlockedWaitingCmd = 0,
    Sampling = 1,
    /// A phase is out; waiting for its weight update.
    AwaitAck = 2,
    Stopped = 3,
}

impl ThreadState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Sampling,
            2 => Self::AwaitAck,
            3 => Self::Stopped,
            _ => Self::BlockedWaitingCmd,
        }
    }
}

/// Handle to a running scheduler thread.
#[derive(Debug)]
pub struct SchedulerThread {
    lid: usize,
    gid: usize,
    inq: Queue<SamplingCommand>,
    outq: Queue<MakePhase>,
    state: Arc<AtomicU8>,
    handle: Option<JoinHandle<Result<SchedulerStats, SchedError>>>,
}

impl SchedulerThread {
    /// Spawn the thread for local partition `lid`.
    pub fn spawn(ctx: Arc<MachineContext>, lid: usize) -> Result<Self, SchedError> {
        let gid = ctx.gid(lid);
        let inq = Queue::new("sched-inq");
        let outq = Queue::new("sched-outq");
        let state = Arc::new(AtomicU8::new(ThreadState::BlockedWaitingCmd as u8));

        let worker = Worker::new(ctx, lid, state.clone());
        let (rx, tx) = (inq.clone(), outq.clone());
        let handle = std::thread::Builder::new()
            .name(format!("strads-sched-{gid}"))
            .spawn(move || worker.run(&rx, &tx))?;

        Ok(Self {
            lid,
            gid,
            inq,
            outq,
            state,
            handle: Some(handle),
        })
    }

    pub fn lid(&self) -> usize {
        self.lid
    }

    pub fn gid(&self) -> usize {
        self.gid
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn send(&self, cmd: SamplingCommand) -> Result<(), SchedError> {
        self.inq.push(cmd)?;
        Ok(())
    }

    /// Next finished phase, if any.
    pub fn try_phase(&self) -> Result<Option<MakePhase>, SchedError> {
        Ok(self.outq.try_pop()?)
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Ask the thread to stop and wait for it.
    pub fn shutdown(mut self) -> Result<SchedulerStats, SchedError> {
        // The thread may already be gone after an error.
        let _ = self.inq.push(SamplingCommand::Shutdown);
        self.join()
    }

    /// Wait for the thread and return its result.
    pub fn join(&mut self) -> Result<SchedulerStats, SchedError> {
        match self.handle.take() {
            Some(h) => h
                .join()
                .map_err(|_| SchedError::ThreadPanic(format!("strads-sched-{}", self.gid)))?,
            None => Ok(SchedulerStats::default()),
        }
    }
}

// ── Worker ──────────────────────────────────────────────────────────

struct Worker {
    ctx: Arc<MachineContext>,
    gid: usize,
    range: TaskRange,
    sampler: WeightedSampler,
    screen: PartitionScreen,
    restart_cnt: u32,
    restart_flag: bool,
    pending: Option<Vec<TaskId>>,
    stats: SchedulerStats,
    state: Arc<AtomicU8>,
}

impl Worker {
    fn new(ctx: Arc<MachineContext>, lid: usize, state: Arc<AtomicU8>) -> Self {
        let gid = ctx.gid(lid);
        let range = ctx.thread_range(lid);
        let sampler = WeightedSampler::from_params(range, gid, &ctx.params);
        let screen = PartitionScreen::new(ctx.clone(), lid);
        Self {
            ctx,
            gid,
            range,
            sampler,
            screen,
            restart_cnt: 0,
            restart_flag: false,
            pending: None,
            stats: SchedulerStats::default(),
            state,
        }
    }

    fn set_state(&self, s: ThreadState) {
        self.state.store(s as u8, Ordering::Release);
    }

    fn run(
        mut self,
        inq: &Queue<SamplingCommand>,
        outq: &Queue<MakePhase>,
    ) -> Result<SchedulerStats, SchedError> {
        debug!(gid = self.gid, range = %self.range, "scheduler thread started");
        let result = self.serve(inq, outq);
        self.set_state(ThreadState::Stopped);
        match result {
            Ok(()) => {
                debug!(gid = self.gid, rounds = self.stats.rounds, "scheduler thread stopped");
                Ok(self.stats)
            }
            Err(e) => {
                error!(gid = self.gid, error = %e, "scheduler thread failed");
                Err(e)
            }
        }
    }

    fn serve(
        &mut self,
        inq: &Queue<SamplingCommand>,
        outq: &Queue<MakePhase>,
    ) -> Result<(), SchedError> {
        loop {
            self.set_state(if self.pending.is_some() {
                ThreadState::AwaitAck
            } else {
                ThreadState::BlockedWaitingCmd
            });

            let cmd = inq.pop()?;
            match cmd {
                SamplingCommand::InitWeightUpdate(entries) => {
                    self.check_full_cover(&entries)?;
                    self.sampler.update_weight(&entries)?;
                    self.make_phase(outq)?;
                }
                SamplingCommand::RestartWeightUpdate(entries) => {
                    self.restart_cnt += 1;
                    match self.restart_cnt {
                        1 => {}
                        2 => self.restart_flag = true,
                        n => {
                            return Err(SchedError::Protocol(format!(
                                "partition {} restarted {n} times",
                                self.gid
                            )))
                        }
                    }
                    info!(
                        gid = self.gid,
                        restart = self.restart_cnt,
                        restart_flag = self.restart_flag,
                        "weights restarted"
                    );
                    self.check_full_cover(&entries)?;
                    self.pending = None;
                    self.sampler.update_weight(&entries)?;
                    self.make_phase(outq)?;
                }
                SamplingCommand::WeightUpdate(entries) => {
                    self.check_matches_phase(&entries)?;
                    self.sampler.update_weight(&entries)?;
                    self.make_phase(outq)?;
                }
                SamplingCommand::BwChange(bw) => {
                    debug!(gid = self.gid, bw, "base weight override");
                    self.sampler.set_base_weight(bw);
                }
                SamplingCommand::Shutdown => return Ok(()),
            }
        }
    }

    /// Init and restart payloads carry every id of the partition in order.
    fn check_full_cover(&self, entries: &[IdVal]) -> Result<(), SchedError> {
        if entries.len() != self.range.len() {
            return Err(SchedError::Protocol(format!(
                "partition {} expects {} init entries, got {}",
                self.gid,
                self.range.len(),
                entries.len()
            )));
        }
        for (i, e) in entries.iter().enumerate() {
            let expect = self.range.start + i as TaskId;
            if e.id != expect {
                return Err(SchedError::Protocol(format!(
                    "partition {} init entry {i} has id {}, expected {expect}",
                    self.gid, e.id
                )));
            }
        }
        Ok(())
    }

    fn check_matches_phase(&mut self, entries: &[IdVal]) -> Result<(), SchedError> {
        let Some(mut expect) = self.pending.take() else {
            return Err(SchedError::Protocol(format!(
                "weight update for partition {} without an outstanding phase",
                self.gid
            )));
        };
        let mut got: Vec<TaskId> = entries.iter().map(|e| e.id).collect();
        expect.sort_unstable();
        got.sort_unstable();
        if expect != got {
            return Err(SchedError::Protocol(format!(
                "weight update for partition {} does not match its last phase",
                self.gid
            )));
        }
        Ok(())
    }

    fn make_phase(&mut self, outq: &Queue<MakePhase>) -> Result<(), SchedError> {
        self.set_state(ThreadState::Sampling);
        let maxset = self.ctx.params.maxset;
        let cancelled_before = self.sampler.cancelled();
        let samples = self.sampler.do_sampling(maxset)?;
        let Some((retained, checked)) =
            self.screen
                .screen(&self.sampler, &samples, maxset, self.restart_flag)?
        else {
            debug!(gid = self.gid, "gate closed, phase dropped");
            return Ok(());
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
        if retained.len() * 10 < maxset * 6 {
            debug!(
                gid = self.gid,
                sampled = samples.len(),
                retained = retained.len(),
                maxset,
                "small phase"
            );
        }

        self.pending = Some(retained.clone());
        outq.push(MakePhase {
            gid: self.gid,
            task_ids: retained,
        })?;
        Ok(())
    }
}

// ── Screening ───────────────────────────────────────────────────────

/// Interference screening for one partition against the machine's active
/// shard, taken under the partition gate.
#[derive(Debug)]
pub(crate) struct PartitionScreen {
    ctx: Arc<MachineContext>,
    lid: usize,
    gid: usize,
    range: TaskRange,
    checker: InterferenceChecker,
    warned: bool,
    waited: bool,
}

impl PartitionScreen {
    pub(crate) fn new(ctx: Arc<MachineContext>, lid: usize) -> Self {
        let checker = InterferenceChecker::from_params(&ctx.params);
        Self {
            gid: ctx.gid(lid),
            range: ctx.thread_range(lid),
            ctx,
            lid,
            checker,
            warned: false,
            waited: false,
        }
    }

    /// Whether the last screen had to wait for the partition's columns.
    pub(crate) fn take_waited(&mut self) -> bool {
        std::mem::take(&mut self.waited)
    }

    /// Filter `samples` down to `size` non-interfering ids. Blocks while the
    /// partition's column group is swapped out and returns `None` if the
    /// gate closes meanwhile. Returns the sample unchanged, with `false`,
    /// when no shard covers the partition.
    pub(crate) fn screen(
        &mut self,
        sampler: &WeightedSampler,
        samples: &[TaskId],
        size: usize,
        restart_flag: bool,
    ) -> Result<Option<(Vec<TaskId>, bool)>, SchedError> {
        if !self.ctx.gate.is_resident(self.lid) {
            debug!(gid = self.gid, "waiting for column group");
            self.waited = true;
        }
        let Some(_guard) = self.ctx.gate.enter(self.lid) else {
            return Ok(None);
        };

        let shard = match self.ctx.shards.get(&self.ctx.params.check_alias) {
            Some(s) if s.holds_range(self.range) => s,
            other => {
                let reason = if other.is_some() {
                    "shard does not cover partition"
                } else {
                    "no shard loaded"
                };
                if self.warned {
                    debug!(gid = self.gid, reason, "interference check skipped");
                } else {
                    warn!(gid = self.gid, reason, "interference check skipped");
                    self.warned = true;
                }
                return Ok(Some((samples.to_vec(), false)));
            }
        };

        let retained = self.checker.check(
            samples,
            size,
            &shard,
            |id| sampler.weight(id).unwrap_or(0.0),
            restart_flag,
        )?;
        Ok(Some((retained, true)))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use strads_core::{PartitionTable, SchedulerParams, ShardKind};
    use strads_dshard::{DataShard, ShardTag};

    use super::*;

    fn ctx(modelsize: u64, threads: usize, maxset: usize) -> Arc<MachineContext> {
        let params = SchedulerParams {
            modelsize,
            maxset,
            ..SchedulerParams::default()
        };
        let table = PartitionTable::new(modelsize, 1, threads).unwrap();
        Arc::new(MachineContext::new(0, params, table, 1).unwrap())
    }

    fn init(range: TaskRange, value: f64) -> Vec<IdVal> {
        range.ids().map(|id| IdVal::new(id, value)).collect()
    }

    fn next_phase(t: &SchedulerThread) -> MakePhase {
        for _ in 0..500 {
            if let Some(p) = t.try_phase().unwrap() {
                return p;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!("no phase from partition {}", t.gid());
    }

    #[test]
    fn init_produces_phase_inside_range() {
        let ctx = ctx(100, 4, 5);
        let t = SchedulerThread::spawn(ctx.clone(), 1).unwrap();
        t.send(SamplingCommand::InitWeightUpdate(init(TaskRange::new(25, 49), 1.0)))
            .unwrap();
        let phase = next_phase(&t);
        assert_eq!(phase.gid, 1);
        assert!(!phase.task_ids.is_empty() && phase.task_ids.len() <= 5);
        assert!(phase.task_ids.iter().all(|id| (25..=49).contains(id)));

        let stats = t.shutdown().unwrap();
        assert_eq!(stats.rounds, 1);
        assert_eq!(stats.unchecked_rounds, 1);
    }

    #[test]
    fn init_outside_partition_is_fatal() {
        let ctx = ctx(100, 4, 5);
        let mut t = SchedulerThread::spawn(ctx, 1).unwrap();
        let mut entries = init(TaskRange::new(25, 49), 1.0);
        entries[0].id = 24;
        t.send(SamplingCommand::InitWeightUpdate(entries)).unwrap();
        assert!(matches!(t.join(), Err(SchedError::Protocol(_))));
        assert_eq!(t.state(), ThreadState::Stopped);
    }

    #[test]
    fn weight_update_must_match_phase() {
        let ctx = ctx(100, 4, 5);
        let t = SchedulerThread::spawn(ctx, 0).unwrap();
        t.send(SamplingCommand::InitWeightUpdate(init(TaskRange::new(0, 24), 1.0)))
            .unwrap();
        let phase = next_phase(&t);

        let answer: Vec<IdVal> = phase.task_ids.iter().map(|id| IdVal::new(*id, 0.5)).collect();
        t.send(SamplingCommand::WeightUpdate(answer)).unwrap();
        let phase = next_phase(&t);

        let extra = (0..25).find(|id| !phase.task_ids.contains(id)).unwrap();
        let mut wrong: Vec<IdVal> = phase.task_ids.iter().map(|id| IdVal::new(*id, 0.5)).collect();
        wrong.push(IdVal::new(extra, 1.0));
        t.send(SamplingCommand::WeightUpdate(wrong)).unwrap();
        assert!(matches!(t.shutdown(), Err(SchedError::Protocol(_))));
    }

    #[test]
    fn third_restart_is_fatal() {
        let ctx = ctx(40, 2, 3);
        let t = SchedulerThread::spawn(ctx, 0).unwrap();
        let range = TaskRange::new(0, 19);
        t.send(SamplingCommand::InitWeightUpdate(init(range, 0.0))).unwrap();
        next_phase(&t);
        for _ in 0..2 {
            t.send(SamplingCommand::RestartWeightUpdate(init(range, 0.0))).unwrap();
            next_phase(&t);
        }
        t.send(SamplingCommand::RestartWeightUpdate(init(range, 0.0))).unwrap();
        assert!(matches!(t.shutdown(), Err(SchedError::Protocol(_))));
    }

    #[test]
    fn swapped_out_partition_waits_for_its_group() {
        let params = SchedulerParams {
            modelsize: 40,
            maxset: 3,
            ..SchedulerParams::default()
        };
        let table = PartitionTable::new(40, 1, 2).unwrap();
        let ctx = Arc::new(MachineContext::new(0, params, table, 2).unwrap());
        let t = SchedulerThread::spawn(ctx.clone(), 1).unwrap();
        let range = TaskRange::new(20, 39);
        t.send(SamplingCommand::InitWeightUpdate(init(range, 1.0))).unwrap();

        while ctx.gate.status(1) != crate::gate::PartitionStatus::Blocked {
            std::thread::yield_now();
        }
        assert!(t.try_phase().unwrap().is_none());

        let shard = DataShard::from_triplets(
            "Acol",
            ShardKind::Sparse,
            2,
            TaskRange::new(0, 39),
            vec![range],
            ShardTag {
                h_modulo: 1,
                oocdpartitions: 2,
            },
            range.ids().map(|col| (col % 2, col, 1.0)),
        )
        .unwrap();
        ctx.install_shard(shard);
        let phase = next_phase(&t);
        assert!(phase.task_ids.iter().all(|id| range.contains(*id)));

        let stats = t.shutdown().unwrap();
        assert_eq!(stats.rounds, 1);
        assert_eq!(stats.held_rounds, 1);
        assert_eq!(stats.unchecked_rounds, 0);
    }

    #[test]
    fn closing_the_gate_drops_a_held_phase() {
        let table = PartitionTable::new(40, 1, 2).unwrap();
        let params = SchedulerParams {
            modelsize: 40,
            maxset: 3,
            ..SchedulerParams::default()
        };
        let ctx = Arc::new(MachineContext::new(0, params, table, 2).unwrap());
        let t = SchedulerThread::spawn(ctx.clone(), 0).unwrap();
        t.send(SamplingCommand::InitWeightUpdate(init(TaskRange::new(0, 19), 1.0)))
            .unwrap();
        while ctx.gate.status(0) != crate::gate::PartitionStatus::Blocked {
            std::thread::yield_now();
        }
        ctx.gate.close();
        let stats = t.shutdown().unwrap();
        assert_eq!(stats.rounds, 0);
        assert_eq!(stats.unchecked_rounds, 0);
    }

    #[test]
    fn retained_set_respects_threshold() {
        let ctx = ctx(20, 1, 8);
        // Columns 2k and 2k+1 are identical, distinct pairs are disjoint.
        let mut triplets = Vec::new();
        for col in 0..20u64 {
            let pair = col / 2;
            triplets.push((pair, col, 1.0));
            triplets.push((pair + 10, col, -1.0));
        }
        let shard = DataShard::from_triplets(
            "Acol",
            ShardKind::Sparse,
            20,
            TaskRange::new(0, 19),
            vec![TaskRange::new(0, 19)],
            ShardTag::whole(),
            triplets,
        )
        .unwrap();
        ctx.shards.install(shard);
        let shard = ctx.shards.get("Acol").unwrap();

        let t = SchedulerThread::spawn(ctx.clone(), 0).unwrap();
        t.send(SamplingCommand::InitWeightUpdate(init(TaskRange::new(0, 19), 1.0)))
            .unwrap();
        let mut phase = next_phase(&t);
        for _ in 0..20 {
            for (i, a) in phase.task_ids.iter().enumerate() {
                for b in &phase.task_ids[i + 1..] {
                    assert!(shard.correlation(*a, *b).unwrap() < 0.1, "{a} and {b}");
                }
            }
            let answer = phase.task_ids.iter().map(|id| IdVal::new(*id, 1.0)).collect();
            t.send(SamplingCommand::WeightUpdate(answer)).unwrap();
            phase = next_phase(&t);
        }
        let stats = t.shutdown().unwrap();
        assert_eq!(stats.unchecked_rounds, 0);
    }
}
