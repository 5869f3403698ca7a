use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info};

use strads_core::{PartitionTable, StradsConfig};
use strads_wire::{
    chunk_count, entries_per_chunk, Endpoint, Envelope, IdVal, Message, OocLoadCmd,
    SchedStartParams,
};

use crate::error::CoordinatorError;
use crate::handler::RoundHandler;
use crate::objective::ObjectiveLog;
use crate::tracker::PhaseTracker;

/// Pause after a full sweep over the machines found nothing.
const IDLE_BACKOFF: Duration = Duration::from_micros(50);

/// How long a drain waits without progress before it loads the column group
/// of a partition that has not reported.
const DRAIN_SWAP_PATIENCE: Duration = Duration::from_millis(20);

/// Outcome of a completed run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub iterations: u64,
    pub switch_iter: u64,
    pub elapsed_secs: f64,
    pub restarts: u32,
    pub ooc_loads: u64,
    /// Column-group loads requested to finish a drain.
    pub drain_swaps: u64,
    pub final_objective: Option<f64>,
}

/// Single-threaded control loop over one link per scheduler machine.
pub struct Coordinator<E: Endpoint, H: RoundHandler> {
    config: StradsConfig,
    table: PartitionTable,
    links: Vec<E>,
    handler: H,
    tracker: PhaseTracker,
    log: ObjectiveLog,
    /// Phases that arrived while waiting for a control reply.
    stash: Vec<VecDeque<Envelope>>,
    restarts: u32,
    ooc_group: usize,
    ooc_loads: u64,
    drain_swaps: u64,
}

impl<E: Endpoint, H: RoundHandler> Coordinator<E, H> {
    /// `links[mid]` must reach scheduler machine `mid`.
    pub fn new(config: StradsConfig, links: Vec<E>, handler: H) -> Result<Self, CoordinatorError> {
        let table = config.partition_table()?;
        if links.len() != table.machines() {
            return Err(CoordinatorError::Protocol(format!(
                "{} links for {} scheduler machines",
                links.len(),
                table.machines()
            )));
        }
        let log = match &config.run.objective_log {
            Some(path) => ObjectiveLog::to_file(path)?,
            None => ObjectiveLog::new(),
        };
        Ok(Self {
            tracker: PhaseTracker::new(table.partitions()),
            stash: links.iter().map(|_| VecDeque::new()).collect(),
            config,
            table,
            links,
            handler,
            log,
            restarts: 0,
            ooc_group: 0,
            ooc_loads: 0,
            drain_swaps: 0,
        })
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn into_handler(self) -> H {
        self.handler
    }

    pub fn objective_log(&self) -> &ObjectiveLog {
        &self.log
    }

    /// Bootstrap the schedulers, run `run.iterations` rounds and shut the
    /// schedulers down.
    pub fn run(&mut self) -> Result<RunSummary, CoordinatorError> {
        let result = self.bootstrap().and_then(|()| self.round_loop());
        if let Err(e) = &result {
            error!(error = %e, "coordinator failed, shutting schedulers down");
            for link in &self.links {
                let _ = link.send(Envelope::new(Message::Shutdown));
            }
        }
        result
    }

    fn bootstrap(&mut self) -> Result<(), CoordinatorError> {
        let zeros = vec![0.0; self.table.modelsize() as usize];
        info!(
            machines = self.table.machines(),
            partitions = self.table.partitions(),
            modelsize = self.table.modelsize(),
            "starting schedulers"
        );
        self.start_schedulers(&zeros, false)?;
        self.load_shards()?;
        self.drain()?;
        self.start_schedulers(&zeros, true)
    }

    // ── Round loop ──────────────────────────────────────────────────

    fn round_loop(&mut self) -> Result<RunSummary, CoordinatorError> {
        let switch_iter = self.config.switch_iter();
        let m_iter = self.config.run.iterations;
        let logfreq = self.config.run.logfreq;
        let machines = self.links.len();
        let started = Instant::now();
        info!(switch_iter, iterations = m_iter, "round loop started");

        let mut iteration: u64 = 0;
        let mut rclock = 0;
        let mut misses = 0;
        loop {
            let mid = rclock;
            rclock = (rclock + 1) % machines;
            let Some(env) = self.poll(mid)? else {
                misses += 1;
                if misses >= machines {
                    misses = 0;
                    std::thread::sleep(IDLE_BACKOFF);
                }
                continue;
            };
            misses = 0;

            self.answer(mid, env, iteration > switch_iter)?;
            iteration += 1;

            if logfreq > 0 && iteration % logfreq == 0 {
                let objective = self.handler.objective()?;
                self.log
                    .record(iteration, started.elapsed().as_secs_f64(), objective)?;
            }
            if self.ooc_due(iteration) {
                self.trigger_ooc()?;
            }
            if iteration == m_iter {
                return self.finish(iteration, switch_iter, started);
            }
            if iteration == switch_iter {
                self.warm_restart()?;
            }
        }
    }

    /// Run the handler hooks for one phase and send the weights back to the
    /// partition that produced it.
    fn answer(&mut self, mid: usize, env: Envelope, weighted: bool) -> Result<(), CoordinatorError> {
        let oocdone = env.header.oocdone;
        let phase = match env.message {
            Message::Phase(p) => p,
            other => {
                return Err(CoordinatorError::Protocol(format!(
                    "unexpected {} from machine {mid} during rounds",
                    other.name()
                )))
            }
        };
        let gid = self.check_origin(mid, phase.mid, phase.thrdgid)?;
        self.tracker.on_phase(gid)?;
        if oocdone {
            info!(mid, gid, "machine completed an out-of-core swap");
        }

        self.handler.dispatch_scheduling(&phase)?;
        let partial = self.handler.do_msgcombiner(&phase)?;
        self.handler.do_aggregate(&phase, &partial)?;
        let weights = self.handler.update_weight(&phase, &partial)?;
        if weights.len() != phase.task_ids.len() {
            return Err(CoordinatorError::Handler(format!(
                "update_weight returned {} weights for {} tasks",
                weights.len(),
                phase.task_ids.len()
            )));
        }

        let entries: Vec<IdVal> = phase
            .task_ids
            .iter()
            .zip(&weights)
            .map(|(id, w)| IdVal::new(*id, if weighted { *w } else { 0.0 }))
            .collect();
        self.links[mid].send(
            Envelope::new(Message::WeightUpdate {
                mid: mid as i32,
                thrdgid: phase.thrdgid,
                entries,
            })
            .with_partition(gid as u64),
        )?;
        self.tracker.on_update(gid)
    }

    fn check_origin(&self, mid: usize, phase_mid: i32, thrdgid: i32) -> Result<usize, CoordinatorError> {
        let gid = usize::try_from(thrdgid).ok();
        match gid.and_then(|g| self.table.locate(g).map(|loc| (g, loc))) {
            Some((g, (owner, _))) if owner == mid && phase_mid == mid as i32 => Ok(g),
            _ => Err(CoordinatorError::Protocol(format!(
                "phase for partition {thrdgid} (machine {phase_mid}) arrived from machine {mid}"
            ))),
        }
    }

    fn ooc_due(&self, iteration: u64) -> bool {
        let c = &self.config.cluster;
        c.ooc_enabled() && iteration % c.ooc_frequency == 0
    }

    /// Ask every machine to load the next column group.
    fn trigger_ooc(&mut self) -> Result<(), CoordinatorError> {
        let next = (self.ooc_group + 1) % self.config.cluster.ooc_partitions;
        self.broadcast_ooc(next)?;
        self.ooc_loads += 1;
        Ok(())
    }

    fn broadcast_ooc(&mut self, h_modulo: usize) -> Result<(), CoordinatorError> {
        let g = self.config.cluster.ooc_partitions;
        let cmd = OocLoadCmd {
            ooc_hmodflag: true,
            h_modulo: h_modulo as u64,
            oocdpartitions: g as u64,
        };
        for link in &self.links {
            link.send(Envelope::new(Message::OocLoad(cmd)))?;
        }
        debug!(h_modulo, "ooc load broadcast");
        self.ooc_group = h_modulo;
        Ok(())
    }

    /// Load the column group of the first partition that has not reported
    /// in the current drain. Partitions outside the resident group cannot
    /// produce a phase until it is swapped in.
    fn swap_in_unreported(&mut self, reported: &[bool]) -> Result<(), CoordinatorError> {
        let Some(gid) = reported.iter().position(|r| !r) else {
            return Ok(());
        };
        let h_modulo = gid % self.config.cluster.ooc_partitions;
        info!(gid, h_modulo, "partition silent during drain, loading its column group");
        self.broadcast_ooc(h_modulo)?;
        self.drain_swaps += 1;
        Ok(())
    }

    /// Drain every in-flight phase, then restart the schedulers with the
    /// handler's initial priorities.
    fn warm_restart(&mut self) -> Result<(), CoordinatorError> {
        info!("warm restart of all schedulers");
        self.drain()?;
        let mut weights = vec![0.0; self.table.modelsize() as usize];
        self.handler.set_initial_priority(&mut weights);
        self.start_schedulers(&weights, true)
    }

    fn finish(
        &mut self,
        iterations: u64,
        switch_iter: u64,
        started: Instant,
    ) -> Result<RunSummary, CoordinatorError> {
        self.log.flush()?;
        self.handler.log_parameters()?;
        for link in &self.links {
            link.send(Envelope::new(Message::Shutdown))?;
        }
        let summary = RunSummary {
            iterations,
            switch_iter,
            elapsed_secs: started.elapsed().as_secs_f64(),
            restarts: self.restarts,
            ooc_loads: self.ooc_loads,
            drain_swaps: self.drain_swaps,
            final_objective: self.log.last().map(|r| r.objective),
        };
        info!(
            iterations,
            elapsed_secs = summary.elapsed_secs,
            restarts = summary.restarts,
            "run finished"
        );
        Ok(summary)
    }

    // ── Control handshakes ──────────────────────────────────────────

    /// Send every machine its slice of `weights` in init chunks and wait for
    /// all acknowledgements.
    fn start_schedulers(&mut self, weights: &[f64], restart: bool) -> Result<(), CoordinatorError> {
        let per_chunk = entries_per_chunk();
        let mut declared = Vec::with_capacity(self.links.len());
        for (mid, link) in self.links.iter().enumerate() {
            let range = self.table.machine_range(mid).ok_or_else(|| {
                CoordinatorError::Protocol(format!("no partition range for machine {mid}"))
            })?;
            let taskcnt = range.len();
            let params = SchedStartParams {
                taskcnt: taskcnt as u64,
                start: range.start,
                end: range.end,
                chunks: chunk_count(taskcnt) as u64,
            };
            let m = mid as i32;
            let head = if restart {
                Message::SchedRestart { mid: m, params }
            } else {
                Message::SchedStart { mid: m, params }
            };
            link.send(Envelope::new(head))?;

            let entries: Vec<IdVal> = range
                .ids()
                .map(|id| IdVal::new(id, weights[id as usize]))
                .collect();
            for chunk in entries.chunks(per_chunk) {
                link.send(Envelope::new(Message::InitVal {
                    mid: m,
                    entries: chunk.to_vec(),
                }))?;
            }
            declared.push(params.taskcnt);
        }

        for (mid, declared) in declared.into_iter().enumerate() {
            match self.recv_control(mid)? {
                Message::StartAck { taskcnt, .. } if taskcnt == declared => {}
                Message::StartAck { taskcnt, .. } => {
                    return Err(CoordinatorError::AckMismatch {
                        mid,
                        declared,
                        acked: taskcnt,
                    })
                }
                other => {
                    return Err(CoordinatorError::Protocol(format!(
                        "expected start ack from machine {mid}, got {}",
                        other.name()
                    )))
                }
            }
        }
        if restart {
            self.restarts += 1;
        }
        info!(restart, restarts = self.restarts, "schedulers acknowledged start");
        Ok(())
    }

    /// Distribute every configured shard to every machine.
    fn load_shards(&mut self) -> Result<(), CoordinatorError> {
        let specs = self.config.shards.clone();
        for spec in specs {
            for link in &self.links {
                link.send(Envelope::new(Message::LoadShard(spec.clone())))?;
            }
            for mid in 0..self.links.len() {
                match self.recv_control(mid)? {
                    Message::ShardLoaded(ack) if ack.alias == spec.alias => {
                        info!(mid, alias = %ack.alias, nonzero = ack.nonzero, "shard loaded");
                    }
                    other => {
                        return Err(CoordinatorError::Protocol(format!(
                            "expected shard ack for {} from machine {mid}, got {}",
                            spec.alias,
                            other.name()
                        )))
                    }
                }
            }
        }
        Ok(())
    }

    /// Discard exactly one phase per partition. With cycling column groups
    /// a partition whose group is swapped out stays silent, so its group is
    /// loaded once the drain stops making progress.
    fn drain(&mut self) -> Result<(), CoordinatorError> {
        let expected = self.table.partitions();
        let swaps = self.config.cluster.ooc_partitions > 1;
        let mut reported = vec![false; expected];
        let mut drained = 0;
        let mut progress = Instant::now();
        while drained < expected {
            let mut got = false;
            for mid in 0..self.links.len() {
                if drained == expected {
                    break;
                }
                if let Some(env) = self.poll(mid)? {
                    match env.message {
                        Message::Phase(p) => {
                            let gid = self.check_origin(mid, p.mid, p.thrdgid)?;
                            if std::mem::replace(&mut reported[gid], true) {
                                return Err(CoordinatorError::Protocol(format!(
                                    "partition {gid} sent two phases in one drain"
                                )));
                            }
                            drained += 1;
                            got = true;
                        }
                        other => {
                            return Err(CoordinatorError::Protocol(format!(
                                "unexpected {} from machine {mid} while draining",
                                other.name()
                            )))
                        }
                    }
                }
            }
            if got {
                progress = Instant::now();
                continue;
            }
            if swaps && progress.elapsed() >= DRAIN_SWAP_PATIENCE {
                self.swap_in_unreported(&reported)?;
                progress = Instant::now();
            }
            std::thread::sleep(IDLE_BACKOFF);
        }
        self.tracker.reset();
        debug!(drained, "in-flight phases drained");
        Ok(())
    }

    fn poll(&mut self, mid: usize) -> Result<Option<Envelope>, CoordinatorError> {
        if let Some(env) = self.stash[mid].pop_front() {
            return Ok(Some(env));
        }
        Ok(self.links[mid].try_recv()?)
    }

    /// Next non-phase message from `mid`, stashing phases on the way.
    fn recv_control(&mut self, mid: usize) -> Result<Message, CoordinatorError> {
        loop {
            let env = self.links[mid].recv()?;
            if matches!(env.message, Message::Phase(_)) {
                self.stash[mid].push_back(env);
                continue;
            }
            return Ok(env.message);
        }
    }
}
