//! Out-of-core column-group cycling.
//!
//! The IO thread reads the next column group of every registered shard in
//! the background. When the load completes the controller quiesces the
//! local partitions through the [`PartitionGate`](crate::PartitionGate),
//! installs the new shards and releases the partitions again.

use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, info};

use strads_core::{select_ooc_ranges, ShardSpec};
use strads_dshard::{load_shard, DataShard, ShardTag};
use strads_wire::{OocLoadCmd, Queue};

use crate::context::MachineContext;
use crate::error::SchedError;

/// Load column group `h_modulo` of every shard in `specs` for this machine.
pub fn load_group(
    ctx: &MachineContext,
    specs: &[ShardSpec],
    h_modulo: usize,
    oocdpartitions: usize,
) -> Result<Vec<DataShard>, SchedError> {
    let cols = ctx.machine_range();
    let select = select_ooc_ranges(&ctx.table.param_ranges(), h_modulo, oocdpartitions, cols);
    let tag = ShardTag {
        h_modulo,
        oocdpartitions,
    };
    specs
        .iter()
        .map(|spec| {
            load_shard(&spec.path, &spec.alias, spec.kind, cols, Some(&select), tag)
                .map_err(SchedError::from)
        })
        .collect()
}

/// Load the first shard for `spec`: the whole machine range, or column
/// group 0 when out-of-core cycling is enabled.
pub fn load_initial(ctx: &MachineContext, spec: &ShardSpec) -> Result<DataShard, SchedError> {
    let g = ctx.ooc_partitions;
    if g > 1 {
        return load_group(ctx, std::slice::from_ref(spec), 0, g)?
            .pop()
            .ok_or_else(|| SchedError::Protocol(format!("no shard read for {}", spec.alias)));
    }
    Ok(load_shard(
        &spec.path,
        &spec.alias,
        spec.kind,
        ctx.machine_range(),
        None,
        ShardTag::whole(),
    )?)
}

// ── IO thread ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OocRequest {
    pub h_modulo: usize,
    pub oocdpartitions: usize,
    pub specs: Vec<ShardSpec>,
}

#[derive(Debug)]
pub struct OocLoaded {
    pub h_modulo: usize,
    pub shards: Vec<DataShard>,
}

#[derive(Debug)]
enum IoCommand {
    Load(OocRequest),
    Shutdown,
}

/// Background loader with a blocking command queue and a result queue.
#[derive(Debug)]
pub struct OocIoThread {
    cmdq: Queue<IoCommand>,
    resq: Queue<Result<OocLoaded, SchedError>>,
    handle: Option<JoinHandle<()>>,
}

impl OocIoThread {
    pub fn spawn(ctx: Arc<MachineContext>) -> Result<Self, SchedError> {
        let cmdq: Queue<IoCommand> = Queue::new("ooc-cmdq");
        let resq: Queue<Result<OocLoaded, SchedError>> = Queue::new("ooc-resq");
        let (rx, tx) = (cmdq.clone(), resq.clone());
        let handle = std::thread::Builder::new()
            .name(format!("strads-ooc-{}", ctx.mid))
            .spawn(move || {
                while let Ok(IoCommand::Load(req)) = rx.pop() {
                    debug!(mid = ctx.mid, h_modulo = req.h_modulo, "ooc load started");
                    let res = load_group(&ctx, &req.specs, req.h_modulo, req.oocdpartitions)
                        .map(|shards| OocLoaded {
                            h_modulo: req.h_modulo,
                            shards,
                        });
                    if tx.push(res).is_err() {
                        break;
                    }
                }
            })?;
        Ok(Self {
            cmdq,
            resq,
            handle: Some(handle),
        })
    }

    pub fn submit(&self, req: OocRequest) -> Result<(), SchedError> {
        self.cmdq.push(IoCommand::Load(req))?;
        Ok(())
    }

    pub fn try_result(&self) -> Result<Option<Result<OocLoaded, SchedError>>, SchedError> {
        Ok(self.resq.try_pop()?)
    }

    pub fn shutdown(&mut self) {
        let _ = self.cmdq.push(IoCommand::Shutdown);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for OocIoThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ── Controller ──────────────────────────────────────────────────────

/// Tracks the registered shards and the single in-flight load.
#[derive(Debug)]
pub struct OocController {
    ctx: Arc<MachineContext>,
    specs: Vec<ShardSpec>,
    io: Option<OocIoThread>,
    in_flight: Option<usize>,
    current: usize,
    swaps: u64,
}

impl OocController {
    pub fn new(ctx: Arc<MachineContext>) -> Self {
        Self {
            ctx,
            specs: Vec::new(),
            io: None,
            in_flight: None,
            current: 0,
            swaps: 0,
        }
    }

    pub fn enabled(&self) -> bool {
        self.ctx.ooc_partitions > 1
    }

    /// Remember a loaded shard so later groups are read from the same file.
    pub fn register(&mut self, spec: ShardSpec) {
        self.specs.retain(|s| s.alias != spec.alias);
        self.specs.push(spec);
    }

    pub fn current_group(&self) -> usize {
        self.current
    }

    pub fn in_flight(&self) -> Option<usize> {
        self.in_flight
    }

    pub fn swaps(&self) -> u64 {
        self.swaps
    }

    /// Start loading the group named by `cmd`, or the next group when the
    /// command carries no explicit `h_modulo`.
    pub fn request(&mut self, cmd: &OocLoadCmd) -> Result<(), SchedError> {
        if !self.enabled() {
            debug!(mid = self.ctx.mid, "ooc load ignored, cycling disabled");
            return Ok(());
        }
        let g = self.ctx.ooc_partitions;
        if cmd.oocdpartitions as usize != g {
            return Err(SchedError::Protocol(format!(
                "ooc load for {} groups, machine is configured for {g}",
                cmd.oocdpartitions
            )));
        }
        if self.in_flight.is_some() {
            return Err(SchedError::LoadInFlight);
        }
        let h_modulo = if cmd.ooc_hmodflag {
            cmd.h_modulo as usize
        } else {
            (self.current + 1) % g
        };

        if self.io.is_none() {
            self.io = Some(OocIoThread::spawn(self.ctx.clone())?);
        }
        if let Some(io) = &self.io {
            io.submit(OocRequest {
                h_modulo,
                oocdpartitions: g,
                specs: self.specs.clone(),
            })?;
        }
        self.in_flight = Some(h_modulo);
        debug!(mid = self.ctx.mid, h_modulo, "ooc load requested");
        Ok(())
    }

    /// Complete a finished load. Returns `true` after a cutover.
    pub fn poll(&mut self) -> Result<bool, SchedError> {
        if self.in_flight.is_none() {
            return Ok(false);
        }
        let Some(io) = &self.io else {
            return Ok(false);
        };
        match io.try_result()? {
            Some(Ok(loaded)) => {
                self.cutover(loaded);
                Ok(true)
            }
            Some(Err(e)) => Err(e),
            None => Ok(false),
        }
    }

    /// Swap in `loaded` while every local partition is held off the gate.
    /// Only the partitions covered by the new group are let through again;
    /// the rest stay blocked until their own group comes round.
    pub fn cutover(&mut self, loaded: OocLoaded) {
        let lids = self.ctx.local_lids();
        self.ctx.gate.quiesce(&lids);
        let mut nonzero = 0;
        for shard in loaded.shards {
            nonzero += shard.nonzero();
            self.ctx.shards.install(shard);
        }
        let resident = self.ctx.refresh_residency();
        let woken = self.ctx.gate.release(&lids);

        self.current = loaded.h_modulo;
        self.in_flight = None;
        self.swaps += 1;
        info!(
            mid = self.ctx.mid,
            h_modulo = loaded.h_modulo,
            nonzero,
            resident = resident.len(),
            woken = woken.len(),
            "ooc shard swapped"
        );
    }

    pub fn shutdown(&mut self) {
        if let Some(mut io) = self.io.take() {
            io.shutdown();
        }
    }
}
