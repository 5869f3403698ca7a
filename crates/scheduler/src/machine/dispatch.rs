use std::time::Duration;

use tracing::{debug, error, info, warn};

use strads_core::ShardSpec;
use strads_wire::{Endpoint, Envelope, Message, PhaseMessage, ShardLoaded};

use super::SchedulerMachine;
use crate::command::{MakePhase, SamplingCommand};
use crate::error::SchedError;
use crate::ooc::load_initial;

/// Pause between polls when neither the link nor the threads have work.
const IDLE_BACKOFF: Duration = Duration::from_micros(50);

#[derive(Debug, PartialEq, Eq)]
pub(super) enum Flow {
    Continue,
    Stop,
}

impl<E: Endpoint> SchedulerMachine<E> {
    pub(super) fn serve(&mut self) -> Result<(), SchedError> {
        loop {
            if let Some(env) = self.link.try_recv()? {
                if self.handle(env)? == Flow::Stop {
                    return Ok(());
                }
                continue;
            }

            if self.ooc.poll()? {
                self.oocdone_pending = true;
            }

            if !self.forward_phase()? {
                self.check_threads()?;
                std::thread::sleep(IDLE_BACKOFF);
            }
        }
    }

    fn handle(&mut self, env: Envelope) -> Result<Flow, SchedError> {
        debug!(mid = self.ctx.mid, message = env.message.name(), "machine received");
        match env.message {
            Message::SchedStart { mid, params } => self.start_threads(mid, params, false)?,
            Message::SchedRestart { mid, params } => self.start_threads(mid, params, true)?,
            Message::WeightUpdate {
                mid,
                thrdgid,
                entries,
            } => {
                self.check_mid(mid)?;
                let lid = usize::try_from(thrdgid)
                    .ok()
                    .and_then(|gid| self.ctx.lid_of(gid))
                    .ok_or_else(|| {
                        SchedError::Protocol(format!(
                            "weight update for partition {thrdgid} on machine {}",
                            self.ctx.mid
                        ))
                    })?;
                self.threads[lid].send(SamplingCommand::WeightUpdate(entries))?;
            }
            Message::LoadShard(spec) => self.load_shard(spec)?,
            Message::OocLoad(cmd) => match self.ooc.request(&cmd) {
                Err(SchedError::LoadInFlight) => {
                    warn!(
                        mid = self.ctx.mid,
                        h_modulo = cmd.h_modulo,
                        "ooc load already in flight, request dropped"
                    );
                }
                other => other?,
            },
            Message::Shutdown => {
                info!(mid = self.ctx.mid, "shutdown received");
                return Ok(Flow::Stop);
            }
            other => {
                error!(mid = self.ctx.mid, message = other.name(), "unexpected message");
                return Err(SchedError::Protocol(format!(
                    "unexpected {} on scheduler machine {}",
                    other.name(),
                    self.ctx.mid
                )));
            }
        }
        Ok(Flow::Continue)
    }

    /// Load a data shard for this machine's columns and acknowledge it.
    fn load_shard(&mut self, spec: ShardSpec) -> Result<(), SchedError> {
        let shard = load_initial(&self.ctx, &spec)?;
        let loaded = ShardLoaded {
            mid: self.ctx.mid as i32,
            alias: spec.alias.clone(),
            nonzero: shard.nonzero(),
        };
        self.ctx.install_shard(shard);
        self.ooc.register(spec);
        self.link.send(Envelope::new(Message::ShardLoaded(loaded)))?;
        Ok(())
    }

    /// Forward one finished phase, polling every thread once starting at the
    /// round-robin cursor. Returns `false` when no thread had one.
    pub(super) fn forward_phase(&mut self) -> Result<bool, SchedError> {
        let n = self.threads.len();
        for _ in 0..n {
            let lid = self.rr % n;
            self.rr = (lid + 1) % n;
            if let Some(phase) = self.threads[lid].try_phase()? {
                self.send_phase(phase)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn send_phase(&mut self, phase: MakePhase) -> Result<(), SchedError> {
        let oocdone = std::mem::take(&mut self.oocdone_pending);
        let gid = phase.gid;
        let env = Envelope::new(Message::Phase(PhaseMessage {
            mid: self.ctx.mid as i32,
            thrdgid: gid as i32,
            task_ids: phase.task_ids,
        }))
        .with_partition(gid as u64)
        .with_oocdone(oocdone);
        self.link.send(env)?;
        Ok(())
    }

    /// Surface the error of a thread that stopped on its own.
    fn check_threads(&mut self) -> Result<(), SchedError> {
        for t in &mut self.threads {
            if t.is_finished() {
                let gid = t.gid();
                return match t.join() {
                    Err(e) => Err(e),
                    Ok(_) => Err(SchedError::Protocol(format!(
                        "scheduler thread {gid} stopped without shutdown"
                    ))),
                };
            }
        }
        Ok(())
    }
}
