use tracing::{debug, error};

use strads_core::TaskId;
use strads_wire::{Endpoint, Envelope, IdVal, Message, SchedStartParams};

use super::SchedulerMachine;
use crate::command::SamplingCommand;
use crate::error::SchedError;

impl<E: Endpoint> SchedulerMachine<E> {
    /// Receive the `InitVal` chunks announced by a start or restart, hand
    /// every thread its slice and acknowledge with the task count.
    pub(super) fn start_threads(
        &mut self,
        mid: i32,
        params: SchedStartParams,
        restart: bool,
    ) -> Result<(), SchedError> {
        self.check_mid(mid)?;
        let range = self.ctx.machine_range();
        if params.start != range.start || params.end != range.end {
            return Err(SchedError::Protocol(format!(
                "start for [{}, {}] sent to machine {} owning {range}",
                params.start, params.end, self.ctx.mid
            )));
        }

        let entries = self.receive_chunks(&params)?;
        for (i, e) in entries.iter().enumerate() {
            let expect = params.start + i as TaskId;
            if e.id != expect {
                error!(mid = self.ctx.mid, index = i, id = e.id, expect, "non-contiguous init");
                return Err(SchedError::Protocol(format!(
                    "init entry {i} has id {}, expected {expect}",
                    e.id
                )));
            }
        }

        let mut rest = entries.as_slice();
        for (lid, t) in self.threads.iter().enumerate() {
            let len = self.ctx.thread_range(lid).len();
            let (mine, tail) = rest.split_at(len);
            rest = tail;
            let cmd = if restart {
                SamplingCommand::RestartWeightUpdate(mine.to_vec())
            } else {
                SamplingCommand::InitWeightUpdate(mine.to_vec())
            };
            t.send(cmd)?;
        }

        debug!(
            mid = self.ctx.mid,
            taskcnt = params.taskcnt,
            chunks = params.chunks,
            restart,
            "weights distributed"
        );
        self.link.send(Envelope::new(Message::StartAck {
            mid,
            taskcnt: params.taskcnt,
        }))?;
        Ok(())
    }

    fn receive_chunks(&self, params: &SchedStartParams) -> Result<Vec<IdVal>, SchedError> {
        let mut entries = Vec::with_capacity(params.taskcnt as usize);
        for chunk in 0..params.chunks {
            let env = self.link.recv()?;
            match env.message {
                Message::InitVal { mid, entries: part } => {
                    self.check_mid(mid)?;
                    entries.extend(part);
                }
                other => {
                    return Err(SchedError::Protocol(format!(
                        "expected init chunk {chunk} of {}, got {}",
                        params.chunks,
                        other.name()
                    )))
                }
            }
        }
        if entries.len() as u64 != params.taskcnt
            || params.taskcnt != self.ctx.machine_range().len() as u64
        {
            return Err(SchedError::TaskCountMismatch {
                declared: params.taskcnt,
                received: entries.len() as u64,
            });
        }
        Ok(entries)
    }

    pub(super) fn check_mid(&self, mid: i32) -> Result<(), SchedError> {
        if mid < 0 || mid as usize != self.ctx.mid {
            return Err(SchedError::Protocol(format!(
                "message for machine {mid} delivered to machine {}",
                self.ctx.mid
            )));
        }
        Ok(())
    }
}
