use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use strads_core::{ShardSpec, TaskId};

use crate::delta::{DeltaEntry, DELTA_ENTRY_LEN};
use crate::error::WireError;
use crate::header::{ComHeader, MessageType, HEADER_LEN};
use crate::sched::{
    get_task_id, IdVal, SchedHead, SchedStartParams, SchedType, IDVAL_LEN,
    START_PARAMS_LEN,
};

/// Admissible task set produced by one scheduler thread for one round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseMessage {
    pub mid: i32,
    pub thrdgid: i32,
    pub task_ids: Vec<TaskId>,
}

impl PhaseMessage {
    pub fn entrycnt(&self) -> usize {
        self.task_ids.len()
    }
}

/// Request to swap in out-of-core column group `h_modulo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OocLoadCmd {
    pub ooc_hmodflag: bool,
    pub h_modulo: u64,
    pub oocdpartitions: u64,
}

/// Acknowledges a finished shard load on a scheduler machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardLoaded {
    pub mid: i32,
    pub alias: String,
    pub nonzero: u64,
}

/// Every frame exchanged between the coordinator and the scheduler machines.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    SchedStart { mid: i32, params: SchedStartParams },
    SchedRestart { mid: i32, params: SchedStartParams },
    InitVal { mid: i32, entries: Vec<IdVal> },
    WeightUpdate { mid: i32, thrdgid: i32, entries: Vec<IdVal> },
    Phase(PhaseMessage),
    StartAck { mid: i32, taskcnt: u64 },
    LoadShard(ShardSpec),
    ShardLoaded(ShardLoaded),
    OocLoad(OocLoadCmd),
    /// Legacy gate path: per-partition delta stream, partition in the header.
    DeltaUpdate(Vec<DeltaEntry>),
    WakeUp,
    Shutdown,
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::SchedStart { .. }
            | Self::SchedRestart { .. }
            | Self::InitVal { .. }
            | Self::WeightUpdate { .. }
            | Self::Phase(_)
            | Self::StartAck { .. } => MessageType::Scheduling,
            Self::LoadShard(_) => MessageType::LoadShard,
            Self::ShardLoaded(_) => MessageType::ShardLoaded,
            Self::OocLoad(_) => MessageType::OocLoad,
            Self::DeltaUpdate(_) => MessageType::DeltaUpdate,
            Self::WakeUp => MessageType::WakeUp,
            Self::Shutdown => MessageType::Shutdown,
        }
    }

    /// Short label for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SchedStart { .. } => "sched_start",
            Self::SchedRestart { .. } => "sched_restart",
            Self::InitVal { .. } => "sched_initval",
            Self::WeightUpdate { .. } => "sched_uw",
            Self::Phase(_) => "sched_phase",
            Self::StartAck { .. } => "sched_start_ack",
            Self::LoadShard(_) => "load_shard",
            Self::ShardLoaded(_) => "shard_loaded",
            Self::OocLoad(_) => "ooc_load",
            Self::DeltaUpdate(_) => "delta_update",
            Self::WakeUp => "wake_up",
            Self::Shutdown => "shutdown",
        }
    }

    fn put_body(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        match self {
            Self::SchedStart { mid, params } | Self::SchedRestart { mid, params } => {
                let sched_type = if matches!(self, Self::SchedStart { .. }) {
                    SchedType::Start
                } else {
                    SchedType::Restart
                };
                sched_head(sched_type, *mid, -1, 0, START_PARAMS_LEN).put(buf);
                params.put(buf);
            }
            Self::InitVal { mid, entries } => {
                sched_head(SchedType::InitVal, *mid, -1, entries.len(), entries.len() * IDVAL_LEN)
                    .put(buf);
                entries.iter().for_each(|e| e.put(buf));
            }
            Self::WeightUpdate {
                mid,
                thrdgid,
                entries,
            } => {
                sched_head(
                    SchedType::WeightUpdate,
                    *mid,
                    *thrdgid,
                    entries.len(),
                    entries.len() * IDVAL_LEN,
                )
                .put(buf);
                entries.iter().for_each(|e| e.put(buf));
            }
            Self::Phase(phase) => {
                let n = phase.task_ids.len();
                sched_head(SchedType::Phase, phase.mid, phase.thrdgid, n, n * 8).put(buf);
                phase.task_ids.iter().for_each(|id| buf.put_i64_le(*id as i64));
            }
            Self::StartAck { mid, taskcnt } => {
                sched_head(SchedType::StartAck, *mid, -1, *taskcnt as usize, 0).put(buf);
            }
            Self::LoadShard(spec) => buf.put_slice(&rmp_serde::to_vec(spec)?),
            Self::ShardLoaded(ack) => buf.put_slice(&rmp_serde::to_vec(ack)?),
            Self::OocLoad(cmd) => {
                buf.put_u8(cmd.ooc_hmodflag as u8);
                buf.put_u64_le(cmd.h_modulo);
                buf.put_u64_le(cmd.oocdpartitions);
            }
            Self::DeltaUpdate(entries) => entries.iter().for_each(|e| e.put(buf)),
            Self::WakeUp | Self::Shutdown => {}
        }
        Ok(())
    }

    fn from_body(msg_type: MessageType, mut body: &[u8]) -> Result<Self, WireError> {
        let message = match msg_type {
            MessageType::Scheduling => return Self::sched_from_body(body),
            MessageType::LoadShard => Self::LoadShard(rmp_serde::from_slice(body)?),
            MessageType::ShardLoaded => Self::ShardLoaded(rmp_serde::from_slice(body)?),
            MessageType::OocLoad => {
                if body.len() != 17 {
                    return Err(WireError::LengthMismatch {
                        declared: 17,
                        actual: body.len(),
                    });
                }
                let ooc_hmodflag = body.get_u8() != 0;
                let h_modulo = body.get_u64_le();
                let oocdpartitions = body.get_u64_le();
                if oocdpartitions == 0 || h_modulo >= oocdpartitions {
                    return Err(WireError::Malformed(format!(
                        "ooc load h_modulo {h_modulo} outside {oocdpartitions} partitions"
                    )));
                }
                Self::OocLoad(OocLoadCmd {
                    ooc_hmodflag,
                    h_modulo,
                    oocdpartitions,
                })
            }
            MessageType::DeltaUpdate => {
                if body.len() % DELTA_ENTRY_LEN != 0 {
                    return Err(WireError::Malformed(format!(
                        "delta stream of {} bytes is not a whole number of entries",
                        body.len()
                    )));
                }
                let mut entries = Vec::with_capacity(body.len() / DELTA_ENTRY_LEN);
                while body.has_remaining() {
                    entries.push(DeltaEntry::get(&mut body)?);
                }
                Self::DeltaUpdate(entries)
            }
            MessageType::WakeUp => Self::WakeUp,
            MessageType::Shutdown => Self::Shutdown,
        };
        Ok(message)
    }

    fn sched_from_body(mut body: &[u8]) -> Result<Self, WireError> {
        let head = SchedHead::get(&mut body)?;
        let dlen = head.dlen as usize;
        if dlen != body.remaining() {
            return Err(WireError::LengthMismatch {
                declared: dlen,
                actual: body.remaining(),
            });
        }
        let entrycnt = head.entrycnt;
        let mid = head.sched_mid;
        // Byte length of `entrycnt` entries of `width` bytes each.
        let body_len = |width: usize| -> Result<usize, WireError> {
            usize::try_from(entrycnt)
                .ok()
                .and_then(|n| n.checked_mul(width))
                .ok_or_else(|| {
                    WireError::Malformed(format!(
                        "entrycnt {entrycnt} of {width}-byte entries overflows"
                    ))
                })
        };

        let expect_len = |want: usize| -> Result<(), WireError> {
            if want != dlen {
                return Err(WireError::LengthMismatch {
                    declared: want,
                    actual: dlen,
                });
            }
            Ok(())
        };

        Ok(match head.sched_type {
            SchedType::Start | SchedType::Restart => {
                expect_len(START_PARAMS_LEN)?;
                let params = SchedStartParams::get(&mut body)?;
                if head.sched_type == SchedType::Start {
                    Self::SchedStart { mid, params }
                } else {
                    Self::SchedRestart { mid, params }
                }
            }
            SchedType::InitVal | SchedType::WeightUpdate => {
                let len = body_len(IDVAL_LEN)?;
                expect_len(len)?;
                let mut entries = Vec::with_capacity(len / IDVAL_LEN);
                while body.has_remaining() {
                    entries.push(IdVal::get(&mut body)?);
                }
                if head.sched_type == SchedType::InitVal {
                    Self::InitVal { mid, entries }
                } else {
                    Self::WeightUpdate {
                        mid,
                        thrdgid: head.sched_thrdgid,
                        entries,
                    }
                }
            }
            SchedType::Phase => {
                let len = body_len(8)?;
                expect_len(len)?;
                let mut task_ids = Vec::with_capacity(len / 8);
                while body.has_remaining() {
                    task_ids.push(get_task_id(&mut body)?);
                }
                Self::Phase(PhaseMessage {
                    mid,
                    thrdgid: head.sched_thrdgid,
                    task_ids,
                })
            }
            SchedType::StartAck => {
                expect_len(0)?;
                Self::StartAck {
                    mid,
                    taskcnt: entrycnt as u64,
                }
            }
        })
    }
}

fn sched_head(
    sched_type: SchedType,
    mid: i32,
    thrdgid: i32,
    entrycnt: usize,
    dlen: usize,
) -> SchedHead {
    SchedHead {
        sched_type,
        sched_mid: mid,
        sched_thrdgid: thrdgid,
        entrycnt: entrycnt as i64,
        dlen: dlen as i64,
    }
}

/// A [`Message`] together with its routing header.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub header: ComHeader,
    pub message: Message,
}

impl Envelope {
    pub fn new(message: Message) -> Self {
        Self {
            header: ComHeader::new(message.message_type()),
            message,
        }
    }

    pub fn with_partition(mut self, partition: u64) -> Self {
        self.header.partition = partition;
        self
    }

    pub fn with_oocdone(mut self, oocdone: bool) -> Self {
        self.header.oocdone = oocdone;
        self
    }

    pub fn with_blockgh(mut self, blockgh: bool) -> Self {
        self.header.blockgh = blockgh;
        self
    }

    /// Serialize header and body; `length` is filled in here.
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let mut body = BytesMut::new();
        self.message.put_body(&mut body)?;

        let mut header = self.header;
        header.msg_type = self.message.message_type();
        header.length = body.len() as u64;

        let mut frame = BytesMut::with_capacity(HEADER_LEN + body.len());
        header.put(&mut frame);
        frame.extend_from_slice(&body);
        Ok(frame.freeze())
    }

    /// Parse and validate a frame. The declared body length must match
    /// exactly and every payload must be consumed.
    pub fn decode(frame: &[u8]) -> Result<Self, WireError> {
        let mut buf = frame;
        let header = ComHeader::get(&mut buf)?;
        if header.length as usize != buf.remaining() {
            return Err(WireError::LengthMismatch {
                declared: header.length as usize,
                actual: buf.remaining(),
            });
        }
        let message = Message::from_body(header.msg_type, buf)?;
        Ok(Self { header, message })
    }
}
