//! Scheduling sub-protocol: `SchedHead` followed by a typed payload.

use bytes::{Buf, BufMut};
use strads_core::TaskId;

use crate::error::WireError;

/// Largest user payload carried in one frame.
pub const USER_MSG_SIZE: usize = 16 * 1024 - 72;

/// Encoded size of [`SchedHead`].
pub const SCHEDHEAD_LEN: usize = 4 + 4 + 4 + 8 + 8;

/// Encoded size of one [`IdVal`].
pub const IDVAL_LEN: usize = 16;

/// Encoded size of [`SchedStartParams`].
pub const START_PARAMS_LEN: usize = 32;

/// Number of `(id, value)` pairs per init chunk.
pub fn entries_per_chunk() -> usize {
    (USER_MSG_SIZE - SCHEDHEAD_LEN) / (2 * IDVAL_LEN)
}

/// Number of init chunks needed to ship `taskcnt` entries.
pub fn chunk_count(taskcnt: usize) -> usize {
    taskcnt.div_ceil(entries_per_chunk())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SchedType {
    Start = 1,
    Restart = 2,
    InitVal = 3,
    WeightUpdate = 4,
    Phase = 5,
    StartAck = 6,
}

impl TryFrom<u32> for SchedType {
    type Error = WireError;

    fn try_from(v: u32) -> Result<Self, Self::Error> {
        Ok(match v {
            1 => Self::Start,
            2 => Self::Restart,
            3 => Self::InitVal,
            4 => Self::WeightUpdate,
            5 => Self::Phase,
            6 => Self::StartAck,
            other => return Err(WireError::UnknownSchedType(other)),
        })
    }
}

/// Header of every scheduling frame. `dlen` is the payload size in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedHead {
    pub sched_type: SchedType,
    pub sched_mid: i32,
    pub sched_thrdgid: i32,
    pub entrycnt: i64,
    pub dlen: i64,
}

impl SchedHead {
    pub fn put(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.sched_type as u32);
        buf.put_i32_le(self.sched_mid);
        buf.put_i32_le(self.sched_thrdgid);
        buf.put_i64_le(self.entrycnt);
        buf.put_i64_le(self.dlen);
    }

    pub fn get(buf: &mut impl Buf) -> Result<Self, WireError> {
        ensure(buf, SCHEDHEAD_LEN)?;
        let head = Self {
            sched_type: SchedType::try_from(buf.get_u32_le())?,
            sched_mid: buf.get_i32_le(),
            sched_thrdgid: buf.get_i32_le(),
            entrycnt: buf.get_i64_le(),
            dlen: buf.get_i64_le(),
        };
        if head.entrycnt < 0 || head.dlen < 0 {
            return Err(WireError::Malformed(format!(
                "negative entrycnt ({}) or dlen ({})",
                head.entrycnt, head.dlen
            )));
        }
        Ok(head)
    }
}

/// One `(task id, value)` pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IdVal {
    pub id: TaskId,
    pub value: f64,
}

impl IdVal {
    pub fn new(id: TaskId, value: f64) -> Self {
        Self { id, value }
    }

    pub fn put(&self, buf: &mut impl BufMut) {
        buf.put_i64_le(self.id as i64);
        buf.put_f64_le(self.value);
    }

    pub fn get(buf: &mut impl Buf) -> Result<Self, WireError> {
        ensure(buf, IDVAL_LEN)?;
        let id = get_task_id(buf)?;
        Ok(Self {
            id,
            value: buf.get_f64_le(),
        })
    }
}

/// Declares a start/restart handshake: `taskcnt` entries over
/// `[start, end]` arriving in `chunks` init frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedStartParams {
    pub taskcnt: u64,
    pub start: TaskId,
    pub end: TaskId,
    pub chunks: u64,
}

impl SchedStartParams {
    pub fn put(&self, buf: &mut impl BufMut) {
        buf.put_i64_le(self.taskcnt as i64);
        buf.put_i64_le(self.start as i64);
        buf.put_i64_le(self.end as i64);
        buf.put_i64_le(self.chunks as i64);
    }

    pub fn get(buf: &mut impl Buf) -> Result<Self, WireError> {
        ensure(buf, START_PARAMS_LEN)?;
        let taskcnt = get_task_id(buf)?;
        let start = get_task_id(buf)?;
        let end = get_task_id(buf)?;
        let chunks = get_task_id(buf)?;
        if end < start {
            return Err(WireError::Malformed(format!(
                "start range [{start}, {end}] is inverted"
            )));
        }
        Ok(Self {
            taskcnt,
            start,
            end,
            chunks,
        })
    }
}

pub(crate) fn ensure(buf: &impl Buf, needed: usize) -> Result<(), WireError> {
    if buf.remaining() < needed {
        return Err(WireError::Truncated {
            needed,
            available: buf.remaining(),
        });
    }
    Ok(())
}

pub(crate) fn get_task_id(buf: &mut impl Buf) -> Result<TaskId, WireError> {
    let raw = buf.get_i64_le();
    u64::try_from(raw).map_err(|_| WireError::Malformed(format!("negative id {raw}")))
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;

    #[test]
    fn chunk_capacity() {
        assert_eq!(entries_per_chunk(), 508);
        assert_eq!(chunk_count(0), 0);
        assert_eq!(chunk_count(508), 1);
        assert_eq!(chunk_count(509), 2);
        // A full chunk plus its header fits in one user message.
        assert!(SCHEDHEAD_LEN + entries_per_chunk() * IDVAL_LEN <= USER_MSG_SIZE);
    }

    #[test]
    fn negative_id_rejected() {
        let mut buf = BytesMut::new();
        buf.put_i64_le(-1);
        buf.put_f64_le(1.0);
        assert!(matches!(
            IdVal::get(&mut buf.freeze()),
            Err(WireError::Malformed(_))
        ));
    }

    #[test]
    fn inverted_start_range_rejected() {
        let mut buf = BytesMut::new();
        SchedStartParams {
            taskcnt: 1,
            start: 10,
            end: 3,
            chunks: 1,
        }
        .put(&mut buf);
        assert!(SchedStartParams::get(&mut buf.freeze()).is_err());
    }
}
