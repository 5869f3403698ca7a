use bytes::{Buf, BufMut};

use crate::error::WireError;

/// Encoded size of [`ComHeader`].
pub const HEADER_LEN: usize = 4 + 4 + 4 + 8 + 8 + 8 + 1 + 1;

/// Coarse message class carried in every envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    /// Scheduler start/restart handshakes, weight updates and phases.
    Scheduling = 1,
    /// Load a data shard on the receiving machine.
    LoadShard = 2,
    /// Acknowledges a completed shard load.
    ShardLoaded = 3,
    /// Out-of-core column group load request.
    OocLoad = 4,
    /// Delta stream for the legacy gate path.
    DeltaUpdate = 5,
    /// Wakes a partition blocked by the legacy gate path.
    WakeUp = 6,
    /// Orderly stop at the end of a run.
    Shutdown = 7,
}

impl TryFrom<u32> for MessageType {
    type Error = WireError;

    fn try_from(v: u32) -> Result<Self, Self::Error> {
        Ok(match v {
            1 => Self::Scheduling,
            2 => Self::LoadShard,
            3 => Self::ShardLoaded,
            4 => Self::OocLoad,
            5 => Self::DeltaUpdate,
            6 => Self::WakeUp,
            7 => Self::Shutdown,
            other => return Err(WireError::UnknownMessageType(other)),
        })
    }
}

/// Generic envelope header for every point-to-point frame.
///
/// All fields are fixed-width little-endian; `length` is the number of body
/// bytes that follow the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComHeader {
    pub msg_type: MessageType,
    pub src_rank: i32,
    pub dst_rank: i32,
    pub length: u64,
    pub seqno: u64,
    /// Target partition for partition-scoped frames (delta streams, wake-ups).
    pub partition: u64,
    /// Set on the first phase after an out-of-core cutover completed.
    pub oocdone: bool,
    /// Asks the receiving partition to block after its next phase.
    pub blockgh: bool,
}

impl ComHeader {
    pub fn new(msg_type: MessageType) -> Self {
        Self {
            msg_type,
            src_rank: 0,
            dst_rank: 0,
            length: 0,
            seqno: 0,
            partition: 0,
            oocdone: false,
            blockgh: false,
        }
    }

    pub fn put(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.msg_type as u32);
        buf.put_i32_le(self.src_rank);
        buf.put_i32_le(self.dst_rank);
        buf.put_u64_le(self.length);
        buf.put_u64_le(self.seqno);
        buf.put_u64_le(self.partition);
        buf.put_u8(self.oocdone as u8);
        buf.put_u8(self.blockgh as u8);
    }

    pub fn get(buf: &mut impl Buf) -> Result<Self, WireError> {
        if buf.remaining() < HEADER_LEN {
            return Err(WireError::Truncated {
                needed: HEADER_LEN,
                available: buf.remaining(),
            });
        }
        let msg_type = MessageType::try_from(buf.get_u32_le())?;
        let src_rank = buf.get_i32_le();
        let dst_rank = buf.get_i32_le();
        let length = buf.get_u64_le();
        let seqno = buf.get_u64_le();
        let partition = buf.get_u64_le();
        let oocdone = flag(buf.get_u8(), "oocdone")?;
        let blockgh = flag(buf.get_u8(), "blockgh")?;
        Ok(Self {
            msg_type,
            src_rank,
            dst_rank,
            length,
            seqno,
            partition,
            oocdone,
            blockgh,
        })
    }
}

fn flag(v: u8, name: &str) -> Result<bool, WireError> {
    match v {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(WireError::Malformed(format!("{name} flag has value {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;

    #[test]
    fn header_is_fixed_width() {
        let mut buf = BytesMut::new();
        ComHeader::new(MessageType::WakeUp).put(&mut buf);
        assert_eq!(buf.len(), HEADER_LEN);
    }

    #[test]
    fn unknown_type_rejected() {
        let mut buf = BytesMut::new();
        ComHeader::new(MessageType::Shutdown).put(&mut buf);
        buf[0] = 99;
        let err = ComHeader::get(&mut buf.freeze()).unwrap_err();
        assert!(matches!(err, WireError::UnknownMessageType(99)));
    }

    #[test]
    fn bad_flag_byte_rejected() {
        let mut buf = BytesMut::new();
        ComHeader::new(MessageType::Shutdown).put(&mut buf);
        buf[HEADER_LEN - 1] = 7;
        assert!(ComHeader::get(&mut buf.freeze()).is_err());
    }

    #[test]
    fn short_buffer_is_truncated() {
        let mut short: &[u8] = &[1, 0, 0, 0];
        assert!(matches!(
            ComHeader::get(&mut short),
            Err(WireError::Truncated { .. })
        ));
    }
}
