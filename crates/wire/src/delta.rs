//! Delta streams with trailing out-of-band control entries.
//!
//! A producer may append up to two reserved entries after the real deltas:
//! the desired-change value followed by the minimum-unit-change value. The
//! ids of these entries are sentinels that can never be task ids.

use bytes::{Buf, BufMut};

use crate::error::WireError;
use crate::sched::ensure;

pub const MIN_UNIT_CHANGE_SIGNATURE: u64 = 0xFFFF_FFFF_FFFF_FFFF;
pub const DESIRED_CHANGE_SIGNATURE: u64 = 0xEFFF_FFFF_FFFF_FFEE;

/// Encoded size of one [`DeltaEntry`].
pub const DELTA_ENTRY_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeltaEntry {
    pub idx: u64,
    pub delta: f64,
}

impl DeltaEntry {
    pub fn new(idx: u64, delta: f64) -> Self {
        Self { idx, delta }
    }

    pub fn is_sentinel(&self) -> bool {
        self.idx == MIN_UNIT_CHANGE_SIGNATURE || self.idx == DESIRED_CHANGE_SIGNATURE
    }

    pub fn put(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.idx);
        buf.put_f64_le(self.delta);
    }

    pub fn get(buf: &mut impl Buf) -> Result<Self, WireError> {
        ensure(buf, DELTA_ENTRY_LEN)?;
        Ok(Self {
            idx: buf.get_u64_le(),
            delta: buf.get_f64_le(),
        })
    }
}

/// Control values carried at the tail of a delta stream.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DeltaControls {
    pub desired_change: Option<f64>,
    pub min_unit_change: Option<f64>,
}

impl DeltaControls {
    /// Append the present controls in wire order.
    pub fn append_to(&self, entries: &mut Vec<DeltaEntry>) {
        if let Some(v) = self.desired_change {
            entries.push(DeltaEntry::new(DESIRED_CHANGE_SIGNATURE, v));
        }
        if let Some(v) = self.min_unit_change {
            entries.push(DeltaEntry::new(MIN_UNIT_CHANGE_SIGNATURE, v));
        }
    }

    /// Strip the trailing control entries and return the plain deltas.
    ///
    /// The minimum-unit entry may only be last, the desired-change entry only
    /// directly before it (or last when the other is absent). A sentinel
    /// anywhere else is a protocol violation.
    pub fn strip(mut entries: Vec<DeltaEntry>) -> Result<(Vec<DeltaEntry>, Self), WireError> {
        let mut controls = Self::default();
        if entries.last().map(|e| e.idx) == Some(MIN_UNIT_CHANGE_SIGNATURE) {
            controls.min_unit_change = entries.pop().map(|e| e.delta);
        }
        if entries.last().map(|e| e.idx) == Some(DESIRED_CHANGE_SIGNATURE) {
            controls.desired_change = entries.pop().map(|e| e.delta);
        }
        if let Some(pos) = entries.iter().position(DeltaEntry::is_sentinel) {
            return Err(WireError::MisplacedSentinel(pos));
        }
        Ok((entries, controls))
    }
}
