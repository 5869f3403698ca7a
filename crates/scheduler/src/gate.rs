//! Per-machine barrier between the scheduler threads and the shard swap.
//!
//! Threads mark themselves active only while they read the shard. A
//! cutover first holds every partition, waits until none is active, swaps
//! the shard and then releases the holds. Partitions whose columns are not
//! in the active shard stay blocked until a later cutover makes them
//! resident. One mutex and one condition variable cover all state
//! transitions.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use tracing::trace;

use crate::error::SchedError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionStatus {
    Idle,
    /// Reading the active shard.
    Active,
    /// Waiting on the gate, either for a cutover or for a wake-up.
    Blocked,
}

#[derive(Debug)]
struct GateState {
    status: Vec<PartitionStatus>,
    hold: Vec<bool>,
    resident: Vec<bool>,
    closed: bool,
    parking: Vec<bool>,
    parked: Vec<bool>,
    wakes: Vec<u64>,
}

#[derive(Debug)]
pub struct PartitionGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

/// Marks a partition active until dropped.
#[derive(Debug)]
pub struct GateGuard<'a> {
    gate: &'a PartitionGate,
    lid: usize,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        let mut st = self.gate.lock();
        st.status[self.lid] = PartitionStatus::Idle;
        self.gate.cond.notify_all();
    }
}

impl PartitionGate {
    pub fn new(partitions: usize) -> Self {
        Self {
            state: Mutex::new(GateState {
                status: vec![PartitionStatus::Idle; partitions],
                hold: vec![false; partitions],
                resident: vec![true; partitions],
                closed: false,
                parking: vec![false; partitions],
                parked: vec![false; partitions],
                wakes: vec![0; partitions],
            }),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, GateState>) -> MutexGuard<'a, GateState> {
        self.cond.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    pub fn partitions(&self) -> usize {
        self.lock().status.len()
    }

    pub fn status(&self, lid: usize) -> PartitionStatus {
        self.lock().status[lid]
    }

    /// Become active on partition `lid`, waiting out any cutover hold and
    /// any stretch where its columns are not resident. Returns `None` once
    /// the gate is closed.
    pub fn enter(&self, lid: usize) -> Option<GateGuard<'_>> {
        let mut st = self.lock();
        while !st.closed && (st.hold[lid] || !st.resident[lid]) {
            st.status[lid] = PartitionStatus::Blocked;
            self.cond.notify_all();
            st = self.wait(st);
        }
        if st.closed {
            st.status[lid] = PartitionStatus::Idle;
            return None;
        }
        st.status[lid] = PartitionStatus::Active;
        Some(GateGuard { gate: self, lid })
    }

    pub fn is_resident(&self, lid: usize) -> bool {
        self.lock().resident[lid]
    }

    /// Mark whether the active shard holds the columns of partition `lid`.
    pub fn set_resident(&self, lid: usize, resident: bool) {
        let mut st = self.lock();
        st.resident[lid] = resident;
        self.cond.notify_all();
    }

    /// Turn every waiting or later `enter` into `None`.
    pub fn close(&self) {
        let mut st = self.lock();
        st.closed = true;
        self.cond.notify_all();
    }

    /// Hold `lids` and wait until none of them is active.
    pub fn quiesce(&self, lids: &[usize]) {
        let mut st = self.lock();
        for &lid in lids {
            st.hold[lid] = true;
        }
        while lids.iter().any(|&l| st.status[l] == PartitionStatus::Active) {
            st = self.wait(st);
        }
        trace!(partitions = lids.len(), "gate quiesced");
    }

    /// Lift the hold on `lids`. Returns the blocked partitions that may now
    /// proceed; blocked partitions that are not resident stay blocked.
    pub fn release(&self, lids: &[usize]) -> Vec<usize> {
        let mut st = self.lock();
        let mut woken = Vec::new();
        for &lid in lids {
            st.hold[lid] = false;
            if st.status[lid] == PartitionStatus::Blocked && !st.parked[lid] && st.resident[lid] {
                st.status[lid] = PartitionStatus::Idle;
                woken.push(lid);
            }
        }
        self.cond.notify_all();
        woken
    }

    /// Announce that partition `lid` will park and must be woken by
    /// [`PartitionGate::wake`].
    pub fn request_park(&self, lid: usize) {
        self.lock().parking[lid] = true;
    }

    /// Block partition `lid` until it is woken. Returns immediately when no
    /// park was requested.
    pub fn park(&self, lid: usize) {
        let mut st = self.lock();
        if !st.parking[lid] {
            return;
        }
        st.status[lid] = PartitionStatus::Blocked;
        st.parked[lid] = true;
        let ticket = st.wakes[lid];
        self.cond.notify_all();
        while st.wakes[lid] == ticket {
            st = self.wait(st);
        }
        st.status[lid] = PartitionStatus::Idle;
    }

    /// Wake a parked partition. Waits for the partition to reach its park
    /// point if it was asked to park but has not got there yet; waking a
    /// partition that was never asked to park is a protocol violation.
    pub fn wake(&self, lid: usize) -> Result<(), SchedError> {
        let mut st = self.lock();
        if lid >= st.parking.len() || !st.parking[lid] {
            return Err(not_blocked(lid));
        }
        while st.parking[lid] && !st.parked[lid] {
            st = self.wait(st);
        }
        if !st.parking[lid] {
            return Err(not_blocked(lid));
        }
        st.parking[lid] = false;
        st.parked[lid] = false;
        st.wakes[lid] += 1;
        self.cond.notify_all();
        Ok(())
    }

    /// Drop any pending park of a partition whose thread has stopped.
    pub fn retire(&self, lid: usize) {
        let mut st = self.lock();
        st.parking[lid] = false;
        st.parked[lid] = false;
        st.status[lid] = PartitionStatus::Idle;
        self.cond.notify_all();
    }
}

fn not_blocked(lid: usize) -> SchedError {
    SchedError::Protocol(format!("wake_up for partition {lid} which is not blocked"))
}
