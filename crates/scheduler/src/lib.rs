//! Scheduling engine: per-partition weighted sampling, interference
//! checking, the scheduler machine dispatch loop and the out-of-core
//! shard swap.
//!
//! Each scheduling partition runs on its own [`SchedulerThread`]. A
//! [`SchedulerMachine`] owns the threads of one node, talks to the
//! coordinator through an [`Endpoint`](strads_wire::Endpoint) and swaps
//! data shards through the [`OocController`] behind a [`PartitionGate`].

pub mod command;
pub mod context;
pub mod error;
pub mod gate;
pub mod interference;
pub mod legacy;
pub mod machine;
pub mod ooc;
pub mod sampler;
pub mod stats;
pub mod thread;

pub use command::{MakePhase, SamplingCommand};
pub use context::MachineContext;
pub use error::SchedError;
pub use gate::{PartitionGate, PartitionStatus};
pub use interference::InterferenceChecker;
pub use legacy::GateThread;
pub use machine::SchedulerMachine;
pub use ooc::{OocController, OocIoThread};
pub use sampler::WeightedSampler;
pub use stats::SchedulerStats;
pub use thread::{SchedulerThread, ThreadState};
