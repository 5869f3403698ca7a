//! Coordinator round loop.
//!
//! One [`Coordinator`] drives every scheduler machine: it seeds their
//! weights, distributes the data shards, answers each phase with fresh
//! weights computed by a [`RoundHandler`], evaluates the objective
//! periodically and restarts the schedulers once the warm-up is over.

pub mod coordinator;
pub mod error;
pub mod handler;
pub mod objective;
pub mod tracker;

pub use coordinator::{Coordinator, RunSummary};
pub use error::CoordinatorError;
pub use handler::RoundHandler;
pub use objective::{ObjectiveLog, ObjectiveRecord};
pub use tracker::PhaseTracker;
