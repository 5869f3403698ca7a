use std::sync::Arc;

use crate::error::WireError;
use crate::message::Envelope;

/// One side of a point-to-point connection between two ranks.
///
/// The coordinator and the scheduler machines only talk through this trait,
/// so an in-process [`Link`](crate::Link) and a recording wrapper in tests are
/// interchangeable.
pub trait Endpoint: Send + Sync {
    /// Rank of this side.
    fn local_rank(&self) -> i32;

    /// Rank of the other side.
    fn peer_rank(&self) -> i32;

    /// Send one envelope. Ranks and sequence numbers are stamped here.
    fn send(&self, envelope: Envelope) -> Result<(), WireError>;

    /// Receive the next envelope, blocking until one is available.
    fn recv(&self) -> Result<Envelope, WireError>;

    /// Receive without blocking; `None` when nothing is pending.
    fn try_recv(&self) -> Result<Option<Envelope>, WireError>;
}

/// Blanket implementation so `Arc<dyn Endpoint>` can be used directly.
impl<T: Endpoint + ?Sized> Endpoint for Arc<T> {
    fn local_rank(&self) -> i32 {
        (**self).local_rank()
    }

    fn peer_rank(&self) -> i32 {
        (**self).peer_rank()
    }

    fn send(&self, envelope: Envelope) -> Result<(), WireError> {
        (**self).send(envelope)
    }

    fn recv(&self) -> Result<Envelope, WireError> {
        (**self).recv()
    }

    fn try_recv(&self) -> Result<Option<Envelope>, WireError> {
        (**self).try_recv()
    }
}
