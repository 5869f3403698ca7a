//! In-process transport: encoded frames over a pair of channels.
//!
//! Every envelope is encoded on send and decoded on receive, so the
//! in-process cluster exercises exactly the validation a socket transport
//! would.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, TryRecvError};

use crate::error::WireError;
use crate::message::Envelope;
use crate::traits::Endpoint;

/// One end of a duplex frame connection.
#[derive(Debug)]
pub struct Link {
    local: i32,
    peer: i32,
    tx: Sender<Bytes>,
    rx: Receiver<Bytes>,
    seqno: AtomicU64,
}

/// Create a connected pair of links between rank `a` and rank `b`.
pub fn link_pair(a: i32, b: i32) -> (Link, Link) {
    let (a_tx, b_rx) = crossbeam_channel::unbounded();
    let (b_tx, a_rx) = crossbeam_channel::unbounded();
    (
        Link {
            local: a,
            peer: b,
            tx: a_tx,
            rx: a_rx,
            seqno: AtomicU64::new(0),
        },
        Link {
            local: b,
            peer: a,
            tx: b_tx,
            rx: b_rx,
            seqno: AtomicU64::new(0),
        },
    )
}

impl Link {
    fn disconnected(&self) -> WireError {
        WireError::Disconnected(format!("link {} -> {}", self.local, self.peer))
    }

    fn accept(&self, frame: Bytes) -> Result<Envelope, WireError> {
        let envelope = Envelope::decode(&frame)?;
        if envelope.header.dst_rank != self.local {
            return Err(WireError::Malformed(format!(
                "frame for rank {} arrived at rank {}",
                envelope.header.dst_rank, self.local
            )));
        }
        tracing::trace!(
            from = envelope.header.src_rank,
            to = self.local,
            seqno = envelope.header.seqno,
            kind = envelope.message.name(),
            "frame received"
        );
        Ok(envelope)
    }
}

impl Endpoint for Link {
    fn local_rank(&self) -> i32 {
        self.local
    }

    fn peer_rank(&self) -> i32 {
        self.peer
    }

    fn send(&self, mut envelope: Envelope) -> Result<(), WireError> {
        envelope.header.src_rank = self.local;
        envelope.header.dst_rank = self.peer;
        envelope.header.seqno = self.seqno.fetch_add(1, Ordering::Relaxed);
        let frame = envelope.encode()?;
        self.tx.send(frame).map_err(|_| self.disconnected())
    }

    fn recv(&self) -> Result<Envelope, WireError> {
        let frame = self.rx.recv().map_err(|_| self.disconnected())?;
        self.accept(frame)
    }

    fn try_recv(&self) -> Result<Option<Envelope>, WireError> {
        match self.rx.try_recv() {
            Ok(frame) => self.accept(frame).map(Some),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(self.disconnected()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    #[test]
    fn frames_are_stamped_with_ranks_and_seqno() {
        let (coord, sched) = link_pair(5, 1);
        coord.send(Envelope::new(Message::Shutdown)).unwrap();
        coord.send(Envelope::new(Message::WakeUp)).unwrap();

        let first = sched.recv().unwrap();
        assert_eq!(first.header.src_rank, 5);
        assert_eq!(first.header.dst_rank, 1);
        assert_eq!(first.header.seqno, 0);
        assert_eq!(sched.try_recv().unwrap().unwrap().header.seqno, 1);
        assert!(sched.try_recv().unwrap().is_none());
    }

    #[test]
    fn dropped_peer_reports_disconnect() {
        let (a, b) = link_pair(0, 1);
        drop(b);
        assert!(matches!(
            a.send(Envelope::new(Message::Shutdown)),
            Err(WireError::Disconnected(_))
        ));
    }
}
