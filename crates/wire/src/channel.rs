//! Typed blocking queues for producer/consumer edges inside one machine.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::error::WireError;

/// Unbounded MPMC queue with explicit push, try-pop and blocking pop.
///
/// Items are moved in and out, so a buffer has exactly one owner at a time.
/// Cloning the queue clones both ends.
#[derive(Debug)]
pub struct Queue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    name: &'static str,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            name: self.name,
        }
    }
}

impl<T> Queue<T> {
    pub fn new(name: &'static str) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx, rx, name }
    }

    pub fn push(&self, item: T) -> Result<(), WireError> {
        self.tx
            .send(item)
            .map_err(|_| WireError::Disconnected(self.name.to_string()))
    }

    /// Pop without blocking; `None` when the queue is empty.
    pub fn try_pop(&self) -> Result<Option<T>, WireError> {
        match self.rx.try_recv() {
            Ok(item) => Ok(Some(item)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => {
                Err(WireError::Disconnected(self.name.to_string()))
            }
        }
    }

    /// Block until an item is available.
    pub fn pop(&self) -> Result<T, WireError> {
        self.rx
            .recv()
            .map_err(|_| WireError::Disconnected(self.name.to_string()))
    }

    pub fn pop_timeout(&self, timeout: Duration) -> Result<T, WireError> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => WireError::Timeout(timeout),
            RecvTimeoutError::Disconnected => WireError::Disconnected(self.name.to_string()),
        })
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let q = Queue::new("test");
        q.push(1).unwrap();
        q.push(2).unwrap();
        assert_eq!(q.len(), 2);
        assert_eq!(q.try_pop().unwrap(), Some(1));
        assert_eq!(q.pop().unwrap(), 2);
        assert_eq!(q.try_pop().unwrap(), None);
    }

    #[test]
    fn pop_across_threads() {
        let q = Queue::new("cross");
        let producer = q.clone();
        let handle = std::thread::spawn(move || {
            for i in 0..100u32 {
                producer.push(i).unwrap();
            }
        });
        let got: Vec<u32> = (0..100).map(|_| q.pop().unwrap()).collect();
        handle.join().unwrap();
        assert_eq!(got, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn pop_timeout_expires() {
        let q: Queue<u8> = Queue::new("idle");
        let err = q.pop_timeout(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, WireError::Timeout(_)));
    }
}
