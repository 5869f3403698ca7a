use crate::error::CoordinatorError;

/// Enforces phase / weight-update alternation per partition.
#[derive(Debug, Clone)]
pub struct PhaseTracker {
    outstanding: Vec<bool>,
}

impl PhaseTracker {
    pub fn new(partitions: usize) -> Self {
        Self {
            outstanding: vec![false; partitions],
        }
    }

    /// A phase arrived from `gid`; it must not already have one unanswered.
    pub fn on_phase(&mut self, gid: usize) -> Result<(), CoordinatorError> {
        match self.outstanding.get_mut(gid) {
            Some(slot) if !*slot => {
                *slot = true;
                Ok(())
            }
            Some(_) => Err(CoordinatorError::Protocol(format!(
                "partition {gid} sent a phase while one is unanswered"
            ))),
            None => Err(CoordinatorError::Protocol(format!(
                "phase from unknown partition {gid}"
            ))),
        }
    }

    /// The phase of `gid` was answered.
    pub fn on_update(&mut self, gid: usize) -> Result<(), CoordinatorError> {
        match self.outstanding.get_mut(gid) {
            Some(slot) if *slot => {
                *slot = false;
                Ok(())
            }
            _ => Err(CoordinatorError::Protocol(format!(
                "weight update for partition {gid} without a phase"
            ))),
        }
    }

    /// Forget every outstanding phase, after a drain.
    pub fn reset(&mut self) {
        self.outstanding.iter_mut().for_each(|s| *s = false);
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.iter().filter(|s| **s).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alternation_enforced() {
        let mut t = PhaseTracker::new(2);
        t.on_phase(0).unwrap();
        assert!(t.on_phase(0).is_err());
        t.on_phase(1).unwrap();
        assert_eq!(t.outstanding(), 2);
        t.on_update(0).unwrap();
        assert!(t.on_update(0).is_err());
        t.on_phase(0).unwrap();
    }

    #[test]
    fn unknown_partition_rejected() {
        let mut t = PhaseTracker::new(2);
        assert!(t.on_phase(2).is_err());
        assert!(t.on_update(5).is_err());
    }

    #[test]
    fn reset_clears_outstanding() {
        let mut t = PhaseTracker::new(3);
        t.on_phase(0).unwrap();
        t.on_phase(2).unwrap();
        t.reset();
        assert_eq!(t.outstanding(), 0);
        t.on_phase(0).unwrap();
    }
}
