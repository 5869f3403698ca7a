use serde::Serialize;

/// Per-thread sampling counters, merged per machine and reported at
/// shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    /// Phases produced.
    pub rounds: u64,
    /// Distinct ids drawn by the sampler.
    pub sampled: u64,
    /// Ids that survived the interference check.
    pub retained: u64,
    /// Surplus sampling points that fell on an already chosen id.
    pub cancelled: u64,
    /// Rounds where no usable shard was available and checking was skipped.
    pub unchecked_rounds: u64,
    /// Rounds that waited for their column group to be swapped in.
    pub held_rounds: u64,
}

impl SchedulerStats {
    /// Record one produced phase.
    pub fn record_round(&mut self, sampled: usize, retained: usize, cancelled: u64, checked: bool) {
        self.rounds += 1;
        self.sampled += sampled as u64;
        self.retained += retained as u64;
        self.cancelled += cancelled;
        if !checked {
            self.unchecked_rounds += 1;
        }
    }

    pub fn merge(&mut self, other: &SchedulerStats) {
        self.rounds += other.rounds;
        self.sampled += other.sampled;
        self.retained += other.retained;
        self.cancelled += other.cancelled;
        self.unchecked_rounds += other.unchecked_rounds;
        self.held_rounds += other.held_rounds;
    }

    /// Fraction of sampled ids that passed the interference check.
    pub fn retention(&self) -> f64 {
        if self.sampled == 0 {
            return 1.0;
        }
        self.retained as f64 / self.sampled as f64
    }
}
