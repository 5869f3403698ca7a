//! Weighted random sampling over one scheduling partition.
//!
//! Every task owns the interval `bw + weights[i]` on a line of length
//! `totalw + bw * len`; uniform points on that line select the tasks whose
//! intervals they land in, so a task with zero weight is still picked with
//! probability proportional to the base weight.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::trace;

use strads_core::{SchedulerParams, TaskId, TaskRange};
use strads_wire::IdVal;

use crate::error::SchedError;

/// Base weight used when auto-tuning has nothing to go on.
pub const BASE_WEIGHT_FLOOR: f64 = 0.1;

/// Auto-tuning needs more than this many nonzero weights.
const TUNE_MIN_NONZERO: usize = 10;

/// Dense weight array for one partition plus the sampling state.
#[derive(Debug)]
pub struct WeightedSampler {
    range: TaskRange,
    weights: Vec<f64>,
    totalw: f64,
    nzelement: usize,
    bw: f64,
    maxset: usize,
    auto_tune: bool,
    tune_factor: f64,
    cancelled: u64,
    rng: StdRng,
}

impl WeightedSampler {
    pub fn new(range: TaskRange, maxset: usize, bw: f64) -> Self {
        Self {
            range,
            weights: vec![0.0; range.len()],
            totalw: 0.0,
            nzelement: 0,
            bw,
            maxset,
            auto_tune: true,
            tune_factor: 0.01,
            cancelled: 0,
            rng: StdRng::seed_from_u64(0),
        }
    }

    /// Sampler for partition `gid` built from the configured parameters. The
    /// RNG is seeded with `seed + gid` so partitions draw different streams.
    pub fn from_params(range: TaskRange, gid: usize, params: &SchedulerParams) -> Self {
        let mut s = Self::new(range, params.maxset, params.base_weight);
        s.auto_tune = params.auto_tune;
        s.tune_factor = params.tune_factor;
        s.rng = StdRng::seed_from_u64(params.seed.wrapping_add(gid as u64));
        s
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn with_auto_tune(mut self, enabled: bool) -> Self {
        self.auto_tune = enabled;
        self
    }

    pub fn range(&self) -> TaskRange {
        self.range
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn maxset(&self) -> usize {
        self.maxset
    }

    pub fn base_weight(&self) -> f64 {
        self.bw
    }

    pub fn total_weight(&self) -> f64 {
        self.totalw
    }

    pub fn nonzero(&self) -> usize {
        self.nzelement
    }

    /// Total number of surplus points that fell on an already chosen task.
    pub fn cancelled(&self) -> u64 {
        self.cancelled
    }

    /// Length of the sampling line.
    pub fn max_range(&self) -> f64 {
        self.totalw + self.bw * self.weights.len() as f64
    }

    /// Current weight of global task `id`.
    pub fn weight(&self, id: TaskId) -> Option<f64> {
        if !self.range.contains(id) {
            return None;
        }
        Some(self.weights[(id - self.range.start) as usize])
    }

    /// Apply `(global id, signed weight)` changes. Weights are stored as
    /// absolute values; the totals are recomputed from scratch afterwards.
    pub fn update_weight(&mut self, changes: &[IdVal]) -> Result<(), SchedError> {
        for c in changes {
            if !self.range.contains(c.id) {
                return Err(SchedError::OutOfRange {
                    id: c.id,
                    range: self.range,
                });
            }
            self.weights[(c.id - self.range.start) as usize] = c.value.abs();
        }
        self.rescan();
        if self.auto_tune {
            self.tune_base_weight();
        }
        Ok(())
    }

    fn rescan(&mut self) {
        self.totalw = self.weights.iter().sum();
        self.nzelement = self.weights.iter().filter(|w| **w != 0.0).count();
    }

    /// Derive the base weight from the mean nonzero weight.
    pub fn tune_base_weight(&mut self) {
        self.bw = if self.nzelement > TUNE_MIN_NONZERO && self.totalw != 0.0 {
            let bw = self.totalw / self.nzelement as f64 * self.tune_factor;
            if bw == 0.0 {
                BASE_WEIGHT_FLOOR
            } else {
                bw
            }
        } else {
            BASE_WEIGHT_FLOOR
        };
    }

    pub fn set_base_weight(&mut self, bw: f64) {
        self.bw = bw;
    }

    /// Draw `setsize` uniform points and return the distinct tasks they hit,
    /// heaviest first.
    pub fn do_sampling(&mut self, setsize: usize) -> Result<Vec<TaskId>, SchedError> {
        if setsize >= self.weights.len() {
            return Err(SchedError::SetSizeTooLarge {
                setsize,
                len: self.weights.len(),
            });
        }
        let maxrange = self.max_range();
        if maxrange <= 0.0 {
            return Ok(Vec::new());
        }
        let points: Vec<f64> = (0..setsize)
            .map(|_| self.rng.gen_range(0.0..maxrange))
            .collect();
        Ok(self.sample_with_points(points))
    }

    /// Sweep with caller-supplied points.
    pub fn sample_with_points(&mut self, mut points: Vec<f64>) -> Vec<TaskId> {
        points.sort_by(f64::total_cmp);

        let mut picked: Vec<usize> = Vec::with_capacity(points.len());
        let mut p = 0;
        let mut acc = 0.0;
        for (i, w) in self.weights.iter().enumerate() {
            if p == points.len() {
                break;
            }
            let upper = acc + w + (i + 1) as f64 * self.bw;
            let mut hit = false;
            while p < points.len() && points[p] <= upper {
                if hit {
                    self.cancelled += 1;
                } else {
                    picked.push(i);
                    hit = true;
                }
                p += 1;
            }
            acc += w;
        }

        trace!(
            start = self.range.start,
            points = points.len(),
            picked = picked.len(),
            "sampling sweep"
        );

        self.sort(&mut picked);
        picked
            .into_iter()
            .map(|i| i as TaskId + self.range.start)
            .collect()
    }

    /// Nonzero weights first by descending weight, zero weights last.
    fn sort(&self, local: &mut [usize]) {
        local.sort_by(|a, b| {
            let (wa, wb) = (self.weights[*a], self.weights[*b]);
            (wa == 0.0).cmp(&(wb == 0.0)).then(wb.total_cmp(&wa))
        });
    }
}
