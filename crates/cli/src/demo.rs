//! Least-squares coordinate descent used to exercise the engine end to end.
//!
//! Minimises `0.5 * ||y - A x||^2 + lambda * ||x||_1` over the columns of a
//! loaded shard. Each phase's proposals are computed in parallel from the
//! same residual and applied together, which is exactly where the
//! scheduler's interference check matters.

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;

use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info};

use strads_coordinator::{CoordinatorError, RoundHandler};
use strads_core::TaskId;
use strads_dshard::{ColumnView, DataShard};
use strads_wire::PhaseMessage;

pub struct LeastSquares {
    shard: Arc<DataShard>,
    x: Vec<f64>,
    residual: Vec<f64>,
    sq_norms: Vec<f64>,
    /// Magnitude of the last accepted change per coefficient.
    last_delta: Vec<f64>,
    lambda: f64,
    output: Option<PathBuf>,
}

#[derive(Serialize)]
struct Coefficient {
    id: TaskId,
    value: f64,
}

impl LeastSquares {
    /// Fit `y` with the columns of `shard`; `y` is indexed by row.
    pub fn new(shard: Arc<DataShard>, y: Vec<f64>, lambda: f64) -> Result<Self, CoordinatorError> {
        if y.len() as u64 != shard.rows() {
            return Err(CoordinatorError::Handler(format!(
                "target has {} rows, shard has {}",
                y.len(),
                shard.rows()
            )));
        }
        let cols = shard.columns();
        let width = cols.end as usize + 1;
        let mut sq_norms = vec![0.0; width];
        for col in cols.ids() {
            let mut sq = 0.0;
            for_each_nz(&shard, col, |_, v| sq += v * v)?;
            sq_norms[col as usize] = sq;
        }
        Ok(Self {
            shard,
            x: vec![0.0; width],
            residual: y,
            sq_norms,
            last_delta: vec![0.0; width],
            lambda,
            output: None,
        })
    }

    /// Target built from a planted coefficient vector: every fifth
    /// coefficient is non-zero.
    pub fn planted(shard: Arc<DataShard>, lambda: f64) -> Result<Self, CoordinatorError> {
        let mut y = vec![0.0; shard.rows() as usize];
        for col in shard.columns().ids().filter(|c| c % 5 == 0) {
            let truth = 1.0 + (col % 3) as f64;
            for_each_nz(&shard, col, |row, v| y[row] += truth * v)?;
        }
        Self::new(shard, y, lambda)
    }

    pub fn with_output(mut self, path: PathBuf) -> Self {
        self.output = Some(path);
        self
    }

    pub fn coefficients(&self) -> &[f64] {
        &self.x
    }

    /// Coordinate-wise minimiser change for `col` given the current residual.
    fn proposal(&self, col: TaskId) -> Result<f64, CoordinatorError> {
        let j = col as usize;
        let sq = self.sq_norms.get(j).copied().unwrap_or(0.0);
        if sq == 0.0 {
            return Ok(0.0);
        }
        let mut dot = 0.0;
        for_each_nz(&self.shard, col, |row, v| dot += v * self.residual[row])?;
        let z = self.x[j] + dot / sq;
        Ok(soft_threshold(z, self.lambda / sq) - self.x[j])
    }
}

fn soft_threshold(z: f64, t: f64) -> f64 {
    if z > t {
        z - t
    } else if z < -t {
        z + t
    } else {
        0.0
    }
}

fn for_each_nz(
    shard: &DataShard,
    col: TaskId,
    mut f: impl FnMut(usize, f64),
) -> Result<(), CoordinatorError> {
    let view = shard
        .column(col)
        .map_err(|e| CoordinatorError::Handler(e.to_string()))?;
    match view {
        ColumnView::Sparse(c) => c
            .rows
            .iter()
            .zip(&c.vals)
            .for_each(|(r, v)| f(*r as usize, *v)),
        ColumnView::Dense(vals) => vals
            .iter()
            .enumerate()
            .filter(|(_, v)| **v != 0.0)
            .for_each(|(r, v)| f(r, *v)),
    }
    Ok(())
}

impl RoundHandler for LeastSquares {
    type Partial = Vec<f64>;

    fn dispatch_scheduling(&mut self, phase: &PhaseMessage) -> Result<(), CoordinatorError> {
        debug!(gid = phase.thrdgid, tasks = phase.task_ids.len(), "dispatch");
        Ok(())
    }

    fn do_msgcombiner(&mut self, phase: &PhaseMessage) -> Result<Vec<f64>, CoordinatorError> {
        let this = &*self;
        phase
            .task_ids
            .par_iter()
            .map(|col| this.proposal(*col))
            .collect()
    }

    fn do_aggregate(&mut self, phase: &PhaseMessage, deltas: &Vec<f64>) -> Result<(), CoordinatorError> {
        for (col, d) in phase.task_ids.iter().zip(deltas) {
            let j = *col as usize;
            self.last_delta[j] = d.abs();
            if *d == 0.0 {
                continue;
            }
            self.x[j] += d;
            let residual = &mut self.residual;
            for_each_nz(&self.shard, *col, |row, v| residual[row] -= d * v)?;
        }
        Ok(())
    }

    fn update_weight(
        &mut self,
        _phase: &PhaseMessage,
        deltas: &Vec<f64>,
    ) -> Result<Vec<f64>, CoordinatorError> {
        Ok(deltas.iter().map(|d| d.abs()).collect())
    }

    fn objective(&mut self) -> Result<f64, CoordinatorError> {
        let loss: f64 = self.residual.iter().map(|r| r * r).sum::<f64>() * 0.5;
        let penalty: f64 = self.x.iter().map(|x| x.abs()).sum::<f64>() * self.lambda;
        Ok(loss + penalty)
    }

    fn set_initial_priority(&mut self, weights: &mut [f64]) {
        for (w, d) in weights.iter_mut().zip(&self.last_delta) {
            *w = *d;
        }
    }

    fn log_parameters(&mut self) -> Result<(), CoordinatorError> {
        let nonzero: Vec<Coefficient> = self
            .x
            .iter()
            .enumerate()
            .filter(|(_, v)| **v != 0.0)
            .map(|(id, v)| Coefficient {
                id: id as TaskId,
                value: *v,
            })
            .collect();
        info!(nonzero = nonzero.len(), "final coefficients");
        if let Some(path) = &self.output {
            serde_json::to_writer_pretty(BufWriter::new(File::create(path)?), &nonzero)?;
            info!(path = %path.display(), "coefficients written");
        }
        Ok(())
    }
}
