//! Synthetic design matrices for trying the scheduler without real data.

use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use strads_dshard::{write_pbf, NzEntry, PbfHeader, ShardError};

/// Shape and sparsity of a generated matrix.
#[derive(Debug, Clone, Copy)]
pub struct Synthetic {
    pub rows: u64,
    pub cols: u64,
    pub density: f64,
    pub seed: u64,
}

impl Synthetic {
    /// Column-major entries. Every column gets at least one non-zero so no
    /// column is constant.
    pub fn entries(&self) -> Vec<NzEntry> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let density = self.density.clamp(0.0, 1.0);
        let mut out = Vec::new();
        for col in 0..self.cols {
            let before = out.len();
            for row in 0..self.rows {
                if rng.gen_bool(density) {
                    out.push(NzEntry {
                        row,
                        col,
                        val: rng.gen_range(-1.0..1.0),
                    });
                }
            }
            if out.len() == before && self.rows > 0 {
                out.push(NzEntry {
                    row: rng.gen_range(0..self.rows),
                    col,
                    val: 1.0,
                });
            }
        }
        out
    }

    pub fn write(&self, path: &Path) -> Result<PbfHeader, ShardError> {
        write_pbf(path, self.rows, self.cols, &self.entries())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use strads_dshard::read_size;

    #[test]
    fn every_column_has_a_nonzero() {
        let spec = Synthetic {
            rows: 20,
            cols: 50,
            density: 0.01,
            seed: 3,
        };
        let entries = spec.entries();
        for col in 0..50 {
            assert!(entries.iter().any(|e| e.col == col), "column {col} empty");
        }
        assert_eq!(entries, spec.entries());
    }

    #[test]
    fn written_file_reports_its_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        let spec = Synthetic {
            rows: 30,
            cols: 40,
            density: 0.2,
            seed: 9,
        };
        let header = spec.write(&path).unwrap();
        assert_eq!(read_size(&path).unwrap(), (30, 40, header.nonzero));
    }
}
