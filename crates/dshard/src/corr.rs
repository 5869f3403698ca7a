//! Absolute Pearson correlation between two matrix columns.
//!
//! For sparse columns the sums run over each column's nonzeros and the cross
//! term over the rows where both are nonzero; zeros contribute nothing to any
//! of the sums, so the result equals the dense correlation over all `n` rows.

use crate::shard::SparseColumn;

/// Correlation of two sparse columns of an `n`-row matrix.
///
/// Returns `None` when either column has zero variance.
pub fn sparse_correlation(n: u64, x: &SparseColumn, y: &SparseColumn) -> Option<f64> {
    let (sx, sxx) = moments(&x.vals);
    let (sy, syy) = moments(&y.vals);

    let mut sxy = 0.0;
    let (mut i, mut j) = (0, 0);
    while i < x.rows.len() && j < y.rows.len() {
        match x.rows[i].cmp(&y.rows[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                sxy += x.vals[i] * y.vals[j];
                i += 1;
                j += 1;
            }
        }
    }

    pearson(n as f64, sx, sy, sxx, syy, sxy)
}

/// Correlation of two dense columns of equal length.
pub fn dense_correlation(x: &[f64], y: &[f64]) -> Option<f64> {
    debug_assert_eq!(x.len(), y.len());
    let (sx, sxx) = moments(x);
    let (sy, syy) = moments(y);
    let sxy: f64 = x.iter().zip(y).map(|(a, b)| a * b).sum();
    pearson(x.len() as f64, sx, sy, sxx, syy, sxy)
}

fn moments(vals: &[f64]) -> (f64, f64) {
    vals.iter().fold((0.0, 0.0), |(s, ss), v| (s + v, ss + v * v))
}

fn pearson(n: f64, sx: f64, sy: f64, sxx: f64, syy: f64, sxy: f64) -> Option<f64> {
    let var_x = n * sxx - sx * sx;
    let var_y = n * syy - sy * sy;
    if var_x <= 0.0 || var_y <= 0.0 {
        return None;
    }
    let r = (n * sxy - sx * sy) / (var_x.sqrt() * var_y.sqrt());
    Some(r.abs())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sparse(rows: &[u64], vals: &[f64]) -> SparseColumn {
        SparseColumn {
            rows: rows.to_vec(),
            vals: vals.to_vec(),
        }
    }

    fn densify(n: usize, col: &SparseColumn) -> Vec<f64> {
        let mut out = vec![0.0; n];
        for (r, v) in col.rows.iter().zip(&col.vals) {
            out[*r as usize] = *v;
        }
        out
    }

    #[test]
    fn identical_columns_fully_correlated() {
        let x = sparse(&[0, 2, 5], &[1.0, 2.0, 3.0]);
        let r = sparse_correlation(8, &x, &x).unwrap();
        assert!((r - 1.0).abs() < 1e-12);
    }

    #[test]
    fn sparse_matches_dense() {
        let x = sparse(&[0, 1, 4, 6], &[1.5, -2.0, 0.5, 4.0]);
        let y = sparse(&[1, 2, 4, 7], &[3.0, 1.0, -1.0, 2.0]);
        let n = 8;
        let s = sparse_correlation(n as u64, &x, &y).unwrap();
        let d = dense_correlation(&densify(n, &x), &densify(n, &y)).unwrap();
        assert!((s - d).abs() < 1e-12, "sparse={s} dense={d}");
    }

    #[test]
    fn negative_correlation_reported_as_absolute() {
        let x = [1.0, 2.0, 3.0, 4.0];
        let y = [-1.0, -2.0, -3.0, -4.0];
        let r = dense_correlation(&x, &y).unwrap();
        assert!((r - 1.0).abs() < 1e-12);
    }

    #[test]
    fn empty_column_is_degenerate() {
        let x = sparse(&[], &[]);
        let y = sparse(&[1], &[1.0]);
        assert!(sparse_correlation(4, &x, &y).is_none());
    }

    #[test]
    fn constant_dense_column_is_degenerate() {
        assert!(dense_correlation(&[2.0; 5], &[1.0, 0.0, 3.0, 2.0, 1.0]).is_none());
    }
}
