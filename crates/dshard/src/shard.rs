use strads_core::{ShardKind, TaskRange};

use crate::corr::{dense_correlation, sparse_correlation};
use crate::error::ShardError;

/// One sparse column: row indices ascending, values aligned.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SparseColumn {
    pub rows: Vec<u64>,
    pub vals: Vec<f64>,
}

impl SparseColumn {
    pub fn nnz(&self) -> usize {
        self.rows.len()
    }

    /// Sort by row and fold duplicate rows by summing their values.
    fn normalize(&mut self) {
        if self.rows.windows(2).all(|w| w[0] < w[1]) {
            return;
        }
        let mut pairs: Vec<(u64, f64)> =
            self.rows.drain(..).zip(self.vals.drain(..)).collect();
        pairs.sort_by_key(|(r, _)| *r);
        for (r, v) in pairs {
            match self.rows.last() {
                Some(&last) if last == r => {
                    if let Some(acc) = self.vals.last_mut() {
                        *acc += v;
                    }
                }
                _ => {
                    self.rows.push(r);
                    self.vals.push(v);
                }
            }
        }
    }
}

/// Column-major storage for the columns of one shard.
#[derive(Debug, Clone)]
pub enum ColumnStore {
    Sparse(Vec<SparseColumn>),
    /// `data[local_col * rows + row]`.
    Dense { rows: usize, data: Vec<f64> },
}

/// Borrowed view of one column.
#[derive(Debug, Clone, Copy)]
pub enum ColumnView<'a> {
    Sparse(&'a SparseColumn),
    Dense(&'a [f64]),
}

/// Identifies which out-of-core column group a shard represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardTag {
    pub h_modulo: usize,
    pub oocdpartitions: usize,
}

impl ShardTag {
    /// Tag of a shard that holds every column of its range.
    pub fn whole() -> Self {
        Self {
            h_modulo: 0,
            oocdpartitions: 1,
        }
    }
}

/// A column-partitioned matrix shard.
///
/// The shard spans `columns` but only holds values for the `loaded` ranges;
/// with out-of-core cycling that is one column group of the machine's range.
#[derive(Debug, Clone)]
pub struct DataShard {
    alias: String,
    rows: u64,
    columns: TaskRange,
    loaded: Vec<TaskRange>,
    tag: ShardTag,
    store: ColumnStore,
    nonzero: u64,
}

impl DataShard {
    /// Build a shard from `(row, col, value)` triplets. Columns are global
    /// ids and must fall inside `columns`; rows must be below `rows`.
    pub fn from_triplets(
        alias: impl Into<String>,
        kind: ShardKind,
        rows: u64,
        columns: TaskRange,
        loaded: Vec<TaskRange>,
        tag: ShardTag,
        triplets: impl IntoIterator<Item = (u64, u64, f64)>,
    ) -> Result<Self, ShardError> {
        let width = columns.len();
        let mut nonzero = 0u64;
        let store = match kind {
            ShardKind::Sparse => {
                let mut cols = vec![SparseColumn::default(); width];
                for (row, col, val) in triplets {
                    check_entry(row, col, rows, &columns)?;
                    let c = &mut cols[(col - columns.start) as usize];
                    c.rows.push(row);
                    c.vals.push(val);
                    nonzero += 1;
                }
                cols.iter_mut().for_each(SparseColumn::normalize);
                ColumnStore::Sparse(cols)
            }
            ShardKind::Dense => {
                let n = rows as usize;
                let mut data = vec![0.0; width * n];
                for (row, col, val) in triplets {
                    check_entry(row, col, rows, &columns)?;
                    data[(col - columns.start) as usize * n + row as usize] += val;
                    nonzero += 1;
                }
                ColumnStore::Dense { rows: n, data }
            }
        };

        Ok(Self {
            alias: alias.into(),
            rows,
            columns,
            loaded,
            tag,
            store,
            nonzero,
        })
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Number of matrix rows (`n` in the correlation).
    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn columns(&self) -> TaskRange {
        self.columns
    }

    pub fn loaded(&self) -> &[TaskRange] {
        &self.loaded
    }

    pub fn tag(&self) -> ShardTag {
        self.tag
    }

    pub fn nonzero(&self) -> u64 {
        self.nonzero
    }

    pub fn kind(&self) -> ShardKind {
        match self.store {
            ColumnStore::Sparse(_) => ShardKind::Sparse,
            ColumnStore::Dense { .. } => ShardKind::Dense,
        }
    }

    /// True when column `col` was loaded into this shard.
    pub fn holds(&self, col: u64) -> bool {
        self.loaded.iter().any(|r| r.contains(col))
    }

    /// True when every column of `range` was loaded into this shard.
    pub fn holds_range(&self, range: TaskRange) -> bool {
        self.loaded.iter().any(|r| r.covers(&range))
    }

    pub fn column(&self, col: u64) -> Result<ColumnView<'_>, ShardError> {
        if !self.holds(col) {
            return Err(ShardError::MissingColumn(col));
        }
        let local = (col - self.columns.start) as usize;
        Ok(match &self.store {
            ColumnStore::Sparse(cols) => ColumnView::Sparse(&cols[local]),
            ColumnStore::Dense { rows, data } => {
                ColumnView::Dense(&data[local * rows..(local + 1) * rows])
            }
        })
    }

    /// Absolute Pearson correlation of columns `a` and `b`.
    pub fn correlation(&self, a: u64, b: u64) -> Result<f64, ShardError> {
        let r = match (self.column(a)?, self.column(b)?) {
            (ColumnView::Sparse(x), ColumnView::Sparse(y)) => sparse_correlation(self.rows, x, y),
            (ColumnView::Dense(x), ColumnView::Dense(y)) => dense_correlation(x, y),
            _ => None,
        };
        r.ok_or(ShardError::DegenerateColumn { a, b })
    }
}

fn check_entry(row: u64, col: u64, rows: u64, columns: &TaskRange) -> Result<(), ShardError> {
    if row >= rows || !columns.contains(col) {
        return Err(ShardError::EntryOutOfBounds {
            row,
            col,
            maxrow: rows,
            maxcol: columns.end + 1,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard(kind: ShardKind, loaded: Vec<TaskRange>) -> DataShard {
        let triplets = vec![
            (0, 10, 1.0),
            (1, 10, 2.0),
            (2, 10, 3.0),
            (0, 11, 2.0),
            (1, 11, 4.0),
            (2, 11, 6.0),
            (3, 12, 1.0),
            (1, 12, 1.0),
        ];
        DataShard::from_triplets(
            "Acol",
            kind,
            4,
            TaskRange::new(10, 13),
            loaded,
            ShardTag::whole(),
            triplets,
        )
        .unwrap()
    }

    #[test]
    fn sparse_columns_sorted_by_row() {
        let s = shard(ShardKind::Sparse, vec![TaskRange::new(10, 13)]);
        match s.column(12).unwrap() {
            ColumnView::Sparse(c) => assert_eq!(c.rows, vec![1, 3]),
            ColumnView::Dense(_) => panic!("expected sparse"),
        }
        assert_eq!(s.nonzero(), 8);
    }

    #[test]
    fn sparse_and_dense_agree() {
        let sp = shard(ShardKind::Sparse, vec![TaskRange::new(10, 13)]);
        let de = shard(ShardKind::Dense, vec![TaskRange::new(10, 13)]);
        for (a, b) in [(10, 11), (10, 12), (11, 12)] {
            let x = sp.correlation(a, b).unwrap();
            let y = de.correlation(a, b).unwrap();
            assert!((x - y).abs() < 1e-12);
        }
        assert!((sp.correlation(10, 11).unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn empty_column_is_degenerate() {
        let s = shard(ShardKind::Sparse, vec![TaskRange::new(10, 13)]);
        assert!(matches!(
            s.correlation(10, 13),
            Err(ShardError::DegenerateColumn { a: 10, b: 13 })
        ));
    }

    #[test]
    fn unloaded_column_is_missing() {
        let s = shard(ShardKind::Sparse, vec![TaskRange::new(10, 11)]);
        assert!(s.holds_range(TaskRange::new(10, 11)));
        assert!(!s.holds_range(TaskRange::new(11, 12)));
        assert!(matches!(s.column(12), Err(ShardError::MissingColumn(12))));
    }

    #[test]
    fn duplicate_entries_are_summed() {
        let s = DataShard::from_triplets(
            "dup",
            ShardKind::Sparse,
            3,
            TaskRange::new(0, 0),
            vec![TaskRange::new(0, 0)],
            ShardTag::whole(),
            vec![(2, 0, 1.0), (0, 0, 1.0), (2, 0, 0.5)],
        )
        .unwrap();
        match s.column(0).unwrap() {
            ColumnView::Sparse(c) => {
                assert_eq!(c.rows, vec![0, 2]);
                assert_eq!(c.vals, vec![1.0, 1.5]);
            }
            ColumnView::Dense(_) => panic!("expected sparse"),
        }
    }

    #[test]
    fn out_of_range_entry_rejected() {
        let err = DataShard::from_triplets(
            "bad",
            ShardKind::Sparse,
            2,
            TaskRange::new(0, 1),
            vec![TaskRange::new(0, 1)],
            ShardTag::whole(),
            vec![(5, 0, 1.0)],
        )
        .unwrap_err();
        assert!(matches!(err, ShardError::EntryOutOfBounds { row: 5, .. }));
    }
}
