//! Static range tables shared by the coordinator and the scheduler machines.
//!
//! Task ids are split into `scheduler_machines * threads_per_scheduler`
//! contiguous partitions. The same layout doubles as the per-partition
//! feature (column) table used when cycling out-of-core column groups.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Global task (parameter) identifier in `[0, modelsize)`.
pub type TaskId = u64;

/// Inclusive `[start, end]` range of task ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskRange {
    pub start: TaskId,
    pub end: TaskId,
}

impl TaskRange {
    pub fn new(start: TaskId, end: TaskId) -> Self {
        Self { start, end }
    }

    /// Number of ids in the range.
    pub fn len(&self) -> usize {
        if self.is_empty() {
            0
        } else {
            (self.end - self.start + 1) as usize
        }
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    pub fn contains(&self, id: TaskId) -> bool {
        id >= self.start && id <= self.end
    }

    /// True when `other` lies entirely inside this range.
    pub fn covers(&self, other: &TaskRange) -> bool {
        other.start >= self.start && other.end <= self.end
    }

    pub fn ids(&self) -> impl Iterator<Item = TaskId> {
        self.start..=self.end
    }
}

impl std::fmt::Display for TaskRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// Feature range owned by one partition, keyed by its global partition id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamRange {
    pub gid: usize,
    pub feature_start: TaskId,
    pub feature_end: TaskId,
}

impl ParamRange {
    pub fn range(&self) -> TaskRange {
        TaskRange::new(self.feature_start, self.feature_end)
    }
}

/// Split `total` ids into `parts` contiguous ranges; the first `total % parts`
/// ranges get one extra id.
pub fn fine_partition(total: u64, parts: usize) -> Result<Vec<TaskRange>, CoreError> {
    if parts == 0 {
        return Err(CoreError::Partition("partition count must be positive".into()));
    }
    if total < parts as u64 {
        return Err(CoreError::Partition(format!(
            "cannot split {total} tasks into {parts} non-empty partitions"
        )));
    }

    let share = total / parts as u64;
    let remain = total % parts as u64;
    let mut ranges = Vec::with_capacity(parts);
    let mut start = 0u64;
    for i in 0..parts as u64 {
        let len = if i < remain { share + 1 } else { share };
        ranges.push(TaskRange::new(start, start + len - 1));
        start += len;
    }
    Ok(ranges)
}

/// Task partition layout for every scheduler thread in the cluster.
#[derive(Debug, Clone)]
pub struct PartitionTable {
    threads: Vec<TaskRange>,
    threads_per_machine: usize,
}

impl PartitionTable {
    /// Build the table for `modelsize` tasks over `machines * threads_per_machine`
    /// scheduler threads. Thread `gid` lives on machine `gid / threads_per_machine`.
    pub fn new(
        modelsize: u64,
        machines: usize,
        threads_per_machine: usize,
    ) -> Result<Self, CoreError> {
        if machines == 0 || threads_per_machine == 0 {
            return Err(CoreError::Partition(
                "scheduler machines and threads per machine must be positive".into(),
            ));
        }
        let threads = fine_partition(modelsize, machines * threads_per_machine)?;
        Ok(Self {
            threads,
            threads_per_machine,
        })
    }

    pub fn machines(&self) -> usize {
        self.threads.len() / self.threads_per_machine
    }

    pub fn threads_per_machine(&self) -> usize {
        self.threads_per_machine
    }

    /// Total number of scheduling partitions.
    pub fn partitions(&self) -> usize {
        self.threads.len()
    }

    pub fn modelsize(&self) -> u64 {
        self.threads.last().map(|r| r.end + 1).unwrap_or(0)
    }

    pub fn thread(&self, gid: usize) -> Option<TaskRange> {
        self.threads.get(gid).copied()
    }

    pub fn threads(&self) -> &[TaskRange] {
        &self.threads
    }

    /// Ranges owned by the threads of machine `mid`, in local thread order.
    pub fn machine_threads(&self, mid: usize) -> &[TaskRange] {
        let lo = (mid * self.threads_per_machine).min(self.threads.len());
        let hi = ((mid + 1) * self.threads_per_machine).min(self.threads.len());
        &self.threads[lo..hi]
    }

    /// Range spanning the first thread's start to the last thread's end.
    pub fn machine_range(&self, mid: usize) -> Option<TaskRange> {
        let threads = self.machine_threads(mid);
        match (threads.first(), threads.last()) {
            (Some(first), Some(last)) => Some(TaskRange::new(first.start, last.end)),
            _ => None,
        }
    }

    /// Machine and local thread index that own global thread `gid`.
    pub fn locate(&self, gid: usize) -> Option<(usize, usize)> {
        (gid < self.threads.len())
            .then(|| (gid / self.threads_per_machine, gid % self.threads_per_machine))
    }

    /// Global thread id of the partition containing `task`.
    pub fn owner_of(&self, task: TaskId) -> Option<usize> {
        self.threads.iter().position(|r| r.contains(task))
    }

    /// The per-partition feature table used for out-of-core selection.
    pub fn param_ranges(&self) -> Vec<ParamRange> {
        self.threads
            .iter()
            .enumerate()
            .map(|(gid, r)| ParamRange {
                gid,
                feature_start: r.start,
                feature_end: r.end,
            })
            .collect()
    }
}

/// Pick the partitions that make up out-of-core column group `h_modulo`:
/// index `i` is kept iff `i % oocdpartitions == h_modulo` and its feature
/// range lies inside `within` (the machine's column range).
pub fn select_ooc_ranges(
    table: &[ParamRange],
    h_modulo: usize,
    oocdpartitions: usize,
    within: TaskRange,
) -> Vec<ParamRange> {
    if oocdpartitions == 0 {
        return Vec::new();
    }
    table
        .iter()
        .enumerate()
        .filter(|(i, p)| i % oocdpartitions == h_modulo && within.covers(&p.range()))
        .map(|(_, p)| *p)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hundred_tasks_over_four_threads() {
        let table = PartitionTable::new(100, 1, 4).unwrap();
        assert_eq!(
            table.threads(),
            &[
                TaskRange::new(0, 24),
                TaskRange::new(25, 49),
                TaskRange::new(50, 74),
                TaskRange::new(75, 99),
            ]
        );
        assert_eq!(table.machine_range(0), Some(TaskRange::new(0, 99)));
    }

    #[test]
    fn remainder_goes_to_first_partitions() {
        let ranges = fine_partition(10, 4).unwrap();
        let lens: Vec<usize> = ranges.iter().map(|r| r.len()).collect();
        assert_eq!(lens, vec![3, 3, 2, 2]);
    }

    #[test]
    fn partitions_cover_model_exactly_once() {
        for modelsize in [7u64, 64, 100, 1001, 4096] {
            for machines in 1..4 {
                for threads in 1..6 {
                    let parts = (machines * threads) as u64;
                    if modelsize < parts {
                        continue;
                    }
                    let table = PartitionTable::new(modelsize, machines, threads).unwrap();
                    let mut seen = vec![0u32; modelsize as usize];
                    for r in table.threads() {
                        for id in r.ids() {
                            seen[id as usize] += 1;
                        }
                    }
                    assert!(seen.iter().all(|&c| c == 1), "modelsize={modelsize}");
                    // Adjacent ranges are contiguous.
                    for w in table.threads().windows(2) {
                        assert_eq!(w[0].end + 1, w[1].start);
                    }
                    assert_eq!(table.modelsize(), modelsize);
                }
            }
        }
    }

    #[test]
    fn machine_ranges_follow_thread_layout() {
        let table = PartitionTable::new(90, 3, 2).unwrap();
        assert_eq!(table.machines(), 3);
        assert_eq!(table.machine_range(1), Some(TaskRange::new(30, 59)));
        assert_eq!(table.locate(3), Some((1, 1)));
        assert_eq!(table.owner_of(59), Some(3));
        assert_eq!(table.locate(6), None);
    }

    #[test]
    fn too_few_tasks_is_rejected() {
        assert!(PartitionTable::new(3, 1, 4).is_err());
        assert!(PartitionTable::new(3, 0, 4).is_err());
    }

    #[test]
    fn ooc_selection_keeps_matching_modulo() {
        let table = PartitionTable::new(120, 1, 12).unwrap();
        let params = table.param_ranges();
        let within = table.machine_range(0).unwrap();

        let picked = select_ooc_ranges(&params, 1, 3, within);
        let gids: Vec<usize> = picked.iter().map(|p| p.gid).collect();
        assert_eq!(gids, vec![1, 4, 7, 10]);
    }

    #[test]
    fn ooc_selection_respects_machine_columns() {
        let table = PartitionTable::new(120, 2, 6).unwrap();
        let params = table.param_ranges();
        let second = table.machine_range(1).unwrap();

        let picked = select_ooc_ranges(&params, 0, 2, second);
        let gids: Vec<usize> = picked.iter().map(|p| p.gid).collect();
        assert_eq!(gids, vec![6, 8, 10]);
    }
}
