//! Pairwise-correlation interference check.
//!
//! Two tasks whose data columns correlate at or above the threshold must not
//! be updated in the same round. The check keeps a greedy subset of the
//! sampled candidates in which every pair stays below the threshold.

use tracing::debug;

use strads_core::{DegeneratePolicy, SchedulerParams, TaskId};
use strads_dshard::{DataShard, ShardError};

use crate::error::SchedError;

#[derive(Debug, Clone)]
pub struct InterferenceChecker {
    threshold: f64,
    light_threshold: usize,
    light_care_cnt: usize,
    policy: DegeneratePolicy,
}

impl InterferenceChecker {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            light_threshold: 400,
            light_care_cnt: 50,
            policy: DegeneratePolicy::Fatal,
        }
    }

    pub fn from_params(params: &SchedulerParams) -> Self {
        Self {
            threshold: params.infthreshold,
            light_threshold: params.light_threshold,
            light_care_cnt: params.light_care_cnt,
            policy: params.degenerate_policy,
        }
    }

    pub fn with_policy(mut self, policy: DegeneratePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_light_mode(mut self, light_threshold: usize, light_care_cnt: usize) -> Self {
        self.light_threshold = light_threshold;
        self.light_care_cnt = light_care_cnt;
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Filter `samples` (heaviest first) down to at most `size` ids that do
    /// not interfere with each other. Large candidate sets go through the
    /// light check, which only examines the heaviest candidates.
    ///
    /// `size` bounds the full check only. The light check keeps every
    /// unchecked candidate plus the care-set survivors, so its output is
    /// bounded by `samples.len()`; callers already draw at most the sample
    /// size they want.
    pub fn check<W>(
        &self,
        samples: &[TaskId],
        size: usize,
        shard: &DataShard,
        weight_of: W,
        restart_flag: bool,
    ) -> Result<Vec<TaskId>, SchedError>
    where
        W: Fn(TaskId) -> f64,
    {
        if samples.len() >= self.light_threshold {
            self.light_check(samples, shard, &weight_of, restart_flag)
        } else {
            self.full_check(samples, size, shard, &weight_of, restart_flag)
        }
    }

    /// Greedy pass: a candidate is kept when it stays below the threshold
    /// against everything kept so far.
    pub fn full_check<W>(
        &self,
        samples: &[TaskId],
        size: usize,
        shard: &DataShard,
        weight_of: &W,
        restart_flag: bool,
    ) -> Result<Vec<TaskId>, SchedError>
    where
        W: Fn(TaskId) -> f64,
    {
        let mut retained: Vec<TaskId> = Vec::with_capacity(size.min(samples.len()));
        for &cand in samples {
            if retained.len() >= size {
                break;
            }
            let mut clash = false;
            for &kept in &retained {
                if self.conflicts(cand, kept, shard, weight_of, restart_flag)? {
                    clash = true;
                    break;
                }
            }
            if !clash {
                retained.push(cand);
            }
        }
        Ok(retained)
    }

    /// Accept the light candidates unchecked and run the greedy pass over
    /// the heaviest `carecnt` only.
    pub fn light_check<W>(
        &self,
        samples: &[TaskId],
        shard: &DataShard,
        weight_of: &W,
        restart_flag: bool,
    ) -> Result<Vec<TaskId>, SchedError>
    where
        W: Fn(TaskId) -> f64,
    {
        let count = samples.len();
        let carecnt = if self.light_care_cnt > count {
            count / 2
        } else {
            self.light_care_cnt
        };

        let mut ordered = samples.to_vec();
        ordered.sort_by(|a, b| weight_of(*a).total_cmp(&weight_of(*b)));
        let care = ordered.split_off(count - carecnt);
        let survivors = self.full_check(&care, care.len(), shard, weight_of, restart_flag)?;

        debug!(
            count,
            carecnt,
            dropped = care.len() - survivors.len(),
            "light interference check"
        );

        ordered.extend(survivors);
        Ok(ordered)
    }

    fn conflicts<W>(
        &self,
        a: TaskId,
        b: TaskId,
        shard: &DataShard,
        weight_of: &W,
        restart_flag: bool,
    ) -> Result<bool, SchedError>
    where
        W: Fn(TaskId) -> f64,
    {
        if restart_flag && (weight_of(a) == 0.0 || weight_of(b) == 0.0) {
            return Ok(false);
        }
        match shard.correlation(a, b) {
            Ok(corr) => Ok(corr >= self.threshold),
            Err(ShardError::DegenerateColumn { .. }) if self.policy == DegeneratePolicy::Zero => {
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use strads_core::{ShardKind, TaskRange};
    use strads_dshard::ShardTag;

    use super::*;

    /// Columns 0 and 1 identical, column 2 uncorrelated with both, column 3
    /// a scaled copy of column 2, column 4 empty.
    fn shard() -> DataShard {
        let triplets = vec![
            (0, 0, 1.0),
            (2, 0, 2.0),
            (0, 1, 1.0),
            (2, 1, 2.0),
            (1, 2, 1.0),
            (3, 2, -1.0),
            (1, 3, 3.0),
            (3, 3, -3.0),
        ];
        DataShard::from_triplets(
            "Acol",
            ShardKind::Sparse,
            8,
            TaskRange::new(0, 4),
            vec![TaskRange::new(0, 4)],
            ShardTag::whole(),
            triplets,
        )
        .unwrap()
    }

    fn unit(_: TaskId) -> f64 {
        1.0
    }

    #[test]
    fn correlated_candidates_dropped() {
        let c = InterferenceChecker::new(0.1);
        let out = c.check(&[0, 1, 2, 3], 4, &shard(), unit, false).unwrap();
        assert_eq!(out, vec![0, 2]);
    }

    #[test]
    fn stops_at_requested_size() {
        let c = InterferenceChecker::new(0.99);
        let out = c.check(&[0, 2], 1, &shard(), unit, false).unwrap();
        assert_eq!(out, vec![0]);
    }

    #[test]
    fn restart_flag_skips_zero_weight_pairs() {
        let c = InterferenceChecker::new(0.1);
        let w = |id: TaskId| if id == 1 { 0.0 } else { 1.0 };
        let out = c.check(&[0, 1], 2, &shard(), w, true).unwrap();
        assert_eq!(out, vec![0, 1]);
        let out = c.check(&[0, 1], 2, &shard(), w, false).unwrap();
        assert_eq!(out, vec![0]);
    }

    #[test]
    fn degenerate_column_follows_policy() {
        let fatal = InterferenceChecker::new(0.1);
        assert!(matches!(
            fatal.check(&[0, 4], 2, &shard(), unit, false),
            Err(SchedError::Shard(ShardError::DegenerateColumn { .. }))
        ));

        let zero = InterferenceChecker::new(0.1).with_policy(DegeneratePolicy::Zero);
        assert_eq!(zero.check(&[0, 4], 2, &shard(), unit, false).unwrap(), vec![0, 4]);
    }

    #[test]
    fn light_mode_checks_only_heaviest() {
        let c = InterferenceChecker::new(0.1).with_light_mode(4, 2);
        // Weight ascending: 3, 2, 1, 0. Unchecked tail [3, 2], care set [1, 0].
        let w = |id: TaskId| 10.0 - id as f64;
        let out = c.check(&[0, 1, 2, 3], 4, &shard(), w, false).unwrap();
        assert_eq!(out, vec![3, 2, 1]);
    }

    #[test]
    fn light_mode_is_not_capped_by_size() {
        let c = InterferenceChecker::new(0.1).with_light_mode(4, 2);
        let w = |id: TaskId| 10.0 - id as f64;
        let out = c.check(&[0, 1, 2, 3], 2, &shard(), w, false).unwrap();
        assert_eq!(out, vec![3, 2, 1]);

        // Below the light threshold the same call stops at `size`.
        let full = InterferenceChecker::new(0.1).with_light_mode(5, 2);
        assert_eq!(full.check(&[0, 1, 2, 3], 2, &shard(), w, false).unwrap(), vec![0, 2]);
    }

    #[test]
    fn light_mode_halves_care_count_when_too_large() {
        let c = InterferenceChecker::new(0.1).with_light_mode(4, 50);
        let w = |id: TaskId| 10.0 - id as f64;
        let out = c.check(&[0, 1, 2, 3], 4, &shard(), w, false).unwrap();
        assert_eq!(out, vec![3, 2, 1]);
    }
}
