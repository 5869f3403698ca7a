use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::partition::PartitionTable;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key)
        .ok()
        .filter(|s| !s.is_empty())
        .and_then(|v| v.parse().ok())
}

// ── Top-level config ────────────────────────────────────────────────

/// Full configuration for a scheduling run.
///
/// Parsed from `strads.toml` with support for environment variable overrides.
/// Every component receives the parts it needs as read-only values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StradsConfig {
    /// Cluster shape: machine and thread counts, out-of-core layout.
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Sampling and interference-checking parameters.
    #[serde(default)]
    pub scheduler: SchedulerParams,

    /// Round loop limits and logging cadence.
    #[serde(default)]
    pub run: RunConfig,

    /// Data shards loaded on every scheduler machine.
    #[serde(default)]
    pub shards: Vec<ShardSpec>,
}

// ── Section configs ─────────────────────────────────────────────────

/// Cluster section: the `-m -t -s -p -g -e` shape of the job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Number of worker machines (`-m`).
    #[serde(default = "default_one")]
    pub worker_machines: usize,

    /// Threads per worker machine (`-t`).
    #[serde(default = "default_one")]
    pub threads_per_worker: usize,

    /// Number of scheduler machines (`-s`).
    #[serde(default = "default_one")]
    pub scheduler_machines: usize,

    /// Scheduler threads per scheduler machine (`-p`).
    #[serde(default = "default_one")]
    pub threads_per_scheduler: usize,

    /// Out-of-core column groups (`-g`); 1 disables swapping.
    #[serde(default = "default_one")]
    pub ooc_partitions: usize,

    /// Rounds between out-of-core loads (`-e`); 0 never swaps.
    #[serde(default)]
    pub ooc_frequency: u64,
}

fn default_one() -> usize {
    1
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            worker_machines: 1,
            threads_per_worker: 1,
            scheduler_machines: 1,
            threads_per_scheduler: 1,
            ooc_partitions: 1,
            ooc_frequency: 0,
        }
    }
}

impl ClusterConfig {
    /// Total scheduler threads across all scheduler machines.
    pub fn scheduler_threads(&self) -> usize {
        self.scheduler_machines * self.threads_per_scheduler
    }

    pub fn ooc_enabled(&self) -> bool {
        self.ooc_partitions > 1 && self.ooc_frequency > 0
    }
}

/// How a zero-variance column is treated by the correlation check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DegeneratePolicy {
    /// Abort the check with an error.
    #[default]
    Fatal,
    /// Treat the pair as uncorrelated.
    Zero,
}

impl FromStr for DegeneratePolicy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fatal" => Ok(Self::Fatal),
            "zero" => Ok(Self::Zero),
            other => Err(CoreError::Config(format!(
                "invalid degenerate policy '{other}', expected 'fatal' or 'zero'"
            ))),
        }
    }
}

/// Scheduler section: weighted sampling and interference checking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerParams {
    /// Number of tasks (parameters) in the model.
    #[serde(default = "default_modelsize")]
    pub modelsize: u64,

    /// Sample size drawn per partition per round.
    #[serde(default = "default_maxset")]
    pub maxset: usize,

    /// Initial base weight.
    #[serde(default = "default_base_weight")]
    pub base_weight: f64,

    /// Re-derive the base weight from the weight distribution on every update.
    #[serde(default = "default_true")]
    pub auto_tune: bool,

    /// Multiplier applied to the mean non-zero weight when auto-tuning.
    #[serde(default = "default_tune_factor")]
    pub tune_factor: f64,

    /// Pairs at or above this absolute correlation conflict.
    #[serde(default = "default_infthreshold")]
    pub infthreshold: f64,

    /// Sample sizes at or above this use the light check.
    #[serde(default = "default_light_threshold")]
    pub light_threshold: usize,

    /// Candidates deeply checked in light mode.
    #[serde(default = "default_light_care_cnt")]
    pub light_care_cnt: usize,

    /// RNG seed for sampling; each partition offsets it by its gid.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Shard alias read by the interference checker.
    #[serde(default = "default_check_alias")]
    pub check_alias: String,

    #[serde(default)]
    pub degenerate_policy: DegeneratePolicy,
}

fn default_modelsize() -> u64 {
    1000
}
fn default_maxset() -> usize {
    10
}
fn default_base_weight() -> f64 {
    0.1
}
fn default_true() -> bool {
    true
}
fn default_tune_factor() -> f64 {
    0.01
}
fn default_infthreshold() -> f64 {
    0.1
}
fn default_light_threshold() -> usize {
    400
}
fn default_light_care_cnt() -> usize {
    50
}
fn default_seed() -> u64 {
    0x5eed_0001
}
fn default_check_alias() -> String {
    "Acol".into()
}

impl Default for SchedulerParams {
    fn default() -> Self {
        Self {
            modelsize: default_modelsize(),
            maxset: default_maxset(),
            base_weight: default_base_weight(),
            auto_tune: true,
            tune_factor: default_tune_factor(),
            infthreshold: default_infthreshold(),
            light_threshold: default_light_threshold(),
            light_care_cnt: default_light_care_cnt(),
            seed: default_seed(),
            check_alias: default_check_alias(),
            degenerate_policy: DegeneratePolicy::Fatal,
        }
    }
}

/// Run section: iteration limits and objective logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Total coordinator rounds before shutdown.
    #[serde(default = "default_iterations")]
    pub iterations: u64,

    /// Rounds between objective evaluations.
    #[serde(default = "default_logfreq")]
    pub logfreq: u64,

    /// Warm-restart round. Derived from `modelsize / maxset * 1.2` when unset.
    #[serde(default)]
    pub switch_iter: Option<u64>,

    /// Where `(iteration, elapsed, objective)` rows are appended.
    #[serde(default)]
    pub objective_log: Option<PathBuf>,
}

fn default_iterations() -> u64 {
    1000
}
fn default_logfreq() -> u64 {
    100
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            iterations: default_iterations(),
            logfreq: default_logfreq(),
            switch_iter: None,
            objective_log: None,
        }
    }
}

/// Storage layout of a data shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardKind {
    #[default]
    Sparse,
    Dense,
}

/// A column-partitioned matrix file to load under an alias.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardSpec {
    pub alias: String,
    pub path: PathBuf,
    #[serde(default)]
    pub kind: ShardKind,
}

// ── Loading ─────────────────────────────────────────────────────────

impl StradsConfig {
    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, CoreError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// The warm-restart round: configured, or `(modelsize / maxset) * 1.2`.
    pub fn switch_iter(&self) -> u64 {
        self.run.switch_iter.unwrap_or_else(|| {
            let rounds = self.scheduler.modelsize / self.scheduler.maxset.max(1) as u64;
            (rounds as f64 * 1.2) as u64
        })
    }

    /// Build the scheduler partition table for this cluster shape.
    pub fn partition_table(&self) -> Result<PartitionTable, CoreError> {
        PartitionTable::new(
            self.scheduler.modelsize,
            self.cluster.scheduler_machines,
            self.cluster.threads_per_scheduler,
        )
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        let c = &self.cluster;
        let s = &self.scheduler;
        tracing::info!("Config loaded:");
        tracing::info!(
            "  cluster:    workers={}x{}, schedulers={}x{}, ooc={} every {}",
            c.worker_machines,
            c.threads_per_worker,
            c.scheduler_machines,
            c.threads_per_scheduler,
            c.ooc_partitions,
            c.ooc_frequency
        );
        tracing::info!(
            "  scheduler:  modelsize={}, maxset={}, bw={}, auto_tune={}, threshold={}",
            s.modelsize,
            s.maxset,
            s.base_weight,
            s.auto_tune,
            s.infthreshold
        );
        tracing::info!(
            "  run:        iterations={}, logfreq={}, switch_iter={}",
            self.run.iterations,
            self.run.logfreq,
            self.switch_iter()
        );
        for shard in &self.shards {
            tracing::info!("  shard:      {} <- {}", shard.alias, shard.path.display());
        }
    }

    // ── Environment variable overrides ──────────────────────────────

    /// Apply environment variable overrides.
    ///
    /// Convention: `STRADS_SECTION_KEY` overrides `section.key`.
    /// Examples:
    /// - `STRADS_CLUSTER_SCHEDULER_MACHINES` -> `cluster.scheduler_machines`
    /// - `STRADS_SCHEDULER_MAXSET` -> `scheduler.maxset`
    /// - `STRADS_RUN_ITERATIONS` -> `run.iterations`
    pub fn apply_env_overrides(&mut self) {
        let c = &mut self.cluster;
        if let Some(v) = env_parse("STRADS_CLUSTER_WORKER_MACHINES") {
            c.worker_machines = v;
        }
        if let Some(v) = env_parse("STRADS_CLUSTER_THREADS_PER_WORKER") {
            c.threads_per_worker = v;
        }
        if let Some(v) = env_parse("STRADS_CLUSTER_SCHEDULER_MACHINES") {
            c.scheduler_machines = v;
        }
        if let Some(v) = env_parse("STRADS_CLUSTER_THREADS_PER_SCHEDULER") {
            c.threads_per_scheduler = v;
        }
        if let Some(v) = env_parse("STRADS_CLUSTER_OOC_PARTITIONS") {
            c.ooc_partitions = v;
        }
        if let Some(v) = env_parse("STRADS_CLUSTER_OOC_FREQUENCY") {
            c.ooc_frequency = v;
        }

        let s = &mut self.scheduler;
        if let Some(v) = env_parse("STRADS_SCHEDULER_MODELSIZE") {
            s.modelsize = v;
        }
        if let Some(v) = env_parse("STRADS_SCHEDULER_MAXSET") {
            s.maxset = v;
        }
        if let Some(v) = env_parse("STRADS_SCHEDULER_BASE_WEIGHT") {
            s.base_weight = v;
        }
        if let Some(v) = env_parse("STRADS_SCHEDULER_INFTHRESHOLD") {
            s.infthreshold = v;
        }
        if let Some(v) = env_parse("STRADS_SCHEDULER_SEED") {
            s.seed = v;
        }
        if let Some(v) = env_parse("STRADS_SCHEDULER_DEGENERATE_POLICY") {
            s.degenerate_policy = v;
        }

        let r = &mut self.run;
        if let Some(v) = env_parse("STRADS_RUN_ITERATIONS") {
            r.iterations = v;
        }
        if let Some(v) = env_parse("STRADS_RUN_LOGFREQ") {
            r.logfreq = v;
        }
        if let Some(v) = env_parse("STRADS_RUN_SWITCH_ITER") {
            r.switch_iter = Some(v);
        }
        if let Some(v) = env_parse::<PathBuf>("STRADS_RUN_OBJECTIVE_LOG") {
            r.objective_log = Some(v);
        }
    }

    // ── Validation ──────────────────────────────────────────────────

    /// Validate the config: cluster shape, sampler bounds, shard aliases.
    pub fn validate(&self) -> Result<(), CoreError> {
        self.validate_cluster()?;
        self.validate_scheduler()?;
        self.validate_run()?;
        self.validate_shards()?;
        self.validate_ooc()?;
        Ok(())
    }

    fn validate_cluster(&self) -> Result<(), CoreError> {
        let c = &self.cluster;
        if c.scheduler_machines == 0 || c.threads_per_scheduler == 0 {
            return Err(CoreError::Config(
                "cluster needs at least one scheduler machine and thread".into(),
            ));
        }
        if c.worker_machines == 0 || c.threads_per_worker == 0 {
            return Err(CoreError::Config(
                "cluster needs at least one worker machine and thread".into(),
            ));
        }
        if c.ooc_partitions == 0 {
            return Err(CoreError::Config("ooc_partitions must be at least 1".into()));
        }
        Ok(())
    }

    /// The sample size must stay below the smallest partition length.
    fn validate_scheduler(&self) -> Result<(), CoreError> {
        let s = &self.scheduler;
        if s.maxset == 0 {
            return Err(CoreError::Config("scheduler.maxset must be positive".into()));
        }
        let table = self.partition_table()?;
        let smallest = table.threads().iter().map(|r| r.len()).min().unwrap_or(0);
        if s.maxset >= smallest {
            return Err(CoreError::Config(format!(
                "scheduler.maxset ({}) must be smaller than the smallest partition ({smallest})",
                s.maxset
            )));
        }
        if !(s.base_weight > 0.0) {
            return Err(CoreError::Config("scheduler.base_weight must be positive".into()));
        }
        if !(s.infthreshold > 0.0 && s.infthreshold <= 1.0) {
            return Err(CoreError::Config(format!(
                "scheduler.infthreshold ({}) must be in (0, 1]",
                s.infthreshold
            )));
        }
        if s.light_care_cnt == 0 {
            return Err(CoreError::Config("scheduler.light_care_cnt must be positive".into()));
        }
        Ok(())
    }

    fn validate_run(&self) -> Result<(), CoreError> {
        if self.run.iterations == 0 || self.run.logfreq == 0 {
            return Err(CoreError::Config(
                "run.iterations and run.logfreq must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Cycling column groups needs the checked shard, and every group must
    /// own at least one partition.
    fn validate_ooc(&self) -> Result<(), CoreError> {
        let g = self.cluster.ooc_partitions;
        if g <= 1 {
            return Ok(());
        }
        let partitions = self.cluster.scheduler_threads();
        if g > partitions {
            return Err(CoreError::Config(format!(
                "ooc_partitions ({g}) exceeds the {partitions} scheduler partitions"
            )));
        }
        let alias = &self.scheduler.check_alias;
        if !self.shards.iter().any(|s| &s.alias == alias) {
            return Err(CoreError::Config(format!(
                "ooc_partitions = {g} needs a [[shards]] entry for '{alias}'"
            )));
        }
        Ok(())
    }

    fn validate_shards(&self) -> Result<(), CoreError> {
        let mut seen = HashSet::new();
        for shard in &self.shards {
            if !seen.insert(shard.alias.as_str()) {
                return Err(CoreError::Config(format!(
                    "shard alias '{}' is declared twice",
                    shard.alias
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_toml() {
        let cfg = StradsConfig::from_toml("").unwrap();
        assert_eq!(cfg.cluster.scheduler_machines, 1);
        assert_eq!(cfg.scheduler.maxset, 10);
        assert_eq!(cfg.scheduler.degenerate_policy, DegeneratePolicy::Fatal);
        assert!(cfg.shards.is_empty());
    }

    #[test]
    fn parse_full_toml() {
        let toml = r#"
[cluster]
worker_machines = 4
threads_per_worker = 8
scheduler_machines = 2
threads_per_scheduler = 3
ooc_partitions = 3
ooc_frequency = 50

[scheduler]
modelsize = 6000
maxset = 40
infthreshold = 0.2
degenerate_policy = "zero"

[run]
iterations = 500
logfreq = 25
switch_iter = 120

[[shards]]
alias = "Acol"
path = "/data/a.bin"

[[shards]]
alias = "Dense"
path = "/data/d.bin"
kind = "dense"
"#;
        let cfg = StradsConfig::from_toml(toml).unwrap();
        assert_eq!(cfg.cluster.scheduler_threads(), 6);
        assert!(cfg.cluster.ooc_enabled());
        assert_eq!(cfg.scheduler.degenerate_policy, DegeneratePolicy::Zero);
        assert_eq!(cfg.switch_iter(), 120);
        assert_eq!(cfg.shards.len(), 2);
        assert_eq!(cfg.shards[1].kind, ShardKind::Dense);
    }

    #[test]
    fn switch_iter_derived_from_modelsize() {
        let mut cfg = StradsConfig::default();
        cfg.scheduler.modelsize = 1000;
        cfg.scheduler.maxset = 10;
        assert_eq!(cfg.switch_iter(), 120);
    }

    #[test]
    fn maxset_must_fit_partitions() {
        let toml = r#"
[cluster]
threads_per_scheduler = 4

[scheduler]
modelsize = 100
maxset = 25
"#;
        let err = StradsConfig::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("smallest partition"));
    }

    #[test]
    fn duplicate_shard_alias_rejected() {
        let toml = r#"
[[shards]]
alias = "Acol"
path = "a.bin"

[[shards]]
alias = "Acol"
path = "b.bin"
"#;
        assert!(StradsConfig::from_toml(toml).is_err());
    }

    #[test]
    fn ooc_needs_checked_shard_and_enough_partitions() {
        let no_shard = "[cluster]\nthreads_per_scheduler = 4\nooc_partitions = 2\n";
        let err = StradsConfig::from_toml(no_shard).unwrap_err();
        assert!(err.to_string().contains("Acol"), "{err}");

        let too_many = r#"
[cluster]
threads_per_scheduler = 2
ooc_partitions = 3

[[shards]]
alias = "Acol"
path = "a.bin"
"#;
        let err = StradsConfig::from_toml(too_many).unwrap_err();
        assert!(err.to_string().contains("exceeds"), "{err}");
    }

    #[test]
    fn zero_ooc_partitions_rejected() {
        let toml = "[cluster]\nooc_partitions = 0\n";
        assert!(StradsConfig::from_toml(toml).is_err());
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strads.toml");
        std::fs::write(&path, "[run]\niterations = 7\n").unwrap();
        let cfg = StradsConfig::from_file(&path).unwrap();
        assert_eq!(cfg.run.iterations, 7);
    }

    #[test]
    fn degenerate_policy_from_str() {
        assert_eq!("ZERO".parse::<DegeneratePolicy>().unwrap(), DegeneratePolicy::Zero);
        assert!("sometimes".parse::<DegeneratePolicy>().is_err());
    }
}
