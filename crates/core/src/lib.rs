pub mod config;
pub mod error;
pub mod partition;

pub use config::{
    ClusterConfig, DegeneratePolicy, RunConfig, SchedulerParams, ShardKind, ShardSpec,
    StradsConfig,
};
pub use error::CoreError;
pub use partition::{select_ooc_ranges, ParamRange, PartitionTable, TaskId, TaskRange};
