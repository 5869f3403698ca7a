pub mod corr;
pub mod error;
pub mod pbf;
pub mod registry;
pub mod shard;

pub use corr::{dense_correlation, sparse_correlation};
pub use error::ShardError;
pub use pbf::{load_shard, read_size, write_pbf, NzEntry, PbfFile, PbfHeader};
pub use registry::ShardRegistry;
pub use shard::{ColumnStore, ColumnView, DataShard, ShardTag, SparseColumn};
