use strads_core::{CoreError, TaskId, TaskRange};
use strads_dshard::ShardError;
use strads_wire::WireError;

/// Errors raised by the scheduling engine.
///
/// Everything except [`SchedError::LoadInFlight`] is a protocol or resource
/// failure that ends the owning loop.
#[derive(Debug, thiserror::Error)]
pub enum SchedError {
    #[error("task {id} outside partition {range}")]
    OutOfRange { id: TaskId, range: TaskRange },

    #[error("sample size {setsize} must be smaller than partition length {len}")]
    SetSizeTooLarge { setsize: usize, len: usize },

    #[error("taskcnt mismatch: declared {declared}, received {received}")]
    TaskCountMismatch { declared: u64, received: u64 },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("an out-of-core load is already in flight")]
    LoadInFlight,

    #[error("thread {0} panicked")]
    ThreadPanic(String),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("shard error: {0}")]
    Shard(#[from] ShardError),

    #[error("config error: {0}")]
    Core(#[from] CoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
