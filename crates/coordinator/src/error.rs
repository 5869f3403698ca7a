use strads_core::CoreError;
use strads_wire::WireError;

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("machine {mid} acknowledged {acked} tasks, {declared} were sent")]
    AckMismatch { mid: usize, declared: u64, acked: u64 },

    #[error("round handler failed: {0}")]
    Handler(String),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("config error: {0}")]
    Core(#[from] CoreError),

    #[error("objective log error: {0}")]
    Io(#[from] std::io::Error),

    #[error("objective log encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}
