use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while framing, decoding or moving messages.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("unknown message type {0}")]
    UnknownMessageType(u32),

    #[error("unknown scheduling message type {0}")]
    UnknownSchedType(u32),

    #[error("length mismatch: declared {declared} bytes, found {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("misplaced delta sentinel at entry {0}")]
    MisplacedSentinel(usize),

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("channel disconnected: {0}")]
    Disconnected(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}
