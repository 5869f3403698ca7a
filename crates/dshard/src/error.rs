use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShardError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid partition file header: {0}")]
    Header(String),

    #[error("partition file size mismatch: expected {expected} bytes, found {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("requested range out of bounds: {0}")]
    RangeOutOfBounds(String),

    #[error("entry ({row}, {col}) outside the {maxrow}x{maxcol} matrix")]
    EntryOutOfBounds {
        row: u64,
        col: u64,
        maxrow: u64,
        maxcol: u64,
    },

    #[error("column {0} is not held by this shard")]
    MissingColumn(u64),

    #[error("zero variance in correlation of columns {a} and {b}")]
    DegenerateColumn { a: u64, b: u64 },
}
