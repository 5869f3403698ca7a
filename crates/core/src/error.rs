use thiserror::Error;

/// Errors raised while building configuration and static range tables.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("partition error: {0}")]
    Partition(String),
}
