//! Crate-wide error type for backup engine operations

/// Error type for scheduling, execution, storage and pruning operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("engine error: {0}")]
    Engine(String),

    #[error("invalid policy: {0}")]
    Policy(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("backup timed out after {0} seconds")]
    Timeout(u64),
}

/// Result type for backup engine operations
pub type Result<T> = std::result::Result<T, Error>;
