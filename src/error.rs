use thiserror::Error;

/// Crate-wide result type.
pub type AppResult<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    // =========
    // Config / startup
    // =========
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML config: {0}")]
    ConfigToml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // =========
    // Binlog stream
    // =========
    #[error("Empty binlog coordinates")]
    EmptyCoordinate,

    #[error("Invalid binlog coordinate: {0}")]
    InvalidCoordinate(String),

    #[error("Unknown DML event type: {0}")]
    UnknownDml(String),

    #[error("Binlog stream ended unexpectedly")]
    BinlogStreamEnded,

    #[error("{failures} successive streamer reconnect failures at {coordinates}")]
    ReconnectOverflow { failures: u64, coordinates: String },

    #[error("Replication protocol error: {0}")]
    MySql(#[from] mysql_async::Error),

    // =========
    // Sharding / appliers
    // =========
    #[error("Unsupported sharding key type: {0}")]
    InvalidKey(String),

    #[error("Applier for shard {0} is closed")]
    ApplierClosed(usize),

    // =========
    // Database
    // =========
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    // =========
    // Runtime
    // =========
    #[error("Failed to join task: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("Internal error: {0}")]
    Internal(String),
}
