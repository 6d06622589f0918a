use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The store refused an item because of its size (or ran out of memory
    /// storing it). This is the trigger for splitting a value into pieces.
    #[error("Object too large for cache: {0}")]
    ObjectTooLarge(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Connection is closed")]
    Closed,

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// No server of a cluster could be reached when a bin was acquired.
    #[error("Failed to connect to any server of cluster '{cluster}'")]
    Connection { cluster: String },

    #[error("Driver unavailable: {0}")]
    DriverUnavailable(String),
}

impl CacheError {
    /// Whether this is the hard error a caller must see. Everything else is
    /// degraded to a miss or a `false` write result.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CacheError::Connection { .. } | CacheError::DriverUnavailable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
