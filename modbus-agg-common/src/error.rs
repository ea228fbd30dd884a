use thiserror::Error;

/// Common error type for modbus-agg components.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid log filter directive '{directive}': {message}")]
    LogFilter { directive: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
