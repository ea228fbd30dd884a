//! Error types for the service framework.

use thiserror::Error;

/// Result type alias using [`ServiceError`].
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Errors that can occur while starting or running a service.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file not found.
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Configuration parse error.
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(String),

    /// Configuration validation error.
    #[error("Configuration validation failed: {0}")]
    ConfigValidation(String),

    /// A critical worker stopped.
    #[error("Worker '{name}' failed: {message}")]
    Worker { name: String, message: String },

    /// Generic error with context.
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl ServiceError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a configuration validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ConfigValidation(msg.into())
    }

    /// Create a worker error.
    pub fn worker(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Worker {
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Wrap an error with context.
    pub fn with_context<E>(context: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::WithContext {
            context: context.into(),
            source: Box::new(source),
        }
    }
}

impl From<modbus_agg_common::Error> for ServiceError {
    fn from(err: modbus_agg_common::Error) -> Self {
        match err {
            modbus_agg_common::Error::Config(message) => Self::ConfigParse(message),
            other => Self::Config(other.to_string()),
        }
    }
}
