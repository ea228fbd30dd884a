//! modbus-agg Common Library
//!
//! Shared types and utilities for the Modbus aggregator crates:
//!
//! - [`config`] - Configuration loading (JSON5 format) and logging settings
//! - [`error`] - Error types

pub mod config;
pub mod error;

// Re-export commonly used types at the crate root
pub use config::{LogFormat, LoggingConfig, load_config, parse_config, verbosity_level};
pub use error::{Error, Result};

/// Initialize tracing with the given configuration.
///
/// `RUST_LOG` takes precedence when set. Otherwise the filter starts from
/// `config.level` and every entry of `config.directives` is layered on top,
/// which is how per-node verbosity is scoped to a single poller span.
///
/// Supports two output formats:
/// - `LogFormat::Text` (default): Human-readable text format
/// - `LogFormat::Json`: Structured JSON format for log aggregation systems
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => build_filter(config)?,
    };

    match config.format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
    }

    Ok(())
}

fn build_filter(config: &LoggingConfig) -> Result<tracing_subscriber::EnvFilter> {
    let mut filter = tracing_subscriber::EnvFilter::new(&config.level);

    for directive in &config.directives {
        let parsed = directive.parse().map_err(|e| Error::LogFilter {
            directive: directive.clone(),
            message: format!("{}", e),
        })?;
        filter = filter.add_directive(parsed);
    }

    Ok(filter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_filter_with_directives() {
        let config = LoggingConfig {
            level: "info".to_string(),
            format: LogFormat::Text,
            directives: vec!["modbus_agg=debug".to_string()],
        };

        assert!(build_filter(&config).is_ok());
    }

    #[test]
    fn test_build_filter_rejects_garbage() {
        let config = LoggingConfig {
            level: "info".to_string(),
            format: LogFormat::Text,
            directives: vec!["modbus_agg=notalevel".to_string()],
        };

        assert!(matches!(
            build_filter(&config),
            Err(Error::LogFilter { .. })
        ));
    }
}
