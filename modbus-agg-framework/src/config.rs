//! Configuration traits and utilities.

use std::path::Path;

use serde::de::DeserializeOwned;

use modbus_agg_common::{load_config, parse_config};

use crate::LoggingConfig;
use crate::error::{Result, ServiceError};

/// Trait for service configuration types.
///
/// Implement this trait for a service's configuration struct to get
/// loading, validation, and access to the logging settings.
///
/// # Example
///
/// ```ignore
/// use serde::Deserialize;
/// use modbus_agg_framework::{LoggingConfig, ServiceConfig, ServiceError};
///
/// #[derive(Debug, Deserialize)]
/// pub struct MyConfig {
///     pub logging: LoggingConfig,
///     pub nodes: Vec<NodeConfig>,
/// }
///
/// impl ServiceConfig for MyConfig {
///     fn logging(&self) -> &LoggingConfig {
///         &self.logging
///     }
///
///     fn validate(&self) -> Result<()> {
///         if self.nodes.is_empty() {
///             return Err(ServiceError::validation("At least one node required"));
///         }
///         Ok(())
///     }
/// }
/// ```
pub trait ServiceConfig: Sized + DeserializeOwned {
    /// Get the logging configuration.
    fn logging(&self) -> &LoggingConfig;

    /// Extra log filter directives derived from the configuration.
    ///
    /// Appended to the logging config's own directives by the runner.
    fn log_directives(&self) -> Vec<String> {
        Vec::new()
    }

    /// Validate the configuration.
    ///
    /// Called automatically after loading. Override to add custom validation.
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Load and validate configuration from a JSON5 file.
    fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config = Self::load_unvalidated(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON5 file without validating it.
    ///
    /// For callers that adjust the configuration (CLI overrides) before
    /// calling [`validate`](Self::validate) themselves.
    fn load_unvalidated(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ServiceError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        Ok(load_config(path)?)
    }

    /// Parse and validate configuration from a JSON5 string.
    fn parse(content: &str) -> Result<Self> {
        let config: Self = parse_config(content)?;
        config.validate()?;
        Ok(config)
    }
}
