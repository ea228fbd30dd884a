//! modbus-agg Service Framework
//!
//! Common plumbing for long-running modbus-agg services.
//!
//! # Overview
//!
//! This framework provides:
//! - [`ServiceConfig`] trait for configuration loading and validation
//! - [`ServiceRunner`] for managing service lifecycle (startup, shutdown, signal handling)
//! - [`ServiceArgs`] for common CLI argument parsing
//!
//! # Example
//!
//! ```ignore
//! use modbus_agg_framework::{ServiceArgs, ServiceConfig, ServiceRunner};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = ServiceArgs::parse_with_default("myservice.json5");
//!     let config = MyConfig::load(&args.config)?;
//!
//!     let mut runner = ServiceRunner::new_with_args("myservice", config, Some(&args))?;
//!
//!     runner.spawn(my_worker());
//!
//!     // Run until Ctrl+C
//!     Ok(runner.run().await?)
//! }
//! ```

mod args;
mod config;
mod error;
mod runner;

pub use args::ServiceArgs;
pub use config::ServiceConfig;
pub use error::{Result, ServiceError};
pub use runner::ServiceRunner;

// Re-export commonly used types from modbus-agg-common
pub use modbus_agg_common::{LogFormat, LoggingConfig};
