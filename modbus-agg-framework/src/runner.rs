//! Service runner for lifecycle management.

use std::future::Future;

use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use modbus_agg_common::{LoggingConfig, init_tracing};

use crate::ServiceArgs;
use crate::config::ServiceConfig;
use crate::error::{Result, ServiceError};

/// Service runner that manages the lifecycle of a long-running service.
///
/// Handles:
/// - Logging initialization
/// - Task spawning and management
/// - Graceful shutdown on Ctrl+C
/// - Fatal shutdown when a critical task stops
///
/// # Example
///
/// ```ignore
/// use modbus_agg_framework::{ServiceArgs, ServiceConfig, ServiceRunner};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let args = ServiceArgs::parse_with_default("myservice.json5");
///     let config = MyConfig::load(&args.config)?;
///
///     let mut runner = ServiceRunner::new_with_args("myservice", config, Some(&args))?;
///
///     runner.spawn(async move {
///         // Worker logic here
///     });
///
///     runner.run().await
/// }
/// ```
pub struct ServiceRunner<C: ServiceConfig> {
    /// Service name for logging.
    name: String,
    /// Service version.
    version: String,
    /// The loaded configuration.
    config: C,
    /// Spawned tasks.
    tasks: Vec<JoinHandle<()>>,
    /// Failures reported by critical tasks.
    failures_tx: mpsc::UnboundedSender<ServiceError>,
    failures_rx: mpsc::UnboundedReceiver<ServiceError>,
}

impl<C: ServiceConfig> ServiceRunner<C> {
    /// Create a new service runner with CLI args for log level override.
    pub fn new_with_args(
        name: impl Into<String>,
        config: C,
        args: Option<&ServiceArgs>,
    ) -> Result<Self> {
        let mut log_config: LoggingConfig = config.logging().clone();
        if let Some(level) = args.and_then(|a| a.log_level.as_ref()) {
            log_config.level = level.clone();
        }
        log_config.directives.extend(config.log_directives());

        init_tracing(&log_config).map_err(|e| ServiceError::config(e.to_string()))?;

        let runner = Self::without_tracing(name, config);
        tracing::info!(service = %runner.name, version = %runner.version, "Starting service");

        Ok(runner)
    }

    /// Create a runner that leaves the global subscriber alone.
    pub fn without_tracing(name: impl Into<String>, config: C) -> Self {
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();

        Self {
            name: name.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            config,
            tasks: Vec::new(),
            failures_tx,
            failures_rx,
        }
    }

    /// Get a reference to the configuration.
    pub fn config(&self) -> &C {
        &self.config
    }

    /// Number of tracked tasks.
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Spawn a worker task.
    ///
    /// The task will be tracked and aborted on shutdown.
    pub fn spawn<F>(&mut self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        self.tasks.push(handle);
    }

    /// Spawn a task the service cannot live without.
    ///
    /// If it returns, for any reason, [`run`](Self::run) stops the service
    /// and reports the failure.
    pub fn spawn_critical<F, E>(&mut self, name: String, future: F)
    where
        F: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let failures = self.failures_tx.clone();
        let handle = tokio::spawn(async move {
            let message = match future.await {
                Ok(()) => "exited unexpectedly".to_string(),
                Err(e) => e.to_string(),
            };
            tracing::error!(worker = %name, error = %message, "Critical worker stopped");
            let _ = failures.send(ServiceError::worker(name, message));
        });
        self.tasks.push(handle);
    }

    /// Run the service until Ctrl+C is received or a critical task stops.
    ///
    /// All spawned tasks are aborted before returning. Ctrl+C yields
    /// `Ok(())`; a critical failure yields the reported error.
    pub async fn run(mut self) -> Result<()> {
        tracing::info!(
            service = %self.name,
            tasks = self.tasks.len(),
            "Service running. Press Ctrl+C to stop."
        );

        let outcome = tokio::select! {
            signal = signal::ctrl_c() => {
                match signal {
                    Ok(()) => {
                        tracing::info!(service = %self.name, "Received shutdown signal");
                        Ok(())
                    }
                    Err(e) => Err(ServiceError::with_context("Failed to listen for Ctrl+C", e)),
                }
            }
            Some(failure) = self.failures_rx.recv() => Err(failure),
        };

        for task in &self.tasks {
            task.abort();
        }

        match &outcome {
            Ok(()) => tracing::info!(service = %self.name, "Goodbye!"),
            Err(e) => tracing::error!(service = %self.name, error = %e, "Service stopped"),
        }

        outcome
    }
}
