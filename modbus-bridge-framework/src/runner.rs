//! Bridge runner for lifecycle management.

use std::future::Future;

use tokio::signal;
use tokio::task::JoinHandle;

use modbus_bridge_common::{LoggingConfig, init_tracing};

use crate::BridgeArgs;
use crate::config::BridgeConfig;
use crate::error::Result;

/// Bridge runner that manages the lifecycle of a bridge process.
///
/// Handles:
/// - Logging initialization
/// - Task spawning and management
/// - Graceful shutdown on Ctrl+C, followed by a caller-supplied
///   shutdown hook that releases devices in order
///
/// # Example
///
/// ```ignore
/// use modbus_bridge_framework::{BridgeArgs, BridgeConfig, BridgeRunner};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let args = BridgeArgs::parse_with_default("mybridge.json5");
///     let config = MyBridgeConfig::load(&args.config)?;
///
///     let mut runner = BridgeRunner::new("mybridge", config, Some(&args))?;
///     runner.spawn(async move {
///         // Worker logic here
///     });
///
///     runner.run(|| async {}).await
/// }
/// ```
pub struct BridgeRunner<C: BridgeConfig> {
    /// Bridge name for logging.
    name: String,
    /// Bridge version.
    version: String,
    /// The loaded configuration.
    config: C,
    /// Spawned tasks.
    tasks: Vec<JoinHandle<()>>,
}

impl<C: BridgeConfig> BridgeRunner<C> {
    /// Create a new bridge runner and initialize logging.
    ///
    /// The log level comes from the configuration unless `args` carries
    /// a `--log-level` override.
    pub fn new(name: impl Into<String>, config: C, args: Option<&BridgeArgs>) -> Result<Self> {
        let log_config = match args.and_then(|a| a.log_level.as_ref()) {
            Some(level) => LoggingConfig {
                level: level.clone(),
                format: config.logging().format,
            },
            None => config.logging().clone(),
        };

        init_tracing(&log_config)?;

        let runner = Self::detached(name, config);
        tracing::info!(bridge = %runner.name, version = %runner.version, "Starting bridge");
        Ok(runner)
    }

    /// Create a runner without touching the global tracing subscriber.
    pub fn detached(name: impl Into<String>, config: C) -> Self {
        Self {
            name: name.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            config,
            tasks: Vec::new(),
        }
    }

    /// Get the bridge name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the bridge version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Get a reference to the configuration.
    pub fn config(&self) -> &C {
        &self.config
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

    /// Run the bridge until Ctrl+C is received, then call `on_shutdown`.
    pub async fn run<F, Fut>(self, on_shutdown: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            }
        };
        self.run_until(ctrl_c, on_shutdown).await
    }

    /// Run the bridge until `signal` completes.
    ///
    /// This will:
    /// 1. Wait for the shutdown signal
    /// 2. Abort all spawned tasks
    /// 3. Await `on_shutdown` so owned devices are released in order
    pub async fn run_until<S, F, Fut>(self, signal: S, on_shutdown: F) -> Result<()>
    where
        S: Future<Output = ()>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        tracing::info!(
            bridge = %self.name,
            tasks = self.tasks.len(),
            "Bridge running. Press Ctrl+C to stop."
        );

        signal.await;

        tracing::info!(bridge = %self.name, "Received shutdown signal");

        for task in &self.tasks {
            task.abort();
        }
        for task in self.tasks {
            // Aborted tasks resolve with a cancellation error
            let _ = task.await;
        }

        on_shutdown().await;

        tracing::info!(bridge = %self.name, "Goodbye!");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug, Deserialize)]
    struct EmptyConfig {
        #[serde(default)]
        logging: LoggingConfig,
    }

    impl BridgeConfig for EmptyConfig {
        fn logging(&self) -> &LoggingConfig {
            &self.logging
        }
    }

    #[tokio::test]
    async fn test_run_until_aborts_tasks_and_calls_hook() {
        let config = EmptyConfig::parse("{}").unwrap();
        let mut runner = BridgeRunner::detached("test", config);
        assert_eq!(runner.name(), "test");

        let finished = Arc::new(AtomicBool::new(false));
        let task_flag = finished.clone();
        runner.spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            task_flag.store(true, Ordering::SeqCst);
        });

        let hook_called = Arc::new(AtomicBool::new(false));
        let hook_flag = hook_called.clone();
        runner
            .run_until(async {}, || async move {
                hook_flag.store(true, Ordering::SeqCst);
            })
            .await
            .unwrap();

        assert!(hook_called.load(Ordering::SeqCst));
        assert!(!finished.load(Ordering::SeqCst));
    }
}
