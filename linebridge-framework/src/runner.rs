//! Bridge runner for lifecycle management.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use linebridge_common::{LoggingConfig, connect, init_tracing};

use crate::BridgeArgs;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::publisher::Publisher;
use crate::status::StatusPublisher;

/// How long spawned workers get to notice the shutdown token before they are aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Bridge runner that manages the lifecycle of a protocol bridge.
///
/// Handles:
/// - Logging initialization
/// - Zenoh connection
/// - Task spawning and cooperative shutdown
/// - Graceful shutdown on Ctrl+C
/// - Status publishing (optional)
pub struct BridgeRunner<C: BridgeConfig> {
    /// Bridge name for logging and status.
    name: String,
    /// Bridge version.
    version: String,
    /// The loaded configuration.
    config: C,
    /// Zenoh session.
    session: Arc<zenoh::Session>,
    /// Publisher for events.
    publisher: Publisher,
    /// Status publisher (optional), shared with workers that report failures.
    status_publisher: Option<Arc<StatusPublisher>>,
    /// Cancelled when the bridge shuts down; workers select on it.
    shutdown: CancellationToken,
    /// Spawned tasks.
    tasks: Vec<JoinHandle<()>>,
}

impl<C: BridgeConfig> BridgeRunner<C> {
    /// Create a new bridge runner with CLI args for log level override.
    ///
    /// This will:
    /// 1. Initialize logging based on config (with optional CLI override)
    /// 2. Connect to Zenoh
    /// 3. Create the publisher
    pub async fn new_with_args(
        name: impl Into<String>,
        config: C,
        args: Option<&BridgeArgs>,
    ) -> Result<Self> {
        let name = name.into();
        let version = env!("CARGO_PKG_VERSION").to_string();

        let log_config = match args.and_then(|a| a.log_level.as_ref()) {
            Some(level) => LoggingConfig {
                level: level.clone(),
                format: config.logging().format,
            },
            None => config.logging().clone(),
        };

        init_tracing(&log_config).map_err(|e| BridgeError::config(e.to_string()))?;

        tracing::info!(bridge = %name, version = %version, "Starting bridge");

        let session = Arc::new(
            connect(config.zenoh())
                .await
                .map_err(|e| BridgeError::ZenohConnection(e.to_string()))?,
        );

        let publisher = Publisher::new(session.clone(), config.key_prefix(), config.format());

        Ok(Self {
            name,
            version,
            config,
            session,
            publisher,
            status_publisher: None,
            shutdown: CancellationToken::new(),
            tasks: Vec::new(),
        })
    }

    /// Enable status publishing.
    ///
    /// When enabled, the runner publishes status messages on startup and shutdown.
    pub fn with_status_publishing(mut self) -> Self {
        self.status_publisher = Some(Arc::new(StatusPublisher::new(
            self.publisher.clone(),
            &self.name,
            &self.version,
        )));
        self
    }

    /// Get a reference to the configuration.
    pub fn config(&self) -> &C {
        &self.config
    }

    /// Get a reference to the Zenoh session.
    pub fn session(&self) -> &Arc<zenoh::Session> {
        &self.session
    }

    /// Get a clone of the publisher.
    pub fn publisher(&self) -> Publisher {
        self.publisher.clone()
    }

    /// Token cancelled when the bridge begins shutting down.
    ///
    /// Long-running workers should derive child tokens from it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawn a worker task.
    ///
    /// The task is awaited on shutdown and aborted if it outlives the grace period.
    pub fn spawn<F>(&mut self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.push(tokio::spawn(future));
    }

    /// Spawn a worker task that returns a Result.
    ///
    /// Errors are logged and, with status publishing enabled, announced as
    /// the bridge's "error" status.
    pub fn spawn_with_error<F, E>(&mut self, name: String, future: F)
    where
        F: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let status = self.status_publisher.clone();
        self.spawn(async move {
            if let Err(e) = future.await {
                tracing::error!(worker = %name, error = %e, "Worker failed");
                if let Some(status) = status {
                    if let Err(e) = status.publish_error(format!("{}: {}", name, e)).await {
                        tracing::warn!(error = %e, "Failed to publish error status");
                    }
                }
            }
        });
    }

    /// Run the bridge with custom status metadata.
    ///
    /// This will:
    /// 1. Publish "running" status (if enabled)
    /// 2. Wait for Ctrl+C or an external cancellation of the shutdown token
    /// 3. Cancel the shutdown token and wait for workers to finish
    /// 4. Publish "offline" status (if enabled)
    /// 5. Close the Zenoh session
    pub async fn run_with_metadata(self, metadata: Option<serde_json::Value>) -> Result<()> {
        if let Some(ref status_pub) = self.status_publisher {
            if let Err(e) = status_pub.publish_running(metadata).await {
                tracing::warn!(error = %e, "Failed to publish running status");
            }
        }

        tracing::info!(
            bridge = %self.name,
            tasks = self.tasks.len(),
            "Bridge running. Press Ctrl+C to stop."
        );

        tokio::select! {
            result = signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Failed to listen for Ctrl+C");
                }
                tracing::info!(bridge = %self.name, "Received shutdown signal");
            }
            _ = self.shutdown.cancelled() => {
                tracing::info!(bridge = %self.name, "Shutdown requested");
            }
        }

        self.shutdown.cancel();

        for mut task in self.tasks {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                tracing::warn!("Worker did not stop in time, aborting");
                task.abort();
            }
        }

        if let Some(ref status_pub) = self.status_publisher {
            if let Err(e) = status_pub.publish_offline().await {
                tracing::warn!(error = %e, "Failed to publish offline status");
            }
        }

        if let Err(e) = self.session.close().await {
            tracing::warn!(error = %e, "Error closing Zenoh session");
        }

        tracing::info!(bridge = %self.name, "Goodbye!");

        Ok(())
    }
}
