//! Periodic telemetry publishing.

use std::sync::Arc;
use std::time::Duration;

use linebridge_framework::{EventSink, PublishStats};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::DeviceRegistry;
use crate::task::{CycleOutcome, LoopState, TaskSlot};

/// Publishes one telemetry event per device on a fixed cadence.
pub struct TelemetryLoop {
    registry: Arc<DeviceRegistry>,
    sink: Arc<dyn EventSink>,
    interval: Duration,
    backoff: Duration,
    slot: TaskSlot,
}

impl TelemetryLoop {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        sink: Arc<dyn EventSink>,
        interval: Duration,
        backoff: Duration,
    ) -> Self {
        Self {
            registry,
            sink,
            interval,
            backoff,
            slot: TaskSlot::new("telemetry"),
        }
    }

    /// Start the loop; a no-op if it is already running.
    pub fn start(self: &Arc<Self>, shutdown: &CancellationToken) -> bool {
        let this = Arc::clone(self);
        self.slot
            .start(shutdown, move |token| async move { this.run(token).await })
    }

    /// Stop the loop; `false` if it was not running.
    pub async fn stop(&self) -> bool {
        self.slot.stop().await
    }

    pub fn state(&self) -> LoopState {
        self.slot.state()
    }

    async fn run(&self, token: CancellationToken) {
        info!(
            interval = ?self.interval,
            backoff = ?self.backoff,
            "Telemetry loop started"
        );

        while !token.is_cancelled() {
            let wait = match self.run_cycle(&token).await {
                CycleOutcome::Disconnected => self.backoff,
                CycleOutcome::Completed { published, failed } => {
                    debug!(published, failed, "Telemetry cycle complete");
                    self.interval
                }
                CycleOutcome::Cancelled => break,
            };

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        info!("Telemetry loop stopped");
    }

    /// Discover, snapshot every device and publish its telemetry.
    pub async fn run_cycle(&self, token: &CancellationToken) -> CycleOutcome {
        if !self.registry.connection().ensure_connected().await {
            warn!(backoff = ?self.backoff, "Device endpoint unavailable, backing off");
            return CycleOutcome::Disconnected;
        }

        let names = match self.registry.discover().await {
            Ok(names) => names,
            Err(e) => {
                warn!(error = %e, "Discovery failed");
                return CycleOutcome::Disconnected;
            }
        };

        let mut stats = PublishStats::default();

        for name in names {
            if token.is_cancelled() {
                return CycleOutcome::Cancelled;
            }

            let Some(record) = self.registry.snapshot(&name).await else {
                warn!(device = %name, "Snapshot unavailable, skipping telemetry");
                stats.failed += 1;
                continue;
            };

            let result = self.sink.publish_telemetry(&record.telemetry()).await;
            match &result {
                Ok(()) => debug!(device = %name, "Telemetry published"),
                Err(e) => warn!(device = %name, error = %e, "Failed to publish telemetry"),
            }
            stats.record(&result);
        }

        if stats.failed > 0 {
            debug!(success_rate = stats.success_rate(), "Telemetry cycle had failures");
        }

        CycleOutcome::Completed {
            published: stats.success,
            failed: stats.failed,
        }
    }
}
