//! Rising-edge detection on device error registers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use linebridge_common::ErrorEvent;
use linebridge_framework::{EventSink, PublishStats};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::DeviceRegistry;
use crate::task::{CycleOutcome, LoopState, TaskSlot};

/// Bits set in `current` that were clear in `previous`, lowest first.
pub fn rising_edges(previous: u32, current: u32) -> Vec<u8> {
    let newly_set = current & !previous;
    (0..u32::BITS as u8)
        .filter(|bit| newly_set & (1 << bit) != 0)
        .collect()
}

/// Last observed error mask per device name.
#[derive(Debug, Clone, Default)]
pub struct ErrorState {
    previous: HashMap<String, u32>,
}

impl ErrorState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget every device not in `present`; returns how many were dropped.
    pub fn prune<S: AsRef<str>>(&mut self, present: &[S]) -> usize {
        let keep: HashSet<&str> = present.iter().map(AsRef::as_ref).collect();
        let before = self.previous.len();
        self.previous.retain(|name, _| keep.contains(name.as_str()));
        before - self.previous.len()
    }

    /// Record `current` for `name` and return the bits that rose.
    ///
    /// A name seen for the first time is diffed against a baseline of 0.
    pub fn observe(&mut self, name: &str, current: u32) -> Vec<u8> {
        let previous = self.previous.insert(name.to_string(), current).unwrap_or(0);
        rising_edges(previous, current)
    }

    pub fn baseline(&self, name: &str) -> Option<u32> {
        self.previous.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.previous.len()
    }

    pub fn is_empty(&self) -> bool {
        self.previous.is_empty()
    }
}

/// Polls every registered device's error register and publishes one
/// [`ErrorEvent`] per bit that went from 0 to 1.
///
/// Membership comes from the shared [`DeviceRegistry`]; this loop only runs a
/// discovery pass itself when none has happened yet.
pub struct ErrorDiffLoop {
    registry: Arc<DeviceRegistry>,
    sink: Arc<dyn EventSink>,
    interval: Duration,
    state: Mutex<ErrorState>,
    slot: TaskSlot,
}

impl ErrorDiffLoop {
    pub fn new(registry: Arc<DeviceRegistry>, sink: Arc<dyn EventSink>, interval: Duration) -> Self {
        Self {
            registry,
            sink,
            interval,
            state: Mutex::new(ErrorState::new()),
            slot: TaskSlot::new("error-diff"),
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

    /// Last observed mask of `name`.
    pub async fn baseline(&self, name: &str) -> Option<u32> {
        self.state.lock().await.baseline(name)
    }

    async fn run(&self, token: CancellationToken) {
        info!(interval = ?self.interval, "Error diff loop started");

        while !token.is_cancelled() {
            if self.run_cycle(&token).await == CycleOutcome::Cancelled {
                break;
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        info!("Error diff loop stopped");
    }

    /// Diff every registered device's error register once.
    pub async fn run_cycle(&self, token: &CancellationToken) -> CycleOutcome {
        if !self.registry.connection().ensure_connected().await {
            return CycleOutcome::Disconnected;
        }

        if !self.registry.has_discovered() {
            if let Err(e) = self.registry.discover().await {
                warn!(error = %e, "Initial discovery failed");
                return CycleOutcome::Disconnected;
            }
        }

        let names = self.registry.names().await;
        let pruned = self.state.lock().await.prune(&names);
        if pruned > 0 {
            debug!(pruned, "Dropped error baselines of removed devices");
        }

        let mut stats = PublishStats::default();

        for name in names {
            if token.is_cancelled() {
                return CycleOutcome::Cancelled;
            }

            // Unreadable registers keep their baseline so no edge is invented.
            let Some(current) = self.registry.read_error_bits(&name).await else {
                continue;
            };

            let edges = self.state.lock().await.observe(&name, current);
            for bit in edges {
                let event = ErrorEvent::rising(name.as_str(), bit);
                let result = self.sink.publish_error(&event).await;
                match &result {
                    Ok(()) => info!(device = %name, bit, code = event.error_code, "Error bit raised"),
                    Err(e) => warn!(device = %name, bit, error = %e, "Failed to publish error event"),
                }
                stats.record(&result);
            }
        }

        CycleOutcome::Completed {
            published: stats.success,
            failed: stats.failed,
        }
    }
}
