//! Start/stop handle for the periodic loops.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle of a periodic loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Running,
    Stopped,
}

/// Result of one loop cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The endpoint could not be reached; the loop backs off.
    Disconnected,
    /// Every device was visited.
    Completed { published: usize, failed: usize },
    /// Cancellation was observed between two devices.
    Cancelled,
}

enum Slot {
    Idle,
    Running {
        token: CancellationToken,
        handle: JoinHandle<()>,
    },
    Stopped,
}

/// Owns the task of one loop.
///
/// `start` while running is a no-op, `stop` while not running reports
/// `false`. Both may be called from any task, any number of times.
pub struct TaskSlot {
    name: &'static str,
    slot: Mutex<Slot>,
}

impl TaskSlot {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slot: Mutex::new(Slot::Idle),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> LoopState {
        match &*self.lock() {
            Slot::Idle => LoopState::Idle,
            Slot::Running { handle, .. } if handle.is_finished() => LoopState::Stopped,
            Slot::Running { .. } => LoopState::Running,
            Slot::Stopped => LoopState::Stopped,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == LoopState::Running
    }

    /// Spawn `run` with a child of `parent`.
    ///
    /// Returns `false` if the loop is already running.
    pub fn start<F, Fut>(&self, parent: &CancellationToken, run: F) -> bool
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.lock();
        if let Slot::Running { handle, .. } = &*slot {
            if !handle.is_finished() {
                info!(task = self.name, "Already running");
                return false;
            }
        }

        let token = parent.child_token();
        let handle = tokio::spawn(run(token.clone()));
        *slot = Slot::Running { token, handle };
        debug!(task = self.name, "Started");
        true
    }

    /// Cancel the loop and wait for it to exit.
    ///
    /// Returns `false` (and does nothing) if the loop was not running.
    pub async fn stop(&self) -> bool {
        let (token, handle) = {
            let mut slot = self.lock();
            match std::mem::replace(&mut *slot, Slot::Stopped) {
                Slot::Running { token, handle } => (token, handle),
                previous => {
                    *slot = previous;
                    info!(task = self.name, "Not running");
                    return false;
                }
            }
        };

        token.cancel();
        if let Err(e) = handle.await {
            warn!(task = self.name, error = %e, "Task ended abnormally");
        }
        info!(task = self.name, "Stopped");
        true
    }
}

impl std::fmt::Debug for TaskSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSlot")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}
