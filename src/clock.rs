//! Coarse sampled clock
//!
//! Per-exchange deadlines only need sub-second accuracy, so the current
//! instant is sampled on a fixed cadence by one background task and read
//! everywhere else without a syscall.

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{Duration, Instant};
use tracing::trace;

/// Interval between two samples of the system clock.
const RESOLUTION: Duration = Duration::from_millis(500);

/// Shared coarse clock.
///
/// `now()` returns the most recent sample; before the ticker runs it
/// returns the instant the clock was created.
#[derive(Clone)]
pub struct Clock {
    current: Arc<RwLock<Instant>>,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            current: Arc::new(RwLock::new(Instant::now())),
        }
    }

    /// Last sampled instant.
    pub fn now(&self) -> Instant {
        *self.current.read()
    }

    /// Run the sampling ticker until shutdown fires.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(RESOLUTION);
        loop {
            tokio::select! {
                t = ticker.tick() => {
                    *self.current.write() = t;
                }
                _ = shutdown.recv() => {
                    trace!("clock ticker stopped");
                    return;
                }
            }
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
