//! View-change timer.
//!
//! There is one deadline per node. Any progress pushes it out; when it
//! passes, the engine abandons the view.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};

/// Resettable single-deadline timer.
#[derive(Debug)]
pub struct Pacemaker {
    deadline: Mutex<Instant>,
    changed: Notify,
}

impl Pacemaker {
    /// Creates a timer expiring `timeout` from now.
    pub fn new(timeout: Duration) -> Self {
        Self {
            deadline: Mutex::new(Instant::now() + timeout),
            changed: Notify::new(),
        }
    }

    /// Moves the deadline to `timeout` from now.
    pub fn reset(&self, timeout: Duration) {
        *self.deadline.lock() = Instant::now() + timeout;
        self.changed.notify_one();
    }

    /// The current deadline.
    pub fn deadline(&self) -> Instant {
        *self.deadline.lock()
    }

    /// Resolves once the deadline passes without being pushed out.
    pub async fn expired(&self) {
        loop {
            let deadline = self.deadline();
            tokio::select! {
                _ = sleep_until(deadline) => {
                    if self.deadline() <= Instant::now() {
                        return;
                    }
                }
                _ = self.changed.notified() => {}
            }
        }
    }
}
