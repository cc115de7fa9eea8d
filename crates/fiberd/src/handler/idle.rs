//! Idle self-termination timer.
//!
//! The handler samples its supervisor every refresh interval. The first idle
//! sample arms the timeout; a second idle sample one timeout later means the
//! handler has nothing to do and should ask the router to retire it. Any
//! busy sample disarms the timer.
//!
//! ```text
//!  busy ──idle──▶ armed ──idle──▶ expired
//!   ▲               │
//!   └─────busy──────┘
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::supervisor::SupervisorHandle;

/// What the timer wants after a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleVerdict {
    /// Sample again after this long.
    Wait(Duration),
    /// Idle for a full timeout.
    Expired,
}

#[derive(Debug, Clone)]
pub struct IdleTimer {
    refresh: Duration,
    timeout: Duration,
    armed: bool,
}

impl IdleTimer {
    pub fn new(refresh: Duration, timeout: Duration) -> Self {
        Self {
            refresh,
            timeout,
            armed: false,
        }
    }

    /// Delay before the first sample.
    pub fn first_wait(&self) -> Duration {
        self.refresh
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Feeds one sample.
    pub fn sample(&mut self, idle: bool) -> IdleVerdict {
        match (idle, self.armed) {
            (false, _) => {
                self.armed = false;
                IdleVerdict::Wait(self.refresh)
            }
            (true, false) => {
                self.armed = true;
                IdleVerdict::Wait(self.timeout)
            }
            (true, true) => IdleVerdict::Expired,
        }
    }
}

/// Completes once the handler has been idle for the configured timeout.
///
/// `activity` is set by every request the handler receives and counts as
/// a busy sample.
pub fn idle_expiry(
    supervisor: SupervisorHandle,
    activity: Arc<AtomicBool>,
    mut timer: IdleTimer,
) -> impl Future<Output = ()> {
    async move {
        let mut wait = timer.first_wait();
        loop {
            tokio::time::sleep(wait).await;

            let recent_request = activity.swap(false, Ordering::SeqCst);
            // A dead supervisor has no work left either
            let queues_empty = supervisor.is_idle().await.unwrap_or(true);

            match timer.sample(queues_empty && !recent_request) {
                IdleVerdict::Wait(next) => {
                    debug!(armed = timer.is_armed(), "Idle check");
                    wait = next;
                }
                IdleVerdict::Expired => return,
            }
        }
    }
}
