//! Deadlock watchdog for a running surrogate.
//!
//! Every interval the watchdog sends the surrogate a diagnostics ping on a
//! fresh connection. A ping that cannot connect, write or read within the
//! probe timeout marks the surrogate deadlocked and kills it; the exit path
//! then answers the in-flight request with the deadlock error. A surrogate
//! that never completes its handshake is handled the same way.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fiber_process::ProcessHandle;
use fiber_protocol::{Dialer, Framing, ServiceCall};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Everything a watchdog task needs.
pub struct Watchdog {
    pub surrogate: String,
    pub socket: PathBuf,
    pub process: ProcessHandle,
    pub deadlock: Arc<AtomicBool>,
    pub interval: Duration,
    pub probe_timeout: Duration,
    pub cancel: CancellationToken,
}

/// Spawns the watchdog loop. It stops when `cancel` fires or after it
/// kills the process.
pub fn spawn_watchdog(watchdog: Watchdog) {
    tokio::spawn(watchdog.run());
}

impl Watchdog {
    async fn run(self) {
        let dialer = Dialer::new(self.probe_timeout, Some(self.probe_timeout))
            .with_write_timeout(self.probe_timeout);
        let ping = ServiceCall::ping().to_value();
        let mut ticker = tokio::time::interval(self.interval);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(surrogate = %self.surrogate, "Watchdog stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let probe = tokio::select! {
                _ = self.cancel.cancelled() => return,
                result = dialer.request(&self.socket, &ping, Framing::Footer) => result,
            };

            match probe {
                Ok(_) => self.deadlock.store(false, Ordering::SeqCst),
                Err(e) => {
                    warn!(
                        surrogate = %self.surrogate,
                        error = %e,
                        "Surrogate failed watchdog probe, killing it"
                    );
                    self.deadlock.store(true, Ordering::SeqCst);
                    self.process.kill();
                    return;
                }
            }
        }
    }
}

/// Bounds the time between a surrogate starting and its handshake.
///
/// A surrogate that never reports in is treated like one that stopped
/// answering pings: it is marked deadlocked and killed.
pub struct StartupDeadline {
    pub surrogate: String,
    pub process: ProcessHandle,
    pub deadlock: Arc<AtomicBool>,
    pub timeout: Duration,
    /// Cancelled once the handshake arrives or the worker is dropped.
    pub cancel: CancellationToken,
}

pub fn spawn_startup_deadline(deadline: StartupDeadline) {
    tokio::spawn(async move {
        tokio::select! {
            _ = deadline.cancel.cancelled() => {}
            _ = tokio::time::sleep(deadline.timeout) => {
                warn!(
                    surrogate = %deadline.surrogate,
                    timeout = ?deadline.timeout,
                    "Surrogate did not complete its handshake, killing it"
                );
                deadline.deadlock.store(true, Ordering::SeqCst);
                deadline.process.kill();
            }
        }
    });
}
