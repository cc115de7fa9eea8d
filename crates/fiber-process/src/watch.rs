//! Exit watching for launched processes.
//!
//! [`watch`] moves a [`ChildProcess`] into its own task, which waits for
//! the process to end and then runs a completion callback. The returned
//! [`ProcessHandle`] is all the owner keeps: it can kill the process, and
//! the kill is still reported through the same callback.

use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::launcher::{ChildProcess, ExitOutcome};

/// Owner-side handle of a watched process.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: Option<u32>,
    kill: CancellationToken,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Kills the process. Idempotent.
    pub fn kill(&self) {
        self.kill.cancel();
    }

    pub fn is_killed(&self) -> bool {
        self.kill.is_cancelled()
    }
}

/// Watches `child` until it exits, then calls `on_exit` with the outcome.
///
/// A process that cannot be waited on is reported as crashed.
pub fn watch<F, Fut>(mut child: Box<dyn ChildProcess>, on_exit: F) -> ProcessHandle
where
    F: FnOnce(ExitOutcome) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let pid = child.id();
    let kill = CancellationToken::new();
    let token = kill.clone();

    tokio::spawn(async move {
        let result = tokio::select! {
            result = child.wait() => result,
            _ = token.cancelled() => {
                if let Err(e) = child.start_kill() {
                    warn!(pid = ?pid, error = %e, "Failed to kill process");
                }
                child.wait().await
            }
        };

        let outcome = result.unwrap_or_else(|e| {
            warn!(pid = ?pid, error = %e, "Lost track of process");
            ExitOutcome::crashed()
        });
        on_exit(outcome).await;
    });

    ProcessHandle { pid, kill }
}
