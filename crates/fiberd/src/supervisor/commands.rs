//! Supervisor actor commands, errors, and events.
//!
//! This module defines the message types for communicating with the `SupervisorActor`:
//! - `SupervisorCommand`: Commands sent to the actor, public and internal
//! - `SupervisorError`: Errors that can occur during supervisor operations
//! - `SupervisorEvent`: Events published for blocking callers and observers

use std::fmt;
use std::path::PathBuf;

use bytes::Bytes;
use fiber_core::{RequestId, WorkerKind};
use fiber_process::{ChildProcess, ExitOutcome, ProcessError};
use fiber_protocol::{EndpointError, SurrogateContact};
use thiserror::Error;
use tokio::net::UnixStream;
use tokio::sync::oneshot;

// ============================================================================
// Supervisor Commands
// ============================================================================

/// Commands sent to the supervisor actor.
///
/// Client-facing commands carry a oneshot `respond_to` channel. The
/// internal ones are sent by tasks the actor itself spawned (launches,
/// dispatches, exit watchers, the handshake listener).
pub enum SupervisorCommand {
    /// Enqueue a request and schedule its dispatch.
    Submit {
        kind: WorkerKind,
        /// Request bytes forwarded verbatim to the surrogate
        payload: Bytes,
        respond_to: oneshot::Sender<RequestId>,
    },

    /// Remove a request from the request queue, or its response from the
    /// response queue.
    Cancel {
        kind: WorkerKind,
        request_id: RequestId,
        respond_to: oneshot::Sender<bool>,
    },

    /// Remaining size in bytes of a queued response.
    ResponseSize {
        kind: WorkerKind,
        request_id: RequestId,
        respond_to: oneshot::Sender<Option<usize>>,
    },

    /// Drain up to `max_bytes` of a queued response (`<= 0` drains all).
    TakeResponse {
        kind: WorkerKind,
        request_id: RequestId,
        max_bytes: i64,
        respond_to: oneshot::Sender<Option<Bytes>>,
    },

    /// Ids of responses waiting to be collected.
    AvailableResponses {
        kind: WorkerKind,
        respond_to: oneshot::Sender<Vec<RequestId>>,
    },

    /// Ids of requests not yet answered.
    PendingRequests {
        kind: WorkerKind,
        respond_to: oneshot::Sender<Vec<RequestId>>,
    },

    /// Whether every queue of every kind is empty.
    IsIdle { respond_to: oneshot::Sender<bool> },

    /// Per-kind snapshot for status reporting.
    Status {
        respond_to: oneshot::Sender<Vec<LaneStatus>>,
    },

    /// Kill all surrogates and stop the actor.
    Shutdown { respond_to: oneshot::Sender<()> },

    /// A surrogate connected to the RequestManager endpoint.
    SurrogateHandshake {
        contact: SurrogateContact,
        /// Kept open for the surrogate's lifetime; dropping it tells the
        /// surrogate to exit.
        connection: UnixStream,
    },

    /// A launch task finished.
    WorkerLaunched {
        kind: WorkerKind,
        generation: u64,
        result: Result<Box<dyn ChildProcess>, ProcessError>,
    },

    /// A watched surrogate process ended.
    WorkerExited {
        kind: WorkerKind,
        generation: u64,
        outcome: ExitOutcome,
    },

    /// A dispatch task got the surrogate's answer (or failed to).
    DispatchCompleted {
        kind: WorkerKind,
        generation: u64,
        request_id: RequestId,
        result: Result<Bytes, String>,
    },
}

impl fmt::Debug for SupervisorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Submit { .. } => "Submit",
            Self::Cancel { .. } => "Cancel",
            Self::ResponseSize { .. } => "ResponseSize",
            Self::TakeResponse { .. } => "TakeResponse",
            Self::AvailableResponses { .. } => "AvailableResponses",
            Self::PendingRequests { .. } => "PendingRequests",
            Self::IsIdle { .. } => "IsIdle",
            Self::Status { .. } => "Status",
            Self::Shutdown { .. } => "Shutdown",
            Self::SurrogateHandshake { .. } => "SurrogateHandshake",
            Self::WorkerLaunched { .. } => "WorkerLaunched",
            Self::WorkerExited { .. } => "WorkerExited",
            Self::DispatchCompleted { .. } => "DispatchCompleted",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Supervisor Errors
// ============================================================================

/// Errors that can occur during supervisor operations.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The RequestManager endpoint could not be bound.
    #[error("request manager endpoint unavailable: {0}")]
    Endpoint(#[from] EndpointError),

    /// The actor has shut down.
    #[error("response channel closed")]
    ChannelClosed,
}

// ============================================================================
// Supervisor Events
// ============================================================================

/// Events published by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// A response (real or synthesized) was queued.
    ResponseAvailable {
        kind: WorkerKind,
        request_id: RequestId,
    },

    /// A surrogate process started.
    WorkerStarted { kind: WorkerKind, pid: Option<u32> },

    /// A surrogate process ended.
    WorkerExited {
        kind: WorkerKind,
        outcome: ExitOutcome,
        deadlock: bool,
    },
}

/// Worker lifecycle state of one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    NoWorker,
    Launching,
    /// Process started, handshake not yet received.
    Starting,
    Running,
}

/// Snapshot of one kind's queues and worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaneStatus {
    pub kind: WorkerKind,
    pub state: WorkerState,
    pub pid: Option<u32>,
    pub socket: Option<PathBuf>,
    pub queued_requests: usize,
    pub queued_responses: usize,
    pub consecutive_failures: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            SupervisorError::ChannelClosed.to_string(),
            "response channel closed"
        );
    }

    #[test]
    fn test_command_debug_is_name_only() {
        let (tx, _rx) = oneshot::channel();
        let cmd = SupervisorCommand::IsIdle { respond_to: tx };
        assert_eq!(format!("{cmd:?}"), "IsIdle");
    }
}
