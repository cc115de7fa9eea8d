//! Router actor commands, errors, and events.
//!
//! This module defines the message types for communicating with the `RouterActor`:
//! - `RouterCommand`: Commands sent to the actor
//! - `RouterError`: Errors that can occur during routing operations
//! - `RouterEvent`: Events published to front-door connections waiting on a handler

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use fiber_core::{HandlerName, SessionId};
use fiber_process::{ChildProcess, ExitOutcome, ProcessError};
use fiber_protocol::{EndpointError, HandlerContact};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Router Commands
// ============================================================================

/// Commands sent to the router actor.
pub enum RouterCommand {
    /// Create a session for a client address.
    CreateSession {
        client_address: String,
        respond_to: oneshot::Sender<SessionId>,
    },

    /// Destroy a session. Responds `false` for an unknown session.
    TerminateSession {
        session: SessionId,
        respond_to: oneshot::Sender<bool>,
    },

    /// Find or spawn the handler bound to a session.
    ResolveHandler {
        session: SessionId,
        respond_to: oneshot::Sender<Result<HandlerName, RouterError>>,
    },

    /// Socket path a handler reported in its handshake.
    LocalSocket {
        handler: HandlerName,
        respond_to: oneshot::Sender<Option<PathBuf>>,
    },

    /// Snapshot of all sessions and handlers.
    Snapshot {
        respond_to: oneshot::Sender<RouterSnapshot>,
    },

    /// Kill every handler and stop the actor.
    Shutdown { respond_to: oneshot::Sender<()> },

    /// A message arrived on the control endpoint.
    HandlerContact {
        contact: HandlerContact,
        /// Cancelling it closes the control connection the message came on.
        link: CancellationToken,
    },

    /// A launch task finished.
    HandlerLaunched {
        handler: HandlerName,
        generation: u64,
        result: Result<Box<dyn ChildProcess>, ProcessError>,
    },

    /// A watched handler process ended.
    HandlerExited {
        handler: HandlerName,
        generation: u64,
        outcome: ExitOutcome,
    },
}

impl fmt::Debug for RouterCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateSession { .. } => f.write_str("CreateSession"),
            Self::TerminateSession { session, .. } => {
                write!(f, "TerminateSession({session})")
            }
            Self::ResolveHandler { session, .. } => write!(f, "ResolveHandler({session})"),
            Self::LocalSocket { handler, .. } => write!(f, "LocalSocket({handler})"),
            Self::Snapshot { .. } => f.write_str("Snapshot"),
            Self::Shutdown { .. } => f.write_str("Shutdown"),
            Self::HandlerContact { contact, .. } => {
                write!(f, "HandlerContact({:?} {})", contact.contact_type, contact.handler_name)
            }
            Self::HandlerLaunched { handler, .. } => write!(f, "HandlerLaunched({handler})"),
            Self::HandlerExited { handler, .. } => write!(f, "HandlerExited({handler})"),
        }
    }
}

// ============================================================================
// Router Errors
// ============================================================================

/// Errors that can occur during routing operations.
#[derive(Debug, Error)]
pub enum RouterError {
    /// The control endpoint could not be bound.
    #[error("control endpoint unavailable: {0}")]
    Endpoint(#[from] EndpointError),

    /// The session was never created or has been terminated.
    #[error("Invalid session requested.")]
    InvalidSession { session: SessionId },

    /// The actor has shut down.
    #[error("response channel closed")]
    ChannelClosed,
}

// ============================================================================
// Router Events
// ============================================================================

/// Events published by the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterEvent {
    /// A handler completed its handshake.
    HandlerSocketUpdated { name: HandlerName, socket: PathBuf },

    /// A handler was torn down and will never report a socket.
    HandlerRemoved { name: HandlerName },
}

// ============================================================================
// Snapshots
// ============================================================================

/// Lifecycle of a handler as seen by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    /// Process launch in progress.
    Launching,
    /// Process running, handshake not yet received.
    Handshaking,
    /// Handshake received, socket known.
    Active,
    /// Told to exit; no new sessions are bound to it.
    Deactivating,
}

impl fmt::Display for HandlerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HandlerState::Launching => "launching",
            HandlerState::Handshaking => "handshaking",
            HandlerState::Active => "active",
            HandlerState::Deactivating => "deactivating",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerStatus {
    pub name: HandlerName,
    pub state: HandlerState,
    pub socket: Option<PathBuf>,
    pub pid: Option<u32>,
    pub sessions: Vec<SessionId>,
    pub restarts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub id: SessionId,
    pub client_address: String,
    pub created_at: DateTime<Utc>,
    pub handler: Option<HandlerName>,
}

/// Everything the router currently tracks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterSnapshot {
    pub sessions: Vec<SessionStatus>,
    pub handlers: Vec<HandlerStatus>,
}

impl RouterSnapshot {
    pub fn handler(&self, name: &HandlerName) -> Option<&HandlerStatus> {
        self.handlers.iter().find(|h| &h.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_session_message() {
        let err = RouterError::InvalidSession {
            session: SessionId::new("nope"),
        };
        assert_eq!(err.to_string(), "Invalid session requested.");
    }

    #[test]
    fn test_handler_state_display() {
        assert_eq!(HandlerState::Deactivating.to_string(), "deactivating");
    }
}
