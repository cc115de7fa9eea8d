//! Client interface for interacting with the RouterActor.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Channel errors are mapped to `RouterError::ChannelClosed`

use std::path::PathBuf;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use fiber_core::{HandlerName, SessionId};

use super::commands::{RouterCommand, RouterError, RouterEvent, RouterSnapshot};

/// Handle for interacting with the router actor.
///
/// Cheap to clone and shared by every front-door connection.
#[derive(Clone)]
pub struct RouterHandle {
    sender: mpsc::Sender<RouterCommand>,
    event_sender: broadcast::Sender<RouterEvent>,
    /// Stops the control listener
    stop: CancellationToken,
}

impl RouterHandle {
    pub fn new(
        sender: mpsc::Sender<RouterCommand>,
        event_sender: broadcast::Sender<RouterEvent>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            sender,
            event_sender,
            stop,
        }
    }

    async fn ask<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> RouterCommand,
    ) -> Result<T, RouterError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(make(tx))
            .await
            .map_err(|_| RouterError::ChannelClosed)?;
        rx.await.map_err(|_| RouterError::ChannelClosed)
    }

    /// Creates a session for `client_address` and returns its id.
    pub async fn create_session(
        &self,
        client_address: impl Into<String>,
    ) -> Result<SessionId, RouterError> {
        let client_address = client_address.into();
        self.ask(|respond_to| RouterCommand::CreateSession {
            client_address,
            respond_to,
        })
        .await
    }

    /// Destroys a session. Returns `false` if it did not exist.
    ///
    /// Terminating a handler's last session deactivates the handler.
    pub async fn terminate_session(&self, session: SessionId) -> Result<bool, RouterError> {
        self.ask(|respond_to| RouterCommand::TerminateSession {
            session,
            respond_to,
        })
        .await
    }

    /// Returns the handler bound to `session`, spawning one if needed.
    ///
    /// # Errors
    ///
    /// - `RouterError::InvalidSession` if the session does not exist
    /// - `RouterError::ChannelClosed` if the actor has shut down
    pub async fn resolve_handler(&self, session: SessionId) -> Result<HandlerName, RouterError> {
        self.ask(|respond_to| RouterCommand::ResolveHandler {
            session,
            respond_to,
        })
        .await?
    }

    /// Socket path of a handler that completed its handshake.
    pub async fn local_socket(
        &self,
        handler: HandlerName,
    ) -> Result<Option<PathBuf>, RouterError> {
        self.ask(|respond_to| RouterCommand::LocalSocket {
            handler,
            respond_to,
        })
        .await
    }

    pub async fn snapshot(&self) -> Result<RouterSnapshot, RouterError> {
        self.ask(|respond_to| RouterCommand::Snapshot { respond_to })
            .await
    }

    /// Closes the control endpoint, stops every handler and the actor.
    pub async fn shutdown(&self) -> Result<(), RouterError> {
        self.stop.cancel();
        self.ask(|respond_to| RouterCommand::Shutdown { respond_to })
            .await
    }

    /// Subscribes to handler socket notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<RouterEvent> {
        self.event_sender.subscribe()
    }
}
