//! Client interface for interacting with the SupervisorActor.
//!
//! The `SupervisorHandle` is what a handler's connection tasks use to queue
//! requests, collect responses and wait for them.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Channel errors are mapped to `SupervisorError::ChannelClosed`

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use fiber_core::{RequestId, WorkerKind};

use super::commands::{LaneStatus, SupervisorCommand, SupervisorError, SupervisorEvent};

// ============================================================================
// Supervisor Handle
// ============================================================================

/// Handle for interacting with the supervisor actor.
///
/// Cheap to clone. The actor keeps running while any handle exists or
/// until [`SupervisorHandle::shutdown`] is called.
#[derive(Clone)]
pub struct SupervisorHandle {
    sender: mpsc::Sender<SupervisorCommand>,
    event_sender: broadcast::Sender<SupervisorEvent>,
    /// Stops the handshake listener
    stop: CancellationToken,
}

impl SupervisorHandle {
    pub fn new(
        sender: mpsc::Sender<SupervisorCommand>,
        event_sender: broadcast::Sender<SupervisorEvent>,
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
        make: impl FnOnce(oneshot::Sender<T>) -> SupervisorCommand,
    ) -> Result<T, SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(make(tx))
            .await
            .map_err(|_| SupervisorError::ChannelClosed)?;
        rx.await.map_err(|_| SupervisorError::ChannelClosed)
    }

    /// Queues `payload` for a surrogate of `kind` and returns its id.
    ///
    /// The surrogate is launched on demand.
    pub async fn submit(
        &self,
        kind: WorkerKind,
        payload: Bytes,
    ) -> Result<RequestId, SupervisorError> {
        self.ask(|respond_to| SupervisorCommand::Submit {
            kind,
            payload,
            respond_to,
        })
        .await
    }

    /// Cancels a queued request or drops its uncollected response.
    ///
    /// Returns whether anything was removed. Cancelling twice is harmless.
    pub async fn cancel(
        &self,
        kind: WorkerKind,
        request_id: RequestId,
    ) -> Result<bool, SupervisorError> {
        self.ask(|respond_to| SupervisorCommand::Cancel {
            kind,
            request_id,
            respond_to,
        })
        .await
    }

    /// Remaining bytes of a queued response, `None` if there is none.
    pub async fn response_size(
        &self,
        kind: WorkerKind,
        request_id: RequestId,
    ) -> Result<Option<usize>, SupervisorError> {
        self.ask(|respond_to| SupervisorCommand::ResponseSize {
            kind,
            request_id,
            respond_to,
        })
        .await
    }

    /// Takes up to `max_bytes` from the front of a queued response.
    ///
    /// `max_bytes <= 0`, or a value covering the rest, takes everything and
    /// removes the response.
    pub async fn take_response(
        &self,
        kind: WorkerKind,
        request_id: RequestId,
        max_bytes: i64,
    ) -> Result<Option<Bytes>, SupervisorError> {
        self.ask(|respond_to| SupervisorCommand::TakeResponse {
            kind,
            request_id,
            max_bytes,
            respond_to,
        })
        .await
    }

    pub async fn available_responses(
        &self,
        kind: WorkerKind,
    ) -> Result<Vec<RequestId>, SupervisorError> {
        self.ask(|respond_to| SupervisorCommand::AvailableResponses { kind, respond_to })
            .await
    }

    pub async fn pending_requests(
        &self,
        kind: WorkerKind,
    ) -> Result<Vec<RequestId>, SupervisorError> {
        self.ask(|respond_to| SupervisorCommand::PendingRequests { kind, respond_to })
            .await
    }

    /// Whether no request or response of any kind is queued.
    pub async fn is_idle(&self) -> Result<bool, SupervisorError> {
        self.ask(|respond_to| SupervisorCommand::IsIdle { respond_to })
            .await
    }

    pub async fn status(&self) -> Result<Vec<LaneStatus>, SupervisorError> {
        self.ask(|respond_to| SupervisorCommand::Status { respond_to })
            .await
    }

    /// Kills every surrogate and stops the actor.
    pub async fn shutdown(&self) -> Result<(), SupervisorError> {
        self.stop.cancel();
        self.ask(|respond_to| SupervisorCommand::Shutdown { respond_to })
            .await
    }

    /// Subscribes to supervisor events.
    ///
    /// Subscribe before submitting to be sure not to miss the request's
    /// `ResponseAvailable`.
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.event_sender.subscribe()
    }
}
