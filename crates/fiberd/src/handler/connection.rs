//! Handler connection handling.
//!
//! Each connection carries one footer-framed request. Normal calls are
//! queued on the supervisor; meta-calls inspect or drain the queues. The
//! reply is written and the connection closed.
//!
//! A blocking caller keeps the connection open until its response is ready.
//! Closing it earlier cancels the request, so callers must not half-close
//! their side after sending.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Every failure becomes an error envelope for the client

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use fiber_core::{RequestId, WorkerKind};
use fiber_protocol::{
    decode, Envelope, FrameDecoder, FrameError, FrameReader, HandlerCall, MetaMethod,
    ProtocolError,
};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::supervisor::{SupervisorError, SupervisorEvent, SupervisorHandle};

/// Timeouts applied to one handler connection.
#[derive(Debug, Clone, Copy)]
pub struct HandlerTimeouts {
    pub read: Duration,
    pub write: Duration,
}

/// What goes back to the client.
enum Reply {
    Envelope(Envelope),
    /// Response bytes exactly as the surrogate produced them.
    Raw(Bytes),
    /// The client went away; nothing to write.
    Nothing,
}

impl From<ProtocolError> for Reply {
    fn from(e: ProtocolError) -> Self {
        Reply::Envelope(Envelope::error(e.to_string()))
    }
}

impl From<SupervisorError> for Reply {
    fn from(e: SupervisorError) -> Self {
        Reply::Envelope(Envelope::error(e.to_string()))
    }
}

impl From<FrameError> for Reply {
    fn from(e: FrameError) -> Self {
        Reply::Envelope(Envelope::error(e.to_string()))
    }
}

/// Serves a single client connection of a handler.
pub struct HandlerConnection {
    stream: UnixStream,
    supervisor: SupervisorHandle,
    activity: Arc<AtomicBool>,
    timeouts: HandlerTimeouts,
    connection_number: u64,
}

impl HandlerConnection {
    pub fn new(
        stream: UnixStream,
        supervisor: SupervisorHandle,
        activity: Arc<AtomicBool>,
        timeouts: HandlerTimeouts,
        connection_number: u64,
    ) -> Self {
        Self {
            stream,
            supervisor,
            activity,
            timeouts,
            connection_number,
        }
    }

    pub async fn run(mut self) {
        let reply = self.serve().await;

        let bytes = match reply {
            Reply::Nothing => return,
            Reply::Raw(bytes) => bytes,
            Reply::Envelope(envelope) => match serde_json::to_vec(&envelope) {
                Ok(bytes) => Bytes::from(bytes),
                Err(e) => {
                    warn!(error = %e, "Failed to serialize reply");
                    return;
                }
            },
        };

        let write = async {
            self.stream.write_all(&bytes).await?;
            self.stream.flush().await?;
            self.stream.shutdown().await
        };
        match timeout(self.timeouts.write, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(connection = self.connection_number, error = %e, "Failed to write reply"),
            Err(_) => debug!(connection = self.connection_number, "Timed out writing reply"),
        }
    }

    async fn serve(&mut self) -> Reply {
        let mut reader = FrameReader::new(&mut self.stream, FrameDecoder::strict());
        let frame = match timeout(self.timeouts.read, reader.next_frame()).await {
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => {
                debug!(connection = self.connection_number, "Connection closed before request");
                return Reply::Nothing;
            }
            Ok(Err(e)) => return e.into(),
            Err(_) => return Reply::Envelope(Envelope::error("Timed out waiting for request")),
        };
        self.activity.store(true, Ordering::SeqCst);

        let call = match decode(&frame).map_err(Reply::from).and_then(|value| {
            HandlerCall::from_value(&value).map_err(Reply::from)
        }) {
            Ok(call) => call,
            Err(reply) => return reply,
        };
        let kind = match call.kind() {
            Ok(kind) => kind,
            Err(e) => return e.into(),
        };

        if call.is_meta() {
            return self.serve_meta(&call, kind).await;
        }
        self.serve_call(kind, call.is_blocking(), frame.freeze()).await
    }

    // ------------------------------------------------------------------------
    // Service calls
    // ------------------------------------------------------------------------

    async fn serve_call(&mut self, kind: WorkerKind, blocking: bool, payload: Bytes) -> Reply {
        // Subscribe before submitting so the completion cannot be missed
        let events = self.supervisor.subscribe();

        let id = match self.supervisor.submit(kind, payload).await {
            Ok(id) => id,
            Err(e) => return e.into(),
        };
        debug!(connection = self.connection_number, kind = %kind, request_id = %id, blocking, "Request submitted");

        if !blocking {
            return Reply::Envelope(Envelope::success(id.get()));
        }

        let (mut read_half, _) = self.stream.split();
        let peer_gone = tokio::select! {
            _ = peer_closed(&mut read_half) => true,
            ready = wait_for_response(&self.supervisor, events, kind, id) => {
                if !ready {
                    return SupervisorError::ChannelClosed.into();
                }
                false
            }
        };

        if peer_gone {
            info!(kind = %kind, request_id = %id, "Had to cancel a request because peer disconnected");
            let _ = self.supervisor.cancel(kind, id).await;
            return Reply::Nothing;
        }

        match self.supervisor.take_response(kind, id, 0).await {
            Ok(Some(bytes)) => Reply::Raw(bytes),
            Ok(None) => Reply::Envelope(Envelope::error(format!("No response found for {id}"))),
            Err(e) => e.into(),
        }
    }

    // ------------------------------------------------------------------------
    // Meta-calls
    // ------------------------------------------------------------------------

    async fn serve_meta(&self, call: &HandlerCall, kind: WorkerKind) -> Reply {
        let method = match call.meta_method() {
            Ok(method) => method,
            Err(e) => return e.into(),
        };
        debug!(connection = self.connection_number, kind = %kind, method = %method, "Meta call");

        let result = match method {
            MetaMethod::AvailableResponses => self.available_responses(kind).await,
            MetaMethod::Response => return self.response_chunk(call, kind).await,
            MetaMethod::ResponseSize => self.response_size(call, kind).await,
            MetaMethod::CancelRequests => self.cancel_requests(call, kind).await,
        };
        match result {
            Ok(value) => Reply::Envelope(Envelope::success(value)),
            Err(reply) => reply,
        }
    }

    async fn available_responses(&self, kind: WorkerKind) -> Result<Value, Reply> {
        let ids = self.supervisor.available_responses(kind).await?;
        Ok(json!(ids.iter().map(|id| id.get()).collect::<Vec<_>>()))
    }

    async fn response_chunk(&self, call: &HandlerCall, kind: WorkerKind) -> Reply {
        let id = match call.request_id() {
            Ok(id) => id,
            Err(e) => return e.into(),
        };
        let max_bytes = call.response_length.unwrap_or(-1);
        match self.supervisor.take_response(kind, id, max_bytes).await {
            Ok(Some(chunk)) => Reply::Raw(chunk),
            Ok(None) => Reply::Envelope(Envelope::error(format!("No response found for {id}"))),
            Err(e) => e.into(),
        }
    }

    async fn response_size(&self, call: &HandlerCall, kind: WorkerKind) -> Result<Value, Reply> {
        let id = call.request_id()?;
        match self.supervisor.response_size(kind, id).await? {
            Some(size) => Ok(json!(size)),
            None => Err(ProtocolError::InvalidRequestId.into()),
        }
    }

    async fn cancel_requests(&self, call: &HandlerCall, kind: WorkerKind) -> Result<Value, Reply> {
        let mut cancelled = Vec::new();
        for id in call.request_ids()? {
            if self.supervisor.cancel(kind, id).await? {
                cancelled.push(id.get());
            }
        }
        Ok(json!(cancelled))
    }
}

/// Waits for `ResponseAvailable` of `id`. Returns `false` if the supervisor
/// is gone.
async fn wait_for_response(
    supervisor: &SupervisorHandle,
    mut events: broadcast::Receiver<SupervisorEvent>,
    kind: WorkerKind,
    id: RequestId,
) -> bool {
    loop {
        match events.recv().await {
            Ok(SupervisorEvent::ResponseAvailable {
                kind: k,
                request_id,
            }) if k == kind && request_id == id => return true,
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped, "Handler connection lagged behind supervisor events");
                if matches!(supervisor.response_size(kind, id).await, Ok(Some(_))) {
                    return true;
                }
            }
            Err(RecvError::Closed) => return false,
        }
    }
}

/// Completes when the peer closes its side of the connection.
async fn peer_closed<R: AsyncRead + Unpin>(reader: &mut R) {
    let mut buf = [0u8; 256];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}
