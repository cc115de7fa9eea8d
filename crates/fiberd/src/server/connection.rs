//! Front-door connection handling.
//!
//! Each connection carries exactly one request and receives exactly one
//! response, after which the connection is closed:
//!
//! ```text
//! client                         front door                      router
//!   │ {"requestType":"HANDLER"}     │                               │
//!   │──────────────────────────────▶│ resolve_handler(session) ────▶│
//!   │                               │◀──────────── Handler3 ────────│
//!   │                               │   (wait for HandlerSocketUpdated)
//!   │ {"handlerName":"/run/…/Handler3"}                             │
//!   │◀──────────────────────────────│                               │
//! ```
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Every failure becomes an error envelope for the client

use std::path::PathBuf;
use std::time::Duration;

use fiber_core::{HandlerName, SessionId};
use fiber_protocol::{
    encode, ControlCommand, Envelope, FrameDecoder, FrameError, FrameReader, Framing,
    FrontDoorRequest,
};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::router::{RouterError, RouterEvent, RouterHandle};

/// Errors that end a front-door connection without a response.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Write timeout")]
    WriteTimeout,
}

/// Timeouts applied to one connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionTimeouts {
    pub read: Duration,
    pub write: Duration,
    pub handshake: Duration,
}

/// Reply plus what to do after it was written.
struct Reply {
    body: Value,
    stop_daemon: bool,
}

impl Reply {
    fn of(body: impl Into<Value>) -> Self {
        Self {
            body: body.into(),
            stop_daemon: false,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self::of(envelope_value(Envelope::error(message)))
    }
}

fn envelope_value(envelope: Envelope) -> Value {
    serde_json::to_value(envelope).unwrap_or(Value::Null)
}

/// Serves a single front-door connection.
pub struct ConnectionHandler {
    stream: UnixStream,
    router: RouterHandle,
    shutdown: CancellationToken,
    timeouts: ConnectionTimeouts,
    connection_number: u64,
}

impl ConnectionHandler {
    pub fn new(
        stream: UnixStream,
        router: RouterHandle,
        shutdown: CancellationToken,
        timeouts: ConnectionTimeouts,
        connection_number: u64,
    ) -> Self {
        Self {
            stream,
            router,
            shutdown,
            timeouts,
            connection_number,
        }
    }

    /// Reads the request, answers it and closes the connection.
    pub async fn run(mut self) {
        let reply = self.read_and_process().await;

        if let Err(e) = self.write_reply(&reply.body).await {
            debug!(
                connection = self.connection_number,
                error = %e,
                "Failed to write front door response"
            );
        }

        if reply.stop_daemon {
            info!("Terminating fiber on request");
            self.shutdown.cancel();
        }
    }

    async fn read_and_process(&mut self) -> Reply {
        let mut reader = FrameReader::new(&mut self.stream, FrameDecoder::lenient());
        let value = match timeout(self.timeouts.read, reader.next_value()).await {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                debug!(connection = self.connection_number, error = %e, "Bad front door request");
                return Reply::error(e.to_string());
            }
            Err(_) => return Reply::error("Timed out waiting for request"),
        };

        let request = match FrontDoorRequest::from_value(&value) {
            Ok(request) => request,
            Err(e) => {
                debug!(connection = self.connection_number, error = ?e, "Rejected front door request");
                return Reply::error(e.to_string());
            }
        };

        debug!(connection = self.connection_number, request = ?request, "Front door request");
        self.process(request).await
    }

    async fn process(&self, request: FrontDoorRequest) -> Reply {
        match request {
            FrontDoorRequest::Handler { session_name } => self.process_handler(session_name).await,
            FrontDoorRequest::Control(ControlCommand::Terminate) => Reply {
                body: envelope_value(Envelope::success(Value::Null)),
                stop_daemon: true,
            },
            FrontDoorRequest::CreateSession { client_address } => {
                match self.router.create_session(client_address).await {
                    Ok(session) => Reply::of(envelope_value(Envelope::success(session.as_str()))),
                    Err(e) => Reply::error(e.to_string()),
                }
            }
            FrontDoorRequest::TerminateSession { session_name } => {
                let success = match self.router.terminate_session(session_name.clone()).await {
                    Ok(success) => success,
                    Err(e) => return Reply::error(e.to_string()),
                };
                let envelope = Envelope {
                    success,
                    result: Value::String(String::new()),
                    error: String::new(),
                    session_name: Some(session_name.as_str().to_string()),
                };
                Reply::of(envelope_value(envelope))
            }
        }
    }

    async fn process_handler(&self, session: SessionId) -> Reply {
        // Subscribe first so the handshake cannot slip between the two calls
        let events = self.router.subscribe();

        let handler = match self.router.resolve_handler(session).await {
            Ok(handler) => handler,
            Err(e) => return Reply::error(e.to_string()),
        };

        match self.router.local_socket(handler.clone()).await {
            Ok(Some(socket)) => return handler_reply(&socket),
            Ok(None) => {}
            Err(e) => return Reply::error(e.to_string()),
        }

        match timeout(
            self.timeouts.handshake,
            self.wait_for_socket(&handler, events),
        )
        .await
        {
            Ok(Ok(socket)) => {
                info!(handler = %handler, socket = %socket.display(), "Handler socket updated");
                handler_reply(&socket)
            }
            Ok(Err(message)) => Reply::error(message),
            Err(_) => {
                warn!(handler = %handler, "Timed out waiting for handler handshake");
                Reply::error("Timed out waiting for handler")
            }
        }
    }

    async fn wait_for_socket(
        &self,
        handler: &HandlerName,
        mut events: tokio::sync::broadcast::Receiver<RouterEvent>,
    ) -> Result<PathBuf, String> {
        loop {
            match events.recv().await {
                Ok(RouterEvent::HandlerSocketUpdated { name, socket }) if &name == handler => {
                    return Ok(socket);
                }
                Ok(RouterEvent::HandlerRemoved { name }) if &name == handler => {
                    return Err("Handler terminated before completing its handshake".to_string());
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Front door lagged behind router events");
                    if let Ok(Some(socket)) = self.router.local_socket(handler.clone()).await {
                        return Ok(socket);
                    }
                }
                Err(RecvError::Closed) => {
                    return Err(RouterError::ChannelClosed.to_string());
                }
            }
        }
    }

    async fn write_reply(&mut self, body: &Value) -> Result<(), ConnectionError> {
        let bytes = encode(body, Framing::Close)?;
        timeout(self.timeouts.write, async {
            self.stream.write_all(&bytes).await?;
            self.stream.flush().await?;
            self.stream.shutdown().await?;
            Ok::<(), ConnectionError>(())
        })
        .await
        .map_err(|_| ConnectionError::WriteTimeout)?
    }
}

fn handler_reply(socket: &std::path::Path) -> Reply {
    Reply::of(json!({ "handlerName": socket.to_string_lossy() }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_reply_shape() {
        let reply = handler_reply(std::path::Path::new("/tmp/fiber/Handler1"));
        assert_eq!(reply.body, json!({"handlerName": "/tmp/fiber/Handler1"}));
        assert!(!reply.stop_daemon);
    }

    #[test]
    fn test_error_reply_is_envelope() {
        let reply = Reply::error("Invalid session requested.");
        assert_eq!(
            reply.body,
            json!({"success": false, "result": null, "error": "Invalid session requested."})
        );
    }
}
