//! Clients for the Fiber front door and for handler processes.
//!
//! [`FiberClient`] talks to the front door: session management, handler
//! lookup and daemon control. [`HandlerClient`] talks to one handler
//! process: service calls and the response meta-calls.
//!
//! **Panic-Free Policy:** This module follows the project's panic-free guidelines.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use fiber_core::{FiberConfig, RequestId, SessionId, WorkerKind};
use fiber_protocol::{
    decode, encode, ControlCommand, Dialer, EndpointDir, Envelope, Framing, FrontDoorRequest,
    HandlerCall, MetaMethod, ServiceCall, ServiceReply,
};
use serde_json::{json, Value};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{ClientError, Result};

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for Fiber clients.
///
/// # Example
///
/// ```rust
/// use fiber_client::ClientConfig;
/// use std::time::Duration;
///
/// let config = ClientConfig {
///     runtime_dir: std::path::PathBuf::from("/run/fiber"),
///     retry_attempts: 0,
///     ..Default::default()
/// };
/// assert_eq!(config.main, "Fiber");
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Directory holding the endpoint sockets.
    pub runtime_dir: PathBuf,

    /// Front door endpoint name.
    pub main: String,

    /// Handler handshake endpoint name, used for liveness checks.
    pub control: String,

    pub connect_timeout: Duration,

    /// Bound on waiting for a reply. `None` waits as long as the peer lives,
    /// which suits blocking service calls.
    pub read_timeout: Option<Duration>,

    pub write_timeout: Duration,

    /// Extra attempts when the front door refuses the connection.
    pub retry_attempts: u32,

    /// Delay before the first retry.
    pub retry_initial_delay: Duration,

    /// Maximum delay between retries.
    pub retry_max_delay: Duration,

    /// Multiplier for exponential backoff.
    pub retry_multiplier: f64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::from_fiber_config(&FiberConfig::default())
    }
}

impl ClientConfig {
    /// Client settings matching a daemon configuration.
    pub fn from_fiber_config(config: &FiberConfig) -> Self {
        Self {
            runtime_dir: config.runtime_dir(),
            main: config.endpoints.main.clone(),
            control: config.endpoints.control.clone(),
            connect_timeout: config.connect_timeout(),
            read_timeout: Some(config.read_timeout()),
            write_timeout: config.write_timeout(),
            retry_attempts: 3,
            retry_initial_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(2),
            retry_multiplier: 2.0,
        }
    }

    fn dialer(&self) -> Dialer {
        Dialer::new(self.connect_timeout, self.read_timeout).with_write_timeout(self.write_timeout)
    }

    fn endpoints(&self) -> EndpointDir {
        EndpointDir::new(&self.runtime_dir)
    }
}

// ============================================================================
// Front Door Client
// ============================================================================

/// Client of the front door.
#[derive(Debug, Clone)]
pub struct FiberClient {
    config: ClientConfig,
    dialer: Dialer,
    main_path: PathBuf,
    control_path: PathBuf,
}

impl FiberClient {
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        let endpoints = config.endpoints();
        Self {
            dialer: config.dialer(),
            main_path: endpoints.path_for(&config.main),
            control_path: endpoints.path_for(&config.control),
            config,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Creates a session for `client_address`.
    pub async fn create_session(&self, client_address: &str) -> Result<SessionId> {
        let request = FrontDoorRequest::CreateSession {
            client_address: client_address.to_string(),
        };
        let result = expect_success(self.send(&request).await?)?;
        result
            .as_str()
            .map(SessionId::from)
            .ok_or_else(|| ClientError::UnexpectedResponse(result.to_string()))
    }

    /// Terminates `session`. Returns whether the session existed.
    pub async fn terminate_session(&self, session: &SessionId) -> Result<bool> {
        let request = FrontDoorRequest::TerminateSession {
            session_name: session.clone(),
        };
        let value = self.send(&request).await?;
        match Envelope::from_value(&value) {
            Some(envelope) if envelope.success || envelope.error.is_empty() => Ok(envelope.success),
            Some(envelope) => Err(ClientError::Remote(envelope.error)),
            None => Err(ClientError::UnexpectedResponse(value.to_string())),
        }
    }

    /// Socket path of the handler serving `session`, spawning one if needed.
    ///
    /// Pass [`SessionId::null`] for stateless calls.
    pub async fn handler_socket(&self, session: &SessionId) -> Result<PathBuf> {
        let request = FrontDoorRequest::Handler {
            session_name: session.clone(),
        };
        let value = self.send(&request).await?;
        if let Some(path) = value.get("handlerName").and_then(Value::as_str) {
            return Ok(PathBuf::from(path));
        }
        match Envelope::from_value(&value) {
            Some(envelope) => Err(ClientError::Remote(envelope.error)),
            None => Err(ClientError::UnexpectedResponse(value.to_string())),
        }
    }

    /// Client for the handler serving `session`.
    pub async fn handler(&self, session: &SessionId) -> Result<HandlerClient> {
        let socket = self.handler_socket(session).await?;
        Ok(HandlerClient::new(socket, &self.config))
    }

    /// Asks the daemon to stop.
    pub async fn terminate_daemon(&self) -> Result<()> {
        let request = FrontDoorRequest::Control(ControlCommand::Terminate);
        expect_success(self.send(&request).await?)?;
        Ok(())
    }

    /// Whether the front door accepts connections.
    pub async fn front_door_alive(&self) -> bool {
        self.dialer.probe(&self.main_path).await
    }

    /// Whether the router's handshake endpoint accepts connections.
    pub async fn control_alive(&self) -> bool {
        self.dialer.probe(&self.control_path).await
    }

    /// Sends one front-door request, retrying refused connections with
    /// exponential backoff.
    async fn send(&self, request: &FrontDoorRequest) -> Result<Value> {
        let payload = request.to_value();
        let mut delay = self.config.retry_initial_delay;
        let mut attempt = 0;

        loop {
            match self
                .dialer
                .request(&self.main_path, &payload, Framing::Close)
                .await
                .map_err(ClientError::from)
            {
                Ok(value) => return Ok(value),
                Err(e) if e.is_connect_failure() && attempt < self.config.retry_attempts => {
                    attempt += 1;
                    warn!(
                        socket = %self.main_path.display(),
                        attempt,
                        delay = ?delay,
                        error = %e,
                        "Front door not reachable, retrying"
                    );
                    sleep(delay).await;
                    delay = self.next_delay(delay);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn next_delay(&self, current: Duration) -> Duration {
        let next = current.mul_f64(self.config.retry_multiplier);
        next.min(self.config.retry_max_delay)
    }
}

// ============================================================================
// Handler Client
// ============================================================================

/// Client of one handler process.
///
/// Every call opens its own connection. A blocking call keeps it open until
/// the response arrives; dropping the future closes the connection, which
/// cancels the request.
#[derive(Debug, Clone)]
pub struct HandlerClient {
    socket: PathBuf,
    dialer: Dialer,
}

impl HandlerClient {
    pub fn new(socket: impl Into<PathBuf>, config: &ClientConfig) -> Self {
        Self {
            socket: socket.into(),
            dialer: config.dialer(),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Runs `call` on a `kind` surrogate and waits for its reply.
    pub async fn call(&self, kind: WorkerKind, call: &ServiceCall) -> Result<ServiceReply> {
        let routing = HandlerCall {
            session_type: Some(kind.as_str().to_string()),
            blocking_call: Some(true),
            ..HandlerCall::default()
        };
        let raw = self.exchange(&routing.merge_into(call.to_value())).await?;
        let value = decode(&raw)?;
        serde_json::from_value(value.clone())
            .map_err(|_| ClientError::UnexpectedResponse(value.to_string()))
    }

    /// Queues `call` without waiting; collect the reply later by id.
    pub async fn submit(&self, kind: WorkerKind, call: &ServiceCall) -> Result<RequestId> {
        let routing = HandlerCall {
            session_type: Some(kind.as_str().to_string()),
            blocking_call: Some(false),
            ..HandlerCall::default()
        };
        let result = self.envelope(&routing.merge_into(call.to_value())).await?;
        result
            .as_u64()
            .map(RequestId::new)
            .ok_or_else(|| ClientError::UnexpectedResponse(result.to_string()))
    }

    /// Ids of `kind` responses waiting to be collected.
    pub async fn available_responses(&self, kind: WorkerKind) -> Result<Vec<RequestId>> {
        let call = HandlerCall::meta(kind, MetaMethod::AvailableResponses);
        let result = self.envelope(&json!(call)).await?;
        parse_ids(&result)
    }

    /// Bytes left in the response of `id`.
    pub async fn response_size(&self, kind: WorkerKind, id: RequestId) -> Result<u64> {
        let call = HandlerCall {
            request_id: Some(id.get() as i64),
            ..HandlerCall::meta(kind, MetaMethod::ResponseSize)
        };
        let result = self.envelope(&json!(call)).await?;
        result
            .as_u64()
            .ok_or_else(|| ClientError::UnexpectedResponse(result.to_string()))
    }

    /// Drains up to `max_bytes` of the response of `id`; zero or less
    /// drains the rest.
    ///
    /// The bytes are returned as stored. A handler that has no such
    /// response answers with an error envelope, which is reported as
    /// [`ClientError::Remote`] when the whole response was requested.
    pub async fn fetch_response(
        &self,
        kind: WorkerKind,
        id: RequestId,
        max_bytes: i64,
    ) -> Result<Bytes> {
        let call = HandlerCall {
            request_id: Some(id.get() as i64),
            response_length: Some(max_bytes),
            ..HandlerCall::meta(kind, MetaMethod::Response)
        };
        let raw = self.exchange(&json!(call)).await?;
        if max_bytes <= 0 {
            if let Some(envelope) = decode(&raw).ok().as_ref().and_then(Envelope::from_value) {
                if !envelope.success && !is_service_reply(&raw) {
                    return Err(ClientError::Remote(envelope.error));
                }
            }
        }
        Ok(raw)
    }

    /// Drains the whole response of `id` and parses it.
    pub async fn take_reply(&self, kind: WorkerKind, id: RequestId) -> Result<ServiceReply> {
        let raw = self.fetch_response(kind, id, 0).await?;
        let value = decode(&raw)?;
        serde_json::from_value(value.clone())
            .map_err(|_| ClientError::UnexpectedResponse(value.to_string()))
    }

    /// Cancels queued requests or drops uncollected responses. Returns the
    /// ids that were found.
    pub async fn cancel_requests(
        &self,
        kind: WorkerKind,
        ids: &[RequestId],
    ) -> Result<Vec<RequestId>> {
        let call = HandlerCall {
            request_ids: Some(ids.iter().map(|id| id.get() as i64).collect()),
            ..HandlerCall::meta(kind, MetaMethod::CancelRequests)
        };
        let result = self.envelope(&json!(call)).await?;
        parse_ids(&result)
    }

    /// Sends one footer-framed message and returns the raw reply.
    ///
    /// The write side stays open: a handler treats a half-closed
    /// connection as a client that went away.
    async fn exchange(&self, payload: &Value) -> Result<Bytes> {
        let message = encode(payload, Framing::Footer)?;
        debug!(socket = %self.socket.display(), "Calling handler");
        let frame = self
            .dialer
            .request_raw(&self.socket, &message, Framing::Footer)
            .await?;
        Ok(frame.freeze())
    }

    async fn envelope(&self, payload: &Value) -> Result<Value> {
        let raw = self.exchange(payload).await?;
        expect_success(decode(&raw)?)
    }
}

/// Unwraps the `result` of a success envelope.
fn expect_success(value: Value) -> Result<Value> {
    match Envelope::from_value(&value) {
        Some(envelope) if envelope.success => Ok(envelope.result),
        Some(envelope) => Err(ClientError::Remote(envelope.error)),
        None => Err(ClientError::UnexpectedResponse(value.to_string())),
    }
}

fn parse_ids(value: &Value) -> Result<Vec<RequestId>> {
    let items = value
        .as_array()
        .ok_or_else(|| ClientError::UnexpectedResponse(value.to_string()))?;
    items
        .iter()
        .map(|item| {
            item.as_u64()
                .map(RequestId::new)
                .ok_or_else(|| ClientError::UnexpectedResponse(value.to_string()))
        })
        .collect()
}

/// Surrogate replies carry a `server` field; handler envelopes do not.
fn is_service_reply(raw: &[u8]) -> bool {
    decode(raw)
        .ok()
        .is_some_and(|value| value.get("server").is_some())
}
