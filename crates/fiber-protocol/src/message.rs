//! Typed messages for every Fiber connection.
//!
//! | Connection                  | Message types                              |
//! |-----------------------------|--------------------------------------------|
//! | client → front door         | [`FrontDoorRequest`] → [`Envelope`]        |
//! | handler → FiberControl      | [`HandlerContact`] (persistent)            |
//! | client → handler            | [`HandlerCall`] + service fields           |
//! | surrogate → RequestManager  | [`SurrogateContact`] (persistent)          |
//! | handler → surrogate         | [`ServiceCall`] → [`ServiceReply`]         |

use std::fmt;
use std::str::FromStr;

use fiber_core::{RequestId, SessionId, WorkerKind};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Protocol-level failures reported back to the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid request format received as request")]
    InvalidFormat,

    #[error("Unrecognized request")]
    UnrecognizedRequest(String),

    #[error("Unrecognized control command")]
    UnrecognizedControlCommand(String),

    #[error("Unrecognized request")]
    UnrecognizedSessionCommand(String),

    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Invalid session type")]
    InvalidSessionType(String),

    #[error("Invalid meta method requested")]
    InvalidMetaMethod(String),

    #[error("Invalid request ID")]
    InvalidRequestId,

    #[error("No request ID provided")]
    NoRequestIds,
}

// ============================================================================
// Envelope
// ============================================================================

/// Standard response envelope.
///
/// Success: `{"success":true,"result":<v>,"error":""}`.
/// Failure: `{"success":false,"result":null,"error":"<msg>"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub success: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: String,
    #[serde(
        rename = "sessionName",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub session_name: Option<String>,
}

impl Envelope {
    pub fn success(result: impl Into<Value>) -> Self {
        Self {
            success: true,
            result: result.into(),
            error: String::new(),
            session_name: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            result: Value::Null,
            error: message.into(),
            session_name: None,
        }
    }

    #[must_use]
    pub fn with_session_name(mut self, session: impl Into<String>) -> Self {
        self.session_name = Some(session.into());
        self
    }

    /// Reads an envelope out of a response value, if it is one.
    pub fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        if !object.contains_key("success") {
            return None;
        }
        serde_json::from_value(value.clone()).ok()
    }
}

// ============================================================================
// Front Door Requests
// ============================================================================

/// Values of the mandatory `requestType` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Handler,
    FiberControl,
    SessionMgmt,
}

impl RequestType {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestType::Handler => "HANDLER",
            RequestType::FiberControl => "FIBER_CONTROL",
            RequestType::SessionMgmt => "SESSION_MGMT",
        }
    }
}

impl FromStr for RequestType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HANDLER" => Ok(RequestType::Handler),
            "FIBER_CONTROL" => Ok(RequestType::FiberControl),
            "SESSION_MGMT" => Ok(RequestType::SessionMgmt),
            other => Err(ProtocolError::UnrecognizedRequest(other.to_string())),
        }
    }
}

/// `controlCommand` of a `FIBER_CONTROL` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Terminate,
}

/// `sessionCommand` of a `SESSION_MGMT` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    Create,
    Terminate,
}

/// A parsed front-door request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrontDoorRequest {
    /// Resolve (or spawn) the handler for a session.
    Handler { session_name: SessionId },
    /// Operator control of the daemon.
    Control(ControlCommand),
    /// Create a session for a client address.
    CreateSession { client_address: String },
    /// Destroy a session.
    TerminateSession { session_name: SessionId },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFrontDoorRequest {
    request_type: Option<String>,
    session_name: Option<String>,
    control_command: Option<String>,
    session_command: Option<String>,
    #[serde(rename = "clientIP")]
    client_ip: Option<String>,
}

impl FrontDoorRequest {
    /// Parses a decoded request object.
    pub fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        if !value.is_object() {
            return Err(ProtocolError::InvalidFormat);
        }
        let raw: RawFrontDoorRequest =
            serde_json::from_value(value.clone()).map_err(|_| ProtocolError::InvalidFormat)?;
        let request_type: RequestType = raw
            .request_type
            .as_deref()
            .ok_or(ProtocolError::InvalidFormat)?
            .parse()?;

        match request_type {
            RequestType::Handler => Ok(FrontDoorRequest::Handler {
                session_name: raw
                    .session_name
                    .map(SessionId::from)
                    .unwrap_or_else(SessionId::null),
            }),
            RequestType::FiberControl => {
                let command = raw.control_command.unwrap_or_default();
                if command.eq_ignore_ascii_case("terminate") {
                    Ok(FrontDoorRequest::Control(ControlCommand::Terminate))
                } else {
                    Err(ProtocolError::UnrecognizedControlCommand(command))
                }
            }
            RequestType::SessionMgmt => {
                let command = raw.session_command.unwrap_or_default();
                if command.eq_ignore_ascii_case("create") {
                    Ok(FrontDoorRequest::CreateSession {
                        client_address: raw.client_ip.unwrap_or_default(),
                    })
                } else if command.eq_ignore_ascii_case("terminate") {
                    let session = raw
                        .session_name
                        .ok_or(ProtocolError::MissingField("sessionName"))?;
                    Ok(FrontDoorRequest::TerminateSession {
                        session_name: SessionId::from(session),
                    })
                } else {
                    Err(ProtocolError::UnrecognizedSessionCommand(command))
                }
            }
        }
    }

    /// Wire form, as a client sends it.
    pub fn to_value(&self) -> Value {
        match self {
            FrontDoorRequest::Handler { session_name } => json!({
                "requestType": RequestType::Handler.as_str(),
                "sessionName": session_name.as_str(),
            }),
            FrontDoorRequest::Control(ControlCommand::Terminate) => json!({
                "requestType": RequestType::FiberControl.as_str(),
                "controlCommand": "terminate",
            }),
            FrontDoorRequest::CreateSession { client_address } => json!({
                "requestType": RequestType::SessionMgmt.as_str(),
                "sessionCommand": "create",
                "clientIP": client_address,
            }),
            FrontDoorRequest::TerminateSession { session_name } => json!({
                "requestType": RequestType::SessionMgmt.as_str(),
                "sessionCommand": "terminate",
                "sessionName": session_name.as_str(),
            }),
        }
    }
}

// ============================================================================
// Handshakes
// ============================================================================

/// `contactType` of a handshake message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ContactType {
    Handshake,
    Suicide,
}

/// Message a handler sends to `FiberControl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerContact {
    pub contact_type: ContactType,
    pub handler_name: String,
    pub handler_socket: String,
}

impl HandlerContact {
    pub fn handshake(name: impl Into<String>, socket: impl Into<String>) -> Self {
        Self {
            contact_type: ContactType::Handshake,
            handler_name: name.into(),
            handler_socket: socket.into(),
        }
    }

    pub fn suicide(name: impl Into<String>, socket: impl Into<String>) -> Self {
        Self {
            contact_type: ContactType::Suicide,
            handler_name: name.into(),
            handler_socket: socket.into(),
        }
    }
}

/// Message a surrogate sends to its handler's `RequestManager` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SurrogateContact {
    pub contact_type: ContactType,
    pub surrogate_name: String,
    pub surrogate_socket: String,
}

impl SurrogateContact {
    pub fn handshake(name: impl Into<String>, socket: impl Into<String>) -> Self {
        Self {
            contact_type: ContactType::Handshake,
            surrogate_name: name.into(),
            surrogate_socket: socket.into(),
        }
    }
}

// ============================================================================
// Handler Calls
// ============================================================================

/// Meta-methods served by a handler without touching a surrogate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaMethod {
    AvailableResponses,
    Response,
    ResponseSize,
    CancelRequests,
}

impl MetaMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            MetaMethod::AvailableResponses => "availableResponses",
            MetaMethod::Response => "response",
            MetaMethod::ResponseSize => "responseSize",
            MetaMethod::CancelRequests => "cancelRequests",
        }
    }
}

impl fmt::Display for MetaMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetaMethod {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "availableResponses" => Ok(MetaMethod::AvailableResponses),
            "response" => Ok(MetaMethod::Response),
            "responseSize" => Ok(MetaMethod::ResponseSize),
            "cancelRequests" => Ok(MetaMethod::CancelRequests),
            other => Err(ProtocolError::InvalidMetaMethod(other.to_string())),
        }
    }
}

/// Routing fields of a request sent to a handler.
///
/// The same object carries the [`ServiceCall`] fields, which the handler
/// forwards untouched to the surrogate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocking_call: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta_call: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta_method: Option<String>,
    #[serde(rename = "requestID", default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_length: Option<i64>,
    #[serde(rename = "requestIDs", default, skip_serializing_if = "Option::is_none")]
    pub request_ids: Option<Vec<i64>>,
}

impl HandlerCall {
    pub fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        if !value.is_object() {
            return Err(ProtocolError::InvalidFormat);
        }
        serde_json::from_value(value.clone()).map_err(|_| ProtocolError::InvalidFormat)
    }

    /// A meta-call of `method` against the `kind` queues.
    pub fn meta(kind: WorkerKind, method: MetaMethod) -> Self {
        Self {
            session_type: Some(kind.as_str().to_string()),
            meta_call: Some(true),
            meta_method: Some(method.as_str().to_string()),
            ..Self::default()
        }
    }

    /// Worker kind, `CORE` when absent.
    pub fn kind(&self) -> Result<WorkerKind, ProtocolError> {
        match self.session_type.as_deref() {
            None => Ok(WorkerKind::Core),
            Some(raw) => raw
                .parse()
                .map_err(|_| ProtocolError::InvalidSessionType(raw.to_string())),
        }
    }

    /// Blocking unless `blockingCall` is explicitly false.
    pub fn is_blocking(&self) -> bool {
        self.blocking_call.unwrap_or(true)
    }

    pub fn is_meta(&self) -> bool {
        self.meta_call.unwrap_or(false)
    }

    /// The `requestID` of a meta-call. Missing or non-positive ids are
    /// invalid.
    pub fn request_id(&self) -> Result<RequestId, ProtocolError> {
        self.request_id
            .and_then(|raw| u64::try_from(raw).ok())
            .map(RequestId::new)
            .filter(|id| id.is_valid())
            .ok_or(ProtocolError::InvalidRequestId)
    }

    /// The `requestIDs` of a cancel call, skipping unusable entries.
    pub fn request_ids(&self) -> Result<Vec<RequestId>, ProtocolError> {
        match self.request_ids.as_deref() {
            None | Some([]) => Err(ProtocolError::NoRequestIds),
            Some(raw) => Ok(raw
                .iter()
                .filter_map(|id| u64::try_from(*id).ok())
                .map(RequestId::new)
                .filter(|id| id.is_valid())
                .collect()),
        }
    }

    pub fn meta_method(&self) -> Result<MetaMethod, ProtocolError> {
        self.meta_method
            .as_deref()
            .unwrap_or_default()
            .parse()
    }

    /// Serializes the routing fields merged over `service` fields.
    pub fn merge_into(&self, service: Value) -> Value {
        let mut object = match service {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        if let Ok(Value::Object(routing)) = serde_json::to_value(self) {
            object.extend(routing);
        }
        Value::Object(object)
    }
}

// ============================================================================
// Service Calls
// ============================================================================

/// The work item a surrogate executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceCall {
    pub service_component: String,
    pub service_object: String,
    pub service_method: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl ServiceCall {
    pub fn new(
        component: impl Into<String>,
        object: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            service_component: component.into(),
            service_object: object.into(),
            service_method: method.into(),
            args: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_arg(mut self, arg: impl Into<Value>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Liveness probe answered by every surrogate.
    pub fn ping() -> Self {
        Self::new("Fiber", "Diagnostics", "ping")
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// A surrogate's answer to one [`ServiceCall`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceReply {
    pub success: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub server: String,
}

impl ServiceReply {
    pub fn ok(result: Value, server: impl Into<String>) -> Self {
        Self {
            success: true,
            result,
            error: String::new(),
            server: server.into(),
        }
    }

    pub fn failed(error: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            success: false,
            result: Value::Null,
            error: error.into(),
            server: server.into(),
        }
    }
}
