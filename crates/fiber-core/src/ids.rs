//! Identifiers used across the Fiber process graph.
//!
//! - [`SessionId`]: client session, UUID v4 generated by the router
//! - [`HandlerName`]: `Handler<N>` endpoint name of a handler process
//! - [`RequestId`]: per-kind request counter inside a handler, never 0

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;
use crate::kind::WorkerKind;

/// Session name accepted by the router without a prior `create`.
pub const NULL_SESSION: &str = "NULL";

/// Prefix shared by all handler endpoint names.
const HANDLER_PREFIX: &str = "Handler";

/// Suffix of the endpoint a handler's surrogates report to.
const REQUEST_MANAGER_SUFFIX: &str = "RequestManager";

// ============================================================================
// Session Identifier
// ============================================================================

/// Unique identifier for a client session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Wraps an existing session string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh random session id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The stateless `"NULL"` session.
    pub fn null() -> Self {
        Self(NULL_SESSION.to_string())
    }

    /// Whether this is the stateless `"NULL"` session.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.0 == NULL_SESSION
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Handler Name
// ============================================================================

/// Endpoint name of a handler process (`Handler1`, `Handler2`, ...).
///
/// The same string is used as the listening endpoint, as the process
/// argument, and as the prefix of its surrogate and request-manager
/// endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandlerName(String);

impl HandlerName {
    /// Builds the name for the `index`-th handler of a router.
    pub fn from_index(index: u64) -> Self {
        Self(format!("{HANDLER_PREFIX}{index}"))
    }

    /// Validates a name received from the command line or the wire.
    ///
    /// Names must be non-empty and usable as a single path component.
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        let invalid = raw.is_empty()
            || raw.contains('/')
            || raw.contains('\0')
            || raw == "."
            || raw == "..";
        if invalid {
            return Err(DomainError::InvalidHandlerName {
                value: raw.to_string(),
            });
        }
        Ok(Self(raw.to_string()))
    }

    /// Endpoint name of this handler's surrogate for `kind`.
    pub fn surrogate_name(&self, kind: WorkerKind) -> String {
        format!("{}{}", self.0, kind.surrogate_suffix())
    }

    /// Endpoint name surrogates send their handshake to.
    pub fn request_manager_name(&self) -> String {
        format!("{}{REQUEST_MANAGER_SUFFIX}", self.0)
    }

    /// Which kind a surrogate endpoint name belongs to, if any.
    pub fn kind_of_surrogate(&self, surrogate_name: &str) -> Option<WorkerKind> {
        WorkerKind::ALL
            .into_iter()
            .find(|kind| self.surrogate_name(*kind) == surrogate_name)
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HandlerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for HandlerName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Request Identifier
// ============================================================================

/// Identifier of a request queued in a handler's supervisor.
///
/// Zero is reserved as "invalid" and is never handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    /// The reserved invalid id.
    pub const INVALID: RequestId = RequestId(0);

    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic allocator for [`RequestId`]s that skips zero.
#[derive(Debug, Default)]
pub struct RequestIdAllocator {
    last: u64,
}

impl RequestIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next id. Wraps around past `u64::MAX` without ever
    /// yielding zero.
    pub fn allocate(&mut self) -> RequestId {
        self.last = self.last.wrapping_add(1);
        if self.last == 0 {
            self.last = 1;
        }
        RequestId(self.last)
    }
}
