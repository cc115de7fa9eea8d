//! Error types for the Fiber client.
//!
//! **Panic-Free Policy:** This module follows the project's panic-free guidelines.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use fiber_protocol::{EndpointError, FrameError};
use thiserror::Error;

/// Client errors.
///
/// `Remote` carries the `error` field of an error envelope verbatim, so
/// callers can show exactly what the daemon or handler said.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The endpoint could not be reached or did not answer in time.
    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    /// The peer answered with an error envelope.
    #[error("{0}")]
    Remote(String),

    /// The peer answered with something that is not a known reply shape.
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl ClientError {
    /// Whether retrying the same request could succeed.
    ///
    /// Only connection failures qualify; a request that reached the peer
    /// may already have had side effects.
    #[must_use]
    pub fn is_connect_failure(&self) -> bool {
        matches!(
            self,
            ClientError::Endpoint(EndpointError::Connect { .. })
                | ClientError::Endpoint(EndpointError::Timeout {
                    stage: "connecting to",
                    ..
                })
        )
    }
}

/// Result alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_remote_error_is_verbatim() {
        let err = ClientError::Remote("Invalid session requested.".into());
        assert_eq!(err.to_string(), "Invalid session requested.");
    }

    #[test]
    fn test_connect_failures_are_retryable() {
        let refused = ClientError::from(EndpointError::Connect {
            path: PathBuf::from("/tmp/Fiber"),
            error: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        });
        assert!(refused.is_connect_failure());

        let slow_read = ClientError::from(EndpointError::Timeout {
            path: PathBuf::from("/tmp/Fiber"),
            stage: "waiting for response from",
        });
        assert!(!slow_read.is_connect_failure());
        assert!(!ClientError::Remote("x".into()).is_connect_failure());
    }
}
