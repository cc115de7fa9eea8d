//! Front door of the Fiber daemon.
//!
//! The front door:
//! - Listens on the main endpoint (`Fiber` by default)
//! - Spawns a ConnectionHandler for each client
//! - Serves `HANDLER`, `SESSION_MGMT` and `FIBER_CONTROL` requests
//! - Supports graceful shutdown via CancellationToken
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │    FrontDoor    │
//! │   (Listener)    │
//! └───────┬─────────┘
//!         │ accept()
//!         ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │ConnectionHandler│────▶│  RouterHandle   │
//! │ (per request)   │◀────│  (+ events)     │
//! └─────────────────┘     └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Accept errors are logged and the server keeps accepting

mod connection;

pub use connection::{ConnectionError, ConnectionHandler, ConnectionTimeouts};

use std::sync::atomic::{AtomicU64, Ordering};

use fiber_protocol::{EndpointError, Listener};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::context::FiberContext;
use crate::router::RouterHandle;

/// Front-door server.
pub struct FrontDoor {
    ctx: FiberContext,
    router: RouterHandle,
    cancel_token: CancellationToken,
    connection_counter: AtomicU64,
}

impl FrontDoor {
    /// Creates the front door.
    ///
    /// Cancelling `cancel_token` stops it; a `FIBER_CONTROL terminate`
    /// request cancels the same token.
    pub fn new(ctx: FiberContext, router: RouterHandle, cancel_token: CancellationToken) -> Self {
        Self {
            ctx,
            router,
            cancel_token,
            connection_counter: AtomicU64::new(0),
        }
    }

    /// Binds the main endpoint and serves until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::Endpoint` if the endpoint cannot be bound.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = Listener::bind(self.ctx.endpoints(), &self.ctx.config().endpoints.main)?;
        info!(socket = %listener.path().display(), "Fiber listening");

        let config = self.ctx.config();
        let timeouts = ConnectionTimeouts {
            read: config.read_timeout(),
            write: config.write_timeout(),
            handshake: config.handshake_timeout(),
        };

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Front door shutdown requested");
                    break;
                }

                result = listener.accept() => match result {
                    Ok(stream) => {
                        let conn_num = self.connection_counter.fetch_add(1, Ordering::Relaxed);
                        let handler = ConnectionHandler::new(
                            stream,
                            self.router.clone(),
                            self.cancel_token.clone(),
                            timeouts,
                            conn_num,
                        );
                        tokio::spawn(handler.run());
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                },
            }
        }

        // Dropping the listener removes the socket file
        drop(listener);
        info!("Front door closed");
        Ok(())
    }
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to set up front door: {0}")]
    Endpoint(#[from] EndpointError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_server_error_display() {
        let err = ServerError::from(EndpointError::NoResponse {
            path: PathBuf::from("/tmp/fiber/Fiber"),
        });
        assert!(err.to_string().contains("/tmp/fiber/Fiber"));
    }
}
