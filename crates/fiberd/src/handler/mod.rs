//! Handler process runtime.
//!
//! A handler serves the sessions the router bound to it. On start it:
//! 1. Binds its own endpoint (`Handler<N>`)
//! 2. Starts its supervisor, which binds `Handler<N>RequestManager`
//! 3. Sends a HANDSHAKE to `FiberControl` and keeps that connection open
//!
//! The router closing the control connection tells the handler to exit.
//! When idle for long enough the handler sends SUICIDE on the same
//! connection and waits for the router to close it.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Startup failures are returned as `HandlerError`

mod connection;
mod idle;

pub use connection::{HandlerConnection, HandlerTimeouts};
pub use idle::{idle_expiry, IdleTimer, IdleVerdict};

use std::future::{pending, Future};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use fiber_core::HandlerName;
use fiber_protocol::{encode, EndpointError, FrameError, Framing, HandlerContact, Listener};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::FiberContext;
use crate::supervisor::{spawn_supervisor, SupervisorError};

/// Errors that stop a handler process.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    #[error("Failed to start request manager: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// The handler process.
pub struct HandlerServer {
    name: HandlerName,
    ctx: FiberContext,
    connection_counter: AtomicU64,
}

impl HandlerServer {
    pub fn new(name: HandlerName, ctx: FiberContext) -> Self {
        Self {
            name,
            ctx,
            connection_counter: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &HandlerName {
        &self.name
    }

    /// Runs the handler until the router lets go of it or `shutdown` fires.
    ///
    /// # Errors
    ///
    /// Fails if an endpoint cannot be bound or the router cannot be reached
    /// for the handshake.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), HandlerError> {
        let config = self.ctx.config();
        let listener = Listener::bind(self.ctx.endpoints(), self.name.as_str())?;
        let socket = listener.path().to_string_lossy().into_owned();
        info!(handler = %self.name, socket = %socket, "Fiber handler listening");

        let supervisor = spawn_supervisor(self.name.clone(), self.ctx.clone())?;

        let control_path = self.ctx.endpoints().path_for(&config.endpoints.control);
        let dialer = self.ctx.dialer();
        let mut control = dialer.connect(&control_path).await?;
        let handshake = encode(
            &HandlerContact::handshake(self.name.as_str(), socket.as_str()),
            Framing::Footer,
        )?;
        dialer.write(&mut control, &control_path, &handshake).await?;
        debug!(handler = %self.name, "Handshake sent to router");

        let activity = Arc::new(AtomicBool::new(false));
        let timeouts = HandlerTimeouts {
            read: config.read_timeout(),
            write: config.write_timeout(),
        };

        let mut idle: Pin<Box<dyn Future<Output = ()> + Send>> =
            if config.auto_time_out.kill_on_time_out {
                Box::pin(idle_expiry(
                    supervisor.clone(),
                    Arc::clone(&activity),
                    IdleTimer::new(config.refresh_interval(), config.time_out_interval()),
                ))
            } else {
                Box::pin(pending())
            };

        let (mut control_rx, mut control_tx) = control.split();
        let control_closed = async {
            let mut buf = [0u8; 256];
            loop {
                match control_rx.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
            }
        };
        tokio::pin!(control_closed);

        let suicide_deadline = sleep(config.handshake_timeout());
        tokio::pin!(suicide_deadline);
        let mut suicide_sent = false;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(handler = %self.name, "Handler shutdown requested");
                    break;
                }

                _ = &mut control_closed => {
                    info!(handler = %self.name, "Fiber disconnected; shutting down");
                    break;
                }

                _ = &mut idle, if !suicide_sent => {
                    info!(
                        handler = %self.name,
                        timeout_ms = config.auto_time_out.time_out_interval,
                        "Terminating because idle timeout encountered"
                    );
                    let letter = encode(
                        &HandlerContact::suicide(self.name.as_str(), socket.as_str()),
                        Framing::Footer,
                    )?;
                    if let Err(e) = control_tx.write_all(&letter).await {
                        warn!(handler = %self.name, error = %e, "Failed to send suicide letter");
                        break;
                    }
                    suicide_sent = true;
                    suicide_deadline
                        .as_mut()
                        .reset(Instant::now() + config.handshake_timeout());
                }

                _ = &mut suicide_deadline, if suicide_sent => {
                    warn!(handler = %self.name, "Router did not answer the suicide letter");
                    break;
                }

                accepted = listener.accept() => match accepted {
                    Ok(stream) => {
                        let conn_num = self.connection_counter.fetch_add(1, Ordering::Relaxed);
                        let connection = HandlerConnection::new(
                            stream,
                            supervisor.clone(),
                            Arc::clone(&activity),
                            timeouts,
                            conn_num,
                        );
                        tokio::spawn(connection.run());
                    }
                    Err(e) => error!(error = %e, "Failed to accept connection"),
                },
            }
        }

        if let Err(e) = supervisor.shutdown().await {
            debug!(handler = %self.name, error = %e, "Request manager already stopped");
        }
        drop(listener);
        info!(handler = %self.name, "Handler stopped");
        Ok(())
    }
}
