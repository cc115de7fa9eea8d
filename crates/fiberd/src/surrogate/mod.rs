//! Surrogate process runtime.
//!
//! A surrogate executes service calls for one worker kind of one handler.
//! On start it binds `<SurrogateName>` and sends a HANDSHAKE to
//! `<HandlerName>RequestManager` over a connection it keeps open. The
//! request manager closing that connection tells the surrogate to exit.
//!
//! Every accepted connection carries one footer-framed [`ServiceCall`]; the
//! [`ServiceReply`] goes back footer-framed and the connection is closed.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Bad calls are answered with a failed `ServiceReply`

mod service;

pub use service::{
    Diagnostics, Service, ServiceError, ServiceRegistry, DIAGNOSTICS_COMPONENT, DIAGNOSTICS_OBJECT,
};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fiber_protocol::{
    decode, encode, EndpointError, FrameDecoder, FrameError, FrameReader, Framing, Listener,
    ServiceCall, ServiceReply, SurrogateContact,
};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::FiberContext;

const CORRUPT_REQUEST: &str = "Corrupt data received as request";

/// Errors that stop a surrogate process.
#[derive(Debug, Error)]
pub enum SurrogateError {
    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// The surrogate process.
pub struct SurrogateServer {
    name: String,
    manager: String,
    ctx: FiberContext,
    registry: Arc<ServiceRegistry>,
    connection_counter: AtomicU64,
}

impl SurrogateServer {
    /// `name` is the surrogate's own endpoint, `manager` the request manager
    /// endpoint it reports to.
    pub fn new(
        name: impl Into<String>,
        manager: impl Into<String>,
        ctx: FiberContext,
        registry: ServiceRegistry,
    ) -> Self {
        Self {
            name: name.into(),
            manager: manager.into(),
            ctx,
            registry: Arc::new(registry),
            connection_counter: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Serves calls until the request manager hangs up or `shutdown` fires.
    ///
    /// # Errors
    ///
    /// Fails if the endpoint cannot be bound or the request manager cannot
    /// be reached for the handshake.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), SurrogateError> {
        let listener = Listener::bind(self.ctx.endpoints(), &self.name)?;
        let socket = listener.path().to_string_lossy().into_owned();
        info!(surrogate = %self.name, socket = %socket, "Surrogate server listening");

        let manager_path = self.ctx.endpoints().path_for(&self.manager);
        let dialer = self.ctx.dialer();
        let mut manager = dialer.connect(&manager_path).await?;
        let handshake = encode(
            &SurrogateContact::handshake(self.name.as_str(), socket.as_str()),
            Framing::Footer,
        )?;
        dialer.write(&mut manager, &manager_path, &handshake).await?;
        debug!(surrogate = %self.name, manager = %self.manager, "Handshake sent");

        let read_timeout = self.ctx.config().read_timeout();
        let write_timeout = self.ctx.config().write_timeout();

        let manager_closed = async {
            let mut buf = [0u8; 256];
            loop {
                match manager.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
            }
        };
        tokio::pin!(manager_closed);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(surrogate = %self.name, "Surrogate shutdown requested");
                    break;
                }

                _ = &mut manager_closed => {
                    info!(surrogate = %self.name, "Handler disconnected; shutting down");
                    break;
                }

                accepted = listener.accept() => match accepted {
                    Ok(stream) => {
                        let conn_num = self.connection_counter.fetch_add(1, Ordering::Relaxed);
                        debug!(surrogate = %self.name, connection = conn_num, "New connection");
                        tokio::spawn(serve_connection(
                            stream,
                            Arc::clone(&self.registry),
                            self.name.clone(),
                            read_timeout,
                            write_timeout,
                        ));
                    }
                    Err(e) => error!(error = %e, "Failed to accept connection"),
                },
            }
        }

        drop(listener);
        info!(surrogate = %self.name, "Surrogate stopped");
        Ok(())
    }
}

async fn serve_connection(
    mut stream: UnixStream,
    registry: Arc<ServiceRegistry>,
    server: String,
    read_timeout: Duration,
    write_timeout: Duration,
) {
    let mut reader = FrameReader::new(&mut stream, FrameDecoder::strict());
    let reply = match timeout(read_timeout, reader.next_frame()).await {
        Ok(Ok(Some(frame))) => execute(&registry, &frame, &server).await,
        Ok(Ok(None)) => return,
        Ok(Err(e)) => {
            warn!(surrogate = %server, error = %e, "Unreadable request");
            ServiceReply::failed(CORRUPT_REQUEST, server.as_str())
        }
        Err(_) => {
            debug!(surrogate = %server, "Timed out waiting for request");
            return;
        }
    };

    let bytes = match encode(&reply, Framing::Footer) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(surrogate = %server, error = %e, "Failed to serialize reply");
            return;
        }
    };
    let write = async {
        stream.write_all(&bytes).await?;
        stream.flush().await?;
        stream.shutdown().await
    };
    match timeout(write_timeout, write).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(surrogate = %server, error = %e, "Failed to write reply"),
        Err(_) => debug!(surrogate = %server, "Timed out writing reply"),
    }
}

/// Decodes one call and runs it.
async fn execute(registry: &ServiceRegistry, frame: &[u8], server: &str) -> ServiceReply {
    let value = match decode(frame) {
        Ok(value @ Value::Object(_)) => value,
        _ => return ServiceReply::failed(CORRUPT_REQUEST, server),
    };
    let call: ServiceCall = match serde_json::from_value(value) {
        Ok(call) => call,
        Err(_) => return ServiceReply::failed(ServiceError::InsufficientData.to_string(), server),
    };

    debug!(
        surrogate = %server,
        component = %call.service_component,
        object = %call.service_object,
        method = %call.service_method,
        "Invoking service"
    );
    match registry.invoke(&call).await {
        Ok(result) => ServiceReply::ok(result, server),
        Err(e) => {
            info!(surrogate = %server, method = %call.service_method, error = %e, "Service call failed");
            ServiceReply::failed(e.to_string(), server)
        }
    }
}
