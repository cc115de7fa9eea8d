//! Request supervision using the Actor pattern.
//!
//! A handler owns one supervisor. The supervisor queues requests per worker
//! kind, launches a surrogate for a kind on demand, forwards one request at
//! a time to it and keeps the answers until the client collects them.
//! Surrogates that crash or deadlock are replaced and the affected request
//! gets an error response.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐ SupervisorCommand ┌──────────────────┐ ServiceCall ┌───────────┐
//! │ Handler conns   │──────(mpsc)──────▶│ SupervisorActor  │────────────▶│ Surrogate │
//! └─────────────────┘                   └──────────────────┘             └───────────┘
//!         ▲                                │         ▲                       │
//!         │       SupervisorEvent          │         │   SurrogateHandshake  │
//!         └──────────(broadcast)───────────┘  ┌──────┴───────────┐           │
//!                                             │ RequestManager   │◀──────────┘
//!                                             │ listener         │
//!                                             └──────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All operations in this module follow the panic-free policy:
//! - No `.unwrap()` or `.expect()` in production code
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

use std::time::Duration;

use fiber_core::HandlerName;
use fiber_protocol::{FrameDecoder, FrameReader, Listener, SurrogateContact};
use tokio::net::UnixStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::FiberContext;

mod actor;
mod commands;
mod handle;
mod watchdog;

pub use actor::{SupervisorActor, CRASHED, CRASHED_WITH_DEADLOCK, RESTART_LIMIT_REACHED};
pub use commands::{LaneStatus, SupervisorCommand, SupervisorError, SupervisorEvent, WorkerState};
pub use handle::SupervisorHandle;

/// Channel buffer sizes
const COMMAND_BUFFER: usize = 100;
const EVENT_BUFFER: usize = 256;

/// Binds `<handler>RequestManager`, spawns the supervisor actor and its
/// handshake listener, and returns a handle.
///
/// # Errors
///
/// Returns `SupervisorError::Endpoint` if the endpoint cannot be bound.
pub fn spawn_supervisor(
    handler: HandlerName,
    ctx: FiberContext,
) -> Result<SupervisorHandle, SupervisorError> {
    let listener = Listener::bind(ctx.endpoints(), &handler.request_manager_name())?;

    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (event_tx, _) = broadcast::channel(EVENT_BUFFER);
    let stop = CancellationToken::new();

    spawn_handshake_listener(
        listener,
        cmd_tx.downgrade(),
        ctx.config().handshake_timeout(),
        stop.clone(),
    );

    let actor = SupervisorActor::new(
        handler,
        ctx,
        cmd_rx,
        cmd_tx.downgrade(),
        event_tx.clone(),
        stop.clone(),
    );
    tokio::spawn(actor.run());

    Ok(SupervisorHandle::new(cmd_tx, event_tx, stop))
}

/// Accepts surrogate handshakes on the RequestManager endpoint until `stop`
/// fires.
fn spawn_handshake_listener(
    listener: Listener,
    sender: mpsc::WeakSender<SupervisorCommand>,
    handshake_timeout: Duration,
    stop: CancellationToken,
) {
    tokio::spawn(async move {
        info!(endpoint = %listener.name(), "Request manager listening");
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(stream) => {
                        let sender = sender.clone();
                        tokio::spawn(async move {
                            read_handshake(stream, sender, handshake_timeout).await;
                        });
                    }
                    Err(e) => warn!(error = %e, "Failed to accept surrogate connection"),
                },
            }
        }
        debug!(endpoint = %listener.name(), "Request manager listener stopped");
    });
}

async fn read_handshake(
    stream: UnixStream,
    sender: mpsc::WeakSender<SupervisorCommand>,
    handshake_timeout: Duration,
) {
    let mut reader = FrameReader::new(stream, FrameDecoder::strict());
    let value = match timeout(handshake_timeout, reader.next_value()).await {
        Ok(Ok(value)) => value,
        Ok(Err(e)) => {
            warn!(error = %e, "Invalid surrogate handshake");
            return;
        }
        Err(_) => {
            warn!("Surrogate handshake timed out");
            return;
        }
    };

    let contact: SurrogateContact = match serde_json::from_value(value) {
        Ok(contact) => contact,
        Err(e) => {
            warn!(error = %e, "Malformed surrogate contact");
            return;
        }
    };

    debug!(surrogate = %contact.surrogate_name, "Surrogate handshake received");
    if let Some(sender) = sender.upgrade() {
        let _ = sender
            .send(SupervisorCommand::SurrogateHandshake {
                contact,
                connection: reader.into_inner(),
            })
            .await;
    }
}
