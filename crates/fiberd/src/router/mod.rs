//! Session routing using the Actor pattern.
//!
//! The router maps client sessions to handler processes. It creates and
//! destroys sessions, spawns a `fiber-handler` for a session on first use,
//! learns each handler's socket from its handshake on the `FiberControl`
//! endpoint and restarts handlers that die without being told to.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐  RouterCommand  ┌─────────────────┐  spawn   ┌───────────────┐
//! │ Front door conns│────(mpsc)──────▶│   RouterActor   │─────────▶│ fiber-handler │
//! └─────────────────┘                 └─────────────────┘          └───────┬───────┘
//!         ▲                              │          ▲                      │
//!         │   RouterEvent (broadcast)    │          │ HandlerContact       │ HANDSHAKE /
//!         └──────────────────────────────┘   ┌──────┴──────────┐           │ SUICIDE
//!                                            │ FiberControl    │◀──────────┘
//!                                            └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All operations in this module follow the panic-free policy:
//! - No `.unwrap()` or `.expect()` in production code
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

use fiber_protocol::Listener;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::context::FiberContext;

mod actor;
mod commands;
mod control;
mod handle;

pub use actor::RouterActor;
pub use commands::{
    HandlerState, HandlerStatus, RouterCommand, RouterError, RouterEvent, RouterSnapshot,
    SessionStatus,
};
pub use handle::RouterHandle;

/// Channel buffer sizes
const COMMAND_BUFFER: usize = 100;
const EVENT_BUFFER: usize = 256;

/// Binds the control endpoint, spawns the router actor and returns a handle.
///
/// # Errors
///
/// Returns `RouterError::Endpoint` if the control endpoint cannot be bound.
pub fn spawn_router(ctx: FiberContext) -> Result<RouterHandle, RouterError> {
    let listener = Listener::bind(ctx.endpoints(), &ctx.config().endpoints.control)?;

    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (event_tx, _) = broadcast::channel(EVENT_BUFFER);
    let stop = CancellationToken::new();

    control::spawn_control_listener(listener, cmd_tx.downgrade(), stop.clone());

    let actor = RouterActor::new(
        ctx,
        cmd_rx,
        cmd_tx.downgrade(),
        event_tx.clone(),
        stop.clone(),
    );
    tokio::spawn(actor.run());

    Ok(RouterHandle::new(cmd_tx, event_tx, stop))
}
