//! Fiber Daemon - request routing and process supervision
//!
//! This crate provides the runtimes of the three Fiber process types:
//! - `server` - front door accepting client requests (`fiber`)
//! - `router` - session to handler mapping and handler lifecycle (`fiber`)
//! - `handler` - per-handler request endpoint and idle timer (`fiber-handler`)
//! - `supervisor` - request queues and surrogate lifecycle (`fiber-handler`)
//! - `surrogate` - service execution (`fiber-surrogate`)
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────── fiber ────────────────────────┐
//! │  ┌──────────────┐   resolve    ┌──────────────────┐   │
//! │  │ FrontDoor    │─────────────▶│   RouterActor    │   │
//! │  │ (Fiber)      │◀─────────────│ (FiberControl)   │   │
//! │  └──────────────┘  socket evt  └────────┬─────────┘   │
//! └─────────────────────────────────────────┼─────────────┘
//!                               spawn + handshake
//! ┌──────────────────── fiber-handler ──────▼─────────────┐
//! │  ┌──────────────┐   submit     ┌──────────────────┐   │
//! │  │ HandlerServer│─────────────▶│ SupervisorActor  │   │
//! │  │ (Handler<N>) │◀─────────────│ (RequestManager) │   │
//! │  └──────────────┘  response    └────────┬─────────┘   │
//! └─────────────────────────────────────────┼─────────────┘
//!                                spawn + dispatch
//!                    ┌────────────────────────▼──────────┐
//!                    │ fiber-surrogate (Core / Gui)      │
//!                    └───────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod context;
pub mod handler;
pub mod router;
pub mod server;
pub mod supervisor;
pub mod surrogate;

pub use context::FiberContext;
