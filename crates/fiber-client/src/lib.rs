//! Fiber Client - talk to a running Fiber daemon and its handlers
//!
//! This crate provides:
//! - `FiberClient` - session management, handler lookup and daemon control
//!   through the front door
//! - `HandlerClient` - service calls and response meta-calls against one
//!   handler process
//!
//! ```rust,ignore
//! use fiber_client::{ClientConfig, FiberClient};
//! use fiber_core::{SessionId, WorkerKind};
//! use fiber_protocol::ServiceCall;
//!
//! let client = FiberClient::new(ClientConfig::default());
//! let session = client.create_session("127.0.0.1").await?;
//! let handler = client.handler(&session).await?;
//! let reply = handler.call(WorkerKind::Core, &ServiceCall::ping()).await?;
//! ```

pub mod client;
pub mod error;

pub use client::{ClientConfig, FiberClient, HandlerClient};
pub use error::{ClientError, Result};
