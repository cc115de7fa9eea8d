//! Fiber Core - Shared types for the Fiber router and its worker processes
//!
//! This crate provides the domain types shared between the front-door
//! daemon (`fiber`), handler processes (`fiber-handler`), surrogate
//! processes (`fiber-surrogate`) and the client library.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod config;
pub mod error;
pub mod ids;
pub mod kind;
pub mod restart;

// Re-exports for convenience
pub use config::{
    AutoTimeOutConfig, ConfigError, EndpointConfig, FiberConfig, ProgramConfig, RestartConfig,
    TimeoutConfig, WatchdogConfig, CONFIG_ENV, RUNTIME_DIR_ENV,
};
pub use error::{DomainError, DomainResult};
pub use ids::{HandlerName, RequestId, RequestIdAllocator, SessionId, NULL_SESSION};
pub use kind::WorkerKind;
pub use restart::RestartPolicy;
