//! Fiber Process - launching and watching child processes
//!
//! The router spawns handler processes and every handler spawns surrogate
//! processes. Both go through the [`ProcessLauncher`] seam so the same
//! supervision code can drive real OS processes ([`OsLauncher`]) or any
//! other implementation, such as in-process fakes in tests.

mod launcher;
mod watch;

pub use launcher::{
    resolve_program, ChildProcess, ExitOutcome, LaunchSpec, OsLauncher, ProcessError,
    ProcessLauncher,
};
pub use watch::{watch, ProcessHandle};
