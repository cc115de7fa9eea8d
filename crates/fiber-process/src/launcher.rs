//! Process launching seam.
//!
//! [`ProcessLauncher::launch`] turns a [`LaunchSpec`] into a running
//! [`ChildProcess`]. The default implementation, [`OsLauncher`], spawns the
//! executable with `tokio::process`, resolving bare program names next to
//! the current executable first so an installed `fiber` finds its own
//! `fiber-handler` and `fiber-surrogate`.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::debug;

/// Errors from launching or waiting on a child process.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Failed to launch {program}: {error}")]
    Spawn {
        program: String,
        error: std::io::Error,
    },

    #[error("Failed to wait for process: {0}")]
    Wait(std::io::Error),

    #[error("Failed to kill process: {0}")]
    Kill(std::io::Error),
}

/// What to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

impl fmt::Display for LaunchSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    /// Exit code, `None` if the process was terminated by a signal.
    pub code: Option<i32>,
    /// Whether the process died abnormally rather than exiting.
    pub crashed: bool,
}

impl ExitOutcome {
    pub fn exited(code: i32) -> Self {
        Self {
            code: Some(code),
            crashed: false,
        }
    }

    pub fn crashed() -> Self {
        Self {
            code: None,
            crashed: true,
        }
    }

    /// Crash or non-zero exit.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.crashed || self.code != Some(0)
    }
}

impl From<std::process::ExitStatus> for ExitOutcome {
    fn from(status: std::process::ExitStatus) -> Self {
        match status.code() {
            Some(code) => Self::exited(code),
            None => Self::crashed(),
        }
    }
}

/// A running child process.
///
/// Dropping a child kills it.
#[async_trait]
pub trait ChildProcess: Send {
    /// OS process id, if the implementation has one.
    fn id(&self) -> Option<u32>;

    /// Waits for the process to end.
    async fn wait(&mut self) -> Result<ExitOutcome, ProcessError>;

    /// Asks the process to die immediately. `wait` reports the result.
    fn start_kill(&mut self) -> Result<(), ProcessError>;
}

/// Starts child processes.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn ChildProcess>, ProcessError>;
}

// ============================================================================
// OS Processes
// ============================================================================

/// Launches real OS processes.
#[derive(Debug, Clone, Default)]
pub struct OsLauncher;

struct OsChild {
    child: Child,
}

#[async_trait]
impl ChildProcess for OsChild {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> Result<ExitOutcome, ProcessError> {
        let status = self.child.wait().await.map_err(ProcessError::Wait)?;
        Ok(ExitOutcome::from(status))
    }

    fn start_kill(&mut self) -> Result<(), ProcessError> {
        self.child.start_kill().map_err(ProcessError::Kill)
    }
}

#[async_trait]
impl ProcessLauncher for OsLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn ChildProcess>, ProcessError> {
        let program = resolve_program(&spec.program);
        debug!(program = %program.display(), args = ?spec.args, "Launching process");

        let child = Command::new(&program)
            .args(&spec.args)
            .envs(spec.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|error| ProcessError::Spawn {
                program: spec.program.clone(),
                error,
            })?;

        Ok(Box::new(OsChild { child }))
    }
}

/// Finds `program` next to the current executable, falling back to `PATH`.
///
/// Names containing a path separator are used as given.
pub fn resolve_program(program: &str) -> PathBuf {
    if program.contains(std::path::MAIN_SEPARATOR) {
        return PathBuf::from(program);
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(program)))
        .filter(|candidate| candidate.exists())
        .unwrap_or_else(|| PathBuf::from(program))
}
