//! Process-wide context.
//!
//! Built once at process start and handed to whatever the process runs
//! (front door, router, handler, supervisor or surrogate). It carries the
//! configuration, the endpoint directory and the process launcher.

use std::fmt;
use std::sync::Arc;

use fiber_core::{FiberConfig, HandlerName, RestartPolicy, WorkerKind, CONFIG_ENV, RUNTIME_DIR_ENV};
use fiber_process::{LaunchSpec, ProcessLauncher};
use fiber_protocol::{Dialer, EndpointDir};

/// Shared, cheap-to-clone process context.
#[derive(Clone)]
pub struct FiberContext {
    config: Arc<FiberConfig>,
    endpoints: EndpointDir,
    launcher: Arc<dyn ProcessLauncher>,
}

impl FiberContext {
    pub fn new(config: FiberConfig, launcher: Arc<dyn ProcessLauncher>) -> Self {
        let endpoints = EndpointDir::new(config.runtime_dir());
        Self {
            config: Arc::new(config),
            endpoints,
            launcher,
        }
    }

    pub fn config(&self) -> &FiberConfig {
        &self.config
    }

    pub fn endpoints(&self) -> &EndpointDir {
        &self.endpoints
    }

    pub fn launcher(&self) -> &Arc<dyn ProcessLauncher> {
        &self.launcher
    }

    /// Dialer with the configured connect, read and write bounds.
    pub fn dialer(&self) -> Dialer {
        Dialer::new(
            self.config.connect_timeout(),
            Some(self.config.read_timeout()),
        )
        .with_write_timeout(self.config.write_timeout())
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy::from(&self.config.restart)
    }

    /// `fiber-handler <HandlerName>`
    pub fn handler_spec(&self, handler: &HandlerName) -> LaunchSpec {
        self.child_spec(&self.config.programs.handler)
            .arg(handler.as_str())
    }

    /// `fiber-surrogate <handler><Kind>Surrogate <handler>RequestManager`
    pub fn surrogate_spec(&self, handler: &HandlerName, kind: WorkerKind) -> LaunchSpec {
        self.child_spec(&self.config.programs.surrogate)
            .arg(handler.surrogate_name(kind))
            .arg(handler.request_manager_name())
    }

    fn child_spec(&self, program: &str) -> LaunchSpec {
        let mut spec = LaunchSpec::new(program).env(
            RUNTIME_DIR_ENV,
            self.endpoints.root().to_string_lossy().into_owned(),
        );
        if let Some(source) = self.config.source() {
            spec = spec.env(CONFIG_ENV, source.to_string_lossy().into_owned());
        }
        spec
    }
}

impl fmt::Debug for FiberContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberContext")
            .field("runtime_dir", &self.endpoints.root())
            .finish_non_exhaustive()
    }
}
