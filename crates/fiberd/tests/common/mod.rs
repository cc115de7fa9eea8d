//! Shared helpers for fiberd integration tests.
//!
//! `InProcessLauncher` runs handler and surrogate "processes" as tasks in
//! the test runtime, so the whole process graph can be exercised without
//! installed binaries. Tests CAN use `.unwrap()` and `.expect()`.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use fiber_client::{ClientConfig, FiberClient};
use fiber_core::{FiberConfig, HandlerName};
use fiber_process::{ChildProcess, ExitOutcome, LaunchSpec, ProcessError, ProcessLauncher};
use fiber_protocol::{encode, Framing, Listener, SurrogateContact};
use fiberd::handler::HandlerServer;
use fiberd::router::{spawn_router, RouterHandle};
use fiberd::server::FrontDoor;
use fiberd::surrogate::{Service, ServiceError, ServiceRegistry, SurrogateServer};
use fiberd::FiberContext;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Constants
// ============================================================================

/// Maximum time to wait for a socket to appear
pub const SOCKET_WAIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Interval between socket existence checks
pub const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Upper bound for anything a test waits on
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the crash service keeps its connection open after "crashing"
const CRASH_LINGER: Duration = Duration::from_secs(3);

// ============================================================================
// Configuration
// ============================================================================

/// Configuration with short timers, rooted in `dir`.
pub fn test_config(dir: &Path) -> FiberConfig {
    let mut config = FiberConfig::default().with_runtime_dir(dir);
    config.auto_time_out.kill_on_time_out = false;
    config.auto_time_out.refresh_interval = 100;
    config.auto_time_out.time_out_interval = 300;
    config.watchdog.interval = 200;
    config.watchdog.connect_timeout = 300;
    config.restart.max_attempts = 3;
    config.restart.backoff_first = 10;
    config.restart.backoff_max = 50;
    config.timeouts.handshake = 3_000;
    config.timeouts.connect = 500;
    config.timeouts.read = 5_000;
    config.timeouts.write = 1_000;
    config
}

/// Polls until `path` exists.
pub async fn wait_for_socket(path: &Path) {
    let start = tokio::time::Instant::now();
    while start.elapsed() < SOCKET_WAIT_TIMEOUT {
        if path.exists() {
            return;
        }
        sleep(SOCKET_POLL_INTERVAL).await;
    }
    panic!("Socket {} did not appear within {SOCKET_WAIT_TIMEOUT:?}", path.display());
}

/// Polls `check` until it returns true.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < TEST_TIMEOUT {
        if check().await {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("Timed out waiting for {what}");
}

// ============================================================================
// Test services
// ============================================================================

/// `Test.Crash.now`: makes the surrogate process die abnormally.
struct Crasher {
    crash: CancellationToken,
}

#[async_trait]
impl Service for Crasher {
    async fn invoke(&self, method: &str, _args: &[Value]) -> Result<Value, ServiceError> {
        match method {
            "now" => {
                self.crash.cancel();
                // The answer must lose the race against the exit
                sleep(CRASH_LINGER).await;
                Err(ServiceError::Failed("survived".into()))
            }
            other => Err(ServiceError::Failed(format!("unknown {other}"))),
        }
    }
}

/// `Test.Payload.blob(n)`: returns a string of `n` bytes.
struct Payload;

#[async_trait]
impl Service for Payload {
    async fn invoke(&self, _method: &str, args: &[Value]) -> Result<Value, ServiceError> {
        let n = args.first().and_then(Value::as_u64).unwrap_or(0) as usize;
        Ok(json!("x".repeat(n)))
    }
}

// ============================================================================
// In-process launcher
// ============================================================================

/// How launched surrogates behave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurrogateMode {
    /// A real `SurrogateServer` with the test services registered.
    Real,
    /// Handshakes, then accepts connections and never answers.
    Hang,
    /// Stays alive without ever binding or handshaking.
    Silent,
}

struct TaskChild {
    pid: u32,
    exit: Option<oneshot::Receiver<ExitOutcome>>,
    kill: CancellationToken,
}

#[async_trait]
impl ChildProcess for TaskChild {
    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }

    async fn wait(&mut self) -> Result<ExitOutcome, ProcessError> {
        match self.exit.take() {
            Some(exit) => Ok(exit.await.unwrap_or_else(|_| ExitOutcome::crashed())),
            None => Ok(ExitOutcome::crashed()),
        }
    }

    fn start_kill(&mut self) -> Result<(), ProcessError> {
        self.kill.cancel();
        Ok(())
    }
}

impl Drop for TaskChild {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

/// Runs Fiber processes as tasks of the current runtime.
pub struct InProcessLauncher {
    me: Weak<InProcessLauncher>,
    config: FiberConfig,
    next_pid: AtomicU32,
    mode: Mutex<SurrogateMode>,
    launches: Mutex<Vec<LaunchSpec>>,
    /// Kill switches by endpoint name (first argument)
    running: Mutex<HashMap<String, CancellationToken>>,
}

impl InProcessLauncher {
    pub fn new(config: FiberConfig) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            next_pid: AtomicU32::new(40_000),
            mode: Mutex::new(SurrogateMode::Real),
            launches: Mutex::new(Vec::new()),
            running: Mutex::new(HashMap::new()),
        })
    }

    pub fn set_surrogate_mode(&self, mode: SurrogateMode) {
        *self.mode.lock().unwrap() = mode;
    }

    /// Number of launches of `program`.
    pub fn launch_count(&self, program: &str) -> usize {
        self.launches
            .lock()
            .unwrap()
            .iter()
            .filter(|spec| spec.program == program)
            .count()
    }

    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.launches.lock().unwrap().clone()
    }

    /// Kills the process registered under `name`, as a crash would.
    pub fn crash(&self, name: &str) -> bool {
        match self.running.lock().unwrap().get(name) {
            Some(kill) => {
                kill.cancel();
                true
            }
            None => false,
        }
    }

    fn context(&self) -> FiberContext {
        let launcher: Arc<dyn ProcessLauncher> = self.me.upgrade().expect("launcher alive");
        FiberContext::new(self.config.clone(), launcher)
    }
}

#[async_trait]
impl ProcessLauncher for InProcessLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn ChildProcess>, ProcessError> {
        self.launches.lock().unwrap().push(spec.clone());

        let name = spec.args.first().cloned().unwrap_or_default();
        let ctx = self.context();
        let kill = CancellationToken::new();
        let crash = CancellationToken::new();
        let (exit_tx, exit_rx) = oneshot::channel();

        let body: std::pin::Pin<Box<dyn std::future::Future<Output = ExitOutcome> + Send>> =
            if spec.program == self.config.programs.handler {
                let handler = HandlerName::parse(&name).map_err(|e| ProcessError::Spawn {
                    program: spec.program.clone(),
                    error: std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()),
                })?;
                Box::pin(async move {
                    let server = HandlerServer::new(handler, ctx);
                    match server.run(CancellationToken::new()).await {
                        Ok(()) => ExitOutcome::exited(0),
                        Err(_) => ExitOutcome::exited(1),
                    }
                })
            } else if spec.program == self.config.programs.surrogate {
                let manager = spec.args.get(1).cloned().unwrap_or_default();
                let mode = *self.mode.lock().unwrap();
                match mode {
                    SurrogateMode::Real => {
                        let mut registry = ServiceRegistry::new();
                        registry.register("Test", "Crash", Crasher { crash: crash.clone() });
                        registry.register("Test", "Payload", Payload);
                        Box::pin(async move {
                            let server = SurrogateServer::new(name, manager, ctx, registry);
                            match server.run(CancellationToken::new()).await {
                                Ok(()) => ExitOutcome::exited(0),
                                Err(_) => ExitOutcome::exited(1),
                            }
                        })
                    }
                    SurrogateMode::Hang => Box::pin(hung_surrogate(ctx, name, manager)),
                    SurrogateMode::Silent => Box::pin(std::future::pending()),
                }
            } else {
                return Err(ProcessError::Spawn {
                    program: spec.program.clone(),
                    error: std::io::Error::from(std::io::ErrorKind::NotFound),
                });
            };

        self.running
            .lock()
            .unwrap()
            .insert(spec.args.first().cloned().unwrap_or_default(), kill.clone());

        let task_kill = kill.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                outcome = body => outcome,
                _ = task_kill.cancelled() => ExitOutcome::crashed(),
                _ = crash.cancelled() => ExitOutcome::crashed(),
            };
            let _ = exit_tx.send(outcome);
        });

        Ok(Box::new(TaskChild {
            pid: self.next_pid.fetch_add(1, Ordering::Relaxed),
            exit: Some(exit_rx),
            kill,
        }))
    }
}

/// A surrogate that completes its handshake and then never answers.
async fn hung_surrogate(ctx: FiberContext, name: String, manager: String) -> ExitOutcome {
    let Ok(listener) = Listener::bind(ctx.endpoints(), &name) else {
        return ExitOutcome::exited(1);
    };
    let socket = listener.path().to_string_lossy().into_owned();
    let manager_path = ctx.endpoints().path_for(&manager);
    let Ok(mut handshake) = tokio::net::UnixStream::connect(&manager_path).await else {
        return ExitOutcome::exited(1);
    };
    let contact = encode(
        &SurrogateContact::handshake(name.as_str(), socket.as_str()),
        Framing::Footer,
    )
    .unwrap();
    handshake.write_all(&contact).await.unwrap();

    let mut held = Vec::new();
    loop {
        if let Ok(stream) = listener.accept().await {
            held.push(stream);
        }
    }
}

// ============================================================================
// Full daemon
// ============================================================================

/// A router and front door running in the test runtime.
pub struct TestFiber {
    pub dir: TempDir,
    pub ctx: FiberContext,
    pub launcher: Arc<InProcessLauncher>,
    pub router: RouterHandle,
    pub client: FiberClient,
    pub cancel_token: CancellationToken,
}

impl TestFiber {
    pub async fn spawn() -> Self {
        Self::spawn_with(|_| {}).await
    }

    pub async fn spawn_with(adjust: impl FnOnce(&mut FiberConfig)) -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let mut config = test_config(dir.path());
        adjust(&mut config);

        let launcher = InProcessLauncher::new(config.clone());
        let ctx = FiberContext::new(config.clone(), launcher.clone());
        let router = spawn_router(ctx.clone()).expect("spawn router");

        let cancel_token = CancellationToken::new();
        let front_door = FrontDoor::new(ctx.clone(), router.clone(), cancel_token.clone());
        tokio::spawn(async move {
            let _ = front_door.run().await;
        });

        let main = ctx.endpoints().path_for(&config.endpoints.main);
        wait_for_socket(&main).await;

        let client = FiberClient::new(ClientConfig {
            retry_attempts: 0,
            ..ClientConfig::from_fiber_config(&config)
        });

        Self {
            dir,
            ctx,
            launcher,
            router,
            client,
            cancel_token,
        }
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.ctx.endpoints().path_for(name)
    }

    pub async fn shutdown(self) {
        self.cancel_token.cancel();
        let _ = self.router.shutdown().await;
        sleep(Duration::from_millis(50)).await;
    }
}
