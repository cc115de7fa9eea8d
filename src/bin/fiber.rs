//! Fiber daemon - front door and router
//!
//! Accepts session and handler requests from clients, launches
//! `fiber-handler` processes on demand and keeps them alive.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (foreground)
//! fiber start
//!
//! # Start the daemon (background/daemonized)
//! fiber start -d
//!
//! # Stop the daemon
//! fiber stop
//!
//! # Check daemon status
//! fiber status
//! ```

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use fiber_client::{ClientConfig, FiberClient};
use fiber_core::FiberConfig;
use fiber_process::OsLauncher;
use fiberd::router::spawn_router;
use fiberd::server::FrontDoor;
use fiberd::FiberContext;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Fiber daemon - session routing and worker supervision
#[derive(Parser, Debug)]
#[command(name = "fiber", version, about)]
struct Args {
    /// Configuration file (defaults to $FIBER_CONFIG, then <config_dir>/fiber/fiber.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon
    Start {
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,
    },
    /// Stop the running daemon
    Stop,
    /// Show daemon status
    Status,
}

// ============================================================================
// PID file
// ============================================================================

fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("fiber")
}

fn log_file_path() -> PathBuf {
    state_dir().join("fiber.log")
}

/// `<state_dir>/fiber/fiber.pid`, owned by a running daemon.
struct PidFile {
    path: PathBuf,
}

impl PidFile {
    fn locate() -> Self {
        Self {
            path: state_dir().join("fiber.pid"),
        }
    }

    fn read(&self) -> Option<u32> {
        let mut contents = String::new();
        File::open(&self.path)
            .ok()?
            .read_to_string(&mut contents)
            .ok()?;
        contents.trim().parse().ok()
    }

    fn write(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("Failed to create state directory")?;
        }
        let mut file = File::create(&self.path).context("Failed to create PID file")?;
        write!(file, "{}", process::id()).context("Failed to write PID")?;
        Ok(())
    }

    fn remove(&self) {
        let _ = fs::remove_file(&self.path);
    }

    /// PID of the live daemon. A file left behind by a dead process is removed.
    fn running(&self) -> Option<u32> {
        let pid = self.read()?;
        if is_process_running(pid) {
            return Some(pid);
        }
        self.remove();
        None
    }
}

fn is_process_running(pid: u32) -> bool {
    // Signal 0 only checks that the process exists
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

fn signal_daemon(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        let result = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if result != 0 {
            bail!("Failed to send SIGTERM to process {pid}");
        }
    }
    #[cfg(not(unix))]
    {
        bail!("Stop command is only supported on Unix systems");
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = FiberConfig::discover(args.config.as_deref()).context("Failed to load configuration")?;

    let command = args.command.unwrap_or(Command::Start { daemon: false });

    match command {
        Command::Start { daemon } => {
            let pid_file = PidFile::locate();
            if let Some(pid) = pid_file.running() {
                eprintln!("Daemon is already running (PID {pid})");
                eprintln!("Use 'fiber stop' to stop it first.");
                process::exit(1);
            }

            if daemon {
                daemonize()?;
            }

            pid_file.write()?;

            let result = run_daemon(config);

            pid_file.remove();

            result
        }
        Command::Stop => stop(&config),
        Command::Status => status(&config),
    }
}

fn stop(config: &FiberConfig) -> Result<()> {
    let client = front_door_client(config);
    let runtime = current_thread_runtime()?;

    let asked = runtime.block_on(async {
        if !client.front_door_alive().await {
            return false;
        }
        match client.terminate_daemon().await {
            Ok(()) => true,
            Err(e) => {
                eprintln!("Front door did not accept terminate: {e}");
                false
            }
        }
    });

    let Some(pid) = PidFile::locate().running() else {
        if asked {
            println!("Daemon asked to terminate.");
        } else {
            println!("Daemon is not running.");
        }
        return Ok(());
    };

    if asked {
        println!("Stopping daemon (PID {pid})...");
    } else {
        println!("Front door not answering, sending SIGTERM to PID {pid}...");
        signal_daemon(pid)?;
    }

    for _ in 0..50 {
        if !is_process_running(pid) {
            println!("Daemon stopped.");
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    eprintln!("Daemon did not stop within 5 seconds.");
    process::exit(1);
}

fn status(config: &FiberConfig) -> Result<()> {
    let client = front_door_client(config);
    let endpoints = &config.endpoints;
    let main_path = client.config().runtime_dir.join(&endpoints.main);
    let control_path = client.config().runtime_dir.join(&endpoints.control);

    let runtime = current_thread_runtime()?;
    let (main_alive, control_alive) =
        runtime.block_on(async { (client.front_door_alive().await, client.control_alive().await) });

    match (PidFile::locate().running(), main_alive) {
        (None, false) => {
            println!("Daemon is not running.");
            process::exit(1);
        }
        (Some(pid), _) => println!("Daemon is running (PID {pid})"),
        (None, true) => println!("Daemon is running (no PID file)"),
    }
    print_socket("Socket", &main_path, main_alive);
    print_socket("Control", &control_path, control_alive);
    Ok(())
}

fn print_socket(label: &str, path: &Path, alive: bool) {
    if alive {
        println!("{label}: {}", path.display());
    } else if path.exists() {
        println!("{label}: {} (not accepting connections)", path.display());
    }
}

fn current_thread_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start runtime")
}

fn front_door_client(config: &FiberConfig) -> FiberClient {
    FiberClient::new(ClientConfig {
        retry_attempts: 0,
        ..ClientConfig::from_fiber_config(config)
    })
}

fn daemonize() -> Result<()> {
    use daemonize::Daemonize;

    let log_path = log_file_path();

    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::create(&log_path).context("Failed to create log file for stdout")?;
    let stderr = File::create(&log_path).context("Failed to create log file for stderr")?;

    let daemonize = Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr);

    daemonize.start().context("Failed to daemonize")?;

    Ok(())
}

#[tokio::main]
async fn run_daemon(config: FiberConfig) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("fiber=info".parse()?)
                .add_directive("fiberd=info".parse()?)
                .add_directive("fiber_core=info".parse()?)
                .add_directive("fiber_protocol=info".parse()?)
                .add_directive("fiber_process=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        config = ?config.source(),
        "Fiber daemon starting"
    );

    let runtime_dir = config.runtime_dir();
    fs::create_dir_all(&runtime_dir)
        .with_context(|| format!("Failed to create runtime directory {}", runtime_dir.display()))?;

    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let ctx = FiberContext::new(config, Arc::new(OsLauncher));

    let router = spawn_router(ctx.clone()).context("Failed to start router")?;
    info!("Router started");

    let server = FrontDoor::new(ctx, router.clone(), cancel_token);

    info!(runtime_dir = %runtime_dir.display(), "Starting front door");

    let result = server.run().await;

    if let Err(e) = router.shutdown().await {
        warn!(error = %e, "Router did not shut down cleanly");
    }

    if let Err(e) = result {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("Fiber daemon stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
