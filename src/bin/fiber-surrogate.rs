//! Fiber surrogate process
//!
//! Launched by a handler's request manager, one per worker kind. Executes
//! service calls one connection at a time.
//!
//! ```text
//! fiber-surrogate Handler3CoreSurrogate Handler3RequestManager
//! ```

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use fiber_core::FiberConfig;
use fiber_process::OsLauncher;
use fiberd::surrogate::{ServiceRegistry, SurrogateServer};
use fiberd::FiberContext;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Fiber surrogate - executes service calls for a handler
#[derive(Parser, Debug)]
#[command(name = "fiber-surrogate", version, about)]
struct Args {
    /// Own endpoint name (e.g. Handler1CoreSurrogate)
    name: String,

    /// Request manager endpoint to report to (e.g. Handler1RequestManager)
    manager: String,

    /// Configuration file (defaults to $FIBER_CONFIG)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("fiberd=info".parse()?)
                .add_directive("fiber_protocol=info".parse()?),
        )
        .init();

    let config = FiberConfig::discover(args.config.as_deref()).context("Failed to load configuration")?;

    // Calls run one at a time; a single-threaded runtime is enough
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start runtime")?;

    runtime.block_on(run(args.name, args.manager, config))
}

async fn run(name: String, manager: String, config: FiberConfig) -> Result<()> {
    info!(
        surrogate = %name,
        manager = %manager,
        pid = process::id(),
        "Surrogate starting"
    );

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_termination().await {
            error!(error = %e, "Error waiting for termination signal");
        }
        signal_token.cancel();
    });

    let ctx = FiberContext::new(config, Arc::new(OsLauncher));
    let server = SurrogateServer::new(name, manager, ctx, ServiceRegistry::new());

    if let Err(e) = server.run(shutdown).await {
        error!(surrogate = %server.name(), error = %e, "Surrogate failed");
        return Err(e.into());
    }

    info!(surrogate = %server.name(), "Surrogate stopped");
    Ok(())
}

async fn wait_for_termination() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
    Ok(())
}
