//! Fiber handler process
//!
//! Launched by the `fiber` daemon, one per handler name. Serves client
//! calls on its own endpoint and runs the request manager that owns the
//! CORE and GUI surrogates.
//!
//! ```text
//! fiber-handler Handler3
//! ```

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use fiber_core::{FiberConfig, HandlerName};
use fiber_process::OsLauncher;
use fiberd::handler::HandlerServer;
use fiberd::FiberContext;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Fiber handler - serves one group of sessions
#[derive(Parser, Debug)]
#[command(name = "fiber-handler", version, about)]
struct Args {
    /// Endpoint name assigned by the router (e.g. Handler1)
    name: String,

    /// Configuration file (defaults to $FIBER_CONFIG)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("fiberd=info".parse()?)
                .add_directive("fiber_protocol=info".parse()?)
                .add_directive("fiber_process=info".parse()?),
        )
        .init();

    let name = HandlerName::parse(&args.name).context("Invalid handler name")?;
    let config = FiberConfig::discover(args.config.as_deref()).context("Failed to load configuration")?;

    info!(
        handler = %name,
        pid = process::id(),
        "Handler starting"
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
    let server = HandlerServer::new(name, ctx);

    if let Err(e) = server.run(shutdown).await {
        error!(handler = %server.name(), error = %e, "Handler failed");
        return Err(e.into());
    }

    info!(handler = %server.name(), "Handler stopped");
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
