//! fiberctl - command-line client for a running Fiber daemon
//!
//! # Usage
//!
//! ```text
//! fiberctl status
//! fiberctl session create --client-ip 10.0.0.7
//! fiberctl call --session <id> Fiber Diagnostics echo '"hello"'
//! fiberctl call --no-wait --kind gui Fiber Diagnostics sleep 2000
//! fiberctl responses --kind gui
//! fiberctl fetch --kind gui 1
//! fiberctl stop
//! ```

use std::io::Write;
use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use fiber_client::{ClientConfig, FiberClient, HandlerClient};
use fiber_core::{FiberConfig, RequestId, SessionId, WorkerKind};
use fiber_protocol::ServiceCall;
use serde_json::Value;

// ============================================================================
// CLI Arguments
// ============================================================================

/// fiberctl - talk to the Fiber daemon and its handlers
#[derive(Parser, Debug)]
#[command(name = "fiberctl", version, about)]
struct Args {
    /// Configuration file (defaults to $FIBER_CONFIG, then <config_dir>/fiber/fiber.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check whether the daemon answers
    Status,
    /// Ask the daemon to terminate
    Stop,
    /// Manage sessions
    Session {
        #[command(subcommand)]
        command: SessionCommand,
    },
    /// Print the handler socket serving a session
    Handler {
        #[command(flatten)]
        target: Target,
    },
    /// Run a service call
    Call {
        #[command(flatten)]
        target: Target,

        /// Queue the call and print its request id instead of waiting
        #[arg(long)]
        no_wait: bool,

        component: String,
        object: String,
        method: String,

        /// Arguments, parsed as JSON when possible, otherwise passed as strings
        args: Vec<String>,
    },
    /// List request ids with responses waiting to be collected
    Responses {
        #[command(flatten)]
        target: Target,
    },
    /// Collect (part of) a queued response
    Fetch {
        #[command(flatten)]
        target: Target,

        id: u64,

        /// Maximum number of bytes to take; 0 takes the rest
        #[arg(long, default_value_t = 0)]
        bytes: i64,

        /// Only print how many bytes are left
        #[arg(long, conflicts_with = "bytes")]
        size: bool,
    },
    /// Cancel queued requests or drop uncollected responses
    Cancel {
        #[command(flatten)]
        target: Target,

        #[arg(required = true)]
        ids: Vec<u64>,
    },
}

#[derive(Subcommand, Debug)]
enum SessionCommand {
    /// Create a session and print its id
    Create {
        /// Address recorded for the client
        #[arg(long, default_value = "127.0.0.1")]
        client_ip: String,
    },
    /// Terminate a session
    Terminate { session: String },
}

/// Which handler and worker kind a command goes to.
#[derive(clap::Args, Debug)]
struct Target {
    /// Session id; the stateless NULL session when omitted
    #[arg(short, long)]
    session: Option<String>,

    /// Worker kind
    #[arg(short, long, value_enum, default_value_t = Kind::Core)]
    kind: Kind,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum Kind {
    Core,
    Gui,
}

impl From<Kind> for WorkerKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Core => WorkerKind::Core,
            Kind::Gui => WorkerKind::Gui,
        }
    }
}

impl Target {
    fn session(&self) -> SessionId {
        self.session
            .as_deref()
            .map(SessionId::from)
            .unwrap_or_else(SessionId::null)
    }

    fn kind(&self) -> WorkerKind {
        self.kind.into()
    }
}

// ============================================================================
// Commands
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = FiberConfig::discover(args.config.as_deref()).context("Failed to load configuration")?;
    let client = FiberClient::new(ClientConfig {
        // Blocking calls may legitimately take a long time
        read_timeout: None,
        ..ClientConfig::from_fiber_config(&config)
    });

    match args.command {
        Command::Status => {
            if client.front_door_alive().await {
                println!("Front door: accepting connections");
                let control = if client.control_alive().await {
                    "accepting connections"
                } else {
                    "not reachable"
                };
                println!("Router control: {control}");
            } else {
                println!("Daemon is not running.");
                process::exit(1);
            }
        }
        Command::Stop => {
            client
                .terminate_daemon()
                .await
                .context("Failed to stop the daemon")?;
            println!("Daemon asked to terminate.");
        }
        Command::Session { command } => match command {
            SessionCommand::Create { client_ip } => {
                let session = client
                    .create_session(&client_ip)
                    .await
                    .context("Failed to create session")?;
                println!("{session}");
            }
            SessionCommand::Terminate { session } => {
                let existed = client
                    .terminate_session(&SessionId::from(session.as_str()))
                    .await
                    .context("Failed to terminate session")?;
                if !existed {
                    eprintln!("No such session: {session}");
                    process::exit(1);
                }
            }
        },
        Command::Handler { target } => {
            let socket = client
                .handler_socket(&target.session())
                .await
                .context("Failed to resolve handler")?;
            println!("{}", socket.display());
        }
        Command::Call {
            target,
            no_wait,
            component,
            object,
            method,
            args,
        } => {
            let handler = handler_for(&client, &target).await?;
            let call = args
                .iter()
                .fold(ServiceCall::new(component, object, method), |call, arg| {
                    call.with_arg(parse_arg(arg))
                });

            if no_wait {
                let id = handler
                    .submit(target.kind(), &call)
                    .await
                    .context("Failed to submit call")?;
                println!("{id}");
            } else {
                let reply = handler
                    .call(target.kind(), &call)
                    .await
                    .context("Call failed")?;
                println!("{}", serde_json::to_string_pretty(&reply)?);
                if !reply.success {
                    process::exit(1);
                }
            }
        }
        Command::Responses { target } => {
            let handler = handler_for(&client, &target).await?;
            let ids = handler
                .available_responses(target.kind())
                .await
                .context("Failed to list responses")?;
            for id in ids {
                println!("{id}");
            }
        }
        Command::Fetch {
            target,
            id,
            bytes,
            size,
        } => {
            let handler = handler_for(&client, &target).await?;
            let id = RequestId::new(id);
            if size {
                let left = handler
                    .response_size(target.kind(), id)
                    .await
                    .context("Failed to read response size")?;
                println!("{left}");
            } else {
                let chunk = handler
                    .fetch_response(target.kind(), id, bytes)
                    .await
                    .context("Failed to fetch response")?;
                let mut stdout = std::io::stdout().lock();
                stdout.write_all(&chunk)?;
                writeln!(stdout)?;
            }
        }
        Command::Cancel { target, ids } => {
            let handler = handler_for(&client, &target).await?;
            let ids: Vec<RequestId> = ids.into_iter().map(RequestId::new).collect();
            let cancelled = handler
                .cancel_requests(target.kind(), &ids)
                .await
                .context("Failed to cancel requests")?;
            for id in cancelled {
                println!("{id}");
            }
        }
    }

    Ok(())
}

async fn handler_for(client: &FiberClient, target: &Target) -> Result<HandlerClient> {
    client
        .handler(&target.session())
        .await
        .context("Failed to resolve handler")
}

fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
