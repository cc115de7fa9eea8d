//! Router actor - owns sessions, session bindings and handler agents.
//!
//! A handler agent tracks one `fiber-handler` process:
//!
//! ```text
//!   Launching ──spawned──▶ Handshaking ──HANDSHAKE──▶ Active
//!       ▲                      │                        │
//!       └──── unexpected exit (restart policy) ─────────┤
//!                                                       │ SUICIDE / last session gone
//!                                                       ▼
//!                                  removed ◀──exit── Deactivating
//! ```
//!
//! Closing an active handler's control connection is what tells it to exit.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Channel send failures are ignored; the receiver may be gone

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fiber_core::{HandlerName, RestartPolicy, SessionId};
use fiber_process::{watch, ChildProcess, ExitOutcome, ProcessError, ProcessHandle};
use fiber_protocol::{ContactType, HandlerContact};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

use super::commands::{
    HandlerState, HandlerStatus, RouterCommand, RouterError, RouterEvent, RouterSnapshot,
    SessionStatus,
};
use crate::context::FiberContext;

struct SessionEntry {
    client_address: String,
    created_at: DateTime<Utc>,
}

struct HandlerAgent {
    state: HandlerState,
    sessions: HashSet<SessionId>,
    socket: Option<PathBuf>,
    process: Option<ProcessHandle>,
    generation: u64,
    restarts: u32,
    /// Control connection of the last handshake.
    link: Option<CancellationToken>,
}

impl HandlerAgent {
    fn new() -> Self {
        Self {
            state: HandlerState::Launching,
            sessions: HashSet::new(),
            socket: None,
            process: None,
            generation: 0,
            restarts: 0,
            link: None,
        }
    }
}

/// The router actor - single owner of all routing state.
pub struct RouterActor {
    ctx: FiberContext,
    policy: RestartPolicy,
    receiver: mpsc::Receiver<RouterCommand>,
    self_sender: mpsc::WeakSender<RouterCommand>,
    event_publisher: broadcast::Sender<RouterEvent>,

    /// Sessions created through `SESSION_MGMT create`.
    sessions: HashMap<SessionId, SessionEntry>,
    /// Session to handler, including the stateless `NULL` session.
    bindings: HashMap<SessionId, HandlerName>,
    handlers: HashMap<HandlerName, HandlerAgent>,

    next_handler_index: u64,
    next_generation: u64,
    shutting_down: bool,
    _listener_guard: DropGuard,
}

impl RouterActor {
    pub fn new(
        ctx: FiberContext,
        receiver: mpsc::Receiver<RouterCommand>,
        self_sender: mpsc::WeakSender<RouterCommand>,
        event_publisher: broadcast::Sender<RouterEvent>,
        listener_stop: CancellationToken,
    ) -> Self {
        let policy = ctx.restart_policy();
        Self {
            ctx,
            policy,
            receiver,
            self_sender,
            event_publisher,
            sessions: HashMap::new(),
            bindings: HashMap::new(),
            handlers: HashMap::new(),
            next_handler_index: 0,
            next_generation: 1,
            shutting_down: false,
            _listener_guard: listener_stop.drop_guard(),
        }
    }

    /// Runs the actor event loop.
    pub async fn run(mut self) {
        info!("Router actor starting");

        while let Some(cmd) = self.receiver.recv().await {
            if !self.handle_command(cmd) {
                break;
            }
        }

        self.stop_handlers();
        info!("Router actor stopped");
    }

    fn publish(&self, event: RouterEvent) {
        let _ = self.event_publisher.send(event);
    }

    /// Dispatches a command. Returns `false` when the actor should stop.
    fn handle_command(&mut self, cmd: RouterCommand) -> bool {
        match cmd {
            RouterCommand::CreateSession {
                client_address,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_create_session(client_address));
            }
            RouterCommand::TerminateSession {
                session,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_terminate_session(&session));
            }
            RouterCommand::ResolveHandler {
                session,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_resolve(session));
            }
            RouterCommand::LocalSocket {
                handler,
                respond_to,
            } => {
                let socket = self.handlers.get(&handler).and_then(|a| a.socket.clone());
                let _ = respond_to.send(socket);
            }
            RouterCommand::Snapshot { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }
            RouterCommand::Shutdown { respond_to } => {
                info!(handlers = self.handlers.len(), "Router shutdown requested");
                self.shutting_down = true;
                self.stop_handlers();
                let _ = respond_to.send(());
                return false;
            }
            RouterCommand::HandlerContact { contact, link } => {
                self.handle_contact(contact, link);
            }
            RouterCommand::HandlerLaunched {
                handler,
                generation,
                result,
            } => self.handle_launched(handler, generation, result),
            RouterCommand::HandlerExited {
                handler,
                generation,
                outcome,
            } => self.handle_exited(handler, generation, outcome),
        }
        true
    }

    // ------------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------------

    fn handle_create_session(&mut self, client_address: String) -> SessionId {
        let id = SessionId::generate();
        info!(session = %id, client = %client_address, "Session created");
        self.sessions.insert(
            id.clone(),
            SessionEntry {
                client_address,
                created_at: Utc::now(),
            },
        );
        id
    }

    fn handle_terminate_session(&mut self, session: &SessionId) -> bool {
        if self.sessions.remove(session).is_none() {
            debug!(session = %session, "Terminate for unknown session");
            return false;
        }
        info!(session = %session, "Session terminated");

        if let Some(name) = self.bindings.remove(session) {
            let now_empty = match self.handlers.get_mut(&name) {
                Some(agent) => {
                    agent.sessions.remove(session);
                    agent.sessions.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.deactivate(&name);
            }
        }
        true
    }

    fn handle_resolve(&mut self, session: SessionId) -> Result<HandlerName, RouterError> {
        if !session.is_null() && !self.sessions.contains_key(&session) {
            return Err(RouterError::InvalidSession { session });
        }

        if let Some(name) = self.bindings.get(&session) {
            let usable = self
                .handlers
                .get(name)
                .is_some_and(|agent| agent.state != HandlerState::Deactivating);
            if usable {
                return Ok(name.clone());
            }
        }

        self.next_handler_index += 1;
        let name = HandlerName::from_index(self.next_handler_index);
        let mut agent = HandlerAgent::new();
        agent.sessions.insert(session.clone());
        self.handlers.insert(name.clone(), agent);
        self.bindings.insert(session.clone(), name.clone());

        info!(session = %session, handler = %name, "Bound session to new handler");
        self.launch_handler(&name, Duration::ZERO);
        Ok(name)
    }

    // ------------------------------------------------------------------------
    // Handler lifecycle
    // ------------------------------------------------------------------------

    fn launch_handler(&mut self, name: &HandlerName, delay: Duration) {
        let generation = self.next_generation;
        self.next_generation += 1;

        let Some(agent) = self.handlers.get_mut(name) else {
            return;
        };
        agent.generation = generation;
        agent.state = HandlerState::Launching;
        agent.process = None;
        agent.socket = None;

        let spec = self.ctx.handler_spec(name);
        let launcher = Arc::clone(self.ctx.launcher());
        let sender = self.self_sender.clone();
        let handler = name.clone();
        info!(handler = %name, delay = ?delay, "Launching handler");

        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let result = launcher.launch(&spec).await;
            if let Some(sender) = sender.upgrade() {
                let _ = sender
                    .send(RouterCommand::HandlerLaunched {
                        handler,
                        generation,
                        result,
                    })
                    .await;
            }
        });
    }

    fn handle_launched(
        &mut self,
        name: HandlerName,
        generation: u64,
        result: Result<Box<dyn ChildProcess>, ProcessError>,
    ) {
        let current = self
            .handlers
            .get(&name)
            .is_some_and(|agent| agent.generation == generation);
        if !current || self.shutting_down {
            debug!(handler = %name, generation, "Discarding stale handler launch");
            return;
        }

        let child = match result {
            Ok(child) => child,
            Err(e) => {
                error!(handler = %name, error = %e, "Failed to launch handler");
                self.on_handler_failed(&name);
                return;
            }
        };

        let pid = child.id();
        let exit_sender = self.self_sender.clone();
        let exit_name = name.clone();
        let process = watch(child, move |outcome| async move {
            if let Some(sender) = exit_sender.upgrade() {
                let _ = sender
                    .send(RouterCommand::HandlerExited {
                        handler: exit_name,
                        generation,
                        outcome,
                    })
                    .await;
            }
        });

        if let Some(agent) = self.handlers.get_mut(&name) {
            if agent.state == HandlerState::Deactivating {
                process.kill();
            } else {
                agent.state = HandlerState::Handshaking;
            }
            agent.process = Some(process);
        }
        info!(handler = %name, pid = ?pid, "Handler started");
    }

    fn handle_exited(&mut self, name: HandlerName, generation: u64, outcome: ExitOutcome) {
        let Some(agent) = self.handlers.get_mut(&name) else {
            return;
        };
        if agent.generation != generation {
            debug!(handler = %name, generation, "Ignoring exit of replaced handler");
            return;
        }

        // Nobody may contact a handler that is down
        agent.socket = None;
        agent.process = None;
        if let Some(link) = agent.link.take() {
            link.cancel();
        }

        if agent.state == HandlerState::Deactivating || self.shutting_down {
            info!(handler = %name, code = ?outcome.code, "Handler terminated");
            self.remove_handler(&name);
            return;
        }

        if outcome.crashed {
            warn!(handler = %name, "Handler process crashed, attempting restart");
        } else {
            warn!(
                handler = %name,
                code = ?outcome.code,
                "Handler process terminated without permission, attempting restart"
            );
        }
        self.on_handler_failed(&name);
    }

    /// Relaunches a handler under the same name, or tears it down together
    /// with its sessions once the restart budget is spent.
    fn on_handler_failed(&mut self, name: &HandlerName) {
        let Some(agent) = self.handlers.get_mut(name) else {
            return;
        };
        let attempt = agent.restarts;
        agent.restarts = agent.restarts.saturating_add(1);

        match self.policy.delay_for(attempt) {
            Some(delay) => self.launch_handler(name, delay),
            None => {
                error!(
                    handler = %name,
                    attempts = attempt,
                    "Handler restart budget exhausted, dropping its sessions"
                );
                let sessions: Vec<SessionId> = agent.sessions.iter().cloned().collect();
                for session in &sessions {
                    self.sessions.remove(session);
                }
                self.remove_handler(name);
            }
        }
    }

    fn handle_contact(&mut self, contact: HandlerContact, link: CancellationToken) {
        let Ok(name) = HandlerName::parse(&contact.handler_name) else {
            warn!(handler = %contact.handler_name, "Invalid handler name on control endpoint");
            link.cancel();
            return;
        };
        if contact.handler_socket.is_empty() {
            warn!(handler = %name, "Incomplete data received at handshake");
            link.cancel();
            return;
        }

        match contact.contact_type {
            ContactType::Handshake => {
                let Some(agent) = self.handlers.get_mut(&name) else {
                    warn!(handler = %name, "Invalid handler name received at handshake");
                    link.cancel();
                    return;
                };
                if agent.state == HandlerState::Deactivating {
                    debug!(handler = %name, "Handshake from deactivating handler refused");
                    link.cancel();
                    return;
                }

                if let Some(previous) = agent.link.replace(link) {
                    previous.cancel();
                }
                let socket = PathBuf::from(contact.handler_socket);
                agent.socket = Some(socket.clone());
                agent.state = HandlerState::Active;
                agent.restarts = 0;

                info!(handler = %name, socket = %socket.display(), "Handler handshake complete");
                self.publish(RouterEvent::HandlerSocketUpdated { name, socket });
            }
            ContactType::Suicide => {
                if !self.handlers.contains_key(&name) {
                    warn!(handler = %name, "Invalid handler name received for suicide");
                    link.cancel();
                    return;
                }
                info!(handler = %name, "Handler asked to terminate");
                self.deactivate(&name);
                link.cancel();
            }
        }
    }

    /// Unbinds a handler's sessions and tells it to exit.
    ///
    /// The sessions themselves stay valid; their next resolve spawns a new
    /// handler.
    fn deactivate(&mut self, name: &HandlerName) {
        let Some(agent) = self.handlers.get_mut(name) else {
            return;
        };
        if agent.state == HandlerState::Deactivating {
            return;
        }

        info!(handler = %name, "Deactivating handler");
        agent.state = HandlerState::Deactivating;
        agent.socket = None;
        let sessions = std::mem::take(&mut agent.sessions);
        let link = agent.link.take();
        let process = agent.process.clone();

        for session in sessions {
            if self.bindings.get(&session) == Some(name) {
                self.bindings.remove(&session);
            }
        }

        match (link, process) {
            // The handler exits on end of stream; teardown follows its exit
            (Some(link), _) => link.cancel(),
            (None, Some(process)) => process.kill(),
            // Launch still in flight, the child is discarded when it arrives
            (None, None) => self.remove_handler(name),
        }
    }

    fn remove_handler(&mut self, name: &HandlerName) {
        let Some(agent) = self.handlers.remove(name) else {
            return;
        };
        for session in &agent.sessions {
            if self.bindings.get(session) == Some(name) {
                self.bindings.remove(session);
            }
        }
        if let Some(link) = agent.link {
            link.cancel();
        }
        if let Some(process) = agent.process {
            process.kill();
        }

        debug!(handler = %name, "Handler removed");
        self.publish(RouterEvent::HandlerRemoved { name: name.clone() });
    }

    fn stop_handlers(&mut self) {
        let names: Vec<HandlerName> = self.handlers.keys().cloned().collect();
        for name in names {
            self.remove_handler(&name);
        }
    }

    fn snapshot(&self) -> RouterSnapshot {
        let mut sessions: Vec<SessionStatus> = self
            .sessions
            .iter()
            .map(|(id, entry)| SessionStatus {
                id: id.clone(),
                client_address: entry.client_address.clone(),
                created_at: entry.created_at,
                handler: self.bindings.get(id).cloned(),
            })
            .collect();
        sessions.sort_by_key(|s| s.created_at);

        let mut handlers: Vec<HandlerStatus> = self
            .handlers
            .iter()
            .map(|(name, agent)| {
                let mut bound: Vec<SessionId> = agent.sessions.iter().cloned().collect();
                bound.sort();
                HandlerStatus {
                    name: name.clone(),
                    state: agent.state,
                    socket: agent.socket.clone(),
                    pid: agent.process.as_ref().and_then(ProcessHandle::pid),
                    sessions: bound,
                    restarts: agent.restarts,
                }
            })
            .collect();
        handlers.sort_by(|a, b| a.name.cmp(&b.name));

        RouterSnapshot { sessions, handlers }
    }
}
