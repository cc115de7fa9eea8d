//! Supervisor actor - owns the request and response queues of one handler.
//!
//! Each worker kind has a lane: a request queue, a response queue, a
//! request id allocator and at most one surrogate process. Per lane:
//!
//! ```text
//!   NoWorker ──launch──▶ Launching ──spawned──▶ Starting ──handshake──▶ Running
//!      ▲                     │                      │                      │
//!      └───────── exit / launch failure ────────────┴──────────────────────┘
//! ```
//!
//! Only the head of a request queue is ever in flight. Its answer is
//! accepted only if the request is still the head when the answer arrives,
//! so cancelling an in-flight request simply discards its result.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Channel send failures are ignored; the receiver may be gone

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use fiber_core::{HandlerName, RequestId, RequestIdAllocator, RestartPolicy, WorkerKind};
use fiber_process::{watch, ChildProcess, ExitOutcome, ProcessError, ProcessHandle};
use fiber_protocol::{encode_raw, ContactType, Framing, ServiceReply, SurrogateContact};
use tokio::net::UnixStream;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

use super::commands::{LaneStatus, SupervisorCommand, SupervisorEvent, WorkerState};
use super::watchdog::{spawn_startup_deadline, spawn_watchdog, StartupDeadline, Watchdog};
use crate::context::FiberContext;

/// Error for the head request when its surrogate died.
pub const CRASHED: &str = "Crashed the server";

/// Error for the head request when the watchdog killed its surrogate.
pub const CRASHED_WITH_DEADLOCK: &str = "Crashed the server with a deadlock";

/// Error for every queued request once relaunching is given up.
pub const RESTART_LIMIT_REACHED: &str = "Worker restart limit reached";

// ============================================================================
// Lane State
// ============================================================================

struct PendingRequest {
    id: RequestId,
    payload: Bytes,
}

struct PendingResponse {
    id: RequestId,
    payload: Bytes,
}

/// Handshake that arrived before the launch task reported back.
struct EarlyHandshake {
    socket: PathBuf,
    connection: UnixStream,
}

enum WorkerSlot {
    NoWorker,
    Launching {
        generation: u64,
        early: Option<EarlyHandshake>,
    },
    Running(Worker),
}

impl WorkerSlot {
    fn generation(&self) -> Option<u64> {
        match self {
            WorkerSlot::NoWorker => None,
            WorkerSlot::Launching { generation, .. } => Some(*generation),
            WorkerSlot::Running(worker) => Some(worker.generation),
        }
    }
}

struct Worker {
    generation: u64,
    process: ProcessHandle,
    socket: Option<PathBuf>,
    /// Held open for the surrogate; dropping it makes the surrogate exit.
    handshake: Option<UnixStream>,
    deadlock: Arc<AtomicBool>,
    watchdog: CancellationToken,
    startup: CancellationToken,
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.watchdog.cancel();
        self.startup.cancel();
    }
}

struct Lane {
    kind: WorkerKind,
    allocator: RequestIdAllocator,
    requests: VecDeque<PendingRequest>,
    responses: VecDeque<PendingResponse>,
    in_flight: Option<RequestId>,
    worker: WorkerSlot,
    failures: u32,
}

impl Lane {
    fn new(kind: WorkerKind) -> Self {
        Self {
            kind,
            allocator: RequestIdAllocator::new(),
            requests: VecDeque::new(),
            responses: VecDeque::new(),
            in_flight: None,
            worker: WorkerSlot::NoWorker,
            failures: 0,
        }
    }

    fn is_idle(&self) -> bool {
        self.requests.is_empty() && self.responses.is_empty()
    }

    fn response_index(&self, id: RequestId) -> Option<usize> {
        self.responses.iter().position(|r| r.id == id)
    }

    fn status(&self) -> LaneStatus {
        let (state, pid, socket) = match &self.worker {
            WorkerSlot::NoWorker => (WorkerState::NoWorker, None, None),
            WorkerSlot::Launching { .. } => (WorkerState::Launching, None, None),
            WorkerSlot::Running(worker) => {
                let state = if worker.socket.is_some() {
                    WorkerState::Running
                } else {
                    WorkerState::Starting
                };
                (state, worker.process.pid(), worker.socket.clone())
            }
        };
        LaneStatus {
            kind: self.kind,
            state,
            pid,
            socket,
            queued_requests: self.requests.len(),
            queued_responses: self.responses.len(),
            consecutive_failures: self.failures,
        }
    }
}

/// What `dispatch_next` decided to do.
enum Next {
    Launch,
    Send {
        generation: u64,
        socket: PathBuf,
        id: RequestId,
        payload: Bytes,
    },
}

// ============================================================================
// Supervisor Actor
// ============================================================================

/// The supervisor actor - owns all queues and surrogate processes of one
/// handler.
///
/// Commands are processed sequentially in a single task. Launches,
/// dispatches and exit watching run in spawned tasks that report back
/// through the same command channel, so completions are always handled
/// after the command that triggered them has returned.
pub struct SupervisorActor {
    handler: HandlerName,
    ctx: FiberContext,
    policy: RestartPolicy,
    receiver: mpsc::Receiver<SupervisorCommand>,
    /// Weak so the actor does not keep its own channel open.
    self_sender: mpsc::WeakSender<SupervisorCommand>,
    event_publisher: broadcast::Sender<SupervisorEvent>,
    core: Lane,
    gui: Lane,
    next_generation: u64,
    shutting_down: bool,
    /// Stops the handshake listener when the actor stops.
    _listener_guard: DropGuard,
}

impl SupervisorActor {
    pub fn new(
        handler: HandlerName,
        ctx: FiberContext,
        receiver: mpsc::Receiver<SupervisorCommand>,
        self_sender: mpsc::WeakSender<SupervisorCommand>,
        event_publisher: broadcast::Sender<SupervisorEvent>,
        listener_stop: CancellationToken,
    ) -> Self {
        let policy = ctx.restart_policy();
        Self {
            handler,
            ctx,
            policy,
            receiver,
            self_sender,
            event_publisher,
            core: Lane::new(WorkerKind::Core),
            gui: Lane::new(WorkerKind::Gui),
            next_generation: 1,
            shutting_down: false,
            _listener_guard: listener_stop.drop_guard(),
        }
    }

    /// Runs the actor event loop until shutdown or until every handle is
    /// dropped.
    pub async fn run(mut self) {
        info!(handler = %self.handler, "Supervisor actor starting");

        while let Some(cmd) = self.receiver.recv().await {
            if !self.handle_command(cmd) {
                break;
            }
        }

        self.stop_workers();
        info!(handler = %self.handler, "Supervisor actor stopped");
    }

    fn lane(&self, kind: WorkerKind) -> &Lane {
        match kind {
            WorkerKind::Core => &self.core,
            WorkerKind::Gui => &self.gui,
        }
    }

    fn lane_mut(&mut self, kind: WorkerKind) -> &mut Lane {
        match kind {
            WorkerKind::Core => &mut self.core,
            WorkerKind::Gui => &mut self.gui,
        }
    }

    fn publish(&self, event: SupervisorEvent) {
        // No subscribers is fine
        let _ = self.event_publisher.send(event);
    }

    /// Dispatches a command. Returns `false` when the actor should stop.
    fn handle_command(&mut self, cmd: SupervisorCommand) -> bool {
        match cmd {
            SupervisorCommand::Submit {
                kind,
                payload,
                respond_to,
            } => {
                let id = self.handle_submit(kind, payload);
                let _ = respond_to.send(id);
                self.dispatch_next(kind);
            }
            SupervisorCommand::Cancel {
                kind,
                request_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_cancel(kind, request_id));
            }
            SupervisorCommand::ResponseSize {
                kind,
                request_id,
                respond_to,
            } => {
                let size = self
                    .lane(kind)
                    .responses
                    .iter()
                    .find(|r| r.id == request_id)
                    .map(|r| r.payload.len());
                let _ = respond_to.send(size);
            }
            SupervisorCommand::TakeResponse {
                kind,
                request_id,
                max_bytes,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_take_response(kind, request_id, max_bytes));
            }
            SupervisorCommand::AvailableResponses { kind, respond_to } => {
                let ids = self.lane(kind).responses.iter().map(|r| r.id).collect();
                let _ = respond_to.send(ids);
            }
            SupervisorCommand::PendingRequests { kind, respond_to } => {
                let ids = self.lane(kind).requests.iter().map(|r| r.id).collect();
                let _ = respond_to.send(ids);
            }
            SupervisorCommand::IsIdle { respond_to } => {
                let _ = respond_to.send(self.core.is_idle() && self.gui.is_idle());
            }
            SupervisorCommand::Status { respond_to } => {
                let _ = respond_to.send(vec![self.core.status(), self.gui.status()]);
            }
            SupervisorCommand::Shutdown { respond_to } => {
                info!(handler = %self.handler, "Supervisor shutdown requested");
                self.shutting_down = true;
                self.stop_workers();
                let _ = respond_to.send(());
                return false;
            }
            SupervisorCommand::SurrogateHandshake {
                contact,
                connection,
            } => self.handle_surrogate_handshake(contact, connection),
            SupervisorCommand::WorkerLaunched {
                kind,
                generation,
                result,
            } => self.handle_worker_launched(kind, generation, result),
            SupervisorCommand::WorkerExited {
                kind,
                generation,
                outcome,
            } => self.handle_worker_exited(kind, generation, outcome),
            SupervisorCommand::DispatchCompleted {
                kind,
                generation,
                request_id,
                result,
            } => self.handle_dispatch_completed(kind, generation, request_id, result),
        }
        true
    }

    // ------------------------------------------------------------------------
    // Queue operations
    // ------------------------------------------------------------------------

    fn handle_submit(&mut self, kind: WorkerKind, payload: Bytes) -> RequestId {
        let lane = self.lane_mut(kind);
        let id = lane.allocator.allocate();
        lane.requests.push_back(PendingRequest { id, payload });
        debug!(
            kind = %kind,
            request_id = %id,
            queued = lane.requests.len(),
            "Request queued"
        );
        id
    }

    fn handle_cancel(&mut self, kind: WorkerKind, id: RequestId) -> bool {
        let lane = self.lane_mut(kind);
        if let Some(pos) = lane.requests.iter().position(|r| r.id == id) {
            lane.requests.remove(pos);
            debug!(kind = %kind, request_id = %id, "Cancelled queued request");
            return true;
        }
        if let Some(pos) = lane.response_index(id) {
            lane.responses.remove(pos);
            debug!(kind = %kind, request_id = %id, "Dropped uncollected response");
            return true;
        }
        false
    }

    fn handle_take_response(
        &mut self,
        kind: WorkerKind,
        id: RequestId,
        max_bytes: i64,
    ) -> Option<Bytes> {
        let lane = self.lane_mut(kind);
        let pos = lane.response_index(id)?;
        let entry = lane.responses.get_mut(pos)?;

        let chunk = usize::try_from(max_bytes)
            .ok()
            .filter(|max| *max > 0 && *max < entry.payload.len());

        match chunk {
            Some(len) => Some(entry.payload.split_to(len)),
            None => lane.responses.remove(pos).map(|r| r.payload),
        }
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    fn dispatch_next(&mut self, kind: WorkerKind) {
        if self.shutting_down {
            return;
        }

        let next = {
            let lane = self.lane(kind);
            if lane.requests.is_empty() || lane.in_flight.is_some() {
                return;
            }
            match &lane.worker {
                WorkerSlot::NoWorker => Next::Launch,
                WorkerSlot::Launching { .. } => return,
                WorkerSlot::Running(worker) => {
                    let (Some(socket), Some(head)) = (&worker.socket, lane.requests.front())
                    else {
                        // Waiting for the handshake
                        return;
                    };
                    Next::Send {
                        generation: worker.generation,
                        socket: socket.clone(),
                        id: head.id,
                        payload: head.payload.clone(),
                    }
                }
            }
        };

        match next {
            Next::Launch => self.launch_worker(kind, Duration::ZERO),
            Next::Send {
                generation,
                socket,
                id,
                payload,
            } => {
                self.lane_mut(kind).in_flight = Some(id);
                self.spawn_dispatch(kind, generation, socket, id, payload);
            }
        }
    }

    fn spawn_dispatch(
        &self,
        kind: WorkerKind,
        generation: u64,
        socket: PathBuf,
        id: RequestId,
        payload: Bytes,
    ) {
        let Some(sender) = self.self_sender.upgrade() else {
            return;
        };
        // Service calls may legitimately run long; the watchdog covers hangs.
        let dialer = self.ctx.dialer().with_read_timeout(None);
        debug!(kind = %kind, request_id = %id, "Dispatching request to surrogate");

        tokio::spawn(async move {
            let message = encode_raw(&payload, Framing::Footer);
            let result = dialer
                .request_raw(&socket, &message, Framing::Footer)
                .await
                .map(BytesMut::freeze)
                .map_err(|e| e.to_string());
            let _ = sender
                .send(SupervisorCommand::DispatchCompleted {
                    kind,
                    generation,
                    request_id: id,
                    result,
                })
                .await;
        });
    }

    fn handle_dispatch_completed(
        &mut self,
        kind: WorkerKind,
        generation: u64,
        id: RequestId,
        result: Result<Bytes, String>,
    ) {
        let lane = self.lane_mut(kind);
        if lane.worker.generation() != Some(generation) {
            debug!(kind = %kind, request_id = %id, "Ignoring completion from replaced surrogate");
            return;
        }
        if lane.in_flight == Some(id) {
            lane.in_flight = None;
        }

        match result {
            Ok(payload) => {
                let still_head = lane.requests.front().map(|r| r.id) == Some(id);
                if still_head {
                    lane.requests.pop_front();
                    lane.responses.push_back(PendingResponse { id, payload });
                    lane.failures = 0;
                    debug!(kind = %kind, request_id = %id, "Response available");
                    self.publish(SupervisorEvent::ResponseAvailable {
                        kind,
                        request_id: id,
                    });
                } else {
                    debug!(kind = %kind, request_id = %id, "Discarding response of cancelled request");
                }
                self.dispatch_next(kind);
            }
            Err(reason) => {
                // The exit path reports the failure for the head request.
                warn!(
                    kind = %kind,
                    request_id = %id,
                    error = %reason,
                    "Dispatch failed, killing surrogate"
                );
                if let WorkerSlot::Running(worker) = &lane.worker {
                    worker.process.kill();
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Worker lifecycle
    // ------------------------------------------------------------------------

    fn launch_worker(&mut self, kind: WorkerKind, delay: Duration) {
        let generation = self.next_generation;
        self.next_generation += 1;

        let spec = self.ctx.surrogate_spec(&self.handler, kind);
        let launcher = Arc::clone(self.ctx.launcher());
        let sender = self.self_sender.clone();
        self.lane_mut(kind).worker = WorkerSlot::Launching {
            generation,
            early: None,
        };

        info!(
            handler = %self.handler,
            kind = %kind,
            delay = ?delay,
            "Launching surrogate"
        );

        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let result = launcher.launch(&spec).await;
            // A child nobody receives is dropped, which kills it.
            if let Some(sender) = sender.upgrade() {
                let _ = sender
                    .send(SupervisorCommand::WorkerLaunched {
                        kind,
                        generation,
                        result,
                    })
                    .await;
            }
        });
    }

    fn handle_worker_launched(
        &mut self,
        kind: WorkerKind,
        generation: u64,
        result: Result<Box<dyn ChildProcess>, ProcessError>,
    ) {
        let expected = matches!(
            &self.lane(kind).worker,
            WorkerSlot::Launching { generation: g, .. } if *g == generation
        );
        if !expected || self.shutting_down {
            debug!(kind = %kind, generation, "Discarding stale launch");
            return;
        }

        match result {
            Ok(child) => {
                let pid = child.id();
                let exit_sender = self.self_sender.clone();
                let process = watch(child, move |outcome| async move {
                    if let Some(sender) = exit_sender.upgrade() {
                        let _ = sender
                            .send(SupervisorCommand::WorkerExited {
                                kind,
                                generation,
                                outcome,
                            })
                            .await;
                    }
                });

                let slot = std::mem::replace(&mut self.lane_mut(kind).worker, WorkerSlot::NoWorker);
                let early = match slot {
                    WorkerSlot::Launching { early, .. } => early,
                    _ => None,
                };
                let deadlock = Arc::new(AtomicBool::new(false));
                let startup = CancellationToken::new();
                spawn_startup_deadline(StartupDeadline {
                    surrogate: self.handler.surrogate_name(kind),
                    process: process.clone(),
                    deadlock: Arc::clone(&deadlock),
                    timeout: self.ctx.config().handshake_timeout(),
                    cancel: startup.clone(),
                });
                self.lane_mut(kind).worker = WorkerSlot::Running(Worker {
                    generation,
                    process,
                    socket: None,
                    handshake: None,
                    deadlock,
                    watchdog: CancellationToken::new(),
                    startup,
                });

                info!(handler = %self.handler, kind = %kind, pid = ?pid, "Surrogate started");
                self.publish(SupervisorEvent::WorkerStarted { kind, pid });

                if let Some(early) = early {
                    self.attach_handshake(kind, early.socket, early.connection);
                    self.dispatch_next(kind);
                }
            }
            Err(e) => {
                error!(handler = %self.handler, kind = %kind, error = %e, "Failed to launch surrogate");
                self.lane_mut(kind).worker = WorkerSlot::NoWorker;
                self.on_worker_gone(kind, Some(format!("Failed to launch worker: {e}")));
            }
        }
    }

    fn handle_surrogate_handshake(&mut self, contact: SurrogateContact, connection: UnixStream) {
        if contact.contact_type != ContactType::Handshake {
            warn!(surrogate = %contact.surrogate_name, "Unexpected contact type from surrogate");
            return;
        }
        let Some(kind) = self.handler.kind_of_surrogate(&contact.surrogate_name) else {
            warn!(surrogate = %contact.surrogate_name, "Handshake from unknown surrogate");
            return;
        };

        let socket = PathBuf::from(&contact.surrogate_socket);
        match &mut self.lane_mut(kind).worker {
            WorkerSlot::Launching { early, .. } => {
                *early = Some(EarlyHandshake { socket, connection });
                return;
            }
            WorkerSlot::Running(_) => {}
            WorkerSlot::NoWorker => {
                warn!(surrogate = %contact.surrogate_name, "Handshake without a launched surrogate");
                return;
            }
        }

        self.attach_handshake(kind, socket, connection);
        self.dispatch_next(kind);
    }

    fn attach_handshake(&mut self, kind: WorkerKind, socket: PathBuf, connection: UnixStream) {
        let name = self.handler.surrogate_name(kind);
        let interval = self.ctx.config().watchdog_interval();
        let probe_timeout = self.ctx.config().watchdog_connect_timeout();

        let WorkerSlot::Running(worker) = &mut self.lane_mut(kind).worker else {
            return;
        };
        if worker.socket.is_some() {
            warn!(surrogate = %name, "Duplicate surrogate handshake ignored");
            return;
        }

        worker.startup.cancel();
        worker.socket = Some(socket.clone());
        worker.handshake = Some(connection);
        spawn_watchdog(Watchdog {
            surrogate: name.clone(),
            socket,
            process: worker.process.clone(),
            deadlock: Arc::clone(&worker.deadlock),
            interval,
            probe_timeout,
            cancel: worker.watchdog.clone(),
        });

        info!(surrogate = %name, "Surrogate handshake complete");
    }

    fn handle_worker_exited(&mut self, kind: WorkerKind, generation: u64, outcome: ExitOutcome) {
        let lane = self.lane_mut(kind);
        if lane.worker.generation() != Some(generation) {
            debug!(kind = %kind, generation, "Ignoring exit of replaced surrogate");
            return;
        }
        let deadlock = match std::mem::replace(&mut lane.worker, WorkerSlot::NoWorker) {
            WorkerSlot::Running(worker) => worker.deadlock.load(Ordering::SeqCst),
            _ => false,
        };

        if outcome.is_failure() {
            warn!(
                handler = %self.handler,
                kind = %kind,
                code = ?outcome.code,
                crashed = outcome.crashed,
                deadlock,
                "Surrogate died"
            );
        } else {
            info!(handler = %self.handler, kind = %kind, "Surrogate exited");
        }
        self.publish(SupervisorEvent::WorkerExited {
            kind,
            outcome,
            deadlock,
        });

        let failure = outcome.is_failure().then(|| {
            if deadlock {
                CRASHED_WITH_DEADLOCK.to_string()
            } else {
                CRASHED.to_string()
            }
        });
        self.on_worker_gone(kind, failure);
    }

    /// Common tail of exits and failed launches.
    ///
    /// A failure answers the head request with `failure` and counts against
    /// the restart budget. Remaining requests trigger a relaunch.
    fn on_worker_gone(&mut self, kind: WorkerKind, failure: Option<String>) {
        let server = self.handler.surrogate_name(kind);
        let lane = self.lane_mut(kind);
        lane.in_flight = None;

        let mut synthesized = None;
        if let Some(message) = failure {
            lane.failures = lane.failures.saturating_add(1);
            if let Some(head) = lane.requests.pop_front() {
                lane.responses.push_back(PendingResponse {
                    id: head.id,
                    payload: error_payload(&message, &server),
                });
                synthesized = Some((head.id, message));
            }
        }
        let remaining = lane.requests.len();
        let failures = lane.failures;

        if let Some((request_id, message)) = synthesized {
            warn!(kind = %kind, request_id = %request_id, error = %message, "Synthesized error response");
            self.publish(SupervisorEvent::ResponseAvailable { kind, request_id });
        }

        if remaining > 0 && !self.shutting_down {
            self.relaunch(kind, failures);
        }
    }

    fn relaunch(&mut self, kind: WorkerKind, failures: u32) {
        if failures == 0 {
            self.launch_worker(kind, Duration::ZERO);
            return;
        }
        match self.policy.delay_for(failures - 1) {
            Some(delay) => self.launch_worker(kind, delay),
            None => {
                error!(
                    handler = %self.handler,
                    kind = %kind,
                    failures,
                    "Surrogate restart budget exhausted, failing queued requests"
                );
                self.fail_all_requests(kind, RESTART_LIMIT_REACHED);
                self.lane_mut(kind).failures = 0;
            }
        }
    }

    fn fail_all_requests(&mut self, kind: WorkerKind, message: &str) {
        let server = self.handler.surrogate_name(kind);
        let lane = self.lane_mut(kind);
        let failed: Vec<RequestId> = lane.requests.iter().map(|r| r.id).collect();
        for request in lane.requests.drain(..) {
            lane.responses.push_back(PendingResponse {
                id: request.id,
                payload: error_payload(message, &server),
            });
        }
        for request_id in failed {
            self.publish(SupervisorEvent::ResponseAvailable { kind, request_id });
        }
    }

    fn stop_workers(&mut self) {
        for lane in [&mut self.core, &mut self.gui] {
            if let WorkerSlot::Running(worker) =
                std::mem::replace(&mut lane.worker, WorkerSlot::NoWorker)
            {
                worker.process.kill();
            }
            lane.in_flight = None;
        }
    }
}

/// Surrogate-shaped error reply stored as a response payload.
fn error_payload(message: &str, server: &str) -> Bytes {
    serde_json::to_vec(&ServiceReply::failed(message, server))
        .map(Bytes::from)
        .unwrap_or_default()
}
