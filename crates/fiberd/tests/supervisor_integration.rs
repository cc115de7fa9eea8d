//! Integration tests for the supervisor.
//!
//! A supervisor is spawned directly and its surrogates run in-process, so
//! queues, dispatch, crash recovery and the watchdog are exercised end to
//! end over real sockets.
//!
//! Tests CAN use `.unwrap()` and `.expect()` - this is allowed.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::{eventually, test_config, InProcessLauncher, SurrogateMode, TEST_TIMEOUT};
use fiber_core::{FiberConfig, HandlerName, RequestId, WorkerKind};
use fiber_protocol::{ServiceCall, ServiceReply};
use fiberd::supervisor::{
    spawn_supervisor, SupervisorEvent, SupervisorHandle, WorkerState, CRASHED,
    CRASHED_WITH_DEADLOCK, RESTART_LIMIT_REACHED,
};
use fiberd::FiberContext;
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::time::timeout;

// ============================================================================
// Test Helpers
// ============================================================================

struct TestSupervisor {
    handle: SupervisorHandle,
    launcher: Arc<InProcessLauncher>,
    _dir: TempDir,
}

impl TestSupervisor {
    fn spawn() -> Self {
        Self::spawn_with(|_| {})
    }

    fn spawn_with(adjust: impl FnOnce(&mut FiberConfig)) -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let mut config = test_config(dir.path());
        adjust(&mut config);
        let launcher = InProcessLauncher::new(config.clone());
        let ctx = FiberContext::new(config, launcher.clone());
        let handle = spawn_supervisor(HandlerName::from_index(1), ctx).expect("spawn supervisor");
        Self {
            handle,
            launcher,
            _dir: dir,
        }
    }

    async fn submit(&self, kind: WorkerKind, call: &ServiceCall) -> RequestId {
        let payload = Bytes::from(serde_json::to_vec(call).unwrap());
        self.handle.submit(kind, payload).await.unwrap()
    }

    /// Waits for the response of `id` and drains it.
    async fn reply(
        &self,
        events: &mut broadcast::Receiver<SupervisorEvent>,
        kind: WorkerKind,
        id: RequestId,
    ) -> ServiceReply {
        wait_available(events, kind, id).await;
        let bytes = self
            .handle
            .take_response(kind, id, 0)
            .await
            .unwrap()
            .expect("response present");
        serde_json::from_slice(&bytes).unwrap()
    }
}

async fn wait_available(
    events: &mut broadcast::Receiver<SupervisorEvent>,
    kind: WorkerKind,
    id: RequestId,
) {
    timeout(TEST_TIMEOUT, async {
        loop {
            if let SupervisorEvent::ResponseAvailable {
                kind: k,
                request_id,
            } = events.recv().await.unwrap()
            {
                if k == kind && request_id == id {
                    return;
                }
            }
        }
    })
    .await
    .expect("response within timeout");
}

fn echo(value: &str) -> ServiceCall {
    ServiceCall::new("Fiber", "Diagnostics", "echo").with_arg(value)
}

// ============================================================================
// Queues and dispatch
// ============================================================================

#[tokio::test]
async fn test_request_ids_are_per_kind_and_start_at_one() {
    let sup = TestSupervisor::spawn();

    let c1 = sup.submit(WorkerKind::Core, &echo("a")).await;
    let c2 = sup.submit(WorkerKind::Core, &echo("b")).await;
    let g1 = sup.submit(WorkerKind::Gui, &echo("c")).await;

    assert_eq!(c1, RequestId::new(1));
    assert_eq!(c2, RequestId::new(2));
    assert_eq!(g1, RequestId::new(1));
}

#[tokio::test]
async fn test_request_is_answered_by_surrogate() {
    let sup = TestSupervisor::spawn();
    let mut events = sup.handle.subscribe();

    let id = sup.submit(WorkerKind::Core, &echo("hello")).await;
    let reply = sup.reply(&mut events, WorkerKind::Core, id).await;

    assert!(reply.success);
    assert_eq!(reply.result, json!("hello"));
    assert_eq!(reply.server, "Handler1CoreSurrogate");
    assert_eq!(sup.launcher.launch_count("fiber-surrogate"), 1);
}

#[tokio::test]
async fn test_responses_arrive_in_submission_order() {
    let sup = TestSupervisor::spawn();
    let mut events = sup.handle.subscribe();

    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(sup.submit(WorkerKind::Core, &echo(&i.to_string())).await);
    }

    let mut seen = Vec::new();
    timeout(TEST_TIMEOUT, async {
        while seen.len() < ids.len() {
            if let Ok(SupervisorEvent::ResponseAvailable { request_id, .. }) = events.recv().await {
                seen.push(request_id);
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(seen, ids);

    let available = sup.handle.available_responses(WorkerKind::Core).await.unwrap();
    assert_eq!(available, ids);
    // One surrogate serves the whole queue
    assert_eq!(sup.launcher.launch_count("fiber-surrogate"), 1);
}

#[tokio::test]
async fn test_kinds_get_separate_surrogates() {
    let sup = TestSupervisor::spawn();

    let core = sup.submit(WorkerKind::Core, &echo("c")).await;
    let gui = sup.submit(WorkerKind::Gui, &echo("g")).await;

    let handle = &sup.handle;
    for (kind, id) in [(WorkerKind::Core, core), (WorkerKind::Gui, gui)] {
        eventually("response", move || async move {
            handle.response_size(kind, id).await.unwrap().is_some()
        })
        .await;
    }

    let core_reply: ServiceReply = serde_json::from_slice(
        &sup.handle
            .take_response(WorkerKind::Core, core, 0)
            .await
            .unwrap()
            .unwrap(),
    )
    .unwrap();
    let gui_reply: ServiceReply = serde_json::from_slice(
        &sup.handle
            .take_response(WorkerKind::Gui, gui, 0)
            .await
            .unwrap()
            .unwrap(),
    )
    .unwrap();

    assert_eq!(core_reply.server, "Handler1CoreSurrogate");
    assert_eq!(gui_reply.server, "Handler1GuiSurrogate");
    assert_eq!(sup.launcher.launch_count("fiber-surrogate"), 2);
}

#[tokio::test]
async fn test_partial_reads_drain_response() {
    let sup = TestSupervisor::spawn();
    let mut events = sup.handle.subscribe();

    let call = ServiceCall::new("Test", "Payload", "blob").with_arg(100);
    let id = sup.submit(WorkerKind::Core, &call).await;
    wait_available(&mut events, WorkerKind::Core, id).await;

    let total = sup
        .handle
        .response_size(WorkerKind::Core, id)
        .await
        .unwrap()
        .unwrap();
    assert!(total > 100);

    let mut collected = Vec::new();
    let first = sup
        .handle
        .take_response(WorkerKind::Core, id, 40)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.len(), 40);
    collected.extend_from_slice(&first);
    assert_eq!(
        sup.handle.response_size(WorkerKind::Core, id).await.unwrap(),
        Some(total - 40)
    );

    let rest = sup
        .handle
        .take_response(WorkerKind::Core, id, -1)
        .await
        .unwrap()
        .unwrap();
    collected.extend_from_slice(&rest);
    assert_eq!(collected.len(), total);

    // Fully drained responses are gone
    assert_eq!(sup.handle.response_size(WorkerKind::Core, id).await.unwrap(), None);
    let reply: ServiceReply = serde_json::from_slice(&collected).unwrap();
    assert_eq!(reply.result.as_str().unwrap().len(), 100);
}

#[tokio::test]
async fn test_cancel_queued_request() {
    let sup = TestSupervisor::spawn();
    let mut events = sup.handle.subscribe();

    let slow = ServiceCall::new("Fiber", "Diagnostics", "sleep").with_arg(300);
    let first = sup.submit(WorkerKind::Core, &slow).await;
    let second = sup.submit(WorkerKind::Core, &echo("never")).await;
    let third = sup.submit(WorkerKind::Core, &echo("kept")).await;
    assert_eq!(
        sup.handle.pending_requests(WorkerKind::Core).await.unwrap(),
        vec![first, second, third]
    );

    assert!(sup.handle.cancel(WorkerKind::Core, second).await.unwrap());
    assert!(!sup.handle.cancel(WorkerKind::Core, second).await.unwrap());
    assert_eq!(
        sup.handle.pending_requests(WorkerKind::Core).await.unwrap(),
        vec![first, third]
    );

    sup.reply(&mut events, WorkerKind::Core, first).await;
    let kept = sup.reply(&mut events, WorkerKind::Core, third).await;
    assert_eq!(kept.result, json!("kept"));
    assert!(sup
        .handle
        .take_response(WorkerKind::Core, second, 0)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_cancel_in_flight_discards_result() {
    let sup = TestSupervisor::spawn();
    let mut events = sup.handle.subscribe();

    let slow = ServiceCall::new("Fiber", "Diagnostics", "sleep").with_arg(200);
    let id = sup.submit(WorkerKind::Core, &slow).await;
    let handle = &sup.handle;
    eventually("request in flight", move || async move {
        let status = handle.status().await.unwrap();
        status.iter().any(|s| s.kind == WorkerKind::Core && s.state == WorkerState::Running)
    })
    .await;
    assert!(sup.handle.cancel(WorkerKind::Core, id).await.unwrap());

    let next = sup.submit(WorkerKind::Core, &echo("after")).await;
    let reply = sup.reply(&mut events, WorkerKind::Core, next).await;
    assert_eq!(reply.result, json!("after"));
    assert!(sup
        .handle
        .response_size(WorkerKind::Core, id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_is_idle_tracks_both_queues() {
    let sup = TestSupervisor::spawn();
    let mut events = sup.handle.subscribe();
    assert!(sup.handle.is_idle().await.unwrap());

    let id = sup.submit(WorkerKind::Gui, &echo("x")).await;
    assert!(!sup.handle.is_idle().await.unwrap());

    wait_available(&mut events, WorkerKind::Gui, id).await;
    // Uncollected responses keep the handler busy
    assert!(!sup.handle.is_idle().await.unwrap());

    sup.handle.take_response(WorkerKind::Gui, id, 0).await.unwrap();
    assert!(sup.handle.is_idle().await.unwrap());
}

// ============================================================================
// Failure handling
// ============================================================================

#[tokio::test]
async fn test_crash_answers_head_and_relaunches() {
    let sup = TestSupervisor::spawn();
    let mut events = sup.handle.subscribe();

    let crash = sup
        .submit(WorkerKind::Core, &ServiceCall::new("Test", "Crash", "now"))
        .await;
    let after = sup.submit(WorkerKind::Core, &echo("survivor")).await;

    let reply = sup.reply(&mut events, WorkerKind::Core, crash).await;
    assert!(!reply.success);
    assert_eq!(reply.error, CRASHED);
    assert_eq!(reply.server, "Handler1CoreSurrogate");

    let reply = sup.reply(&mut events, WorkerKind::Core, after).await;
    assert!(reply.success);
    assert_eq!(reply.result, json!("survivor"));
    assert_eq!(sup.launcher.launch_count("fiber-surrogate"), 2);
}

#[tokio::test]
async fn test_watchdog_kills_hung_surrogate() {
    let sup = TestSupervisor::spawn();
    sup.launcher.set_surrogate_mode(SurrogateMode::Hang);
    let mut events = sup.handle.subscribe();

    let id = sup.submit(WorkerKind::Core, &echo("stuck")).await;
    let reply = sup.reply(&mut events, WorkerKind::Core, id).await;

    assert!(!reply.success);
    assert_eq!(reply.error, CRASHED_WITH_DEADLOCK);
}

#[tokio::test]
async fn test_surrogate_that_never_handshakes_is_killed() {
    let sup = TestSupervisor::spawn_with(|config| {
        config.timeouts.handshake = 400;
    });
    sup.launcher.set_surrogate_mode(SurrogateMode::Silent);
    let mut events = sup.handle.subscribe();

    let stuck = sup.submit(WorkerKind::Core, &echo("never")).await;
    let after = sup.submit(WorkerKind::Core, &echo("second try")).await;
    eventually("first surrogate launch", || async {
        sup.launcher.launch_count("fiber-surrogate") == 1
    })
    .await;
    sup.launcher.set_surrogate_mode(SurrogateMode::Real);

    let reply = sup.reply(&mut events, WorkerKind::Core, stuck).await;
    assert!(!reply.success);
    assert_eq!(reply.error, CRASHED_WITH_DEADLOCK);

    let reply = sup.reply(&mut events, WorkerKind::Core, after).await;
    assert!(reply.success);
    assert_eq!(reply.result, json!("second try"));
    assert_eq!(sup.launcher.launch_count("fiber-surrogate"), 2);
}

#[tokio::test]
async fn test_restart_budget_fails_whole_queue() {
    let sup = TestSupervisor::spawn_with(|config| {
        config.restart.max_attempts = 1;
    });
    let mut events = sup.handle.subscribe();

    let crash = ServiceCall::new("Test", "Crash", "now");
    let first = sup.submit(WorkerKind::Core, &crash).await;
    let second = sup.submit(WorkerKind::Core, &crash).await;
    let third = sup.submit(WorkerKind::Core, &echo("x")).await;

    assert_eq!(sup.reply(&mut events, WorkerKind::Core, first).await.error, CRASHED);
    assert_eq!(sup.reply(&mut events, WorkerKind::Core, second).await.error, CRASHED);
    assert_eq!(
        sup.reply(&mut events, WorkerKind::Core, third).await.error,
        RESTART_LIMIT_REACHED
    );
    assert!(sup.handle.is_idle().await.unwrap());
}

#[tokio::test]
async fn test_shutdown_stops_actor() {
    let sup = TestSupervisor::spawn();
    let mut events = sup.handle.subscribe();
    let id = sup.submit(WorkerKind::Core, &echo("x")).await;
    wait_available(&mut events, WorkerKind::Core, id).await;

    sup.handle.shutdown().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(sup.handle.is_idle().await.is_err());
}
