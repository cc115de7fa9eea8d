//! Integration tests for the router actor and the handler's side of the
//! control protocol.
//!
//! Router tests drive `RouterHandle` directly; handler tests run a
//! `HandlerServer` against a fake `FiberControl` endpoint and read what it
//! sends.
//!
//! Tests CAN use `.unwrap()` and `.expect()` - this is allowed.

mod common;

use std::path::PathBuf;
use std::time::Duration;

use common::{
    eventually, test_config, wait_for_socket, InProcessLauncher, TestFiber, TEST_TIMEOUT,
};
use fiber_client::{ClientConfig, HandlerClient};
use fiber_core::{FiberConfig, HandlerName, SessionId, WorkerKind};
use fiber_protocol::{encode, FrameDecoder, FrameReader, Framing, Listener, ServiceCall};
use fiberd::handler::HandlerServer;
use fiberd::router::{RouterError, RouterEvent};
use fiberd::FiberContext;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Test Helpers
// ============================================================================

async fn socket_updated(
    events: &mut broadcast::Receiver<RouterEvent>,
    handler: &HandlerName,
) -> PathBuf {
    timeout(TEST_TIMEOUT, async {
        loop {
            match events.recv().await.unwrap() {
                RouterEvent::HandlerSocketUpdated { name, socket } if &name == handler => {
                    return socket
                }
                _ => {}
            }
        }
    })
    .await
    .expect("handler never completed its handshake")
}

/// A handler process running against a fake router control endpoint.
struct LoneHandler {
    _dir: TempDir,
    config: FiberConfig,
    socket: PathBuf,
    control: FrameReader<UnixStream>,
    task: JoinHandle<bool>,
}

impl LoneHandler {
    async fn spawn() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.auto_time_out.kill_on_time_out = true;

        let launcher = InProcessLauncher::new(config.clone());
        let ctx = FiberContext::new(config.clone(), launcher);
        let control = Listener::bind(ctx.endpoints(), &config.endpoints.control).unwrap();
        let socket = ctx.endpoints().path_for("Handler9");

        let server = HandlerServer::new(HandlerName::parse("Handler9").unwrap(), ctx);
        let task = tokio::spawn(async move { server.run(CancellationToken::new()).await.is_ok() });

        let stream = timeout(TEST_TIMEOUT, control.accept()).await.unwrap().unwrap();
        let mut control = FrameReader::new(stream, FrameDecoder::strict());
        let handshake = control.next_value().await.unwrap();
        assert_eq!(handshake["contactType"], "HANDSHAKE");
        assert_eq!(handshake["handlerName"], "Handler9");
        assert_eq!(handshake["handlerSocket"], socket.to_string_lossy().as_ref());
        wait_for_socket(&socket).await;

        Self {
            _dir: dir,
            config,
            socket,
            control,
            task,
        }
    }

    async fn next_contact(&mut self, within: Duration) -> Option<Value> {
        timeout(within, self.control.next_value()).await.ok()?.ok()
    }
}

// ============================================================================
// Sessions
// ============================================================================

#[tokio::test]
async fn test_session_lifecycle() {
    let fiber = TestFiber::spawn().await;
    let router = &fiber.router;

    let session = router.create_session("1.2.3.4").await.unwrap();
    assert!(!session.as_str().is_empty());

    let first = router.resolve_handler(session.clone()).await.unwrap();
    assert_eq!(first, HandlerName::from_index(1));
    let again = router.resolve_handler(session.clone()).await.unwrap();
    assert_eq!(again, first);

    assert!(router.terminate_session(session.clone()).await.unwrap());
    assert!(!router.terminate_session(session.clone()).await.unwrap());

    let err = router.resolve_handler(session.clone()).await.unwrap_err();
    assert!(matches!(err, RouterError::InvalidSession { session: s } if s == session));

    fiber.shutdown().await;
}

#[tokio::test]
async fn test_sessions_are_unique() {
    let fiber = TestFiber::spawn().await;

    let a = fiber.router.create_session("1.2.3.4").await.unwrap();
    let b = fiber.router.create_session("1.2.3.4").await.unwrap();
    assert_ne!(a, b);

    let snapshot = fiber.router.snapshot().await.unwrap();
    assert_eq!(snapshot.sessions.len(), 2);
    assert!(snapshot.sessions.iter().all(|s| s.handler.is_none()));

    fiber.shutdown().await;
}

// ============================================================================
// Handlers
// ============================================================================

#[tokio::test]
async fn test_local_socket_known_after_handshake() {
    let fiber = TestFiber::spawn().await;
    let mut events = fiber.router.subscribe();

    let name = fiber.router.resolve_handler(SessionId::null()).await.unwrap();
    let socket = socket_updated(&mut events, &name).await;

    assert_eq!(socket, fiber.path_for("Handler1"));
    assert_eq!(
        fiber.router.local_socket(name.clone()).await.unwrap(),
        Some(socket)
    );
    assert_eq!(
        fiber
            .router
            .local_socket(HandlerName::from_index(77))
            .await
            .unwrap(),
        None
    );

    fiber.shutdown().await;
}

#[tokio::test]
async fn test_handler_names_are_never_reused() {
    let fiber = TestFiber::spawn().await;
    let mut events = fiber.router.subscribe();

    let first = fiber.router.create_session("a").await.unwrap();
    let name = fiber.router.resolve_handler(first.clone()).await.unwrap();
    socket_updated(&mut events, &name).await;

    fiber.router.terminate_session(first).await.unwrap();
    timeout(TEST_TIMEOUT, async {
        loop {
            if let RouterEvent::HandlerRemoved { name: removed } = events.recv().await.unwrap() {
                if removed == name {
                    return;
                }
            }
        }
    })
    .await
    .unwrap();

    let second = fiber.router.create_session("b").await.unwrap();
    let next = fiber.router.resolve_handler(second).await.unwrap();
    assert_eq!(next, HandlerName::from_index(2));

    fiber.shutdown().await;
}

#[tokio::test]
async fn test_ending_one_session_leaves_other_handlers() {
    let fiber = TestFiber::spawn().await;

    let a = fiber.router.create_session("a").await.unwrap();
    let b = fiber.router.create_session("b").await.unwrap();
    let for_a = fiber.router.resolve_handler(a.clone()).await.unwrap();
    let for_b = fiber.router.resolve_handler(b.clone()).await.unwrap();
    // NULL is bound like any other key, to a handler of its own
    let for_null = fiber.router.resolve_handler(SessionId::null()).await.unwrap();
    assert_ne!(for_a, for_b);
    assert_ne!(for_null, for_a);
    assert_ne!(for_null, for_b);

    fiber.router.terminate_session(a).await.unwrap();
    eventually("first handler removal", || async {
        fiber.router.snapshot().await.unwrap().handler(&for_a).is_none()
    })
    .await;

    let snapshot = fiber.router.snapshot().await.unwrap();
    assert_eq!(snapshot.handler(&for_b).unwrap().sessions, vec![b]);
    assert_eq!(
        snapshot.handler(&for_null).unwrap().sessions,
        vec![SessionId::null()]
    );
    assert_eq!(
        fiber.router.resolve_handler(SessionId::null()).await.unwrap(),
        for_null
    );

    fiber.shutdown().await;
}

#[tokio::test]
async fn test_garbage_on_control_endpoint_is_dropped() {
    let fiber = TestFiber::spawn().await;

    let mut stream = UnixStream::connect(fiber.path_for("FiberControl")).await.unwrap();
    let junk = encode(&json!({"contactType": "HELLO"}), Framing::Footer).unwrap();
    stream.write_all(&junk).await.unwrap();

    let mut buf = [0u8; 16];
    let read = timeout(TEST_TIMEOUT, stream.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(read, 0, "router should hang up on an invalid contact");

    // The router is unaffected
    assert!(fiber.router.create_session("x").await.is_ok());
    assert!(fiber.router.snapshot().await.unwrap().handlers.is_empty());

    fiber.shutdown().await;
}

// ============================================================================
// Handler idle timeout
// ============================================================================

#[tokio::test]
async fn test_idle_handler_sends_exactly_one_suicide() {
    let mut handler = LoneHandler::spawn().await;

    let letter = handler.next_contact(TEST_TIMEOUT).await.expect("no suicide letter");
    assert_eq!(letter["contactType"], "SUICIDE");
    assert_eq!(letter["handlerName"], "Handler9");

    // Waiting for the router, never asking twice
    let refresh = Duration::from_millis(handler.config.auto_time_out.refresh_interval);
    let timeout_interval = Duration::from_millis(handler.config.auto_time_out.time_out_interval);
    assert!(handler
        .next_contact(2 * (refresh + timeout_interval))
        .await
        .is_none());
    assert!(!handler.task.is_finished());

    // Router hangs up: the handler exits and removes its socket
    let LoneHandler {
        control,
        task,
        socket,
        ..
    } = handler;
    drop(control);
    assert!(timeout(TEST_TIMEOUT, task).await.unwrap().unwrap());
    assert!(!socket.exists());
}

#[tokio::test]
async fn test_requests_postpone_suicide() {
    let mut handler = LoneHandler::spawn().await;
    let client = HandlerClient::new(
        &handler.socket,
        &ClientConfig::from_fiber_config(&handler.config),
    );

    // Keep the handler busy for well over one idle timeout
    let busy = async {
        for _ in 0..20 {
            let reply = client
                .call(WorkerKind::Core, &ServiceCall::ping())
                .await
                .unwrap();
            assert!(reply.success);
            sleep(Duration::from_millis(50)).await;
        }
    };
    tokio::select! {
        _ = busy => {}
        contact = handler.control.next_value() => {
            panic!("busy handler asked to retire: {contact:?}");
        }
    }

    let letter = handler.next_contact(TEST_TIMEOUT).await.expect("no suicide letter");
    assert_eq!(letter["contactType"], "SUICIDE");
}

#[tokio::test]
async fn test_handler_exits_when_router_hangs_up() {
    let handler = LoneHandler::spawn().await;
    let LoneHandler {
        control,
        task,
        socket,
        ..
    } = handler;

    drop(control);
    assert!(timeout(TEST_TIMEOUT, task).await.unwrap().unwrap());
    assert!(!socket.exists());
}

#[tokio::test]
async fn test_handler_without_router_fails_to_start() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let ctx = FiberContext::new(config.clone(), InProcessLauncher::new(config));

    let server = HandlerServer::new(HandlerName::parse("Handler4").unwrap(), ctx.clone());
    let result = timeout(TEST_TIMEOUT, server.run(CancellationToken::new()))
        .await
        .unwrap();
    assert!(result.is_err());
    assert!(!ctx.endpoints().path_for("Handler4").exists());
}
