//! End-to-end tests of the Fiber process graph.
//!
//! Router, front door, handlers and surrogates all run in the test runtime;
//! clients talk to them through `fiber-client` over real Unix sockets.
//!
//! Tests CAN use `.unwrap()` and `.expect()` - this is allowed.

mod common;

use std::time::Duration;

use common::{eventually, TestFiber, TEST_TIMEOUT};
use fiber_client::{ClientError, HandlerClient};
use fiber_core::{HandlerName, RequestId, SessionId, WorkerKind};
use fiber_protocol::ServiceCall;
use fiberd::router::HandlerState;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::timeout;

// ============================================================================
// Test Helpers
// ============================================================================

/// Sends raw bytes to the front door, half-closes and reads the reply.
async fn raw_front_door(fiber: &TestFiber, bytes: &[u8]) -> Value {
    let mut stream = UnixStream::connect(fiber.path_for("Fiber")).await.unwrap();
    stream.write_all(bytes).await.unwrap();
    stream.shutdown().await.unwrap();
    let mut reply = Vec::new();
    timeout(TEST_TIMEOUT, stream.read_to_end(&mut reply))
        .await
        .unwrap()
        .unwrap();
    serde_json::from_slice(&reply).unwrap()
}

async fn handler_state(fiber: &TestFiber, name: &HandlerName) -> Option<HandlerState> {
    fiber
        .router
        .snapshot()
        .await
        .unwrap()
        .handler(name)
        .map(|h| h.state)
}

// ============================================================================
// Sessions and handlers
// ============================================================================

#[tokio::test]
async fn test_session_call_round_trip() {
    let fiber = TestFiber::spawn().await;

    let session = fiber.client.create_session("10.1.2.3").await.unwrap();
    assert!(!session.is_null());

    let handler = fiber.client.handler(&session).await.unwrap();
    assert_eq!(handler.socket(), fiber.path_for("Handler1"));

    let reply = handler
        .call(WorkerKind::Core, &ServiceCall::ping())
        .await
        .unwrap();
    assert!(reply.success);
    assert_eq!(reply.result, json!("pong"));
    assert_eq!(reply.server, "Handler1CoreSurrogate");

    let snapshot = fiber.router.snapshot().await.unwrap();
    let status = snapshot.handler(&HandlerName::from_index(1)).unwrap();
    assert_eq!(status.state, HandlerState::Active);
    assert_eq!(status.sessions, vec![session.clone()]);
    assert_eq!(snapshot.sessions[0].client_address, "10.1.2.3");

    fiber.shutdown().await;
}

#[tokio::test]
async fn test_session_keeps_its_handler() {
    let fiber = TestFiber::spawn().await;

    let first = fiber.client.create_session("a").await.unwrap();
    let second = fiber.client.create_session("b").await.unwrap();

    let a1 = fiber.client.handler_socket(&first).await.unwrap();
    let b1 = fiber.client.handler_socket(&second).await.unwrap();
    let a2 = fiber.client.handler_socket(&first).await.unwrap();

    assert_eq!(a1, a2);
    assert_ne!(a1, b1);
    assert_eq!(fiber.launcher.launch_count("fiber-handler"), 2);

    fiber.shutdown().await;
}

#[tokio::test]
async fn test_null_session_shares_one_handler() {
    let fiber = TestFiber::spawn().await;

    let first = fiber.client.handler_socket(&SessionId::null()).await.unwrap();
    let second = fiber.client.handler_socket(&SessionId::null()).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(fiber.launcher.launch_count("fiber-handler"), 1);

    fiber.shutdown().await;
}

#[tokio::test]
async fn test_unknown_session_is_rejected() {
    let fiber = TestFiber::spawn().await;

    let err = fiber
        .client
        .handler_socket(&SessionId::from("not-a-session"))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Remote(_)));
    assert_eq!(err.to_string(), "Invalid session requested.");
    assert_eq!(fiber.launcher.launch_count("fiber-handler"), 0);

    fiber.shutdown().await;
}

#[tokio::test]
async fn test_terminate_session_retires_handler() {
    let fiber = TestFiber::spawn().await;
    let session = fiber.client.create_session("a").await.unwrap();
    let socket = fiber.client.handler_socket(&session).await.unwrap();
    let name = HandlerName::from_index(1);

    assert!(fiber.client.terminate_session(&session).await.unwrap());
    assert!(!fiber.client.terminate_session(&session).await.unwrap());

    eventually("handler removal", || async {
        handler_state(&fiber, &name).await.is_none()
    })
    .await;
    eventually("handler socket cleanup", || async { !socket.exists() }).await;

    // The session is gone, so it can no longer be routed
    assert!(fiber.client.handler_socket(&session).await.is_err());

    fiber.shutdown().await;
}

// ============================================================================
// Handler requests
// ============================================================================

#[tokio::test]
async fn test_non_blocking_call_and_meta_calls() {
    let fiber = TestFiber::spawn().await;
    let handler = fiber.client.handler(&SessionId::null()).await.unwrap();

    let echo = ServiceCall::new("Fiber", "Diagnostics", "echo").with_arg("later");
    let id = handler.submit(WorkerKind::Gui, &echo).await.unwrap();
    assert_eq!(id, RequestId::new(1));

    eventually("response", || async {
        handler
            .available_responses(WorkerKind::Gui)
            .await
            .unwrap()
            .contains(&id)
    })
    .await;

    let size = handler.response_size(WorkerKind::Gui, id).await.unwrap();
    let head = handler.fetch_response(WorkerKind::Gui, id, 5).await.unwrap();
    assert_eq!(head.len(), 5);
    assert_eq!(
        handler.response_size(WorkerKind::Gui, id).await.unwrap(),
        size - 5
    );

    let rest = handler.fetch_response(WorkerKind::Gui, id, 0).await.unwrap();
    let mut whole = head.to_vec();
    whole.extend_from_slice(&rest);
    let reply: Value = serde_json::from_slice(&whole).unwrap();
    assert_eq!(reply["result"], "later");

    assert!(handler
        .available_responses(WorkerKind::Gui)
        .await
        .unwrap()
        .is_empty());

    fiber.shutdown().await;
}

#[tokio::test]
async fn test_two_non_blocking_requests_collected_in_chunks() {
    let fiber = TestFiber::spawn().await;
    let handler = fiber.client.handler(&SessionId::null()).await.unwrap();

    let slow = ServiceCall::new("Fiber", "Diagnostics", "sleep").with_arg(300);
    let first = handler.submit(WorkerKind::Core, &slow).await.unwrap();
    let second = handler.submit(WorkerKind::Core, &slow).await.unwrap();
    assert_ne!(first, second);

    assert!(handler
        .available_responses(WorkerKind::Core)
        .await
        .unwrap()
        .is_empty());

    eventually("both responses", || async {
        let ready = handler.available_responses(WorkerKind::Core).await.unwrap();
        ready.contains(&first) && ready.contains(&second)
    })
    .await;

    let size = handler.response_size(WorkerKind::Core, first).await.unwrap();
    let chunk = i64::try_from(size.div_ceil(2)).unwrap();
    let head = handler.fetch_response(WorkerKind::Core, first, chunk).await.unwrap();
    let tail = handler.fetch_response(WorkerKind::Core, first, chunk).await.unwrap();
    assert_eq!(head.len() as u64 + tail.len() as u64, size);

    let mut whole = head.to_vec();
    whole.extend_from_slice(&tail);
    let reply: Value = serde_json::from_slice(&whole).unwrap();
    assert_eq!(reply["success"], true);
    assert_eq!(reply["result"], 300);

    assert_eq!(
        handler.available_responses(WorkerKind::Core).await.unwrap(),
        vec![second]
    );
    let err = handler
        .response_size(WorkerKind::Core, first)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Invalid request ID");

    fiber.shutdown().await;
}

#[tokio::test]
async fn test_meta_call_errors() {
    let fiber = TestFiber::spawn().await;
    let handler = fiber.client.handler(&SessionId::null()).await.unwrap();

    let err = handler
        .response_size(WorkerKind::Core, RequestId::new(42))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Invalid request ID");

    let err = handler.cancel_requests(WorkerKind::Core, &[]).await.unwrap_err();
    assert_eq!(err.to_string(), "No request ID provided");

    let err = handler
        .fetch_response(WorkerKind::Core, RequestId::new(42), 0)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "No response found for 42");

    fiber.shutdown().await;
}

#[tokio::test]
async fn test_cancel_requests_reports_found_ids() {
    let fiber = TestFiber::spawn().await;
    let handler = fiber.client.handler(&SessionId::null()).await.unwrap();

    let slow = ServiceCall::new("Fiber", "Diagnostics", "sleep").with_arg(500);
    let first = handler.submit(WorkerKind::Core, &slow).await.unwrap();
    let second = handler.submit(WorkerKind::Core, &slow).await.unwrap();

    let cancelled = handler
        .cancel_requests(WorkerKind::Core, &[second, RequestId::new(99)])
        .await
        .unwrap();
    assert_eq!(cancelled, vec![second]);

    let reply = timeout(TEST_TIMEOUT, async {
        loop {
            if handler
                .available_responses(WorkerKind::Core)
                .await
                .unwrap()
                .contains(&first)
            {
                return handler.take_reply(WorkerKind::Core, first).await.unwrap();
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(reply.result, json!(500));

    fiber.shutdown().await;
}

#[tokio::test]
async fn test_disconnecting_blocking_client_cancels_request() {
    let fiber = TestFiber::spawn().await;
    let socket = fiber.client.handler_socket(&SessionId::null()).await.unwrap();

    // Occupy the surrogate so the next call stays queued
    let config = fiber.client.config().clone();
    let handler = HandlerClient::new(&socket, &config);
    let slow = ServiceCall::new("Fiber", "Diagnostics", "sleep").with_arg(300);
    let first = handler.submit(WorkerKind::Core, &slow).await.unwrap();

    {
        let call = json!({
            "serviceComponent": "Fiber",
            "serviceObject": "Diagnostics",
            "serviceMethod": "echo",
            "args": ["abandoned"],
        });
        let bytes = fiber_protocol::encode(&call, fiber_protocol::Framing::Footer).unwrap();
        let mut stream = UnixStream::connect(&socket).await.unwrap();
        stream.write_all(&bytes).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let reply = timeout(TEST_TIMEOUT, async {
        loop {
            let available = handler.available_responses(WorkerKind::Core).await.unwrap();
            if available.contains(&first) {
                return available;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(reply, vec![first]);

    // The abandoned request (id 2) never produces a response
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        handler.available_responses(WorkerKind::Core).await.unwrap(),
        vec![first]
    );

    fiber.shutdown().await;
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_crashed_handler_is_restarted() {
    let fiber = TestFiber::spawn().await;
    let session = fiber.client.create_session("a").await.unwrap();
    fiber.client.handler_socket(&session).await.unwrap();
    let name = HandlerName::from_index(1);

    assert!(fiber.launcher.crash("Handler1"));

    eventually("handler relaunch", || async {
        fiber.launcher.launch_count("fiber-handler") == 2
            && handler_state(&fiber, &name).await == Some(HandlerState::Active)
    })
    .await;

    // Same session, same handler name, working again
    let handler = fiber.client.handler(&session).await.unwrap();
    assert_eq!(handler.socket(), fiber.path_for("Handler1"));
    let reply = handler
        .call(WorkerKind::Core, &ServiceCall::ping())
        .await
        .unwrap();
    assert!(reply.success);

    fiber.shutdown().await;
}

#[tokio::test]
async fn test_idle_handler_retires_itself() {
    let fiber = TestFiber::spawn_with(|config| {
        config.auto_time_out.kill_on_time_out = true;
    })
    .await;
    let session = fiber.client.create_session("a").await.unwrap();
    fiber.client.handler_socket(&session).await.unwrap();
    let name = HandlerName::from_index(1);

    eventually("idle handler removal", || async {
        handler_state(&fiber, &name).await.is_none()
    })
    .await;

    // The session survives and gets a fresh handler
    let socket = fiber.client.handler_socket(&session).await.unwrap();
    assert_eq!(socket, fiber.path_for("Handler2"));

    fiber.shutdown().await;
}

#[tokio::test]
async fn test_terminate_daemon_closes_front_door() {
    let fiber = TestFiber::spawn().await;
    assert!(fiber.client.front_door_alive().await);
    assert!(fiber.client.control_alive().await);

    fiber.client.terminate_daemon().await.unwrap();

    let main = fiber.path_for("Fiber");
    eventually("front door closed", || async { !main.exists() }).await;
    fiber.shutdown().await;
}

// ============================================================================
// Malformed input
// ============================================================================

#[tokio::test]
async fn test_front_door_rejects_bad_requests() {
    let fiber = TestFiber::spawn().await;

    let reply = raw_front_door(&fiber, b"{not json").await;
    assert_eq!(reply["success"], false);
    assert_eq!(reply["error"], "Corrupt data received as request");

    let reply = raw_front_door(&fiber, br#"{"requestType":"DANCE"}"#).await;
    assert_eq!(reply["success"], false);
    assert_eq!(reply["error"], "Unrecognized request");

    let reply = raw_front_door(
        &fiber,
        br#"{"requestType":"SESSION_MGMT","sessionCommand":"rename"}"#,
    )
    .await;
    assert_eq!(reply["success"], false);

    // Still serving after the bad requests
    assert!(fiber.client.create_session("ok").await.is_ok());

    fiber.shutdown().await;
}

#[tokio::test]
async fn test_handler_rejects_bad_session_type() {
    let fiber = TestFiber::spawn().await;
    let socket = fiber.client.handler_socket(&SessionId::null()).await.unwrap();

    let call = json!({"sessionType": "TURBO", "serviceComponent": "Fiber"});
    let bytes = fiber_protocol::encode(&call, fiber_protocol::Framing::Footer).unwrap();
    let mut stream = UnixStream::connect(&socket).await.unwrap();
    stream.write_all(&bytes).await.unwrap();
    let mut reply = Vec::new();
    timeout(TEST_TIMEOUT, stream.read_to_end(&mut reply))
        .await
        .unwrap()
        .unwrap();
    let reply: Value = serde_json::from_slice(&reply).unwrap();
    assert_eq!(reply["success"], false);

    fiber.shutdown().await;
}
