//! Proxy session tests: end-to-end scenarios driven straight through
//! `ProxySession::run` with in-process backend handlers.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::Status;

use common::{from_any, to_any, EchoRequest, EchoResponse};
use fanout_proxy::auth::{AllowAll, Authorizer, PeerIdentity};
use fanout_proxy::proto::{
    proxy_reply::Reply, start_stream_reply, ProxyReply, ProxyRequest, Target,
};
use fanout_proxy::registry::{BackendCall, BackendHandler, MethodDescriptor, ServiceRegistry};
use fanout_proxy::server::ProxySession;

// ============================================================================
// Test handlers
// ============================================================================

/// Unary: answers the first payload with the same message and sequence 42.
struct AnswerHandler;

#[async_trait]
impl BackendHandler for AnswerHandler {
    async fn call(&self, mut call: BackendCall) -> Result<(), Status> {
        let payload = call
            .inbound
            .recv()
            .await
            .ok_or_else(|| Status::invalid_argument("missing request payload"))?;
        let request: EchoRequest = from_any(&payload);
        let response = EchoResponse {
            message: request.message,
            sequence: 42,
        };
        let _ = call.outbound.send(to_any(&response)).await;
        Ok(())
    }
}

/// Server streaming: target "a:1" produces x, y, z then OK; target "b:1"
/// produces x, y then INTERNAL.
struct ScriptedHandler;

#[async_trait]
impl BackendHandler for ScriptedHandler {
    async fn call(&self, mut call: BackendCall) -> Result<(), Status> {
        let _ = call.inbound.recv().await;
        let (messages, failure) = match call.target.address.as_str() {
            "a:1" => (vec!["x", "y", "z"], None),
            "b:1" => (
                vec!["x", "y"],
                Some(Status::internal("backend failed mid-stream")),
            ),
            other => (vec![other], None),
        };
        for (sequence, message) in messages.into_iter().enumerate() {
            let response = EchoResponse {
                message: message.to_string(),
                sequence: sequence as u32,
            };
            let _ = call.outbound.send(to_any(&response)).await;
        }
        match failure {
            Some(status) => Err(status),
            None => Ok(()),
        }
    }
}

/// Never completes; terminates only through cancellation.
struct HangHandler;

#[async_trait]
impl BackendHandler for HangHandler {
    async fn call(&self, _call: BackendCall) -> Result<(), Status> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

// ============================================================================
// Harness
// ============================================================================

fn test_registry() -> Arc<ServiceRegistry> {
    Arc::new(
        ServiceRegistry::builder()
            .register(
                MethodDescriptor::unary(
                    "/fanout.test.v1.Echo/Ping",
                    "fanout.test.v1.EchoRequest",
                    "fanout.test.v1.EchoResponse",
                ),
                Arc::new(AnswerHandler),
            )
            .register(
                MethodDescriptor::server_streaming(
                    "/fanout.test.v1.Echo/Count",
                    "fanout.test.v1.EchoRequest",
                    "fanout.test.v1.EchoResponse",
                ),
                Arc::new(ScriptedHandler),
            )
            .register(
                MethodDescriptor::bidi_streaming(
                    "/fanout.test.v1.Echo/Hang",
                    "fanout.test.v1.EchoRequest",
                    "fanout.test.v1.EchoResponse",
                ),
                Arc::new(HangHandler),
            )
            .build(),
    )
}

struct Harness {
    requests: mpsc::Sender<Result<ProxyRequest, Status>>,
    replies: mpsc::Receiver<Result<ProxyReply, Status>>,
    session: tokio::task::JoinHandle<Result<(), Status>>,
}

impl Harness {
    fn start(registry: Arc<ServiceRegistry>, authorizer: Arc<dyn Authorizer>) -> Self {
        let (request_tx, request_rx) = mpsc::channel(32);
        let (reply_tx, reply_rx) = mpsc::channel(64);
        let session = ProxySession::new(registry, authorizer);
        let handle = tokio::spawn(session.run(ReceiverStream::new(request_rx), reply_tx));
        Self {
            requests: request_tx,
            replies: reply_rx,
            session: handle,
        }
    }

    async fn send(&self, request: ProxyRequest) {
        self.requests
            .send(Ok(request))
            .await
            .expect("session should accept requests");
    }

    async fn recv(&mut self) -> ProxyReply {
        tokio::time::timeout(Duration::from_secs(5), self.replies.recv())
            .await
            .expect("timed out waiting for reply")
            .expect("reply stream closed unexpectedly")
            .expect("reply should not be an error frame")
    }

    /// Close the client side and wait for the session to finish.
    async fn finish(self) -> Result<(), Status> {
        drop(self.requests);
        tokio::time::timeout(Duration::from_secs(5), self.session)
            .await
            .expect("session did not terminate")
            .expect("session task panicked")
    }
}

fn start_stream(nonce: u64, address: &str, method: &str) -> ProxyRequest {
    ProxyRequest::start_stream(nonce, Target::new(address), method)
}

fn expect_stream_id(reply: ProxyReply, want_nonce: u64) -> u64 {
    match reply.reply {
        Some(Reply::StartStreamReply(r)) => {
            assert_eq!(r.nonce, want_nonce);
            match r.reply {
                Some(start_stream_reply::Reply::StreamId(id)) => id,
                other => panic!("expected stream id, got {:?}", other),
            }
        }
        other => panic!("expected StartStreamReply, got {:?}", other),
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn one_target_unary_ok() {
    let mut harness = Harness::start(test_registry(), Arc::new(AllowAll));

    harness
        .send(start_stream(1, "a:1", "/fanout.test.v1.Echo/Ping"))
        .await;
    let stream_id = expect_stream_id(harness.recv().await, 1);

    harness
        .send(ProxyRequest::stream_data(
            vec![stream_id],
            to_any(&EchoRequest {
                message: "hello".to_string(),
            }),
        ))
        .await;
    harness
        .send(ProxyRequest::client_close(vec![stream_id]))
        .await;

    // Exactly one data frame, in backend order, then the terminal close.
    match harness.recv().await.reply {
        Some(Reply::StreamData(data)) => {
            assert_eq!(data.stream_ids, vec![stream_id]);
            let response: EchoResponse = from_any(&data.payload.unwrap());
            assert_eq!(response.message, "hello");
            assert_eq!(response.sequence, 42);
        }
        other => panic!("expected StreamData, got {:?}", other),
    }
    match harness.recv().await.reply {
        Some(Reply::ServerClose(close)) => {
            assert_eq!(close.stream_id, stream_id);
            assert!(close.status.unwrap().is_ok());
        }
        other => panic!("expected ServerClose, got {:?}", other),
    }

    assert!(harness.finish().await.is_ok());
}

#[tokio::test]
async fn three_targets_one_denied() {
    struct DenyB;

    #[async_trait]
    impl Authorizer for DenyB {
        async fn authorize(
            &self,
            _peer: Option<&PeerIdentity>,
            target: &Target,
            _method: &MethodDescriptor,
        ) -> Result<(), Status> {
            if target.address == "b:1" {
                Err(Status::permission_denied("target b is off limits"))
            } else {
                Ok(())
            }
        }
    }

    let mut harness = Harness::start(test_registry(), Arc::new(DenyB));

    for (nonce, address) in [(1, "a:1"), (2, "b:1"), (3, "c:1")] {
        harness
            .send(start_stream(nonce, address, "/fanout.test.v1.Echo/Ping"))
            .await;
    }

    // Replies come back in dispatch order: a gets id 1, b is denied without
    // consuming an id, c gets id 2.
    let id_a = expect_stream_id(harness.recv().await, 1);
    assert_eq!(id_a, 1);
    match harness.recv().await.reply {
        Some(Reply::StartStreamReply(r)) => {
            assert_eq!(r.nonce, 2);
            match r.reply {
                Some(start_stream_reply::Reply::ErrorStatus(status)) => {
                    assert_eq!(status.code, tonic::Code::PermissionDenied as i32);
                }
                other => panic!("expected error status, got {:?}", other),
            }
        }
        other => panic!("expected StartStreamReply, got {:?}", other),
    }
    let id_c = expect_stream_id(harness.recv().await, 3);
    assert_eq!(id_c, 2);

    harness
        .send(ProxyRequest::stream_data(
            vec![id_a, id_c],
            to_any(&EchoRequest {
                message: "ping".to_string(),
            }),
        ))
        .await;
    harness
        .send(ProxyRequest::client_close(vec![id_a, id_c]))
        .await;

    // Two data frames and two OK closes, interleaved arbitrarily across the
    // two surviving streams.
    let mut data_seen = HashMap::new();
    let mut closed = HashMap::new();
    while closed.len() < 2 {
        match harness.recv().await.reply {
            Some(Reply::StreamData(data)) => {
                let id = data.stream_ids[0];
                assert!(!closed.contains_key(&id), "data after ServerClose");
                *data_seen.entry(id).or_insert(0) += 1;
            }
            Some(Reply::ServerClose(close)) => {
                assert!(close.status.unwrap().is_ok());
                closed.insert(close.stream_id, true);
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }
    assert_eq!(data_seen.get(&id_a), Some(&1));
    assert_eq!(data_seen.get(&id_c), Some(&1));

    assert!(harness.finish().await.is_ok());
}

#[tokio::test]
async fn server_streaming_mid_stream_backend_error() {
    let mut harness = Harness::start(test_registry(), Arc::new(AllowAll));

    harness
        .send(start_stream(1, "a:1", "/fanout.test.v1.Echo/Count"))
        .await;
    harness
        .send(start_stream(2, "b:1", "/fanout.test.v1.Echo/Count"))
        .await;
    let id_a = expect_stream_id(harness.recv().await, 1);
    let id_b = expect_stream_id(harness.recv().await, 2);

    harness
        .send(ProxyRequest::stream_data(
            vec![id_a, id_b],
            to_any(&EchoRequest {
                message: "go".to_string(),
            }),
        ))
        .await;
    harness
        .send(ProxyRequest::client_close(vec![id_a, id_b]))
        .await;

    let mut per_stream: HashMap<u64, Vec<u32>> = HashMap::new();
    let mut final_status: HashMap<u64, i32> = HashMap::new();
    while final_status.len() < 2 {
        match harness.recv().await.reply {
            Some(Reply::StreamData(data)) => {
                let id = data.stream_ids[0];
                assert!(!final_status.contains_key(&id), "data after ServerClose");
                let response: EchoResponse = from_any(&data.payload.unwrap());
                per_stream.entry(id).or_default().push(response.sequence);
            }
            Some(Reply::ServerClose(close)) => {
                final_status.insert(close.stream_id, close.status.unwrap().code);
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }

    // Per-target order is preserved; a terminates normally, b carries the
    // backend's INTERNAL status.
    assert_eq!(per_stream.get(&id_a), Some(&vec![0, 1, 2]));
    assert_eq!(per_stream.get(&id_b), Some(&vec![0, 1]));
    assert_eq!(final_status.get(&id_a), Some(&(tonic::Code::Ok as i32)));
    assert_eq!(
        final_status.get(&id_b),
        Some(&(tonic::Code::Internal as i32))
    );

    assert!(harness.finish().await.is_ok());
}

#[tokio::test]
async fn client_cancel_wins_and_leaves_others_alone() {
    let mut harness = Harness::start(test_registry(), Arc::new(AllowAll));

    harness
        .send(start_stream(1, "a:1", "/fanout.test.v1.Echo/Hang"))
        .await;
    harness
        .send(start_stream(2, "b:1", "/fanout.test.v1.Echo/Ping"))
        .await;
    let hung = expect_stream_id(harness.recv().await, 1);
    let live = expect_stream_id(harness.recv().await, 2);

    harness.send(ProxyRequest::client_cancel(vec![hung])).await;

    match harness.recv().await.reply {
        Some(Reply::ServerClose(close)) => {
            assert_eq!(close.stream_id, hung);
            assert_eq!(close.status.unwrap().code, tonic::Code::Cancelled as i32);
        }
        other => panic!("expected ServerClose, got {:?}", other),
    }

    // The other stream still works end to end.
    harness
        .send(ProxyRequest::stream_data(
            vec![live],
            to_any(&EchoRequest {
                message: "still here".to_string(),
            }),
        ))
        .await;
    harness.send(ProxyRequest::client_close(vec![live])).await;

    match harness.recv().await.reply {
        Some(Reply::StreamData(data)) => assert_eq!(data.stream_ids, vec![live]),
        other => panic!("expected StreamData, got {:?}", other),
    }
    match harness.recv().await.reply {
        Some(Reply::ServerClose(close)) => {
            assert_eq!(close.stream_id, live);
            assert!(close.status.unwrap().is_ok());
        }
        other => panic!("expected ServerClose, got {:?}", other),
    }

    assert!(harness.finish().await.is_ok());
}

#[tokio::test]
async fn client_disconnect_cancels_all_streams() {
    let mut harness = Harness::start(test_registry(), Arc::new(AllowAll));

    harness
        .send(start_stream(1, "a:1", "/fanout.test.v1.Echo/Hang"))
        .await;
    harness
        .send(start_stream(2, "b:1", "/fanout.test.v1.Echo/Hang"))
        .await;
    let _ = expect_stream_id(harness.recv().await, 1);
    let _ = expect_stream_id(harness.recv().await, 2);

    // Abrupt transport failure on the client stream.
    harness
        .requests
        .send(Err(Status::unavailable("connection reset")))
        .await
        .expect("session should still be receiving");

    let result = harness.finish().await;
    let status = result.expect_err("session should report a terminal error");
    assert_eq!(status.code(), tonic::Code::Internal);
    assert!(status.message().contains("connection reset"));
}

#[tokio::test]
async fn unknown_method_is_unimplemented_and_allocates_no_id() {
    let mut harness = Harness::start(test_registry(), Arc::new(AllowAll));

    harness
        .send(start_stream(1, "a:1", "/fanout.test.v1.Echo/Unknown"))
        .await;
    match harness.recv().await.reply {
        Some(Reply::StartStreamReply(r)) => {
            assert_eq!(r.nonce, 1);
            match r.reply {
                Some(start_stream_reply::Reply::ErrorStatus(status)) => {
                    assert_eq!(status.code, tonic::Code::Unimplemented as i32);
                }
                other => panic!("expected error status, got {:?}", other),
            }
        }
        other => panic!("expected StartStreamReply, got {:?}", other),
    }

    // The next accepted stream still gets id 1.
    harness
        .send(start_stream(2, "a:1", "/fanout.test.v1.Echo/Ping"))
        .await;
    assert_eq!(expect_stream_id(harness.recv().await, 2), 1);

    assert!(harness.finish().await.is_ok());
}

// ============================================================================
// Protocol violations
// ============================================================================

#[tokio::test]
async fn data_after_close_tears_down_session() {
    let mut harness = Harness::start(test_registry(), Arc::new(AllowAll));

    harness
        .send(start_stream(1, "a:1", "/fanout.test.v1.Echo/Hang"))
        .await;
    let id = expect_stream_id(harness.recv().await, 1);

    harness.send(ProxyRequest::client_close(vec![id])).await;
    harness
        .send(ProxyRequest::stream_data(
            vec![id],
            to_any(&EchoRequest {
                message: "late".to_string(),
            }),
        ))
        .await;

    // The offending stream closes with FAILED_PRECONDITION.
    match harness.recv().await.reply {
        Some(Reply::ServerClose(close)) => {
            assert_eq!(close.stream_id, id);
            assert_eq!(
                close.status.unwrap().code,
                tonic::Code::FailedPrecondition as i32
            );
        }
        other => panic!("expected ServerClose, got {:?}", other),
    }

    // And the session itself is torn down with INTERNAL.
    let status = harness.finish().await.expect_err("session should fail");
    assert_eq!(status.code(), tonic::Code::Internal);
}

#[tokio::test]
async fn unknown_stream_id_tears_down_session() {
    let harness = Harness::start(test_registry(), Arc::new(AllowAll));

    harness
        .send(ProxyRequest::stream_data(
            vec![99],
            to_any(&EchoRequest {
                message: "nope".to_string(),
            }),
        ))
        .await;

    let status = harness.finish().await.expect_err("session should fail");
    assert_eq!(status.code(), tonic::Code::Internal);
}

#[tokio::test]
async fn unknown_discriminator_tears_down_session() {
    let harness = Harness::start(test_registry(), Arc::new(AllowAll));

    harness.send(ProxyRequest::default()).await;

    let status = harness.finish().await.expect_err("session should fail");
    assert_eq!(status.code(), tonic::Code::Internal);
}
