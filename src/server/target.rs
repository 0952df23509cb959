//! Target stream: one logical call to one backend target
//!
//! Each accepted StartStream produces a [`TargetStream`] handle owned by the
//! dispatcher and a pump task that runs the backend side of the call. The
//! pump forwards backend payloads as StreamData replies, emits exactly one
//! ServerClose when the call terminates, and publishes its stream id on the
//! done channel so the dispatcher can remove the handle.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::Status;

use crate::proto::{ProxyReply, RpcStatus, Target};
use crate::registry::{BackendCall, MethodDescriptor, RegisteredMethod};

/// Dispatcher-visible lifecycle of a target stream.
///
/// The Opening phase (backend dial in flight) is internal to the backend
/// handler; payloads sent while it lasts queue in the stream's send queue and
/// flush the moment the backend accepts them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    HalfClosedLocal,
    Closed,
}

/// Dispatcher-side handle for one open target stream.
///
/// Only the dispatcher calls these methods; the backend half lives in the
/// pump task spawned alongside the handle.
pub struct TargetStream {
    stream_id: u64,
    method: MethodDescriptor,
    payload_tx: Option<mpsc::Sender<prost_types::Any>>,
    sent_data: bool,
    abort: CancellationToken,
    abort_status: Arc<Mutex<Option<Status>>>,
}

impl TargetStream {
    pub(crate) fn new(
        stream_id: u64,
        method: MethodDescriptor,
        payload_tx: mpsc::Sender<prost_types::Any>,
        abort: CancellationToken,
        abort_status: Arc<Mutex<Option<Status>>>,
    ) -> Self {
        Self {
            stream_id,
            method,
            payload_tx: Some(payload_tx),
            sent_data: false,
            abort,
            abort_status,
        }
    }

    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    pub fn state(&self) -> StreamState {
        if self.abort.is_cancelled() {
            StreamState::Closed
        } else if self.payload_tx.is_none() {
            StreamState::HalfClosedLocal
        } else {
            StreamState::Open
        }
    }

    /// Append one payload to the stream's send queue.
    ///
    /// Data after half-close or close, and a second payload on a method that
    /// is not client-streaming, are protocol errors: the stream is closed
    /// with FAILED_PRECONDITION and the error is returned so the dispatcher
    /// can tear the session down.
    pub async fn send_data(&mut self, payload: prost_types::Any) -> Result<(), Status> {
        if !self.method.is_client_streaming() && self.sent_data {
            let status = Status::failed_precondition(format!(
                "stream {}: method {} takes a single request",
                self.stream_id,
                self.method.full_name()
            ));
            self.abort(status.clone());
            return Err(status);
        }
        let Some(tx) = &self.payload_tx else {
            let status = Status::failed_precondition(format!(
                "stream {}: data after close",
                self.stream_id
            ));
            self.abort(status.clone());
            return Err(status);
        };
        if tx.send(payload).await.is_err() {
            // The pump already terminated; its ServerClose is on the reply
            // channel and the dispatcher has not processed the done signal
            // yet. Data for a terminated stream is still a client error.
            return Err(Status::failed_precondition(format!(
                "stream {}: data after close",
                self.stream_id
            )));
        }
        self.sent_data = true;
        Ok(())
    }

    /// Half-close: no more payloads will be queued. The send queue drains,
    /// then the backend call sees end-of-input.
    pub fn client_close(&mut self) {
        self.payload_tx = None;
    }

    /// Cancel the stream. The backend call is aborted and the final status is
    /// CANCELLED unless the backend already produced a terminal status.
    pub fn cancel(&mut self) {
        self.payload_tx = None;
        self.abort(Status::cancelled(format!(
            "stream {}: cancelled by client",
            self.stream_id
        )));
    }

    fn abort(&mut self, status: Status) {
        if let Ok(mut slot) = self.abort_status.lock() {
            slot.get_or_insert(status);
        }
        self.abort.cancel();
    }
}

/// Backend pump for one target stream.
///
/// Runs the registered handler, forwards its payloads in order, then emits
/// the stream's single ServerClose and publishes the id on `done_tx`.
pub(crate) async fn run(
    stream_id: u64,
    method: RegisteredMethod,
    target: Target,
    inbound: mpsc::Receiver<prost_types::Any>,
    reply_tx: mpsc::Sender<ProxyReply>,
    done_tx: mpsc::UnboundedSender<u64>,
    abort: CancellationToken,
    abort_status: Arc<Mutex<Option<Status>>>,
    buffer: usize,
) {
    let address = target.address.clone();
    let (out_tx, mut out_rx) = mpsc::channel(buffer);
    let call = BackendCall {
        target,
        method: method.descriptor.clone(),
        inbound,
        outbound: out_tx,
    };
    let handler = Arc::clone(&method.handler);
    let mut backend = tokio::spawn(async move { handler.call(call).await });

    let final_status: RpcStatus = loop {
        tokio::select! {
            _ = abort.cancelled() => {
                if backend.is_finished() {
                    // The backend already reported a terminal status; it wins
                    // over the cancellation. Queued payloads are dropped.
                    break backend_status(&mut backend).await;
                }
                backend.abort();
                let status = abort_status
                    .lock()
                    .ok()
                    .and_then(|mut slot| slot.take())
                    .unwrap_or_else(|| Status::cancelled("stream cancelled"));
                break status.into();
            }
            out = out_rx.recv() => match out {
                Some(payload) => {
                    if reply_tx
                        .send(ProxyReply::stream_data(stream_id, payload))
                        .await
                        .is_err()
                    {
                        backend.abort();
                        break Status::cancelled("session closed").into();
                    }
                }
                // Outbound side dropped: the handler finished and its queued
                // payloads have all been forwarded.
                None => break backend_status(&mut backend).await,
            },
        }
    };

    tracing::debug!(
        stream_id,
        target = %address,
        code = final_status.code,
        "Target stream closed"
    );
    let _ = reply_tx
        .send(ProxyReply::server_close(stream_id, final_status))
        .await;
    let _ = done_tx.send(stream_id);
}

async fn backend_status(backend: &mut tokio::task::JoinHandle<Result<(), Status>>) -> RpcStatus {
    match backend.await {
        Ok(Ok(())) => RpcStatus::ok(),
        Ok(Err(status)) => status.into(),
        Err(e) if e.is_cancelled() => Status::cancelled("backend call aborted").into(),
        Err(e) => Status::internal(format!("backend task failed: {}", e)).into(),
    }
}
