//! Per-session registry of open target streams
//!
//! The dispatcher is the sole owner and mutator of the set. Each accepted
//! StartStream inserts a [`TargetStream`] handle and spawns its backend pump;
//! pumps communicate outward only through the shared reply channel and
//! publish their id on the done channel when they terminate, at which point
//! the dispatcher removes them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tonic::Status;

use crate::auth::{Authorizer, PeerIdentity};
use crate::error::ProxyError;
use crate::proto::{ProxyReply, StartStream, StreamData, Target};
use crate::registry::{RegisteredMethod, ServiceRegistry};
use crate::server::target::{self, TargetStream};

pub struct TargetStreamSet {
    registry: Arc<ServiceRegistry>,
    authorizer: Arc<dyn Authorizer>,
    peer: Option<PeerIdentity>,
    streams: HashMap<u64, TargetStream>,
    next_stream_id: u64,
    reply_tx: mpsc::Sender<ProxyReply>,
    done_tx: mpsc::UnboundedSender<u64>,
    done_rx: mpsc::UnboundedReceiver<u64>,
    tasks: JoinSet<()>,
    token: CancellationToken,
    per_stream_buffer: usize,
}

impl TargetStreamSet {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        authorizer: Arc<dyn Authorizer>,
        peer: Option<PeerIdentity>,
        reply_tx: mpsc::Sender<ProxyReply>,
        token: CancellationToken,
        per_stream_buffer: usize,
    ) -> Self {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        Self {
            registry,
            authorizer,
            peer,
            streams: HashMap::new(),
            next_stream_id: 1,
            reply_tx,
            done_tx,
            done_rx,
            tasks: JoinSet::new(),
            token,
            per_stream_buffer,
        }
    }

    /// Open a new target stream. Always answers with exactly one
    /// StartStreamReply on the reply channel, keyed by the request's nonce:
    /// a stream id on success, a terminal status otherwise.
    pub async fn add(&mut self, req: StartStream) {
        let nonce = req.nonce;
        match self.prepare(req).await {
            Err(status) => {
                tracing::debug!(nonce, error = %status, "StartStream rejected");
                let _ = self
                    .reply_tx
                    .send(ProxyReply::start_stream_reply(nonce, Err(status)))
                    .await;
            }
            Ok((stream_id, method, target)) => {
                tracing::debug!(
                    nonce,
                    stream_id,
                    method = method.descriptor.full_name(),
                    target = %target.address,
                    "Target stream opened"
                );
                // The reply must be on the channel before the pump starts so
                // it precedes any StreamData or ServerClose for this id.
                let _ = self
                    .reply_tx
                    .send(ProxyReply::start_stream_reply(nonce, Ok(stream_id)))
                    .await;

                let (payload_tx, payload_rx) = mpsc::channel(self.per_stream_buffer);
                let abort = self.token.child_token();
                let abort_status = Arc::new(Mutex::new(None));
                let handle = TargetStream::new(
                    stream_id,
                    method.descriptor.clone(),
                    payload_tx,
                    abort.clone(),
                    abort_status.clone(),
                );
                self.streams.insert(stream_id, handle);
                self.tasks.spawn(target::run(
                    stream_id,
                    method,
                    target,
                    payload_rx,
                    self.reply_tx.clone(),
                    self.done_tx.clone(),
                    abort,
                    abort_status,
                    self.per_stream_buffer,
                ));
            }
        }
    }

    async fn prepare(
        &mut self,
        req: StartStream,
    ) -> Result<(u64, RegisteredMethod, Target), Status> {
        let target = req
            .target
            .ok_or_else(|| Status::invalid_argument("StartStream missing target"))?;
        let method = self
            .registry
            .lookup(&req.method_name)
            .cloned()
            .ok_or_else(|| {
                Status::from(ProxyError::UnknownMethod {
                    name: req.method_name.clone(),
                })
            })?;
        self.authorizer
            .authorize(self.peer.as_ref(), &target, &method.descriptor)
            .await?;

        let stream_id = self.next_stream_id;
        self.next_stream_id += 1;
        Ok((stream_id, method, target))
    }

    /// Fan one data frame over its listed stream ids. Returns the first
    /// protocol error encountered; a non-existent id is a protocol error.
    pub async fn send_data(&mut self, data: StreamData) -> Result<(), Status> {
        let payload = data
            .payload
            .ok_or_else(|| Status::invalid_argument("StreamData missing payload"))?;
        for id in &data.stream_ids {
            let stream = self
                .streams
                .get_mut(id)
                .ok_or_else(|| Status::from(ProxyError::StreamNotFound { id: *id }))?;
            stream.send_data(payload.clone()).await?;
        }
        Ok(())
    }

    /// Half-close each listed stream.
    pub fn client_close(&mut self, stream_ids: &[u64]) -> Result<(), Status> {
        for id in stream_ids {
            let stream = self
                .streams
                .get_mut(id)
                .ok_or_else(|| Status::from(ProxyError::StreamNotFound { id: *id }))?;
            stream.client_close();
        }
        Ok(())
    }

    /// Cancel each listed stream immediately.
    pub fn cancel(&mut self, stream_ids: &[u64]) -> Result<(), Status> {
        for id in stream_ids {
            let stream = self
                .streams
                .get_mut(id)
                .ok_or_else(|| Status::from(ProxyError::StreamNotFound { id: *id }))?;
            stream.cancel();
        }
        Ok(())
    }

    /// Half-close every open stream. Invoked when the client cleanly closes
    /// its side of the proxy stream.
    pub fn client_close_all(&mut self) {
        for stream in self.streams.values_mut() {
            stream.client_close();
        }
    }

    /// Remove a terminated stream from the set. Called by the dispatcher
    /// after the stream's id arrives on the done channel, i.e. after its
    /// ServerClose has been serialized to the reply channel.
    pub fn remove(&mut self, stream_id: u64) {
        if self.streams.remove(&stream_id).is_some() {
            tracing::debug!(stream_id, "Target stream removed from set");
        }
    }

    /// Next terminated stream id. Never resolves to `None` while the set is
    /// alive, since the set keeps one done sender of its own.
    pub async fn done_recv(&mut self) -> Option<u64> {
        self.done_rx.recv().await
    }

    /// Wait until every launched pump has terminated and published its id,
    /// then drop the corresponding handles.
    pub async fn wait(&mut self) {
        while self.tasks.join_next().await.is_some() {}
        while let Ok(stream_id) = self.done_rx.try_recv() {
            self.remove(stream_id);
        }
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}
