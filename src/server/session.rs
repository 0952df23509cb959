//! Proxy session: the per-connection coordinator
//!
//! Each client stream gets three cooperating tasks under one cancellation
//! scope: a receive pump (sole reader of the client stream), a dispatcher
//! (sole owner of the stream set), and a send pump (sole writer of the
//! client stream). A task returns an error only for a failure it observed
//! itself; tasks that merely react to the scope being cancelled exit
//! cleanly, so the session status reflects the original cause.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tonic::Status;

use crate::auth::{Authorizer, PeerIdentity};
use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::proto::{proxy_request, ProxyReply, ProxyRequest};
use crate::registry::ServiceRegistry;
use crate::server::stream_set::TargetStreamSet;

/// Channel capacities for one session.
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    /// Receive pump to dispatcher.
    pub request_buffer: usize,
    /// Target streams and dispatcher to send pump.
    pub reply_buffer: usize,
    /// Each target stream's send queue.
    pub per_stream_buffer: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            request_buffer: 64,
            reply_buffer: 128,
            per_stream_buffer: 16,
        }
    }
}

impl From<&ProxyConfig> for SessionLimits {
    fn from(config: &ProxyConfig) -> Self {
        Self {
            request_buffer: config.request_buffer,
            reply_buffer: config.reply_buffer,
            per_stream_buffer: config.per_stream_buffer,
        }
    }
}

/// One client connection's worth of proxy state.
pub struct ProxySession {
    registry: Arc<ServiceRegistry>,
    authorizer: Arc<dyn Authorizer>,
    peer: Option<PeerIdentity>,
    limits: SessionLimits,
}

impl ProxySession {
    pub fn new(registry: Arc<ServiceRegistry>, authorizer: Arc<dyn Authorizer>) -> Self {
        Self {
            registry,
            authorizer,
            peer: None,
            limits: SessionLimits::default(),
        }
    }

    #[must_use]
    pub fn with_peer(mut self, peer: Option<PeerIdentity>) -> Self {
        self.peer = peer;
        self
    }

    #[must_use]
    pub fn with_limits(mut self, limits: SessionLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Run the session to completion.
    ///
    /// `inbound` is the client's request stream; replies are written to
    /// `outbound`, which feeds the client's response stream. Returns `Ok` on
    /// a clean client close, or the first task failure rewritten as an
    /// INTERNAL status.
    pub async fn run<S>(
        self,
        inbound: S,
        outbound: mpsc::Sender<Result<ProxyReply, Status>>,
    ) -> Result<(), Status>
    where
        S: Stream<Item = Result<ProxyRequest, Status>> + Send + Unpin + 'static,
    {
        let token = CancellationToken::new();
        let (request_tx, request_rx) = mpsc::channel(self.limits.request_buffer);
        let (reply_tx, reply_rx) = mpsc::channel(self.limits.reply_buffer);
        let set = TargetStreamSet::new(
            self.registry,
            self.authorizer,
            self.peer,
            reply_tx,
            token.clone(),
            self.limits.per_stream_buffer,
        );

        let receive_task = tokio::spawn(receive(inbound, request_tx, token.clone()));
        let dispatch_task = tokio::spawn(dispatch(request_rx, set, token.clone()));
        let send_task = tokio::spawn(send(reply_rx, outbound, token.clone()));

        let (receive_res, dispatch_res, send_res) =
            tokio::join!(receive_task, dispatch_task, send_task);

        let mut first_error = None;
        for result in [
            flatten(receive_res),
            flatten(dispatch_res),
            flatten(send_res),
        ] {
            if let Err(status) = result {
                first_error.get_or_insert(status);
            }
        }
        match first_error {
            Some(status) => Err(Status::internal(format!(
                "proxy session failed: {}",
                status.message()
            ))),
            None => Ok(()),
        }
    }
}

fn flatten(result: Result<Result<(), Status>, tokio::task::JoinError>) -> Result<(), Status> {
    match result {
        Ok(inner) => inner,
        Err(e) => Err(Status::internal(format!("session task failed: {}", e))),
    }
}

/// Relays incoming frames from the client stream to the dispatcher. The only
/// task that reads the underlying stream. EOF closes the request channel
/// cleanly; any other stream error cancels the scope.
async fn receive<S>(
    mut inbound: S,
    request_tx: mpsc::Sender<ProxyRequest>,
    token: CancellationToken,
) -> Result<(), Status>
where
    S: Stream<Item = Result<ProxyRequest, Status>> + Send + Unpin,
{
    loop {
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            item = inbound.next() => match item {
                // Client half-closed: dropping request_tx closes the request
                // channel, which the dispatcher treats as CloseSend on every
                // target stream.
                None => return Ok(()),
                Some(Err(status)) => {
                    tracing::debug!(error = %status, "Client stream receive failed");
                    token.cancel();
                    return Err(status);
                }
                Some(Ok(request)) => {
                    if request_tx.send(request).await.is_err() {
                        // Dispatcher exited; nothing left to route to.
                        return Ok(());
                    }
                }
            },
        }
    }
}

/// Routes client frames to the stream set and reaps terminated streams.
/// The only task that mutates set membership.
async fn dispatch(
    mut requests: mpsc::Receiver<ProxyRequest>,
    mut set: TargetStreamSet,
    token: CancellationToken,
) -> Result<(), Status> {
    let result = loop {
        // Client frames are handled ahead of done signals so that control
        // frames already in flight still see the streams they reference; a
        // frame for a stream that terminated in the meantime is handled by
        // the stream handle itself.
        tokio::select! {
            biased;
            _ = token.cancelled() => break Ok(()),
            request = requests.recv() => match request {
                None => {
                    // Clean close from the client: let every target stream
                    // flush, then wait for them all below.
                    set.client_close_all();
                    break Ok(());
                }
                Some(request) => {
                    if let Err(status) = handle_request(&mut set, request).await {
                        tracing::warn!(error = %status, "Protocol violation, tearing down session");
                        break Err(status);
                    }
                }
            },
            done = set.done_recv() => {
                if let Some(stream_id) = done {
                    set.remove(stream_id);
                }
            }
        }
    };

    if result.is_err() {
        // Stream-id state is ambiguous after a protocol violation; cancel
        // the scope so every target stream aborts.
        token.cancel();
    }
    set.wait().await;
    result
}

async fn handle_request(set: &mut TargetStreamSet, request: ProxyRequest) -> Result<(), Status> {
    match request.request {
        Some(proxy_request::Request::StartStream(start)) => {
            // Rejections are StartStreamReply errors, never session errors.
            set.add(start).await;
            Ok(())
        }
        Some(proxy_request::Request::StreamData(data)) => set.send_data(data).await,
        Some(proxy_request::Request::ClientClose(close)) => set.client_close(&close.stream_ids),
        Some(proxy_request::Request::ClientCancel(cancel)) => set.cancel(&cancel.stream_ids),
        None => Err(ProxyError::ProtocolViolation {
            message: "unhandled request frame".to_string(),
        }
        .into()),
    }
}

/// Drains the reply channel onto the client stream. The only task that
/// writes the underlying stream. Exits when the dispatcher and every target
/// stream have dropped their reply senders.
async fn send(
    mut replies: mpsc::Receiver<ProxyReply>,
    outbound: mpsc::Sender<Result<ProxyReply, Status>>,
    token: CancellationToken,
) -> Result<(), Status> {
    while let Some(reply) = replies.recv().await {
        if outbound.send(Ok(reply)).await.is_err() {
            tracing::debug!("Client stream send failed");
            token.cancel();
            return Err(Status::unavailable("client stream closed"));
        }
    }
    Ok(())
}
