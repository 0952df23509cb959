//! Multiplexed client connection and fan-out invocation
//!
//! A [`ProxyConn`] is either *proxied* (N targets behind a fan-out proxy) or
//! *direct* (exactly one target, no proxy). The OneMany surface keeps the
//! same shape in both modes: direct calls synthesize one [`ManyResponse`]
//! per received message.

use std::collections::{HashMap, VecDeque};
use std::str::FromStr;

use http::uri::PathAndQuery;
use prost::{Message, Name};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::codec::ProstCodec;
use tonic::transport::Channel;
use tonic::{Status, Streaming};

use crate::client::many::{decode_any, encode_any, ManyResponse, OneManyCall};
use crate::proto::proxy_client::ProxyClient;
use crate::proto::{proxy_reply, start_stream_reply, ProxyReply, ProxyRequest, Target};

const REQUEST_BUFFER: usize = 32;

/// A connection the OneMany surface can run over.
pub struct ProxyConn {
    kind: ConnKind,
}

enum ConnKind {
    Direct {
        channel: Channel,
        target: Target,
    },
    Proxied {
        client: ProxyClient<Channel>,
        targets: Vec<Target>,
    },
}

impl ProxyConn {
    /// A connection straight to one backend, with no proxy in between.
    pub fn direct(channel: Channel, target: Target) -> Self {
        Self {
            kind: ConnKind::Direct { channel, target },
        }
    }

    /// A connection to a fan-out proxy, addressing the given targets.
    pub fn proxied(channel: Channel, targets: Vec<Target>) -> Self {
        Self {
            kind: ConnKind::Proxied {
                client: ProxyClient::new(channel),
                targets,
            },
        }
    }

    pub fn is_direct(&self) -> bool {
        matches!(self.kind, ConnKind::Direct { .. })
    }

    /// Target addresses, in index order.
    pub fn targets(&self) -> Vec<&str> {
        match &self.kind {
            ConnKind::Direct { target, .. } => vec![target.address.as_str()],
            ConnKind::Proxied { targets, .. } => {
                targets.iter().map(|t| t.address.as_str()).collect()
            }
        }
    }

    pub fn num_targets(&self) -> usize {
        match &self.kind {
            ConnKind::Direct { .. } => 1,
            ConnKind::Proxied { targets, .. } => targets.len(),
        }
    }

    /// Issue one unary request to every target.
    ///
    /// Returns a lazy sequence of per-target responses; the channel closes
    /// once every target has reported a terminal status. The receiver must
    /// be drained until it closes.
    pub async fn invoke_one_many<I, O>(
        &self,
        method: &str,
        input: I,
    ) -> Result<mpsc::Receiver<ManyResponse<O>>, Status>
    where
        I: Message + Name + 'static,
        O: Message + Name + Default + 'static,
    {
        match &self.kind {
            ConnKind::Direct { channel, target } => {
                let path = method_path(method)?;
                let mut grpc = tonic::client::Grpc::new(channel.clone());
                let target = target.address.clone();
                let (tx, rx) = mpsc::channel(1);
                tokio::spawn(async move {
                    let result = direct_unary::<I, O>(&mut grpc, path, input).await;
                    let _ = tx
                        .send(ManyResponse {
                            target,
                            index: 0,
                            result,
                        })
                        .await;
                });
                Ok(rx)
            }
            ConnKind::Proxied { client, targets } => {
                let mut call = ProxiedCall::open(client.clone(), targets, method).await?;
                if call.open_streams() > 0 {
                    call.send_payload(encode_any(&input)).await?;
                    call.close_send().await?;
                }
                let (tx, rx) = mpsc::channel(targets.len().max(1));
                tokio::spawn(async move {
                    loop {
                        match call.next_batch::<O>().await {
                            Ok(Some(batch)) => {
                                for response in batch {
                                    if tx.send(response).await.is_err() {
                                        return;
                                    }
                                }
                            }
                            Ok(None) => return,
                            Err(status) => {
                                for response in call.fail_remaining::<O>(status) {
                                    if tx.send(response).await.is_err() {
                                        return;
                                    }
                                }
                                return;
                            }
                        }
                    }
                });
                Ok(rx)
            }
        }
    }

    /// Open a server-streaming call: the input goes out once, batches of
    /// per-target responses come back via [`OneManyCall::recv`].
    pub async fn server_stream_one_many<I, O>(
        &self,
        method: &str,
        input: I,
    ) -> Result<OneManyCall<I, O>, Status>
    where
        I: Message + Name + 'static,
        O: Message + Name + Default + 'static,
    {
        match &self.kind {
            ConnKind::Direct { channel, target } => {
                let path = method_path(method)?;
                let mut grpc = tonic::client::Grpc::new(channel.clone());
                grpc.ready()
                    .await
                    .map_err(|e| Status::unavailable(format!("Backend not ready: {}", e)))?;
                let response = grpc
                    .server_streaming(
                        tonic::Request::new(input),
                        path,
                        ProstCodec::<I, O>::default(),
                    )
                    .await?;
                Ok(OneManyCall::direct_streamed(
                    target.address.clone(),
                    response.into_inner(),
                    None,
                ))
            }
            ConnKind::Proxied { client, targets } => {
                let mut call = ProxiedCall::open(client.clone(), targets, method).await?;
                if call.open_streams() > 0 {
                    call.send_payload(encode_any(&input)).await?;
                    call.close_send().await?;
                }
                Ok(OneManyCall::proxied(call))
            }
        }
    }

    /// Open a client-streaming call; use [`OneManyCall::send`] then
    /// [`OneManyCall::close_and_recv`].
    pub async fn client_stream_one_many<I, O>(
        &self,
        method: &str,
    ) -> Result<OneManyCall<I, O>, Status>
    where
        I: Message + Name + 'static,
        O: Message + Name + Default + 'static,
    {
        match &self.kind {
            ConnKind::Direct { channel, target } => {
                let path = method_path(method)?;
                let mut grpc = tonic::client::Grpc::new(channel.clone());
                let (tx, rx) = mpsc::channel(REQUEST_BUFFER);
                // The single response resolves only after the request stream
                // closes, so the call runs in its own task.
                let response = tokio::spawn(async move {
                    grpc.ready()
                        .await
                        .map_err(|e| Status::unavailable(format!("Backend not ready: {}", e)))?;
                    let response = grpc
                        .client_streaming(
                            tonic::Request::new(ReceiverStream::new(rx)),
                            path,
                            ProstCodec::<I, O>::default(),
                        )
                        .await?;
                    Ok(response.into_inner())
                });
                Ok(OneManyCall::direct_client_unary(
                    target.address.clone(),
                    tx,
                    response,
                ))
            }
            ConnKind::Proxied { client, targets } => Ok(OneManyCall::proxied(
                ProxiedCall::open(client.clone(), targets, method).await?,
            )),
        }
    }

    /// Open a bidirectional call with `send`/`recv` semantics.
    pub async fn bidi_stream_one_many<I, O>(
        &self,
        method: &str,
    ) -> Result<OneManyCall<I, O>, Status>
    where
        I: Message + Name + 'static,
        O: Message + Name + Default + 'static,
    {
        match &self.kind {
            ConnKind::Direct { channel, target } => {
                let path = method_path(method)?;
                let mut grpc = tonic::client::Grpc::new(channel.clone());
                grpc.ready()
                    .await
                    .map_err(|e| Status::unavailable(format!("Backend not ready: {}", e)))?;
                let (tx, rx) = mpsc::channel(REQUEST_BUFFER);
                let response = grpc
                    .streaming(
                        tonic::Request::new(ReceiverStream::new(rx)),
                        path,
                        ProstCodec::<I, O>::default(),
                    )
                    .await?;
                Ok(OneManyCall::direct_streamed(
                    target.address.clone(),
                    response.into_inner(),
                    Some(tx),
                ))
            }
            ConnKind::Proxied { client, targets } => Ok(OneManyCall::proxied(
                ProxiedCall::open(client.clone(), targets, method).await?,
            )),
        }
    }
}

async fn direct_unary<I, O>(
    grpc: &mut tonic::client::Grpc<Channel>,
    path: PathAndQuery,
    input: I,
) -> Result<O, Status>
where
    I: Message + Name + 'static,
    O: Message + Name + Default + 'static,
{
    grpc.ready()
        .await
        .map_err(|e| Status::unavailable(format!("Backend not ready: {}", e)))?;
    let response = grpc
        .unary(
            tonic::Request::new(input),
            path,
            ProstCodec::<I, O>::default(),
        )
        .await?;
    Ok(response.into_inner())
}

fn method_path(method: &str) -> Result<PathAndQuery, Status> {
    PathAndQuery::from_str(method)
        .map_err(|e| Status::invalid_argument(format!("Invalid method name '{}': {}", method, e)))
}

/// Client half of one multiplexed call: the open proxy stream, the mapping
/// from proxy-assigned stream ids back to targets, and any frames that
/// arrived before setup finished.
pub(crate) struct ProxiedCall {
    requests: mpsc::Sender<ProxyRequest>,
    replies: Streaming<ProxyReply>,
    routes: HashMap<u64, Route>,
    open: usize,
    early: VecDeque<proxy_reply::Reply>,
    failures: VecDeque<(String, usize, Status)>,
}

struct Route {
    target: String,
    index: usize,
}

impl ProxiedCall {
    pub(crate) async fn open(
        mut client: ProxyClient<Channel>,
        targets: &[Target],
        method: &str,
    ) -> Result<Self, Status> {
        let (request_tx, request_rx) = mpsc::channel(REQUEST_BUFFER.max(targets.len()));
        let replies = client
            .proxy(ReceiverStream::new(request_rx))
            .await?
            .into_inner();

        let mut call = Self {
            requests: request_tx,
            replies,
            routes: HashMap::new(),
            open: 0,
            early: VecDeque::new(),
            failures: VecDeque::new(),
        };

        // One StartStream per target; the nonce is the target's index.
        for (index, target) in targets.iter().enumerate() {
            call.requests
                .send(ProxyRequest::start_stream(
                    index as u64,
                    target.clone(),
                    method,
                ))
                .await
                .map_err(|_| Status::unavailable("proxy stream closed"))?;
        }

        // Collect every StartStreamReply before returning. Data frames for
        // streams that resolved fast may interleave; stash those.
        let mut resolved = 0;
        while resolved < targets.len() {
            let reply = call
                .replies
                .message()
                .await?
                .ok_or_else(|| Status::internal("proxy stream ended during stream setup"))?;
            match reply.reply {
                Some(proxy_reply::Reply::StartStreamReply(start)) => {
                    resolved += 1;
                    let index = start.nonce as usize;
                    let target = targets
                        .get(index)
                        .map(|t| t.address.clone())
                        .ok_or_else(|| {
                            Status::internal(format!(
                                "StartStreamReply for unknown nonce {}",
                                start.nonce
                            ))
                        })?;
                    match start.reply {
                        Some(start_stream_reply::Reply::StreamId(stream_id)) => {
                            call.routes.insert(stream_id, Route { target, index });
                            call.open += 1;
                        }
                        Some(start_stream_reply::Reply::ErrorStatus(status)) => {
                            call.failures.push_back((target, index, status.to_status()));
                        }
                        None => return Err(Status::internal("StartStreamReply missing body")),
                    }
                }
                Some(other) => call.early.push_back(other),
                None => return Err(Status::internal("unknown reply frame")),
            }
        }
        Ok(call)
    }

    pub(crate) fn open_streams(&self) -> usize {
        self.open
    }

    /// Send one payload to every target stream that is still open.
    pub(crate) async fn send_payload(&mut self, payload: prost_types::Any) -> Result<(), Status> {
        let stream_ids: Vec<u64> = self.routes.keys().copied().collect();
        if stream_ids.is_empty() {
            return Err(Status::failed_precondition("no open target streams"));
        }
        self.requests
            .send(ProxyRequest::stream_data(stream_ids, payload))
            .await
            .map_err(|_| Status::unavailable("proxy stream closed"))
    }

    pub(crate) async fn close_send(&mut self) -> Result<(), Status> {
        let stream_ids: Vec<u64> = self.routes.keys().copied().collect();
        if stream_ids.is_empty() {
            return Ok(());
        }
        self.requests
            .send(ProxyRequest::client_close(stream_ids))
            .await
            .map_err(|_| Status::unavailable("proxy stream closed"))
    }

    /// One underlying read, transformed into typed responses. `Ok(None)`
    /// means every target has reported its terminal status.
    pub(crate) async fn next_batch<O>(&mut self) -> Result<Option<Vec<ManyResponse<O>>>, Status>
    where
        O: Message + Name + Default,
    {
        loop {
            if let Some((target, index, status)) = self.failures.pop_front() {
                return Ok(Some(vec![ManyResponse::err(target, index, status)]));
            }
            let frame = if let Some(frame) = self.early.pop_front() {
                frame
            } else {
                if self.open == 0 {
                    return Ok(None);
                }
                match self.replies.message().await? {
                    Some(reply) => reply
                        .reply
                        .ok_or_else(|| Status::internal("unknown reply frame"))?,
                    None => return Err(Status::internal("proxy stream ended with open streams")),
                }
            };
            let batch = self.transform::<O>(frame)?;
            if !batch.is_empty() {
                return Ok(Some(batch));
            }
        }
    }

    fn transform<O>(&mut self, frame: proxy_reply::Reply) -> Result<Vec<ManyResponse<O>>, Status>
    where
        O: Message + Name + Default,
    {
        match frame {
            proxy_reply::Reply::StreamData(data) => {
                let payload = data
                    .payload
                    .ok_or_else(|| Status::internal("StreamData missing payload"))?;
                let mut out = Vec::with_capacity(data.stream_ids.len());
                for stream_id in data.stream_ids {
                    let route = self.routes.get(&stream_id).ok_or_else(|| {
                        Status::internal(format!("reply for unknown stream id {}", stream_id))
                    })?;
                    out.push(ManyResponse {
                        target: route.target.clone(),
                        index: route.index,
                        result: decode_any(&payload),
                    });
                }
                Ok(out)
            }
            proxy_reply::Reply::ServerClose(close) => {
                let route = self.routes.remove(&close.stream_id).ok_or_else(|| {
                    Status::internal(format!(
                        "ServerClose for unknown stream id {}",
                        close.stream_id
                    ))
                })?;
                self.open -= 1;
                let status = close.status.unwrap_or_default();
                if status.is_ok() {
                    // A clean close produces no entry; the data already did.
                    Ok(Vec::new())
                } else {
                    Ok(vec![ManyResponse::err(
                        route.target,
                        route.index,
                        status.to_status(),
                    )])
                }
            }
            proxy_reply::Reply::StartStreamReply(_) => {
                Err(Status::internal("unexpected StartStreamReply"))
            }
        }
    }

    /// Convert every still-open target into an error response. Used when the
    /// proxy stream itself fails mid-sequence.
    pub(crate) fn fail_remaining<O>(&mut self, status: Status) -> Vec<ManyResponse<O>> {
        let mut routes: Vec<Route> = self.routes.drain().map(|(_, route)| route).collect();
        routes.sort_by_key(|route| route.index);
        self.open = 0;
        routes
            .into_iter()
            .map(|route| ManyResponse::err(route.target, route.index, status.clone()))
            .collect()
    }
}
