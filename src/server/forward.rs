//! Generic gRPC forwarder: the production backend handler
//!
//! Forwards the opaque payloads of one target stream to the real backend
//! named by the target descriptor, using a raw bytes codec so it can call
//! any method known only by name. Channels are cached per address and reused
//! across target streams.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes};
use dashmap::DashMap;
use http::uri::PathAndQuery;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::transport::{Channel, Endpoint};
use tonic::{Status, Streaming};

use crate::config::ProxyConfig;
use crate::registry::{BackendCall, BackendHandler};

/// Caching gRPC forwarder.
pub struct GrpcForwarder {
    channels: DashMap<String, Channel>,
    connect_timeout: Duration,
    tcp_keepalive: Duration,
    http2_keepalive_interval: Duration,
    keepalive_timeout: Duration,
}

impl Default for GrpcForwarder {
    fn default() -> Self {
        Self::new()
    }
}

impl GrpcForwarder {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            connect_timeout: Duration::from_secs(5),
            tcp_keepalive: Duration::from_secs(60),
            http2_keepalive_interval: Duration::from_secs(30),
            keepalive_timeout: Duration::from_secs(10),
        }
    }

    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            channels: DashMap::new(),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            tcp_keepalive: Duration::from_secs(config.tcp_keepalive_secs),
            http2_keepalive_interval: Duration::from_secs(config.http2_keepalive_interval_secs),
            keepalive_timeout: Duration::from_secs(config.keepalive_timeout_secs),
        }
    }

    /// Number of cached backend channels.
    pub fn cached_channels(&self) -> usize {
        self.channels.len()
    }

    /// Drop the cached channel for an address, if any.
    pub fn evict(&self, address: &str) -> bool {
        self.channels.remove(address).is_some()
    }

    async fn channel_for(&self, address: &str) -> Result<Channel, Status> {
        if let Some(entry) = self.channels.get(address) {
            return Ok(entry.clone());
        }

        let endpoint = Endpoint::from_shared(format!("http://{}", address))
            .map_err(|e| {
                Status::invalid_argument(format!("Invalid target address '{}': {}", address, e))
            })?
            .tcp_keepalive(Some(self.tcp_keepalive))
            .http2_keep_alive_interval(self.http2_keepalive_interval)
            .keep_alive_timeout(self.keepalive_timeout)
            .connect_timeout(self.connect_timeout);

        let channel = endpoint.connect().await.map_err(|e| {
            Status::unavailable(format!("Failed to connect to backend '{}': {}", address, e))
        })?;

        // Two streams racing to dial the same address both succeed; the
        // second insert wins and both channels work.
        self.channels.insert(address.to_string(), channel.clone());
        tracing::debug!(target = %address, "Created gRPC connection to backend");
        Ok(channel)
    }
}

#[async_trait]
impl BackendHandler for GrpcForwarder {
    async fn call(&self, call: BackendCall) -> Result<(), Status> {
        let BackendCall {
            target,
            method,
            mut inbound,
            outbound,
        } = call;

        let channel = self.channel_for(&target.address).await?;
        let mut grpc = tonic::client::Grpc::new(channel);
        grpc.ready()
            .await
            .map_err(|e| Status::unavailable(format!("Backend not ready: {}", e)))?;

        let path = PathAndQuery::from_str(method.full_name()).map_err(|e| {
            Status::invalid_argument(format!("Invalid method name '{}': {}", method.full_name(), e))
        })?;
        let codec = RawCodec;
        let output_type_url = method.output_type_url();

        match (method.is_client_streaming(), method.is_server_streaming()) {
            (false, false) => {
                let payload = first_payload(&mut inbound).await?;
                let response = grpc.unary(tonic::Request::new(payload), path, codec).await?;
                send_wrapped(&outbound, &output_type_url, response.into_inner()).await;
                Ok(())
            }
            (false, true) => {
                let payload = first_payload(&mut inbound).await?;
                let response = grpc
                    .server_streaming(tonic::Request::new(payload), path, codec)
                    .await?;
                forward_responses(response.into_inner(), &outbound, &output_type_url).await
            }
            (true, false) => {
                let requests = request_stream(inbound);
                let response = grpc
                    .client_streaming(tonic::Request::new(requests), path, codec)
                    .await?;
                send_wrapped(&outbound, &output_type_url, response.into_inner()).await;
                Ok(())
            }
            (true, true) => {
                let requests = request_stream(inbound);
                let response = grpc
                    .streaming(tonic::Request::new(requests), path, codec)
                    .await?;
                forward_responses(response.into_inner(), &outbound, &output_type_url).await
            }
        }
    }
}

async fn first_payload(inbound: &mut tokio::sync::mpsc::Receiver<prost_types::Any>) -> Result<Bytes, Status> {
    inbound
        .recv()
        .await
        .map(|any| Bytes::from(any.value))
        .ok_or_else(|| Status::invalid_argument("missing request payload"))
}

fn request_stream(
    mut inbound: tokio::sync::mpsc::Receiver<prost_types::Any>,
) -> impl tokio_stream::Stream<Item = Bytes> + Send + 'static {
    async_stream::stream! {
        while let Some(any) = inbound.recv().await {
            yield Bytes::from(any.value);
        }
    }
}

fn wrap(type_url: &str, value: Bytes) -> prost_types::Any {
    prost_types::Any {
        type_url: type_url.to_string(),
        value: value.to_vec(),
    }
}

async fn send_wrapped(
    outbound: &tokio::sync::mpsc::Sender<prost_types::Any>,
    type_url: &str,
    value: Bytes,
) {
    // A closed outbound means the stream was cancelled; the pump reports it.
    let _ = outbound.send(wrap(type_url, value)).await;
}

async fn forward_responses(
    mut responses: Streaming<Bytes>,
    outbound: &tokio::sync::mpsc::Sender<prost_types::Any>,
    type_url: &str,
) -> Result<(), Status> {
    while let Some(chunk) = responses.message().await? {
        if outbound.send(wrap(type_url, chunk)).await.is_err() {
            break;
        }
    }
    Ok(())
}

/// Codec that moves raw message bytes without reserializing, so arbitrary
/// methods can be called with payloads that are opaque to the proxy.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl Codec for RawCodec {
    type Encode = Bytes;
    type Decode = Bytes;
    type Encoder = RawEncoder;
    type Decoder = RawDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        RawEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        RawDecoder
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RawEncoder;

impl Encoder for RawEncoder {
    type Item = Bytes;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, buf: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        buf.put(item);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RawDecoder;

impl Decoder for RawDecoder {
    type Item = Bytes;
    type Error = Status;

    fn decode(&mut self, buf: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        Ok(Some(buf.copy_to_bytes(buf.remaining())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_address_is_invalid_argument() {
        let forwarder = GrpcForwarder::new();
        let err = forwarder.channel_for("not a host").await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
        assert_eq!(forwarder.cached_channels(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_unavailable() {
        let forwarder = GrpcForwarder::from_config(&ProxyConfig {
            connect_timeout_secs: 1,
            ..Default::default()
        });
        // Port 1 is essentially never listening.
        let err = forwarder.channel_for("127.0.0.1:1").await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unavailable);
        assert_eq!(forwarder.cached_channels(), 0);
    }

    #[test]
    fn test_wrap_sets_type_url() {
        let any = wrap("type.googleapis.com/t.Out", Bytes::from_static(b"abc"));
        assert_eq!(any.type_url, "type.googleapis.com/t.Out");
        assert_eq!(any.value, b"abc");
    }

    #[test]
    fn test_evict_unknown_address() {
        let forwarder = GrpcForwarder::new();
        assert!(!forwarder.evict("127.0.0.1:9"));
    }
}
