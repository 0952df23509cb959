//! Wire schema for the proxy stream.
//!
//! Message and service definitions mirror `proto/fanout/v1/proxy.proto`. The
//! prost/tonic bindings are committed in-tree so the crate builds without a
//! protoc toolchain; keep them in sync with the .proto file.

/// A single backend server addressed within one logical call.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Target {
    /// host:port of the backend.
    #[prost(string, tag = "1")]
    pub address: ::prost::alloc::string::String,
    /// Optional hint for target-side authentication (opaque to the proxy).
    #[prost(string, optional, tag = "2")]
    pub auth_hint: ::core::option::Option<::prost::alloc::string::String>,
    /// Optional opaque dial nonce (opaque to the proxy).
    #[prost(bytes = "vec", optional, tag = "3")]
    pub dial_nonce: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
}

/// Open one new target stream for `method_name` against `target`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StartStream {
    /// Client-chosen value echoed in the StartStreamReply; correlates the
    /// reply before a stream id exists. Must be unique among open requests.
    #[prost(uint64, tag = "1")]
    pub nonce: u64,
    #[prost(message, optional, tag = "2")]
    pub target: ::core::option::Option<Target>,
    /// Fully qualified method name: /Package.Service/Method
    #[prost(string, tag = "3")]
    pub method_name: ::prost::alloc::string::String,
}

/// A request payload for one or more open streams (client to proxy), or a
/// response payload for exactly one stream (proxy to client).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamData {
    #[prost(uint64, repeated, tag = "1")]
    pub stream_ids: ::prost::alloc::vec::Vec<u64>,
    #[prost(message, optional, tag = "2")]
    pub payload: ::core::option::Option<::prost_types::Any>,
}

/// Half-close: no further payloads will be sent on the listed streams.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientClose {
    #[prost(uint64, repeated, tag = "1")]
    pub stream_ids: ::prost::alloc::vec::Vec<u64>,
}

/// Cancel the listed streams immediately with CANCELLED status.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientCancel {
    #[prost(uint64, repeated, tag = "1")]
    pub stream_ids: ::prost::alloc::vec::Vec<u64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProxyRequest {
    #[prost(oneof = "proxy_request::Request", tags = "1, 2, 3, 4")]
    pub request: ::core::option::Option<proxy_request::Request>,
}
/// Nested message and enum types in `ProxyRequest`.
pub mod proxy_request {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Request {
        #[prost(message, tag = "1")]
        StartStream(super::StartStream),
        #[prost(message, tag = "2")]
        StreamData(super::StreamData),
        #[prost(message, tag = "3")]
        ClientClose(super::ClientClose),
        #[prost(message, tag = "4")]
        ClientCancel(super::ClientCancel),
    }
}

/// Mirrors google.rpc.Status.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcStatus {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "3")]
    pub details: ::prost::alloc::vec::Vec<::prost_types::Any>,
}

/// Outcome of a StartStream, correlated by nonce.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StartStreamReply {
    #[prost(uint64, tag = "1")]
    pub nonce: u64,
    #[prost(oneof = "start_stream_reply::Reply", tags = "2, 3")]
    pub reply: ::core::option::Option<start_stream_reply::Reply>,
}
/// Nested message and enum types in `StartStreamReply`.
pub mod start_stream_reply {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Reply {
        #[prost(uint64, tag = "2")]
        StreamId(u64),
        #[prost(message, tag = "3")]
        ErrorStatus(super::RpcStatus),
    }
}

/// Terminal status for one stream. Always the last frame for its stream id.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerClose {
    #[prost(uint64, tag = "1")]
    pub stream_id: u64,
    #[prost(message, optional, tag = "2")]
    pub status: ::core::option::Option<RpcStatus>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProxyReply {
    #[prost(oneof = "proxy_reply::Reply", tags = "1, 2, 3")]
    pub reply: ::core::option::Option<proxy_reply::Reply>,
}
/// Nested message and enum types in `ProxyReply`.
pub mod proxy_reply {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Reply {
        #[prost(message, tag = "1")]
        StartStreamReply(super::StartStreamReply),
        #[prost(message, tag = "2")]
        StreamData(super::StreamData),
        #[prost(message, tag = "3")]
        ServerClose(super::ServerClose),
    }
}

/// Generated client implementations.
pub mod proxy_client {
    #![allow(
        unused_variables,
        dead_code,
        missing_docs,
        clippy::wildcard_imports,
        clippy::let_unit_value
    )]
    use tonic::codegen::http::Uri;
    use tonic::codegen::*;
    #[derive(Debug, Clone)]
    pub struct ProxyClient<T> {
        inner: tonic::client::Grpc<T>,
    }
    impl ProxyClient<tonic::transport::Channel> {
        /// Attempt to create a new client by connecting to a given endpoint.
        pub async fn connect<D>(dst: D) -> Result<Self, tonic::transport::Error>
        where
            D: TryInto<tonic::transport::Endpoint>,
            D::Error: Into<StdError>,
        {
            let conn = tonic::transport::Endpoint::new(dst)?.connect().await?;
            Ok(Self::new(conn))
        }
    }
    impl<T> ProxyClient<T>
    where
        T: tonic::client::GrpcService<tonic::body::BoxBody>,
        T::Error: Into<StdError>,
        T::ResponseBody: Body<Data = Bytes> + std::marker::Send + 'static,
        <T::ResponseBody as Body>::Error: Into<StdError> + std::marker::Send,
    {
        pub fn new(inner: T) -> Self {
            let inner = tonic::client::Grpc::new(inner);
            Self { inner }
        }
        pub fn with_origin(inner: T, origin: Uri) -> Self {
            let inner = tonic::client::Grpc::with_origin(inner, origin);
            Self { inner }
        }
        /// Compress requests with the given encoding.
        ///
        /// This requires the server to support it otherwise it might respond with an
        /// error.
        #[must_use]
        pub fn send_compressed(mut self, encoding: CompressionEncoding) -> Self {
            self.inner = self.inner.send_compressed(encoding);
            self
        }
        /// Enable decompressing responses.
        #[must_use]
        pub fn accept_compressed(mut self, encoding: CompressionEncoding) -> Self {
            self.inner = self.inner.accept_compressed(encoding);
            self
        }
        /// Limits the maximum size of a decoded message.
        ///
        /// Default: `4MB`
        #[must_use]
        pub fn max_decoding_message_size(mut self, limit: usize) -> Self {
            self.inner = self.inner.max_decoding_message_size(limit);
            self
        }
        /// Limits the maximum size of an encoded message.
        ///
        /// Default: `usize::MAX`
        #[must_use]
        pub fn max_encoding_message_size(mut self, limit: usize) -> Self {
            self.inner = self.inner.max_encoding_message_size(limit);
            self
        }
        pub async fn proxy(
            &mut self,
            request: impl tonic::IntoStreamingRequest<Message = super::ProxyRequest>,
        ) -> std::result::Result<
            tonic::Response<tonic::codec::Streaming<super::ProxyReply>>,
            tonic::Status,
        > {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::unknown(format!("Service was not ready: {}", e.into()))
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/fanout.v1.Proxy/Proxy");
            let mut req = request.into_streaming_request();
            req.extensions_mut()
                .insert(GrpcMethod::new("fanout.v1.Proxy", "Proxy"));
            self.inner.streaming(req, path, codec).await
        }
    }
}

/// Generated server implementations.
pub mod proxy_server {
    #![allow(
        unused_variables,
        dead_code,
        missing_docs,
        clippy::wildcard_imports,
        clippy::let_unit_value
    )]
    use tonic::codegen::*;
    /// Generated trait containing gRPC methods that should be implemented for use with ProxyServer.
    #[async_trait]
    pub trait Proxy: std::marker::Send + std::marker::Sync + 'static {
        /// Server streaming response type for the Proxy method.
        type ProxyStream: tonic::codegen::tokio_stream::Stream<
                Item = std::result::Result<super::ProxyReply, tonic::Status>,
            > + std::marker::Send
            + 'static;
        async fn proxy(
            &self,
            request: tonic::Request<tonic::Streaming<super::ProxyRequest>>,
        ) -> std::result::Result<tonic::Response<Self::ProxyStream>, tonic::Status>;
    }
    #[derive(Debug)]
    pub struct ProxyServer<T> {
        inner: Arc<T>,
        accept_compression_encodings: EnabledCompressionEncodings,
        send_compression_encodings: EnabledCompressionEncodings,
        max_decoding_message_size: Option<usize>,
        max_encoding_message_size: Option<usize>,
    }
    impl<T> ProxyServer<T> {
        pub fn new(inner: T) -> Self {
            Self::from_arc(Arc::new(inner))
        }
        pub fn from_arc(inner: Arc<T>) -> Self {
            Self {
                inner,
                accept_compression_encodings: Default::default(),
                send_compression_encodings: Default::default(),
                max_decoding_message_size: None,
                max_encoding_message_size: None,
            }
        }
        pub fn with_interceptor<F>(inner: T, interceptor: F) -> InterceptedService<Self, F>
        where
            F: tonic::service::Interceptor,
        {
            InterceptedService::new(Self::new(inner), interceptor)
        }
        /// Enable decompressing requests with the given encoding.
        #[must_use]
        pub fn accept_compressed(mut self, encoding: CompressionEncoding) -> Self {
            self.accept_compression_encodings.enable(encoding);
            self
        }
        /// Compress responses with the given encoding, if the client supports it.
        #[must_use]
        pub fn send_compressed(mut self, encoding: CompressionEncoding) -> Self {
            self.send_compression_encodings.enable(encoding);
            self
        }
        /// Limits the maximum size of a decoded message.
        ///
        /// Default: `4MB`
        #[must_use]
        pub fn max_decoding_message_size(mut self, limit: usize) -> Self {
            self.max_decoding_message_size = Some(limit);
            self
        }
        /// Limits the maximum size of an encoded message.
        ///
        /// Default: `usize::MAX`
        #[must_use]
        pub fn max_encoding_message_size(mut self, limit: usize) -> Self {
            self.max_encoding_message_size = Some(limit);
            self
        }
    }
    impl<T, B> tonic::codegen::Service<http::Request<B>> for ProxyServer<T>
    where
        T: Proxy,
        B: Body + std::marker::Send + 'static,
        B::Error: Into<StdError> + std::marker::Send + 'static,
    {
        type Response = http::Response<tonic::body::BoxBody>;
        type Error = std::convert::Infallible;
        type Future = BoxFuture<Self::Response, Self::Error>;
        fn poll_ready(
            &mut self,
            _cx: &mut Context<'_>,
        ) -> Poll<std::result::Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
        fn call(&mut self, req: http::Request<B>) -> Self::Future {
            match req.uri().path() {
                "/fanout.v1.Proxy/Proxy" => {
                    #[allow(non_camel_case_types)]
                    struct ProxySvc<T: Proxy>(pub Arc<T>);
                    impl<T: Proxy> tonic::server::StreamingService<super::ProxyRequest> for ProxySvc<T> {
                        type Response = super::ProxyReply;
                        type ResponseStream = T::ProxyStream;
                        type Future =
                            BoxFuture<tonic::Response<Self::ResponseStream>, tonic::Status>;
                        fn call(
                            &mut self,
                            request: tonic::Request<tonic::Streaming<super::ProxyRequest>>,
                        ) -> Self::Future {
                            let inner = Arc::clone(&self.0);
                            let fut = async move { <T as Proxy>::proxy(&inner, request).await };
                            Box::pin(fut)
                        }
                    }
                    let accept_compression_encodings = self.accept_compression_encodings;
                    let send_compression_encodings = self.send_compression_encodings;
                    let max_decoding_message_size = self.max_decoding_message_size;
                    let max_encoding_message_size = self.max_encoding_message_size;
                    let inner = self.inner.clone();
                    let fut = async move {
                        let method = ProxySvc(inner);
                        let codec = tonic::codec::ProstCodec::default();
                        let mut grpc = tonic::server::Grpc::new(codec)
                            .apply_compression_config(
                                accept_compression_encodings,
                                send_compression_encodings,
                            )
                            .apply_max_message_size_config(
                                max_decoding_message_size,
                                max_encoding_message_size,
                            );
                        let res = grpc.streaming(method, req).await;
                        Ok(res)
                    };
                    Box::pin(fut)
                }
                _ => Box::pin(async move {
                    Ok(http::Response::builder()
                        .status(200)
                        .header("grpc-status", tonic::Code::Unimplemented as i32)
                        .header(
                            http::header::CONTENT_TYPE,
                            tonic::metadata::GRPC_CONTENT_TYPE,
                        )
                        .body(empty_body())
                        .unwrap())
                }),
            }
        }
    }
    impl<T> Clone for ProxyServer<T> {
        fn clone(&self) -> Self {
            let inner = self.inner.clone();
            Self {
                inner,
                accept_compression_encodings: self.accept_compression_encodings,
                send_compression_encodings: self.send_compression_encodings,
                max_decoding_message_size: self.max_decoding_message_size,
                max_encoding_message_size: self.max_encoding_message_size,
            }
        }
    }
    /// Generated gRPC service name
    pub const SERVICE_NAME: &str = "fanout.v1.Proxy";
    impl<T> tonic::server::NamedService for ProxyServer<T> {
        const NAME: &'static str = SERVICE_NAME;
    }
}

// ---------------------------------------------------------------------------
// Hand-written helpers over the generated types.
// ---------------------------------------------------------------------------

impl Target {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            auth_hint: None,
            dial_nonce: None,
        }
    }
}

impl RpcStatus {
    /// The OK status (code 0, empty message).
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn is_ok(&self) -> bool {
        self.code == tonic::Code::Ok as i32
    }

    pub fn to_status(&self) -> tonic::Status {
        tonic::Status::new(tonic::Code::from(self.code), self.message.clone())
    }
}

impl From<tonic::Status> for RpcStatus {
    fn from(status: tonic::Status) -> Self {
        Self {
            code: status.code() as i32,
            message: status.message().to_string(),
            details: Vec::new(),
        }
    }
}

impl ProxyRequest {
    pub fn start_stream(nonce: u64, target: Target, method_name: impl Into<String>) -> Self {
        Self {
            request: Some(proxy_request::Request::StartStream(StartStream {
                nonce,
                target: Some(target),
                method_name: method_name.into(),
            })),
        }
    }

    pub fn stream_data(stream_ids: Vec<u64>, payload: ::prost_types::Any) -> Self {
        Self {
            request: Some(proxy_request::Request::StreamData(StreamData {
                stream_ids,
                payload: Some(payload),
            })),
        }
    }

    pub fn client_close(stream_ids: Vec<u64>) -> Self {
        Self {
            request: Some(proxy_request::Request::ClientClose(ClientClose {
                stream_ids,
            })),
        }
    }

    pub fn client_cancel(stream_ids: Vec<u64>) -> Self {
        Self {
            request: Some(proxy_request::Request::ClientCancel(ClientCancel {
                stream_ids,
            })),
        }
    }
}

impl ProxyReply {
    pub fn start_stream_reply(nonce: u64, result: Result<u64, tonic::Status>) -> Self {
        let reply = match result {
            Ok(stream_id) => start_stream_reply::Reply::StreamId(stream_id),
            Err(status) => start_stream_reply::Reply::ErrorStatus(status.into()),
        };
        Self {
            reply: Some(proxy_reply::Reply::StartStreamReply(StartStreamReply {
                nonce,
                reply: Some(reply),
            })),
        }
    }

    pub fn stream_data(stream_id: u64, payload: ::prost_types::Any) -> Self {
        Self {
            reply: Some(proxy_reply::Reply::StreamData(StreamData {
                stream_ids: vec![stream_id],
                payload: Some(payload),
            })),
        }
    }

    pub fn server_close(stream_id: u64, status: RpcStatus) -> Self {
        Self {
            reply: Some(proxy_reply::Reply::ServerClose(ServerClose {
                stream_id,
                status: Some(status),
            })),
        }
    }
}
