//! Shared test support: echo message types and an in-process echo backend.
#![allow(dead_code)]

use std::net::SocketAddr;

use prost::{Message, Name};

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EchoRequest {
    #[prost(string, tag = "1")]
    pub message: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EchoResponse {
    #[prost(string, tag = "1")]
    pub message: String,
    #[prost(uint32, tag = "2")]
    pub sequence: u32,
}

impl Name for EchoRequest {
    const NAME: &'static str = "EchoRequest";
    const PACKAGE: &'static str = "fanout.test.v1";
    fn full_name() -> String {
        "fanout.test.v1.EchoRequest".to_string()
    }
    fn type_url() -> String {
        "type.googleapis.com/fanout.test.v1.EchoRequest".to_string()
    }
}

impl Name for EchoResponse {
    const NAME: &'static str = "EchoResponse";
    const PACKAGE: &'static str = "fanout.test.v1";
    fn full_name() -> String {
        "fanout.test.v1.EchoResponse".to_string()
    }
    fn type_url() -> String {
        "type.googleapis.com/fanout.test.v1.EchoResponse".to_string()
    }
}

pub fn to_any<M: Message + Name>(message: &M) -> prost_types::Any {
    prost_types::Any {
        type_url: format!("type.googleapis.com/{}", M::full_name()),
        value: message.encode_to_vec(),
    }
}

pub fn from_any<M: Message + Default>(any: &prost_types::Any) -> M {
    M::decode(any.value.as_slice()).expect("payload should decode")
}

/// Hand-rolled tonic service for the `fanout.test.v1.Echo` backend used by
/// the e2e tests:
///
/// - `Ping` (unary): echoes the message; "fail:<msg>" returns INTERNAL.
/// - `Count` (server streaming): emits N numbered echoes for message "N";
///   "fail-mid" emits two then fails with INTERNAL.
/// - `Sum` (client streaming): joins all messages with '+'.
/// - `Chat` (bidi): echoes each message with its sequence number.
pub mod echo_backend {
    use super::{EchoRequest, EchoResponse};
    use std::pin::Pin;
    use tonic::codegen::*;

    type EchoStream =
        Pin<Box<dyn tokio_stream::Stream<Item = Result<EchoResponse, tonic::Status>> + Send>>;

    struct PingSvc;

    impl tonic::server::UnaryService<EchoRequest> for PingSvc {
        type Response = EchoResponse;
        type Future = BoxFuture<tonic::Response<EchoResponse>, tonic::Status>;

        fn call(&mut self, request: tonic::Request<EchoRequest>) -> Self::Future {
            Box::pin(async move {
                let req = request.into_inner();
                if let Some(rest) = req.message.strip_prefix("fail:") {
                    return Err(tonic::Status::internal(rest.to_string()));
                }
                Ok(tonic::Response::new(EchoResponse {
                    message: req.message,
                    sequence: 0,
                }))
            })
        }
    }

    struct CountSvc;

    impl tonic::server::ServerStreamingService<EchoRequest> for CountSvc {
        type Response = EchoResponse;
        type ResponseStream = EchoStream;
        type Future = BoxFuture<tonic::Response<Self::ResponseStream>, tonic::Status>;

        fn call(&mut self, request: tonic::Request<EchoRequest>) -> Self::Future {
            Box::pin(async move {
                let req = request.into_inner();
                let fail_mid = req.message == "fail-mid";
                let count: u32 = if fail_mid {
                    2
                } else {
                    req.message.parse().unwrap_or(1)
                };
                let message = req.message.clone();
                let stream = async_stream::try_stream! {
                    for sequence in 0..count {
                        yield EchoResponse { message: message.clone(), sequence };
                    }
                    if fail_mid {
                        Err::<EchoResponse, tonic::Status>(
                            tonic::Status::internal("backend failed mid-stream"),
                        )?;
                    }
                };
                Ok(tonic::Response::new(
                    Box::pin(stream) as Self::ResponseStream
                ))
            })
        }
    }

    struct SumSvc;

    impl tonic::server::ClientStreamingService<EchoRequest> for SumSvc {
        type Response = EchoResponse;
        type Future = BoxFuture<tonic::Response<EchoResponse>, tonic::Status>;

        fn call(
            &mut self,
            request: tonic::Request<tonic::Streaming<EchoRequest>>,
        ) -> Self::Future {
            Box::pin(async move {
                let mut stream = request.into_inner();
                let mut parts = Vec::new();
                while let Some(req) = stream.message().await? {
                    parts.push(req.message);
                }
                Ok(tonic::Response::new(EchoResponse {
                    message: parts.join("+"),
                    sequence: parts.len() as u32,
                }))
            })
        }
    }

    struct ChatSvc;

    impl tonic::server::StreamingService<EchoRequest> for ChatSvc {
        type Response = EchoResponse;
        type ResponseStream = EchoStream;
        type Future = BoxFuture<tonic::Response<Self::ResponseStream>, tonic::Status>;

        fn call(
            &mut self,
            request: tonic::Request<tonic::Streaming<EchoRequest>>,
        ) -> Self::Future {
            Box::pin(async move {
                let mut inbound = request.into_inner();
                let stream = async_stream::try_stream! {
                    let mut sequence = 0u32;
                    while let Some(req) = inbound.message().await? {
                        yield EchoResponse { message: req.message, sequence };
                        sequence += 1;
                    }
                };
                Ok(tonic::Response::new(
                    Box::pin(stream) as Self::ResponseStream
                ))
            })
        }
    }

    #[derive(Clone, Default)]
    pub struct EchoServer;

    impl tonic::server::NamedService for EchoServer {
        const NAME: &'static str = "fanout.test.v1.Echo";
    }

    impl<B> tonic::codegen::Service<http::Request<B>> for EchoServer
    where
        B: Body + Send + 'static,
        B::Error: Into<StdError> + Send + 'static,
    {
        type Response = http::Response<tonic::body::BoxBody>;
        type Error = std::convert::Infallible;
        type Future = BoxFuture<Self::Response, Self::Error>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: http::Request<B>) -> Self::Future {
            match req.uri().path() {
                "/fanout.test.v1.Echo/Ping" => Box::pin(async move {
                    let res = tonic::server::Grpc::new(tonic::codec::ProstCodec::default())
                        .unary(PingSvc, req)
                        .await;
                    Ok(res)
                }),
                "/fanout.test.v1.Echo/Count" => Box::pin(async move {
                    let res = tonic::server::Grpc::new(tonic::codec::ProstCodec::default())
                        .server_streaming(CountSvc, req)
                        .await;
                    Ok(res)
                }),
                "/fanout.test.v1.Echo/Sum" => Box::pin(async move {
                    let res = tonic::server::Grpc::new(tonic::codec::ProstCodec::default())
                        .client_streaming(SumSvc, req)
                        .await;
                    Ok(res)
                }),
                "/fanout.test.v1.Echo/Chat" => Box::pin(async move {
                    let res = tonic::server::Grpc::new(tonic::codec::ProstCodec::default())
                        .streaming(ChatSvc, req)
                        .await;
                    Ok(res)
                }),
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
}

/// Serve the echo backend on an ephemeral port, returning its address.
pub async fn spawn_echo_backend() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind echo backend");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(echo_backend::EchoServer)
            .serve_with_incoming(tokio_stream::wrappers::TcpListenerStream::new(listener))
            .await
            .expect("echo backend server");
    });
    addr
}
