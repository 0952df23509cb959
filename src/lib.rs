//! fanout-proxy - Fan-out RPC proxy
//!
//! A single client opens one long-lived bidirectional stream to the proxy
//! and multiplexes many logical calls to one or more backend targets over
//! it. The server side demultiplexes backend responses back onto the client
//! stream; the client side exposes per-RPC OneMany operations that deliver
//! per-target tagged responses as a lazy sequence.

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod proto;
pub mod registry;
pub mod server;

pub use auth::{AllowAll, Authorizer, PeerIdentity};
pub use client::{ManyResponse, OneManyCall, ProxyConn};
pub use config::{MethodConfig, ProxyConfig, TlsConfig};
pub use error::{ProxyError, ProxyResult};
pub use registry::{BackendCall, BackendHandler, MethodDescriptor, ServiceRegistry};
pub use server::{GrpcForwarder, ProxyService, ProxySession, SessionLimits};
