//! Service registry mapping fully qualified method names to descriptors
//!
//! Built once at startup and immutable for the lifetime of the process. The
//! stream set looks methods up when a StartStream arrives; an unknown name
//! yields an UNIMPLEMENTED StartStreamReply.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tonic::Status;

use crate::proto::Target;

/// Immutable description of one RPC method the proxy can open target
/// streams for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    full_name: String,
    input_type: String,
    output_type: String,
    client_streaming: bool,
    server_streaming: bool,
}

impl MethodDescriptor {
    pub fn new(
        full_name: impl Into<String>,
        input_type: impl Into<String>,
        output_type: impl Into<String>,
        client_streaming: bool,
        server_streaming: bool,
    ) -> Self {
        Self {
            full_name: full_name.into(),
            input_type: input_type.into(),
            output_type: output_type.into(),
            client_streaming,
            server_streaming,
        }
    }

    pub fn unary(
        full_name: impl Into<String>,
        input_type: impl Into<String>,
        output_type: impl Into<String>,
    ) -> Self {
        Self::new(full_name, input_type, output_type, false, false)
    }

    pub fn server_streaming(
        full_name: impl Into<String>,
        input_type: impl Into<String>,
        output_type: impl Into<String>,
    ) -> Self {
        Self::new(full_name, input_type, output_type, false, true)
    }

    pub fn client_streaming(
        full_name: impl Into<String>,
        input_type: impl Into<String>,
        output_type: impl Into<String>,
    ) -> Self {
        Self::new(full_name, input_type, output_type, true, false)
    }

    pub fn bidi_streaming(
        full_name: impl Into<String>,
        input_type: impl Into<String>,
        output_type: impl Into<String>,
    ) -> Self {
        Self::new(full_name, input_type, output_type, true, true)
    }

    /// Fully qualified method name: /Package.Service/Method
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    /// Full protobuf message name of the request type.
    pub fn input_type(&self) -> &str {
        &self.input_type
    }

    /// Full protobuf message name of the response type.
    pub fn output_type(&self) -> &str {
        &self.output_type
    }

    pub fn is_client_streaming(&self) -> bool {
        self.client_streaming
    }

    pub fn is_server_streaming(&self) -> bool {
        self.server_streaming
    }

    /// Type URL stamped onto response payload envelopes.
    pub fn output_type_url(&self) -> String {
        format!("type.googleapis.com/{}", self.output_type)
    }
}

/// One backend invocation, handed to a [`BackendHandler`] per target stream.
///
/// `inbound` yields the client's request payloads in order and closes on
/// half-close; the handler sends response payloads to `outbound` in the
/// order the backend produced them. Dropping the call aborts the backend
/// work.
pub struct BackendCall {
    pub target: Target,
    pub method: MethodDescriptor,
    pub inbound: mpsc::Receiver<prost_types::Any>,
    pub outbound: mpsc::Sender<prost_types::Any>,
}

/// Invoked once per target stream to run the backend side of the call.
///
/// The returned status is the stream's terminal status: `Ok(())` becomes an
/// OK ServerClose, an error becomes a ServerClose carrying that status.
#[async_trait]
pub trait BackendHandler: Send + Sync {
    async fn call(&self, call: BackendCall) -> Result<(), Status>;
}

/// A method descriptor together with the handler that serves it.
#[derive(Clone)]
pub struct RegisteredMethod {
    pub descriptor: MethodDescriptor,
    pub handler: Arc<dyn BackendHandler>,
}

/// Immutable registry of forwardable methods.
pub struct ServiceRegistry {
    methods: HashMap<String, RegisteredMethod>,
}

impl ServiceRegistry {
    pub fn builder() -> ServiceRegistryBuilder {
        ServiceRegistryBuilder {
            methods: HashMap::new(),
        }
    }

    /// Look up a method by its fully qualified name.
    pub fn lookup(&self, full_name: &str) -> Option<&RegisteredMethod> {
        self.methods.get(full_name)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }
}

pub struct ServiceRegistryBuilder {
    methods: HashMap<String, RegisteredMethod>,
}

impl ServiceRegistryBuilder {
    /// Register a method. A later registration under the same name replaces
    /// the earlier one.
    pub fn register(
        mut self,
        descriptor: MethodDescriptor,
        handler: Arc<dyn BackendHandler>,
    ) -> Self {
        let name = descriptor.full_name.clone();
        if self
            .methods
            .insert(name.clone(), RegisteredMethod { descriptor, handler })
            .is_some()
        {
            tracing::warn!(method = %name, "Method registered twice, replacing earlier entry");
        }
        self
    }

    pub fn build(self) -> ServiceRegistry {
        tracing::info!(methods = self.methods.len(), "Service registry built");
        ServiceRegistry {
            methods: self.methods,
        }
    }
}
