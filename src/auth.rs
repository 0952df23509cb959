//! Peer identity extraction and the per-call authorization hook
//!
//! TLS termination itself lives in the tonic transport; this module only
//! turns the presented client certificate into a [`PeerIdentity`] and defines
//! the [`Authorizer`] consulted once per StartStream. A denial becomes a
//! PERMISSION_DENIED StartStreamReply and no target stream is created.

use async_trait::async_trait;
use tonic::Status;
use x509_parser::prelude::*;

use crate::proto::Target;
use crate::registry::MethodDescriptor;

/// Identity of the connected proxy client, as asserted by its certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerIdentity {
    /// Subject common name, when present.
    pub common_name: Option<String>,

    /// DNS names from the subject alternative name extension.
    pub dns_names: Vec<String>,
}

impl PeerIdentity {
    /// Parse an identity out of a DER-encoded client certificate.
    pub fn from_der(der: &[u8]) -> Result<Self, Status> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| Status::unauthenticated(format!("Invalid client certificate: {}", e)))?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(String::from);

        let dns_names = cert
            .subject_alternative_name()
            .ok()
            .flatten()
            .map(|san| {
                san.value
                    .general_names
                    .iter()
                    .filter_map(|name| match name {
                        GeneralName::DNSName(dns) => Some((*dns).to_string()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            common_name,
            dns_names,
        })
    }

    /// Extract the identity from the first certificate the transport saw,
    /// if the connection is mTLS.
    pub fn from_request<T>(request: &tonic::Request<T>) -> Option<Self> {
        let certs = request.peer_certs()?;
        let first = certs.first()?;
        match Self::from_der(first.as_ref()) {
            Ok(identity) => Some(identity),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to parse peer certificate");
                None
            }
        }
    }
}

/// Per-call authorization verdict, consulted by the stream set before a
/// target stream is created.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Return `Ok(())` to allow opening a stream for `method` against
    /// `target`, or a PERMISSION_DENIED status to refuse it.
    async fn authorize(
        &self,
        peer: Option<&PeerIdentity>,
        target: &Target,
        method: &MethodDescriptor,
    ) -> Result<(), Status>;
}

/// Authorizer that allows every call. The default for deployments that put
/// their policy elsewhere.
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn authorize(
        &self,
        _peer: Option<&PeerIdentity>,
        _target: &Target,
        _method: &MethodDescriptor,
    ) -> Result<(), Status> {
        Ok(())
    }
}
