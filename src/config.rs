//! Configuration structures and loading logic

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

/// Main proxy configuration
///
/// Configuration is loaded from a TOML file, with env vars taking precedence
/// where noted.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listen address for the proxy stream server (default: 0.0.0.0:50043)
    /// Override via: FANOUT_PROXY_LISTEN_ADDR
    pub listen_addr: String,

    /// Buffer size of the per-session request channel between the receive
    /// pump and the dispatcher (default: 64)
    pub request_buffer: usize,

    /// Buffer size of the per-session reply channel drained by the send pump.
    /// All target streams of a session share it (default: 128)
    pub reply_buffer: usize,

    /// Buffer size of each target stream's send queue. Payloads that arrive
    /// while the backend call is still opening queue here (default: 16)
    pub per_stream_buffer: usize,

    /// Backend dial timeout in seconds (default: 5)
    pub connect_timeout_secs: u64,

    /// TCP keepalive for backend channels in seconds (default: 60)
    pub tcp_keepalive_secs: u64,

    /// HTTP/2 keepalive ping interval for backend channels in seconds (default: 30)
    pub http2_keepalive_interval_secs: u64,

    /// HTTP/2 keepalive ping timeout in seconds (default: 10)
    pub keepalive_timeout_secs: u64,

    /// Methods the proxy is willing to forward. Each entry becomes a registry
    /// descriptor routed through the gRPC forwarder.
    pub methods: Vec<MethodConfig>,

    /// TLS configuration; when absent the proxy listens in plaintext.
    pub tls: Option<TlsConfig>,
}

/// One forwardable method, as declared in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct MethodConfig {
    /// Fully qualified method name: /Package.Service/Method
    pub name: String,

    /// Full protobuf message name of the request type (e.g. "pkg.v1.FooRequest")
    pub input_type: String,

    /// Full protobuf message name of the response type
    pub output_type: String,

    #[serde(default)]
    pub client_streaming: bool,

    #[serde(default)]
    pub server_streaming: bool,
}

/// mTLS listener configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to the server certificate (PEM)
    pub cert: PathBuf,

    /// Path to the server private key (PEM)
    pub key: PathBuf,

    /// Path to the CA bundle used to verify client certificates (PEM).
    /// When set, clients must present a certificate.
    pub client_ca: Option<PathBuf>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            request_buffer: default_request_buffer(),
            reply_buffer: default_reply_buffer(),
            per_stream_buffer: default_per_stream_buffer(),
            connect_timeout_secs: default_connect_timeout(),
            tcp_keepalive_secs: default_tcp_keepalive(),
            http2_keepalive_interval_secs: default_http2_keepalive_interval(),
            keepalive_timeout_secs: default_keepalive_timeout(),
            methods: Vec::new(),
            tls: None,
        }
    }
}

impl ProxyConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        if let Ok(addr) = std::env::var("FANOUT_PROXY_LISTEN_ADDR") {
            config.listen_addr = addr;
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.listen_addr
            .parse::<std::net::SocketAddr>()
            .with_context(|| format!("Invalid listen_addr '{}'", self.listen_addr))?;

        if self.request_buffer == 0 {
            anyhow::bail!("request_buffer must be greater than zero");
        }
        if self.reply_buffer == 0 {
            anyhow::bail!("reply_buffer must be greater than zero");
        }
        if self.per_stream_buffer == 0 {
            anyhow::bail!("per_stream_buffer must be greater than zero");
        }
        if self.connect_timeout_secs == 0 {
            anyhow::bail!("connect_timeout_secs must be greater than zero");
        }

        let mut names = HashSet::new();
        for method in &self.methods {
            if !method.name.starts_with('/') || method.name.matches('/').count() != 2 {
                anyhow::bail!(
                    "Method name '{}' must have the form /Package.Service/Method",
                    method.name
                );
            }
            if method.input_type.is_empty() || method.output_type.is_empty() {
                anyhow::bail!(
                    "Method '{}' must declare input_type and output_type",
                    method.name
                );
            }
            if !names.insert(method.name.as_str()) {
                anyhow::bail!("Method '{}' is declared twice", method.name);
            }
        }

        if let Some(tls) = &self.tls {
            if tls.cert.as_os_str().is_empty() || tls.key.as_os_str().is_empty() {
                anyhow::bail!("tls.cert and tls.key must both be set");
            }
        }

        Ok(())
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:50043".to_string()
}
fn default_request_buffer() -> usize {
    64
}
fn default_reply_buffer() -> usize {
    128
}
fn default_per_stream_buffer() -> usize {
    16
}
fn default_connect_timeout() -> u64 {
    5
}
fn default_tcp_keepalive() -> u64 {
    60
}
fn default_http2_keepalive_interval() -> u64 {
    30
}
fn default_keepalive_timeout() -> u64 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = ProxyConfig::default();
        config.validate().unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:50043");
        assert_eq!(config.request_buffer, 64);
        assert!(config.methods.is_empty());
        assert!(config.tls.is_none());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
listen_addr = "127.0.0.1:7000"
reply_buffer = 256

[[methods]]
name = "/demo.v1.Echo/Ping"
input_type = "demo.v1.PingRequest"
output_type = "demo.v1.PingResponse"

[[methods]]
name = "/demo.v1.Echo/Chat"
input_type = "demo.v1.ChatRequest"
output_type = "demo.v1.ChatResponse"
client_streaming = true
server_streaming = true
"#
        )
        .unwrap();

        let config = ProxyConfig::load(Some(file.path().to_path_buf())).unwrap();
        config.validate().unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:7000");
        assert_eq!(config.reply_buffer, 256);
        // Unspecified fields keep their defaults
        assert_eq!(config.request_buffer, 64);
        assert_eq!(config.methods.len(), 2);
        assert!(config.methods[1].client_streaming);
        assert!(config.methods[1].server_streaming);
        assert!(!config.methods[0].client_streaming);
    }

    #[test]
    fn test_invalid_listen_addr_rejected() {
        let config = ProxyConfig {
            listen_addr: "not-an-addr".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_buffer_rejected() {
        let config = ProxyConfig {
            reply_buffer: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_method_name_rejected() {
        let config = ProxyConfig {
            methods: vec![MethodConfig {
                name: "demo.v1.Echo/Ping".to_string(),
                input_type: "demo.v1.PingRequest".to_string(),
                output_type: "demo.v1.PingResponse".to_string(),
                client_streaming: false,
                server_streaming: false,
            }],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_method_rejected() {
        let method = MethodConfig {
            name: "/demo.v1.Echo/Ping".to_string(),
            input_type: "demo.v1.PingRequest".to_string(),
            output_type: "demo.v1.PingResponse".to_string(),
            client_streaming: false,
            server_streaming: false,
        };
        let config = ProxyConfig {
            methods: vec![method.clone(), method],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = ProxyConfig {
            listen_addr: "127.0.0.1:9999".to_string(),
            methods: vec![MethodConfig {
                name: "/a.B/C".to_string(),
                input_type: "a.In".to_string(),
                output_type: "a.Out".to_string(),
                client_streaming: true,
                server_streaming: false,
            }],
            ..Default::default()
        };
        let serialized = toml::to_string(&config).unwrap();
        let parsed: ProxyConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.listen_addr, config.listen_addr);
        assert_eq!(parsed.methods, config.methods);
    }
}
