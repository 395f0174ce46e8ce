//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the runtime.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration for the service runtime.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Service identity announced to the registry.
    pub service: ServiceConfig,

    /// Listener configuration (bind target, TLS, demultiplexing).
    pub listener: ListenerConfig,

    /// Shutdown behaviour.
    pub shutdown: ShutdownConfig,

    /// Registry announcement settings.
    pub registration: RegistrationConfig,

    /// HTTP gateway mounting.
    pub gateway: GatewayConfig,

    /// gRPC-Web bridge.
    pub web: WebConfig,

    /// Built-in services.
    pub features: FeatureConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Service identity.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Registered service name.
    pub name: String,

    /// Registered service version.
    pub version: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "rpc-runtime".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind target: `host:port` (empty host = all interfaces, port 0 =
    /// ephemeral) or `unix://path`.
    pub address: String,

    /// Optional TLS certificate files.
    pub tls: Option<TlsConfig>,

    /// Generate a self-signed certificate when no TLS files are given.
    pub secure: bool,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,

    /// Protocol demultiplexing.
    pub demux: DemuxConfig,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:0".to_string(),
            tls: None,
            secure: false,
            max_connections: 10_000,
            demux: DemuxConfig::default(),
        }
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

/// Demultiplexer configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DemuxConfig {
    /// Split RPC and HTTP connections by their first bytes. When false, one
    /// handler serves both and dispatches per request on `content-type`.
    pub enabled: bool,

    /// How long a new connection may take to identify itself (milliseconds).
    pub read_timeout_ms: u64,
}

impl Default for DemuxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            read_timeout_ms: 5_000,
        }
    }
}

impl DemuxConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Shutdown configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Graceful drain deadline in milliseconds; in-flight calls are
    /// terminated once it expires.
    pub drain_timeout_ms: u64,

    /// Listen for SIGINT/SIGTERM/SIGQUIT when no signal source is injected.
    pub handle_signals: bool,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_ms: 5_000,
            handle_signals: true,
        }
    }
}

impl ShutdownConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Registry announcement configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RegistrationConfig {
    /// Lease announced with each registration, in seconds.
    pub ttl_secs: u64,

    /// Announcement attempts before startup fails.
    pub max_attempts: u32,

    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 90,
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 2_000,
        }
    }
}

impl RegistrationConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Gateway configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Path prefix the gateway router is nested under ("" = root).
    pub prefix: String,
}

/// gRPC-Web bridge configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct WebConfig {
    /// Mount registered methods on the HTTP server for gRPC-Web clients.
    pub enabled: bool,

    /// Path prefix for bridged methods ("" = root).
    pub prefix: String,
}

/// Built-in service toggles.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Register `grpc.health.v1.Health`.
    pub health: bool,

    /// Expose `GET /_rpc/services` on the HTTP server.
    pub reflection: bool,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            health: true,
            reflection: false,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
