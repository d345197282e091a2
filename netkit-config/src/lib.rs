use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Top-level netkit configuration loaded from YAML.
///
/// Groups the per-subsystem configuration blocks. Every block is optional in
/// the YAML source; omitted blocks fall back to their defaults so programs can
/// configure only the components they actually start.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetConfig {
    /// Session manager configuration shared by all session-oriented servers
    #[serde(default)]
    pub sessions: SessionConfig,
    /// Reliable-UDP layer configuration
    #[serde(default)]
    pub reliability: ReliabilityConfig,
    /// QUIC client configuration (optional)
    #[serde(default)]
    pub quic_client: Option<QuicClientConfig>,
    /// QUIC server configuration (optional)
    #[serde(default)]
    pub quic_server: Option<QuicServerConfig>,
    /// Timeout settings for connection-level operations
    #[serde(default)]
    pub timeouts: Timeouts,
    /// Prometheus metrics endpoint configuration
    #[serde(default)]
    pub metrics: Metrics,
}

impl NetConfig {
    /// Loads configuration from a YAML file.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the YAML configuration file
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use netkit_config::NetConfig;
    /// use std::path::Path;
    ///
    /// let config = NetConfig::from_file(Path::new("netkit.yaml")).unwrap();
    /// ```
    pub fn from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = fs::read_to_string(path)?;
        let config = serde_yaml_ng::from_str(&contents)?;
        Ok(config)
    }

    /// Parses configuration from a YAML string.
    ///
    /// Primarily used for testing and programmatic configuration.
    ///
    /// # Examples
    ///
    /// ```
    /// use netkit_config::NetConfig;
    ///
    /// let yaml = r#"
    /// sessions:
    ///   max_sessions: 100
    /// reliability:
    ///   congestion_window: 16
    /// "#;
    ///
    /// let config = NetConfig::parse(yaml).unwrap();
    /// assert_eq!(config.sessions.max_sessions, 100);
    /// assert_eq!(config.reliability.congestion_window, 16);
    /// ```
    pub fn parse(contents: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let config = serde_yaml_ng::from_str(contents)?;
        Ok(config)
    }
}

/// Session manager configuration.
///
/// Governs admission, idle cleanup, and backpressure for every
/// session-oriented server (TCP, WebSocket, HTTP, QUIC).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Maximum number of concurrently registered sessions (default: 10000)
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Idle timeout in milliseconds before a session is eligible for cleanup (default: 5 minutes)
    #[serde(default = "default_session_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Interval in milliseconds between idle-cleanup sweeps (default: 30 seconds)
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
    /// Whether the backpressure signal is computed (default: true)
    #[serde(default = "default_true")]
    pub enable_backpressure: bool,
    /// Fraction of `max_sessions` at which backpressure activates (default: 0.8)
    #[serde(default = "default_backpressure_threshold")]
    pub backpressure_threshold: f64,
}

fn default_max_sessions() -> usize {
    10_000
}

fn default_session_idle_timeout_ms() -> u64 {
    300_000
}

fn default_cleanup_interval_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

fn default_backpressure_threshold() -> f64 {
    0.8
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            idle_timeout_ms: default_session_idle_timeout_ms(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
            enable_backpressure: default_true(),
            backpressure_threshold: default_backpressure_threshold(),
        }
    }
}

/// Reliable-UDP layer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReliabilityConfig {
    /// Upper bound on unacknowledged in-flight packets (default: 32)
    #[serde(default = "default_congestion_window")]
    pub congestion_window: usize,
    /// Retransmission attempts before a packet is dropped (default: 5)
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    /// Retransmission timeout in milliseconds (default: 200)
    #[serde(default = "default_retransmission_timeout_ms")]
    pub retransmission_timeout_ms: u64,
    /// Maximum out-of-order packets buffered per peer before the newest
    /// arrival is dropped (default: 1024)
    #[serde(default = "default_reorder_buffer_limit")]
    pub reorder_buffer_limit: usize,
}

fn default_congestion_window() -> usize {
    32
}

fn default_max_retries() -> usize {
    5
}

fn default_retransmission_timeout_ms() -> u64 {
    200
}

fn default_reorder_buffer_limit() -> usize {
    1024
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            congestion_window: default_congestion_window(),
            max_retries: default_max_retries(),
            retransmission_timeout_ms: default_retransmission_timeout_ms(),
            reorder_buffer_limit: default_reorder_buffer_limit(),
        }
    }
}

/// QUIC client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuicClientConfig {
    /// Path to a CA certificate file for server verification (PEM)
    #[serde(default)]
    pub ca_cert_file: Option<String>,
    /// Path to a client certificate file for mutual TLS (PEM)
    #[serde(default)]
    pub client_cert_file: Option<String>,
    /// Path to the client private key file for mutual TLS (PEM)
    #[serde(default)]
    pub client_key_file: Option<String>,
    /// Whether to verify the server certificate (default: true)
    #[serde(default = "default_true")]
    pub verify_server: bool,
    /// ALPN protocols to negotiate, in preference order (e.g. ["h3"])
    #[serde(default)]
    pub alpn_protocols: Vec<String>,
    /// Maximum idle timeout in milliseconds (default: 30 seconds)
    #[serde(default = "default_idle_timeout_ms")]
    pub max_idle_timeout_ms: u64,
    /// Initial connection-level flow control credit in bytes (default: 1 MiB)
    #[serde(default = "default_initial_max_data")]
    pub initial_max_data: u64,
    /// Initial per-stream flow control credit in bytes (default: 64 KiB)
    #[serde(default = "default_initial_max_stream_data")]
    pub initial_max_stream_data: u64,
    /// Initial bidirectional stream credit (default: 100)
    #[serde(default = "default_initial_max_streams")]
    pub initial_max_streams_bidi: u64,
    /// Initial unidirectional stream credit (default: 100)
    #[serde(default = "default_initial_max_streams")]
    pub initial_max_streams_uni: u64,
    /// Enable 0-RTT early data (default: false)
    #[serde(default)]
    pub enable_early_data: bool,
    /// Opaque resumption opt-in; `Some` resumes with retained TLS state
    #[serde(default)]
    pub session_ticket: Option<Vec<u8>>,
    /// Upper bound on early data sent before handshake completion (default: 16 KiB)
    #[serde(default = "default_max_early_data")]
    pub max_early_data_size: u32,
}

fn default_idle_timeout_ms() -> u64 {
    30_000
}

fn default_initial_max_data() -> u64 {
    1_048_576
}

fn default_initial_max_stream_data() -> u64 {
    65_536
}

fn default_initial_max_streams() -> u64 {
    100
}

fn default_max_early_data() -> u32 {
    16_384
}

impl Default for QuicClientConfig {
    fn default() -> Self {
        Self {
            ca_cert_file: None,
            client_cert_file: None,
            client_key_file: None,
            verify_server: true,
            alpn_protocols: Vec::new(),
            max_idle_timeout_ms: default_idle_timeout_ms(),
            initial_max_data: default_initial_max_data(),
            initial_max_stream_data: default_initial_max_stream_data(),
            initial_max_streams_bidi: default_initial_max_streams(),
            initial_max_streams_uni: default_initial_max_streams(),
            enable_early_data: false,
            session_ticket: None,
            max_early_data_size: default_max_early_data(),
        }
    }
}

/// QUIC server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuicServerConfig {
    /// Path to the server certificate file (PEM, required)
    pub cert_file: String,
    /// Path to the server private key file (PEM, required)
    pub key_file: String,
    /// Path to a CA certificate file for client verification (optional)
    #[serde(default)]
    pub ca_cert_file: Option<String>,
    /// Whether a client certificate is required (mutual TLS; default: false)
    #[serde(default)]
    pub require_client_cert: bool,
    /// ALPN protocols accepted by the server
    #[serde(default)]
    pub alpn_protocols: Vec<String>,
    /// Maximum idle timeout in milliseconds (default: 30 seconds)
    #[serde(default = "default_idle_timeout_ms")]
    pub max_idle_timeout_ms: u64,
    /// Initial connection-level flow control credit in bytes (default: 1 MiB)
    #[serde(default = "default_initial_max_data")]
    pub initial_max_data: u64,
    /// Initial per-stream flow control credit in bytes (default: 64 KiB)
    #[serde(default = "default_initial_max_stream_data")]
    pub initial_max_stream_data: u64,
    /// Initial bidirectional stream credit (default: 100)
    #[serde(default = "default_initial_max_streams")]
    pub initial_max_streams_bidi: u64,
    /// Initial unidirectional stream credit (default: 100)
    #[serde(default = "default_initial_max_streams")]
    pub initial_max_streams_uni: u64,
    /// Maximum concurrent connections (default: 10000)
    #[serde(default = "default_max_sessions")]
    pub max_connections: usize,
    /// Enable stateless Retry for address validation (default: true)
    #[serde(default = "default_true")]
    pub enable_retry: bool,
    /// Retry-token key; a fresh key is generated per server start when empty
    #[serde(default)]
    pub retry_key: Vec<u8>,
}

/// Timeout settings for connection-level operations (milliseconds).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeouts {
    /// Maximum time to establish an outbound connection (default: 10 s)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_ms: u64,
    /// Idle timeout for established connections (default: 30 s)
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_ms: u64,
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect_ms: default_connect_timeout_ms(),
            idle_ms: default_idle_timeout_ms(),
        }
    }
}

/// Prometheus metrics endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metrics {
    /// Whether metric collection is enabled
    #[serde(default)]
    pub enabled: bool,
    /// Address to bind the metrics HTTP endpoint (e.g. "127.0.0.1:9000")
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

fn default_metrics_address() -> String {
    "127.0.0.1:9000".to_string()
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = NetConfig::default();
        assert_eq!(config.sessions.max_sessions, 10_000);
        assert_eq!(config.sessions.idle_timeout_ms, 300_000);
        assert!((config.sessions.backpressure_threshold - 0.8).abs() < f64::EPSILON);
        assert_eq!(config.reliability.congestion_window, 32);
        assert_eq!(config.reliability.max_retries, 5);
        assert_eq!(config.reliability.retransmission_timeout_ms, 200);
        assert_eq!(config.timeouts.idle_ms, 30_000);
    }

    #[test]
    fn parse_partial_yaml() {
        let config = NetConfig::parse(
            r#"
sessions:
  max_sessions: 2
  idle_timeout_ms: 1000
reliability:
  max_retries: 3
"#,
        )
        .unwrap();
        assert_eq!(config.sessions.max_sessions, 2);
        assert_eq!(config.sessions.idle_timeout_ms, 1000);
        assert_eq!(config.reliability.max_retries, 3);
        // Untouched fields keep defaults
        assert_eq!(config.reliability.congestion_window, 32);
        assert!(config.quic_client.is_none());
    }

    #[test]
    fn parse_quic_server_block() {
        let config = NetConfig::parse(
            r#"
quic_server:
  cert_file: "server.pem"
  key_file: "server.key"
  alpn_protocols: ["h3", "hq-interop"]
  max_connections: 50
"#,
        )
        .unwrap();
        let quic = config.quic_server.unwrap();
        assert_eq!(quic.cert_file, "server.pem");
        assert_eq!(quic.alpn_protocols, vec!["h3", "hq-interop"]);
        assert_eq!(quic.max_connections, 50);
        assert!(quic.enable_retry);
        assert!(quic.retry_key.is_empty());
    }

    #[test]
    fn quic_client_defaults() {
        let config = QuicClientConfig::default();
        assert!(config.verify_server);
        assert_eq!(config.max_idle_timeout_ms, 30_000);
        assert_eq!(config.initial_max_data, 1_048_576);
        assert_eq!(config.initial_max_stream_data, 65_536);
        assert_eq!(config.initial_max_streams_bidi, 100);
        assert!(!config.enable_early_data);
    }
}
