//! Ambient configuration for the secure-session/TCP-engine/cloud-manager core.
//!
//! Every value that would otherwise be a "compile-time constant" is
//! represented here as a `Default` on a `serde`-deserialisable struct, loaded
//! with the `config` crate (TOML source, environment overlay) rather than a
//! Rust `const`, so a deployment can override pool sizes and timeouts
//! without a rebuild while the shipped defaults match the reference values
//! exactly.

use std::path::PathBuf;

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PoolConfig {
    /// Maximum number of in-flight messages (C2).
    pub max_messages: usize,
    /// Maximum PDU payload size, in bytes.
    pub max_pdu: usize,
    /// Maximum bytes of protocol header tolerated before a partial record is dropped.
    pub max_header: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_messages: 256,
            max_pdu: 16384,
            max_header: 64,
        }
    }
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct TcpConfig {
    /// The TCP address:port to listen for inbound CoAP-over-TCP connections.
    pub address: std::net::SocketAddr,
    /// Maximum number of TCP sessions (active + waiting) tracked at once.
    pub max_sessions: usize,
    /// Maximum non-blocking connect retries before a waiting session expires.
    pub connect_retry_max_count: u8,
    /// Seconds between connect retries.
    pub connect_retry_timeout_secs: u64,
    /// Inbound-accept rate limit (connections per second), enforced with a `tower` rate limiter.
    pub accept_rate_limit: u32,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            address: std::net::SocketAddr::new(
                std::net::IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
                5683,
            ),
            max_sessions: 64,
            connect_retry_max_count: 5,
            connect_retry_timeout_secs: 2,
            accept_rate_limit: 32,
        }
    }
}

#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct TlsDebugConfig {
    /// Accept self-signed/unverified peer certificates. Testing only.
    pub accept_self_signed: bool,
}

#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct TlsConfig {
    /// This device's identity certificate chain (leaf first), PEM or DER.
    pub server_cert: Option<PathBuf>,
    /// Private key matching `server_cert`.
    pub server_key: Option<PathBuf>,
    /// Directory of trust-anchor certificates.
    pub ca_bundle: Option<PathBuf>,
    /// Server name used for outbound client handshakes (SNI).
    pub server_name: Option<String>,
    pub debug: TlsDebugConfig,
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SessionConfig {
    /// Maximum number of live TLS/DTLS peers (C5).
    pub max_peers: usize,
    /// Inactivity timeout for DTLS peers, in seconds, before the reaper closes them.
    pub dtls_inactivity_timeout_secs: u64,
    /// Maximum number of devices this runtime manages secure sessions for.
    pub max_devices: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_peers: 64,
            dtls_inactivity_timeout_secs: 60,
            max_devices: 8,
        }
    }
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CloudConfig {
    /// Retry table between sign-up/sign-in/refresh attempts, indexed by `retry_count`.
    pub session_timeout_secs: [u64; 5],
    /// Retry table between publish/ping/find attempts, indexed by `retry_count`.
    pub message_timeout_secs: [u64; 5],
    /// Ceiling on `retry_count`; reaching it moves the device to `Fail`.
    pub max_retry_count: u8,
    /// Maximum number of concurrently tracked cloud contexts.
    pub max_context_size: usize,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            session_timeout_secs: [3, 50, 50, 50, 10],
            message_timeout_secs: [1, 2, 4, 8, 10],
            max_retry_count: 5,
            max_context_size: 2,
        }
    }
}

#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Config {
    pub pool: PoolConfig,
    pub tcp: TcpConfig,
    pub tls: Option<TlsConfig>,
    pub session: SessionConfig,
    pub cloud: CloudConfig,
}

impl Config {
    /// Loads configuration from a TOML file, overlaid with `OCF_` prefixed
    /// environment variables, falling back to defaults for anything absent.
    #[cfg(feature = "serde")]
    pub fn load(path: Option<&std::path::Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        builder = builder.add_source(config::Environment::with_prefix("OCF").separator("__"));
        builder.build()?.try_deserialize()
    }

    /// Non-`serde` fallback: TOML/env deserialisation needs `Deserialize`,
    /// which isn't available without the `serde` feature, so this returns
    /// the shipped defaults with only the handful of `OCF_`-prefixed
    /// environment variables below applied directly. `path` is ignored.
    #[cfg(not(feature = "serde"))]
    pub fn load(_path: Option<&std::path::Path>) -> Result<Self, config::ConfigError> {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("OCF__TCP__ADDRESS") {
            if let Ok(parsed) = v.parse() {
                cfg.tcp.address = parsed;
            }
        }
        if let Ok(v) = std::env::var("OCF__TCP__MAX_SESSIONS") {
            if let Ok(parsed) = v.parse() {
                cfg.tcp.max_sessions = parsed;
            }
        }
        if let Ok(v) = std::env::var("OCF__SESSION__MAX_PEERS") {
            if let Ok(parsed) = v.parse() {
                cfg.session.max_peers = parsed;
            }
        }
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(feature = "serde"))]
    #[test]
    fn load_without_serde_applies_env_overrides_over_defaults() {
        std::env::set_var("OCF__TCP__MAX_SESSIONS", "7");
        let cfg = Config::load(None).unwrap();
        assert_eq!(cfg.tcp.max_sessions, 7);
        assert_eq!(cfg.pool.max_messages, PoolConfig::default().max_messages);
        std::env::remove_var("OCF__TCP__MAX_SESSIONS");
    }
}
