use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener and TLS configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Container discovery and config polling
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Outbound connections to backends
    #[serde(default)]
    pub upstream: UpstreamSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// HTTP port (default: 80, set to 0 to disable)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// HTTPS port, used when TLS is enabled (default: 443, set to 0 to disable)
    #[serde(default = "default_tls_port")]
    pub tls_port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Enable TLS (default: false). If true without cert/key, generates self-signed.
    #[serde(default)]
    pub tls: bool,

    /// Path to TLS certificate file (PEM format)
    pub tls_cert: Option<String>,

    /// Path to TLS private key file (PEM format)
    pub tls_key: Option<String>,

    /// Force redirect from HTTP to HTTPS (default: false, implied by ACME)
    #[serde(default)]
    pub force_https: bool,

    /// Tick on which streamed response bodies are flushed
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,

    /// ACME/Let's Encrypt configuration
    #[serde(default)]
    pub acme: AcmeConfig,
}

impl ServerConfig {
    pub fn tls_enabled(&self) -> bool {
        self.acme.enabled || self.tls || self.has_tls_files()
    }

    pub fn has_tls_files(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }

    /// Get HTTPS port (0 means disabled)
    pub fn https_port(&self) -> u16 {
        if !self.tls_enabled() {
            return 0;
        }
        self.tls_port
    }

    /// Whether the HTTP listener redirects to HTTPS
    pub fn redirects_to_https(&self) -> bool {
        self.https_port() != 0 && (self.force_https || self.acme.enabled)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            tls_port: default_tls_port(),
            bind: default_bind_address(),
            tls: false,
            tls_cert: None,
            tls_key: None,
            force_https: false,
            flush_interval_ms: default_flush_interval(),
            acme: AcmeConfig::default(),
        }
    }
}

/// Challenge type for ACME domain validation
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub enum AcmeChallengeType {
    /// HTTP-01: Serves challenge response on port 80 at /.well-known/acme-challenge/
    #[default]
    #[serde(alias = "http01", alias = "HTTP-01")]
    #[serde(rename = "http-01")]
    Http01,
    /// TLS-ALPN-01: Serves challenge via TLS on port 443 with special ALPN protocol
    #[serde(alias = "tls-alpn01", alias = "TLS-ALPN-01")]
    #[serde(rename = "tls-alpn-01")]
    TlsAlpn01,
}

/// ACME configuration. Certificates are requested per host on first
/// handshake, for hosts that currently have a route.
#[derive(Debug, Deserialize, Clone)]
pub struct AcmeConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Contact email for Let's Encrypt notifications (required when enabled)
    pub email: Option<String>,

    /// ACME directory URL (defaults to Let's Encrypt production)
    /// Use "https://acme-staging-v02.api.letsencrypt.org/directory" for testing
    pub directory_url: Option<String>,

    /// Local directory for certificate and account cache
    #[serde(default = "default_acme_cache_dir")]
    pub cache_dir: String,

    #[serde(default)]
    pub challenge_type: AcmeChallengeType,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            email: None,
            directory_url: None,
            cache_dir: default_acme_cache_dir(),
            challenge_type: AcmeChallengeType::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DiscoveryConfig {
    /// Docker endpoint (default: DOCKER_HOST, then common socket paths)
    pub docker_host: Option<String>,

    /// Seconds between config refreshes of each known container
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Timeout for one config fetch in milliseconds
    #[serde(default = "default_config_timeout")]
    pub config_timeout_ms: u64,

    /// Capacity of the assembler's work queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl DiscoveryConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn config_timeout(&self) -> Duration {
        Duration::from_millis(self.config_timeout_ms)
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            docker_host: None,
            ping_interval_secs: default_ping_interval(),
            config_timeout_ms: default_config_timeout(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamSettings {
    /// Maximum idle connections per backend host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Max time to wait for a backend response, in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl UpstreamSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_listen_port() -> u16 {
    80
}

fn default_tls_port() -> u16 {
    443
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_flush_interval() -> u64 {
    10
}

fn default_acme_cache_dir() -> String {
    "./acme_cache".to_string()
}

fn default_ping_interval() -> u64 {
    10
}

fn default_config_timeout() -> u64 {
    2000
}

fn default_queue_capacity() -> usize {
    10
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_request_timeout() -> u64 {
    30
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.acme.enabled && self.server.acme.email.is_none() {
            errors.push("server.acme.email is required when ACME is enabled".to_string());
        }
        if self.server.tls_cert.is_some() != self.server.tls_key.is_some() {
            errors.push("server.tls_cert and server.tls_key must be set together".to_string());
        }
        if self.server.flush_interval_ms == 0 {
            errors.push("server.flush_interval_ms must be greater than 0".to_string());
        }
        if self.discovery.ping_interval_secs == 0 {
            errors.push("discovery.ping_interval_secs must be greater than 0".to_string());
        }
        if self.discovery.queue_capacity == 0 {
            errors.push("discovery.queue_capacity must be greater than 0".to_string());
        }
        if self.upstream.request_timeout_secs == 0 {
            errors.push("upstream.request_timeout_secs must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
