//! Pooled HTTP client for forwarding requests to backends
//!
//! Plain and TLS backends share one pool; the scheme of the outbound URI
//! picks the transport.

use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::debug;

/// Error type for upstream requests
#[derive(Debug)]
pub enum UpstreamError {
    /// Error from the HTTP client (connect, TLS, protocol)
    Client(hyper_util::client::legacy::Error),
}

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamError::Client(e) => write!(f, "upstream request failed: {}", e),
        }
    }
}

impl std::error::Error for UpstreamError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            UpstreamError::Client(e) => Some(e),
        }
    }
}

impl From<hyper_util::client::legacy::Error> for UpstreamError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        UpstreamError::Client(err)
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

pub struct Upstream {
    client: Client<HttpsConnector<HttpConnector>, Incoming>,
    config: UpstreamConfig,
}

impl Upstream {
    pub fn new(config: UpstreamConfig) -> anyhow::Result<Self> {
        let mut http = HttpConnector::new();
        http.set_nodelay(true);
        // https URIs are handed to the TLS layer
        http.enforce_http(false);

        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_provider_and_webpki_roots(rustls::crypto::ring::default_provider())?
            .https_or_http()
            .enable_http1()
            .wrap_connector(http);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Upstream client initialized"
        );

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    /// Send an already-directed request; its URI must be absolute
    pub async fn send(&self, req: Request<Incoming>) -> Result<Response<Incoming>, UpstreamError> {
        Ok(self.client.request(req).await?)
    }
}
