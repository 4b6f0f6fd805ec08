//! Core data model shared by discovery, the registry and the dispatcher

use crate::rule::Rules;
use serde::Deserialize;
use std::fmt;

/// Network location of a backend
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Addr {
    host: String,
    port: u16,
    secure: bool,
}

impl Addr {
    pub fn new(host: impl Into<String>, port: u16, secure: bool) -> Self {
        Self {
            host: host.into(),
            port,
            secure,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether the backend expects TLS
    pub fn secure(&self) -> bool {
        self.secure
    }

    pub fn scheme(&self) -> &'static str {
        if self.secure {
            "https"
        } else {
            "http"
        }
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// An [`Addr`] plus a request path, rendered as a full URL
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpAddr {
    addr: Addr,
    path: String,
}

impl HttpAddr {
    pub fn new(addr: Addr, path: impl Into<String>) -> Self {
        Self {
            addr,
            path: path.into(),
        }
    }

    pub fn addr(&self) -> &Addr {
        &self.addr
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn with_path(&self, path: impl Into<String>) -> Self {
        Self::new(self.addr.clone(), path)
    }
}

impl fmt::Display for HttpAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.addr.scheme(), self.addr)?;
        if !self.path.starts_with('/') {
            f.write_str("/")?;
        }
        f.write_str(&self.path)
    }
}

/// Failures recorded while discovering a container or fetching its config.
///
/// These never cross the pipeline as hard errors; they ride along on the
/// [`Container`] or [`Service`] they belong to.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiscoveryError {
    #[error("failed to inspect container: {0}")]
    Inspect(String),
    #[error("network '{0}' is not attached to the container")]
    MissingNetwork(String),
    #[error("invalid service port '{value}': {reason}")]
    InvalidPort { value: String, reason: String },
    #[error("config fetch failed: {0}")]
    ConfigFetch(String),
    #[error("invalid config document: {0}")]
    ConfigDecode(String),
    #[error("container source failed: {0}")]
    Source(String),
}

/// One backend process as reported by the container event source
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Container {
    pub id: String,
    pub active: bool,
    pub addr: Addr,
    pub ping_addr: HttpAddr,
    pub error: Option<DiscoveryError>,
}

impl Container {
    /// A running container whose config lives at `ping_path` on `addr`
    pub fn active(id: impl Into<String>, addr: Addr, ping_path: impl Into<String>) -> Self {
        let ping_addr = HttpAddr::new(addr.clone(), ping_path);
        Self {
            id: id.into(),
            active: true,
            addr,
            ping_addr,
            error: None,
        }
    }

    /// A container that stopped; only the id is meaningful
    pub fn inactive(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// A running container that could not be resolved to an address
    pub fn failed(id: impl Into<String>, error: DiscoveryError) -> Self {
        Self {
            id: id.into(),
            active: true,
            error: Some(error),
            ..Default::default()
        }
    }
}

/// Routing intent declared by a backend through its ping endpoint
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub ready: bool,
    #[serde(default, alias = "includeWWW")]
    pub include_www: bool,
    #[serde(default)]
    pub rules: Rules,
}

impl Config {
    /// Path key used in the registry; empty means root
    pub fn route_path(&self) -> &str {
        if self.path.is_empty() {
            "/"
        } else {
            &self.path
        }
    }

    /// Whether this config may appear in the registry at all
    pub fn is_routable(&self) -> bool {
        !self.domain.is_empty()
    }
}

/// A container paired with its config, or with the reason there is none
#[derive(Debug, Clone, PartialEq)]
pub struct Service {
    pub container: Container,
    pub config: Option<Config>,
    pub error: Option<DiscoveryError>,
}

impl Service {
    pub fn configured(container: Container, config: Config) -> Self {
        Self {
            container,
            config: Some(config),
            error: None,
        }
    }

    pub fn failed(container: Container, error: DiscoveryError) -> Self {
        Self {
            container,
            config: None,
            error: Some(error),
        }
    }

    /// Removal notice for a container that is gone
    pub fn removed(container: Container) -> Self {
        Self {
            container,
            config: None,
            error: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.container.id
    }

    /// The config, only when it names a domain
    pub fn routable_config(&self) -> Option<&Config> {
        self.config.as_ref().filter(|c| c.is_routable())
    }
}
