//! Fetching a backend's routing config from its ping endpoint

use crate::model::{Config, DiscoveryError, HttpAddr};
use futures::future::BoxFuture;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Retrieves the [`Config`] a backend publishes at its ping address.
///
/// Implementations apply their own timeout.
pub trait ConfigLoader: Send + Sync {
    fn load<'a>(&'a self, addr: &'a HttpAddr) -> BoxFuture<'a, Result<Config, DiscoveryError>>;
}

impl<F> ConfigLoader for F
where
    F: Fn(&HttpAddr) -> Result<Config, DiscoveryError> + Send + Sync,
{
    fn load<'a>(&'a self, addr: &'a HttpAddr) -> BoxFuture<'a, Result<Config, DiscoveryError>> {
        Box::pin(futures::future::ready(self(addr)))
    }
}

/// Loads configs with a plain `GET` and decodes the JSON body
pub struct HttpConfigLoader {
    client: reqwest::Client,
}

impl HttpConfigLoader {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

impl ConfigLoader for HttpConfigLoader {
    fn load<'a>(&'a self, addr: &'a HttpAddr) -> BoxFuture<'a, Result<Config, DiscoveryError>> {
        Box::pin(async move {
            let url = addr.to_string();
            debug!(url, "Fetching service config");

            let resp = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| DiscoveryError::ConfigFetch(e.to_string()))?;

            let status = resp.status();
            if !status.is_success() {
                return Err(DiscoveryError::ConfigFetch(format!(
                    "{} returned {}",
                    url, status
                )));
            }

            resp.json::<Config>()
                .await
                .map_err(|e| DiscoveryError::ConfigDecode(e.to_string()))
        })
    }
}
