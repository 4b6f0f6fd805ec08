//! Container event source backed by the Docker API
//!
//! Containers opt in through labels:
//!
//! - `baker.network`: network whose IP address is used to reach the service
//! - `baker.service.port`: port the service listens on
//! - `baker.service.ping`: path serving the service's routing config
//! - `baker.service.ssl`: `"true"` when the service speaks TLS

use crate::assembler::ContainerConsumer;
use crate::model::{Addr, Container, DiscoveryError};
use bollard::container::ListContainersOptions;
use bollard::models::EventMessage;
use bollard::system::EventsOptions;
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const NETWORK_LABEL: &str = "baker.network";
pub const PORT_LABEL: &str = "baker.service.port";
pub const PING_LABEL: &str = "baker.service.ping";
pub const SSL_LABEL: &str = "baker.service.ssl";

const LABEL_PREFIX: &str = "baker.";

/// Follows Docker container lifecycle and reports it as [`Container`] facts
pub struct DockerWatcher {
    client: Docker,
}

impl DockerWatcher {
    /// Connect to the Docker daemon
    ///
    /// Connection priority:
    /// 1. Explicit docker_host parameter
    /// 2. DOCKER_HOST environment variable
    /// 3. Common socket paths
    pub async fn new(docker_host: Option<&str>) -> anyhow::Result<Self> {
        let client = if let Some(host) = docker_host {
            Self::connect_to_host(host)
                .map_err(|e| anyhow::anyhow!("Failed to connect to Docker at '{}': {}", host, e))?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host).map_err(|e| {
                anyhow::anyhow!("Failed to connect to Docker via DOCKER_HOST='{}': {}", host, e)
            })?
        } else {
            Self::connect_with_defaults().await?
        };

        client
            .ping()
            .await
            .map_err(|e| anyhow::anyhow!("Docker daemon is not responding: {}", e))?;

        debug!("Connected to Docker daemon");
        Ok(Self { client })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if let Some(socket_path) = host.strip_prefix("unix://") {
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION).map_err(|e| {
                anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e)
            })
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker_host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    async fn connect_with_defaults() -> anyhow::Result<Docker> {
        let home = std::env::var("HOME").unwrap_or_default();
        let candidates = [
            "/var/run/docker.sock".to_string(),
            format!("{}/.docker/run/docker.sock", home),
            format!("{}/.colima/default/docker.sock", home),
        ];

        for path in &candidates {
            if path.starts_with('/') && std::path::Path::new(path).exists() {
                if let Ok(client) =
                    Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)
                {
                    if client.ping().await.is_ok() {
                        debug!(path, "Found Docker socket");
                        return Ok(client);
                    }
                }
            }
        }

        Docker::connect_with_socket_defaults()
            .map_err(|e| anyhow::anyhow!("Cannot connect to Docker daemon: {}", e))
    }

    /// Report running containers, then follow start/die events until the
    /// stream ends or `shutdown` fires. `consumer.close` is called once on
    /// the way out.
    pub async fn run(&self, consumer: Arc<dyn ContainerConsumer>, mut shutdown: watch::Receiver<bool>) {
        match self.watch(consumer.as_ref(), &mut shutdown).await {
            Ok(()) => consumer.close(None),
            Err(err) => {
                warn!(error = %err, "Docker event stream failed");
                consumer.close(Some(err));
            }
        }
    }

    async fn watch(
        &self,
        consumer: &dyn ContainerConsumer,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), DiscoveryError> {
        let running = self
            .client
            .list_containers(Some(ListContainersOptions::<String>::default()))
            .await
            .map_err(|e| DiscoveryError::Source(e.to_string()))?;

        info!(count = running.len(), "Found running containers");
        for id in running.into_iter().filter_map(|summary| summary.id) {
            self.publish(consumer, &id, true).await;
        }

        let filters = HashMap::from([
            ("type".to_string(), vec!["container".to_string()]),
            (
                "event".to_string(),
                vec!["start".to_string(), "die".to_string()],
            ),
        ]);
        let mut events = Box::pin(self.client.events(Some(EventsOptions::<String> {
            filters,
            ..Default::default()
        })));

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            tokio::select! {
                _ = shutdown.changed() => {
                    debug!("Docker watcher stopped");
                    return Ok(());
                }
                next = events.next() => match next {
                    Some(Ok(event)) => {
                        if let Some((id, active)) = lifecycle(&event) {
                            self.publish(consumer, &id, active).await;
                        }
                    }
                    Some(Err(e)) => return Err(DiscoveryError::Source(e.to_string())),
                    None => {
                        info!("Docker event stream ended");
                        return Ok(());
                    }
                },
            }
        }
    }

    async fn publish(&self, consumer: &dyn ContainerConsumer, id: &str, active: bool) {
        if !active {
            consumer.container(Container::inactive(id)).await;
            return;
        }

        match self.resolve(id).await {
            Some(container) => consumer.container(container).await,
            None => debug!(container_id = id, "Ignoring container without baker labels"),
        }
    }

    async fn resolve(&self, id: &str) -> Option<Container> {
        let info = match self.client.inspect_container(id, None).await {
            Ok(info) => info,
            Err(e) => {
                warn!(container_id = id, error = %e, "Failed to inspect container");
                return Some(Container::failed(
                    id,
                    DiscoveryError::Inspect(e.to_string()),
                ));
            }
        };

        let labels = info.config.and_then(|c| c.labels).unwrap_or_default();
        let networks: HashMap<String, String> = info
            .network_settings
            .and_then(|n| n.networks)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(name, endpoint)| {
                endpoint
                    .ip_address
                    .filter(|ip| !ip.is_empty())
                    .map(|ip| (name, ip))
            })
            .collect();

        container_from_labels(id, &labels, &networks)
    }
}

/// Build a container from its labels and its network name to IP map.
/// Returns `None` for containers that carry no baker labels at all.
pub fn container_from_labels(
    id: &str,
    labels: &HashMap<String, String>,
    networks: &HashMap<String, String>,
) -> Option<Container> {
    if !labels.keys().any(|k| k.starts_with(LABEL_PREFIX)) {
        return None;
    }

    let label = |name: &str| labels.get(name).map(String::as_str).unwrap_or_default();

    let network = label(NETWORK_LABEL);
    let Some(ip) = networks.get(network) else {
        return Some(Container::failed(
            id,
            DiscoveryError::MissingNetwork(network.to_string()),
        ));
    };

    let port = match label(PORT_LABEL).parse::<u16>() {
        Ok(port) => port,
        Err(e) => {
            return Some(Container::failed(
                id,
                DiscoveryError::InvalidPort {
                    value: label(PORT_LABEL).to_string(),
                    reason: e.to_string(),
                },
            ))
        }
    };

    let secure = label(SSL_LABEL) == "true";
    Some(Container::active(
        id,
        Addr::new(ip.as_str(), port, secure),
        label(PING_LABEL),
    ))
}

/// Container id and new activity state for start/die events
fn lifecycle(event: &EventMessage) -> Option<(String, bool)> {
    let active = match event.action.as_deref()? {
        "start" => true,
        "die" => false,
        _ => return None,
    };
    let id = event.actor.as_ref()?.id.clone()?;
    Some((id, active))
}
