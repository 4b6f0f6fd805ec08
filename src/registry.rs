//! Routing registry
//!
//! Three levels, each behind its own lock: [`Domains`] maps a host to its
//! [`Paths`], which match request paths to a [`Services`] pool of
//! interchangeable backends. Both upper levels keep a reverse index by
//! container id so a service can be removed knowing only its id.
//!
//! Locks are always taken top-down (domains, then paths, then pool) and never
//! held across I/O.

use crate::assembler::ServiceConsumer;
use crate::model::{DiscoveryError, Service};
use crate::trie::Trie;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Internal-consistency failure: the reverse index points at a pool that does
/// not exist. The offending operation is aborted and nothing is mutated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("registry inconsistent: container '{id}' indexed under {level} '{key}' but no pool exists")]
    Inconsistent {
        id: String,
        level: &'static str,
        key: String,
    },
}

/// Why a lookup found nothing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteMiss {
    Host(String),
    Path(String),
    /// A pool matched but had no members
    Empty,
}

/// Round-robin pool of services sharing one domain and path
#[derive(Debug, Default)]
pub struct Services {
    store: RwLock<Vec<Arc<Service>>>,
    cursor: AtomicUsize,
}

impl Services {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a service, replacing the entry with the same container id.
    /// Returns true when the id was not in the pool before.
    pub fn add(&self, service: Arc<Service>) -> bool {
        let mut store = self.store.write();
        match store.iter_mut().find(|s| s.id() == service.id()) {
            Some(existing) => {
                *existing = service;
                false
            }
            None => {
                store.push(service);
                true
            }
        }
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut store = self.store.write();
        match store.iter().position(|s| s.id() == id) {
            Some(pos) => {
                store.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Next service in rotation
    pub fn get(&self) -> Option<Arc<Service>> {
        let store = self.store.read();
        if store.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % store.len();
        Some(store[idx].clone())
    }

    pub fn len(&self) -> usize {
        self.store.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.read().is_empty()
    }
}

#[derive(Debug, Default)]
struct PathsInner {
    store: Trie<Arc<Services>>,
    by_id: HashMap<String, Arc<Service>>,
}

/// Path matching for a single domain
#[derive(Debug, Default)]
pub struct Paths {
    inner: RwLock<PathsInner>,
}

fn route_key(service: &Service) -> &str {
    service
        .config
        .as_ref()
        .map(|c| c.route_path())
        .unwrap_or("/")
}

impl Paths {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or refresh a service under its configured path. A service that
    /// moved to a different path leaves its old pool first.
    pub fn upsert(&self, service: Arc<Service>) -> Result<bool, RegistryError> {
        let mut inner = self.inner.write();
        let key = route_key(&service).to_string();

        let moved_from = inner
            .by_id
            .get(service.id())
            .map(|known| route_key(known).to_string())
            .filter(|old| *old != key);
        if let Some(old) = moved_from {
            inner.detach(service.id(), &old)?;
        }

        let existing = inner.store.get(&key).cloned();
        let pool = match existing {
            Some(pool) => pool,
            None => {
                let pool = Arc::new(Services::new());
                inner.store.insert(&key, pool.clone());
                pool
            }
        };
        pool.add(service.clone());

        let added = inner
            .by_id
            .insert(service.id().to_string(), service)
            .is_none();
        Ok(added)
    }

    /// Remove by container id using the last known path for it
    pub fn remove(&self, id: &str) -> Result<Option<Arc<Service>>, RegistryError> {
        let mut inner = self.inner.write();
        let Some(known) = inner.by_id.get(id).cloned() else {
            return Ok(None);
        };

        inner.detach(id, route_key(&known))?;
        inner.by_id.remove(id);
        Ok(Some(known))
    }

    /// Pool matching a request path
    pub fn resolve(&self, path: &str) -> Option<Arc<Services>> {
        self.inner.read().store.search(path).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().by_id.is_empty()
    }

    pub fn any_service(&self, f: impl Fn(&Service) -> bool) -> bool {
        self.inner.read().by_id.values().any(|s| f(s))
    }
}

impl PathsInner {
    fn detach(&mut self, id: &str, key: &str) -> Result<(), RegistryError> {
        let pool = self
            .store
            .get(key)
            .cloned()
            .ok_or_else(|| RegistryError::Inconsistent {
                id: id.to_string(),
                level: "path",
                key: key.to_string(),
            })?;

        pool.remove(id);
        if pool.is_empty() {
            self.store.remove(key);
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct DomainsInner {
    store: HashMap<String, Arc<Paths>>,
    by_id: HashMap<String, Arc<Service>>,
}

fn domain_key(service: &Service) -> &str {
    service
        .config
        .as_ref()
        .map(|c| c.domain.as_str())
        .unwrap_or_default()
}

/// Top level of the registry: host to paths
#[derive(Debug, Default)]
pub struct Domains {
    inner: RwLock<DomainsInner>,
}

impl Domains {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or refresh a service. A refresh within the same domain only takes
    /// the read lock here; the write lock is reserved for creating or pruning
    /// a domain and for services moving between domains.
    pub fn upsert(&self, service: Arc<Service>) -> Result<bool, RegistryError> {
        {
            let inner = self.inner.read();
            let domain = domain_key(&service);
            let same_domain = inner
                .by_id
                .get(service.id())
                .is_some_and(|known| domain_key(known) == domain);
            if let (true, Some(paths)) = (same_domain, inner.store.get(domain)) {
                paths.upsert(service)?;
                return Ok(false);
            }
        }

        let mut inner = self.inner.write();
        let domain = domain_key(&service).to_string();

        let moved_from = inner
            .by_id
            .get(service.id())
            .map(|known| domain_key(known).to_string())
            .filter(|old| *old != domain);
        if let Some(old) = moved_from {
            inner.detach(service.id(), &old)?;
        }

        let paths = inner.store.entry(domain).or_default().clone();
        let added_here = paths.upsert(service.clone())?;

        let known_before = inner
            .by_id
            .insert(service.id().to_string(), service)
            .is_some();
        Ok(added_here && !known_before)
    }

    pub fn remove(&self, id: &str) -> Result<Option<Arc<Service>>, RegistryError> {
        let mut inner = self.inner.write();
        let Some(known) = inner.by_id.get(id).cloned() else {
            return Ok(None);
        };

        // the path level holds the latest refresh of this service
        let latest = inner.detach(id, domain_key(&known))?;
        inner.by_id.remove(id);
        Ok(Some(latest))
    }

    pub fn paths(&self, domain: &str) -> Option<Arc<Paths>> {
        self.inner.read().store.get(domain).cloned()
    }

    pub fn contains(&self, domain: &str) -> bool {
        self.inner.read().store.contains_key(domain)
    }

    pub fn len(&self) -> usize {
        self.inner.read().store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().store.is_empty()
    }
}

impl DomainsInner {
    fn detach(&mut self, id: &str, domain: &str) -> Result<Arc<Service>, RegistryError> {
        let inconsistent = || RegistryError::Inconsistent {
            id: id.to_string(),
            level: "domain",
            key: domain.to_string(),
        };

        let paths = self.store.get(domain).cloned().ok_or_else(inconsistent)?;
        let removed = paths.remove(id)?.ok_or_else(inconsistent)?;
        if paths.is_empty() {
            self.store.remove(domain);
        }
        Ok(removed)
    }
}

/// The routing table read by the dispatcher and fed by the assembler
#[derive(Debug, Default)]
pub struct Registry {
    domains: Domains,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route a service, or drop its route when it has no usable config.
    /// Returns true when the container id was not routed before.
    pub fn upsert(&self, service: Service) -> Result<bool, RegistryError> {
        if service.routable_config().is_none() {
            return self.remove(&service).map(|_| false);
        }
        self.domains.upsert(Arc::new(service))
    }

    /// Drop a service by container id; its config is not consulted
    pub fn remove(&self, service: &Service) -> Result<Option<Arc<Service>>, RegistryError> {
        self.domains.remove(service.id())
    }

    pub fn lookup(&self, host: &str, path: &str) -> Result<Arc<Service>, RouteMiss> {
        let paths = self
            .domains
            .paths(host)
            .ok_or_else(|| RouteMiss::Host(host.to_string()))?;
        let pool = paths
            .resolve(path)
            .ok_or_else(|| RouteMiss::Path(path.to_string()))?;
        pool.get().ok_or(RouteMiss::Empty)
    }

    pub fn resolve(&self, host: &str, path: &str) -> Option<Arc<Service>> {
        self.lookup(host, path).ok()
    }

    pub fn contains_domain(&self, domain: &str) -> bool {
        self.domains.contains(domain)
    }

    /// Whether some service on `domain` also answers for `www.<domain>`
    pub fn includes_www(&self, domain: &str) -> bool {
        self.domains.paths(domain).is_some_and(|paths| {
            paths.any_service(|s| s.config.as_ref().is_some_and(|c| c.include_www))
        })
    }

    pub fn domain_count(&self) -> usize {
        self.domains.len()
    }
}

impl ServiceConsumer for Registry {
    fn service(&self, service: Service) -> Result<(), RegistryError> {
        let container_id = service.id().to_string();

        if let Some(config) = service.routable_config() {
            let domain = config.domain.clone();
            let path = config.route_path().to_string();
            let ready = config.ready;
            if self.upsert(service)? {
                info!(container_id, domain, path, ready, "Route added");
            } else {
                debug!(container_id, domain, path, ready, "Route refreshed");
            }
            return Ok(());
        }

        if let Some(err) = &service.error {
            debug!(container_id, error = %err, "Dropping route for failed service");
        }
        if let Some(removed) = self.remove(&service)? {
            if let Some(config) = &removed.config {
                info!(
                    container_id,
                    domain = config.domain,
                    path = config.route_path(),
                    "Route removed"
                );
            }
        }
        Ok(())
    }

    fn close(&self, err: Option<DiscoveryError>) {
        match err {
            Some(err) => error!(error = %err, "Service stream closed with error"),
            None => info!("Service stream closed"),
        }
    }
}
