//! Service assembly pipeline
//!
//! Container facts come in through [`ContainerConsumer`]. The assembler keeps
//! the set of active containers, queues every one of them for a config
//! refresh on each tick, and hands the resulting [`Service`] values to a
//! [`ServiceConsumer`] (normally the registry) in the order they were built.

use crate::loader::ConfigLoader;
use crate::model::{Container, DiscoveryError, Service};
use crate::registry::RegistryError;
use anyhow::{Context, Result};
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, warn, Instrument};

pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

/// Receives container lifecycle facts from an event source
pub trait ContainerConsumer: Send + Sync {
    fn container(&self, container: Container) -> BoxFuture<'_, ()>;

    /// The source has finished; called once
    fn close(&self, err: Option<DiscoveryError>);
}

/// Receives assembled services
pub trait ServiceConsumer: Send + Sync {
    fn service(&self, service: Service) -> Result<(), RegistryError>;

    /// The assembler has stopped; called once
    fn close(&self, err: Option<DiscoveryError>);
}

/// Resolves once `rx` reads true. A dropped sender never resolves.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

pub struct ServiceAssembler {
    loader: Arc<dyn ConfigLoader>,
    ping_interval: Duration,
    table: RwLock<HashMap<String, Container>>,
    queue_tx: mpsc::Sender<Container>,
    queue_rx: Mutex<Option<mpsc::Receiver<Container>>>,
    stop_tx: watch::Sender<bool>,
    close_error: Mutex<Option<DiscoveryError>>,
}

impl ServiceAssembler {
    pub fn new(loader: Arc<dyn ConfigLoader>, ping_interval: Duration, queue_capacity: usize) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(queue_capacity.max(1));
        let (stop_tx, _) = watch::channel(false);

        Self {
            loader,
            ping_interval,
            table: RwLock::new(HashMap::new()),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            stop_tx,
            close_error: Mutex::new(None),
        }
    }

    /// Number of active containers being tracked
    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.table.read().contains_key(id)
    }

    /// Ask the pipeline to stop; pending queue items are discarded
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    fn forget(&self, id: &str) -> bool {
        self.table.write().remove(id).is_some()
    }

    /// Insert a new container; a known id only has its error refreshed
    fn record(&self, container: Container) {
        let mut table = self.table.write();
        match table.get_mut(&container.id) {
            Some(existing) => existing.error = container.error,
            None => {
                table.insert(container.id.clone(), container);
            }
        }
    }

    /// Run the pipeline until stopped, feeding `consumer`. Can only be
    /// started once.
    pub async fn run(
        self: Arc<Self>,
        consumer: Arc<dyn ServiceConsumer>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut queue = self
            .queue_rx
            .lock()
            .take()
            .context("service assembler is already running")?;

        let forward = {
            let this = self.clone();
            tokio::spawn(async move {
                cancelled(&mut shutdown).await;
                this.stop();
            })
        };
        let ticker = tokio::spawn(
            self.clone()
                .tick_loop()
                .instrument(info_span!("ticker", interval_ms = self.ping_interval.as_millis() as u64)),
        );

        info!("Service assembler started");
        let mut stop = self.stop_tx.subscribe();
        loop {
            tokio::select! {
                biased;
                _ = cancelled(&mut stop) => {
                    queue.close();
                    let mut skipped = 0usize;
                    while queue.try_recv().is_ok() {
                        skipped += 1;
                    }
                    debug!(skipped, "Refresh queue closed");
                    break;
                }
                next = queue.recv() => match next {
                    Some(container) => self.assemble(container, consumer.as_ref()).await,
                    None => break,
                },
            }
        }

        ticker.abort();
        forward.abort();

        let err = self.close_error.lock().take();
        info!("Service assembler stopped");
        consumer.close(err);
        Ok(())
    }

    async fn tick_loop(self: Arc<Self>) {
        let mut stop = self.stop_tx.subscribe();
        let mut interval = tokio::time::interval(self.ping_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = cancelled(&mut stop) => return,
            }

            let snapshot: Vec<Container> = self.table.read().values().cloned().collect();
            for container in snapshot {
                tokio::select! {
                    sent = self.queue_tx.send(container) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                    _ = cancelled(&mut stop) => return,
                }
            }
        }
    }

    async fn assemble(&self, container: Container, consumer: &dyn ServiceConsumer) {
        let container_id = container.id.clone();

        let service = if !container.active {
            Service::removed(container)
        } else if let Some(err) = container.error.clone() {
            warn!(container_id, error = %err, "Container could not be resolved");
            Service::failed(container, err)
        } else {
            match self.loader.load(&container.ping_addr).await {
                Ok(config) => Service::configured(container, config),
                Err(err) => {
                    warn!(container_id, error = %err, "Failed to load service config");
                    Service::failed(container, err)
                }
            }
        };

        // the container may have stopped while its config was being fetched
        if service.container.active && !self.contains(&container_id) {
            debug!(container_id, "Container gone, dropping refresh");
            return;
        }

        if let Err(err) = consumer.service(service) {
            error!(container_id, error = %err, "Service rejected by consumer");
        }
    }
}

impl ContainerConsumer for ServiceAssembler {
    fn container(&self, container: Container) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if container.active {
                debug!(container_id = container.id, "Container active");
                self.record(container);
                return;
            }

            if !self.forget(&container.id) {
                return;
            }
            debug!(container_id = container.id, "Container inactive");

            let mut stop = self.stop_tx.subscribe();
            tokio::select! {
                sent = self.queue_tx.send(container) => {
                    if let Err(mpsc::error::SendError(container)) = sent {
                        debug!(container_id = container.id, "Queue closed, removal dropped");
                    }
                }
                _ = cancelled(&mut stop) => {}
            }
        })
    }

    fn close(&self, err: Option<DiscoveryError>) {
        if let Some(err) = &err {
            warn!(error = %err, "Container source closed with error");
        }
        *self.close_error.lock() = err;
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Addr, Config, HttpAddr};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        services: Mutex<Vec<Service>>,
        closed: Mutex<Option<Option<DiscoveryError>>>,
    }

    impl ServiceConsumer for Recorder {
        fn service(&self, service: Service) -> Result<(), RegistryError> {
            self.services.lock().push(service);
            Ok(())
        }

        fn close(&self, err: Option<DiscoveryError>) {
            *self.closed.lock() = Some(err);
        }
    }

    fn domain_loader(addr: &HttpAddr) -> Result<Config, DiscoveryError> {
        Ok(Config {
            domain: format!("{}.test", addr.addr().port()),
            ready: true,
            ..Default::default()
        })
    }

    fn container(id: &str, port: u16) -> Container {
        Container::active(id, Addr::new("10.0.0.2", port, false), "/config")
    }

    fn assembler(loader: Arc<dyn ConfigLoader>) -> Arc<ServiceAssembler> {
        Arc::new(ServiceAssembler::new(loader, Duration::from_millis(20), 10))
    }

    #[tokio::test]
    async fn test_known_container_only_refreshes_error() {
        let assembler = assembler(Arc::new(domain_loader));
        assembler.container(container("c1", 8000)).await;

        let mut update = container("c1", 9000);
        update.error = Some(DiscoveryError::MissingNetwork("web".into()));
        assembler.container(update).await;

        let table = assembler.table.read();
        let entry = table.get("c1").unwrap();
        assert_eq!(entry.addr.port(), 8000);
        assert_eq!(entry.error, Some(DiscoveryError::MissingNetwork("web".into())));
    }

    #[tokio::test]
    async fn test_inactive_unknown_container_is_ignored() {
        let assembler = assembler(Arc::new(domain_loader));
        assembler.container(Container::inactive("nope")).await;

        let mut queue = assembler.queue_rx.lock();
        assert!(queue.as_mut().unwrap().try_recv().is_err());
    }

    #[tokio::test]
    async fn test_inactive_container_is_forgotten_and_queued() {
        let assembler = assembler(Arc::new(domain_loader));
        assembler.container(container("c1", 8000)).await;
        assembler.container(Container::inactive("c1")).await;

        assert!(assembler.is_empty());
        let queued = assembler.queue_rx.lock().as_mut().unwrap().try_recv().unwrap();
        assert_eq!(queued.id, "c1");
        assert!(!queued.active);
    }

    #[tokio::test]
    async fn test_ticks_produce_services() {
        let assembler = assembler(Arc::new(domain_loader));
        let recorder = Arc::new(Recorder::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        assembler.container(container("c1", 8000)).await;
        let handle = tokio::spawn(assembler.clone().run(recorder.clone(), shutdown_rx));

        tokio::time::sleep(Duration::from_millis(150)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        let services = recorder.services.lock();
        assert!(services.len() >= 2, "expected repeated refreshes");
        assert!(services.iter().all(|s| s.id() == "c1"));
        assert_eq!(services[0].config.as_ref().unwrap().domain, "8000.test");
        assert_eq!(*recorder.closed.lock(), Some(None));
    }

    #[tokio::test]
    async fn test_fetch_error_keeps_container() {
        let calls = Arc::new(AtomicUsize::new(0));
        let loader = {
            let calls = calls.clone();
            move |_: &HttpAddr| -> Result<Config, DiscoveryError> {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(DiscoveryError::ConfigFetch("connection refused".into()))
            }
        };
        let assembler = assembler(Arc::new(loader));
        let recorder = Arc::new(Recorder::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        assembler.container(container("c1", 8000)).await;
        let handle = tokio::spawn(assembler.clone().run(recorder.clone(), shutdown_rx));

        tokio::time::sleep(Duration::from_millis(150)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        assert!(calls.load(Ordering::SeqCst) >= 2);
        assert!(assembler.contains("c1"));
        let services = recorder.services.lock();
        assert!(services.iter().all(|s| s.config.is_none() && s.error.is_some()));
    }

    #[tokio::test]
    async fn test_container_error_skips_loader() {
        let calls = Arc::new(AtomicUsize::new(0));
        let loader = {
            let calls = calls.clone();
            move |addr: &HttpAddr| {
                calls.fetch_add(1, Ordering::SeqCst);
                domain_loader(addr)
            }
        };
        let assembler = assembler(Arc::new(loader));
        let recorder = Arc::new(Recorder::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        assembler
            .container(Container::failed("c1", DiscoveryError::Inspect("gone".into())))
            .await;
        let handle = tokio::spawn(assembler.clone().run(recorder.clone(), shutdown_rx));

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let services = recorder.services.lock();
        assert!(!services.is_empty());
        assert_eq!(services[0].error, Some(DiscoveryError::Inspect("gone".into())));
    }

    #[tokio::test]
    async fn test_removal_reaches_consumer() {
        let assembler = assembler(Arc::new(domain_loader));
        let recorder = Arc::new(Recorder::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(assembler.clone().run(recorder.clone(), shutdown_rx));
        assembler.container(container("c1", 8000)).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assembler.container(Container::inactive("c1")).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        let services = recorder.services.lock();
        let last = services.last().unwrap();
        assert_eq!(last.id(), "c1");
        assert!(!last.container.active);
        assert!(last.config.is_none());
    }

    #[tokio::test]
    async fn test_source_close_stops_pipeline() {
        let assembler = assembler(Arc::new(domain_loader));
        let recorder = Arc::new(Recorder::default());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(assembler.clone().run(recorder.clone(), shutdown_rx));
        ContainerConsumer::close(
            assembler.as_ref(),
            Some(DiscoveryError::Source("stream ended".into())),
        );

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("pipeline should stop")
            .unwrap()
            .unwrap();
        assert_eq!(
            *recorder.closed.lock(),
            Some(Some(DiscoveryError::Source("stream ended".into())))
        );
    }

    #[tokio::test]
    async fn test_run_only_once() {
        let assembler = assembler(Arc::new(domain_loader));
        let recorder = Arc::new(Recorder::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let first = tokio::spawn(assembler.clone().run(recorder.clone(), shutdown_rx.clone()));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(assembler.clone().run(recorder.clone(), shutdown_rx).await.is_err());

        shutdown_tx.send(true).unwrap();
        first.await.unwrap().unwrap();
    }
}
