use baker::acme::{AcmeManager, HostPolicy};
use baker::assembler::ServiceAssembler;
use baker::config::{AcmeChallengeType, Config};
use baker::docker::DockerWatcher;
use baker::loader::HttpConfigLoader;
use baker::proxy::{Gateway, ProxyServer, TlsMode};
use baker::registry::Registry;
use baker::upstream::{Upstream, UpstreamConfig};
use rcgen::{generate_simple_self_signed, CertifiedKey};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, info_span, warn, Instrument};

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("baker=info")),
        )
        .init();

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("baker.toml"));

    let config = if config_path.exists() {
        let config = Config::load(&config_path).map_err(|e| {
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            e
        })?;
        info!(path = %config_path.display(), "Configuration loaded");
        config
    } else {
        info!(path = %config_path.display(), "No configuration file, using defaults");
        Config::default()
    };

    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let registry = Arc::new(Registry::new());
    let upstream = Arc::new(Upstream::new(UpstreamConfig {
        max_idle_per_host: config.upstream.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.upstream.pool_idle_timeout_secs),
    })?);
    let gateway = Arc::new(
        Gateway::new(Arc::clone(&registry), upstream)
            .with_flush_interval(config.server.flush_interval())
            .with_request_timeout(config.upstream.request_timeout()),
    );

    // Discovery: docker events feed the assembler, which feeds the registry
    let loader = Arc::new(HttpConfigLoader::new(config.discovery.config_timeout())?);
    let assembler = Arc::new(ServiceAssembler::new(
        loader,
        config.discovery.ping_interval(),
        config.discovery.queue_capacity,
    ));
    let watcher = DockerWatcher::new(config.discovery.docker_host.as_deref()).await?;

    let mut assembler_task = {
        let assembler = Arc::clone(&assembler);
        let consumer = Arc::clone(&registry);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(
            async move { assembler.run(consumer, shutdown).await }
                .instrument(info_span!("assembler")),
        )
    };
    let watcher_task = {
        let consumer = Arc::clone(&assembler);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(
            async move { watcher.run(consumer, shutdown).await }
                .instrument(info_span!("docker")),
        )
    };

    // Priority: ACME > file-based certs > self-signed
    let (tls_mode, acme_manager) = if config.server.acme.enabled {
        let acme_config = config.server.acme.clone();
        std::fs::create_dir_all(&acme_config.cache_dir).map_err(|e| {
            anyhow::anyhow!(
                "Failed to create ACME cache directory '{}': {}",
                acme_config.cache_dir,
                e
            )
        })?;

        info!(
            email = ?acme_config.email,
            cache_dir = %acme_config.cache_dir,
            challenge_type = ?acme_config.challenge_type,
            "On-demand ACME certificates enabled"
        );

        let policy: Arc<dyn HostPolicy> = Arc::clone(&gateway) as Arc<dyn HostPolicy>;
        let manager = Arc::new(AcmeManager::new(acme_config, policy)?);
        (Some(TlsMode::Acme(Arc::clone(&manager))), Some(manager))
    } else if config.server.tls_enabled() {
        let (certs, key) = match (&config.server.tls_cert, &config.server.tls_key) {
            (Some(cert_path), Some(key_path)) => {
                let certs = load_certs(cert_path)?;
                let key = load_key(key_path)?;
                info!(cert = %cert_path, key = %key_path, "TLS enabled with provided certificates");
                (certs, key)
            }
            _ => {
                warn!("TLS enabled with auto-generated self-signed certificate (not for production)");
                generate_self_signed_cert()?
            }
        };

        let mut tls_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?;
        tls_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        (
            Some(TlsMode::Static(TlsAcceptor::from(Arc::new(tls_config)))),
            None,
        )
    } else {
        (None, None)
    };

    let http_port = config.server.port;
    let https_port = config.server.https_port();
    let mut servers: Vec<JoinHandle<()>> = Vec::new();

    if http_port > 0 {
        let addr = bind_addr(&config.server.bind, http_port)?;
        let mut server = ProxyServer::new(addr, Arc::clone(&gateway), shutdown_rx.clone());

        // challenges are answered before the redirect
        if let Some(manager) = &acme_manager {
            if config.server.acme.challenge_type == AcmeChallengeType::Http01 {
                server = server.with_acme_challenges(manager.http01_challenges());
                info!("ACME HTTP-01 challenge handler enabled on HTTP port");
            }
        }
        if config.server.redirects_to_https() {
            server = server.with_https_redirect(https_port);
            info!(http_port, https_port, "HTTP to HTTPS redirect enabled");
        }

        servers.push(tokio::spawn(
            async move {
                if let Err(e) = server.run().await {
                    error!(error = %e, "HTTP proxy server error");
                }
            }
            .instrument(info_span!("http", port = http_port)),
        ));
    }

    if let (Some(tls), true) = (tls_mode, https_port > 0) {
        let addr = bind_addr(&config.server.bind, https_port)?;
        let server = ProxyServer::new(addr, Arc::clone(&gateway), shutdown_rx.clone()).with_tls(tls);

        servers.push(tokio::spawn(
            async move {
                if let Err(e) = server.run().await {
                    error!(error = %e, "HTTPS proxy server error");
                }
            }
            .instrument(info_span!("https", port = https_port)),
        ));
    }

    let acme_task = acme_manager.map(|manager| {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(
            async move {
                if let Err(e) = manager.run(shutdown).await {
                    error!(error = %e, "ACME manager error");
                }
            }
            .instrument(info_span!("acme")),
        )
    });

    tokio::select! {
        signal = shutdown_signal() => signal?,
        result = &mut assembler_task => {
            match result {
                Ok(Ok(())) => warn!("Service discovery stopped"),
                Ok(Err(e)) => error!(error = %e, "Service discovery failed"),
                Err(e) => error!(error = %e, "Service discovery task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    if let Some(handle) = acme_task {
        handle.abort();
    }

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        for handle in servers {
            let _ = handle.await;
        }
        let _ = watcher_task.await;
        if !assembler_task.is_finished() {
            let _ = assembler_task.await;
        }
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT (Ctrl+C), shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

fn bind_addr(bind: &str, port: u16) -> anyhow::Result<SocketAddr> {
    format!("{}:{}", bind, port).parse().map_err(|e| {
        error!(bind, port, error = %e, "Invalid bind address");
        anyhow::anyhow!("Invalid bind address {}:{}: {}", bind, port, e)
    })
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting proxy server");
    let https_port = config.server.https_port();
    info!(
        bind = %config.server.bind,
        http_port = if config.server.port > 0 { Some(config.server.port) } else { None },
        https_port = if https_port > 0 { Some(https_port) } else { None },
        tls = config.server.tls_enabled(),
        acme = config.server.acme.enabled,
        flush_interval_ms = config.server.flush_interval_ms,
        "Server configuration"
    );
    info!(
        docker_host = ?config.discovery.docker_host,
        ping_interval_secs = config.discovery.ping_interval_secs,
        config_timeout_ms = config.discovery.config_timeout_ms,
        queue_capacity = config.discovery.queue_capacity,
        "Discovery settings"
    );
    info!(
        pool_max_idle = config.upstream.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.upstream.pool_idle_timeout_secs,
        request_timeout_secs = config.upstream.request_timeout_secs,
        "Upstream settings"
    );
}

fn load_certs(path: &str) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open certificate file {}: {}", path, e))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to parse certificates from {}: {}", path, e))?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path);
    }

    Ok(certs)
}

fn load_key(path: &str) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open key file {}: {}", path, e))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| anyhow::anyhow!("Failed to parse key from {}: {}", path, e))?
        .ok_or_else(|| anyhow::anyhow!("No private key found in {}", path))
}

fn generate_self_signed_cert() -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let subject_alt_names = vec!["localhost".to_string(), "127.0.0.1".to_string()];

    let CertifiedKey { cert, key_pair } = generate_simple_self_signed(subject_alt_names)
        .map_err(|e| anyhow::anyhow!("Failed to generate self-signed certificate: {}", e))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| anyhow::anyhow!("Failed to serialize private key: {}", e))?;

    Ok((vec![cert_der], key_der))
}
