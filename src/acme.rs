//! On-demand ACME (Let's Encrypt) certificates
//!
//! A certificate is requested the first time a client's SNI names a host,
//! and only when the [`HostPolicy`] admits it. Issued certificates live in
//! memory and in `cache_dir/<host>/{cert,key}.pem`; a background loop renews
//! those that are close to expiry.
//!
//! Supported challenges:
//! - HTTP-01 (token served at /.well-known/acme-challenge/ on the HTTP listener)
//! - TLS-ALPN-01 (challenge certificate served for the acme-tls/1 protocol)
//!
//! Keys are written unencrypted with 0600 permissions on Unix. Keep the cache
//! directory readable by the service user only.

use crate::config::{AcmeChallengeType, AcmeConfig};
use dashmap::DashMap;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, Order, OrderStatus,
};
use parking_lot::RwLock;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, OnceCell};
use tracing::{debug, error, info, warn};

pub const ACME_TLS_ALPN_NAME: &[u8] = b"acme-tls/1";
const ACME_ALPN_OID: &[u64] = &[1, 3, 6, 1, 5, 5, 7, 1, 31];

/// Certificates with fewer days left are renewed
const RENEW_BEFORE_DAYS: u64 = 30;
const RENEWAL_CHECK_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);
const POLL_INTERVAL: Duration = Duration::from_secs(2);
const MAX_POLL_ATTEMPTS: u32 = 30;

/// Decides which hosts may receive a certificate
pub trait HostPolicy: Send + Sync {
    fn allow(&self, host: &str) -> anyhow::Result<()>;
}

/// Pending ACME challenges for HTTP-01 validation
#[derive(Clone, Default)]
pub struct Http01Challenges {
    inner: Arc<tokio::sync::RwLock<HashMap<String, String>>>,
}

impl Http01Challenges {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, token: String, key_authorization: String) {
        self.inner.write().await.insert(token, key_authorization);
    }

    pub async fn get(&self, token: &str) -> Option<String> {
        self.inner.read().await.get(token).cloned()
    }

    pub async fn remove(&self, token: &str) {
        self.inner.write().await.remove(token);
    }
}

/// Resolver that always presents one certificate
#[derive(Debug)]
struct FixedCert(Arc<CertifiedKey>);

impl ResolvesServerCert for FixedCert {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}

/// Issues, caches and renews certificates per host
pub struct AcmeManager {
    config: AcmeConfig,
    cache_dir: PathBuf,
    policy: Arc<dyn HostPolicy>,
    http01_challenges: Http01Challenges,
    /// TLS-ALPN-01 challenge certificates by host
    alpn_certs: RwLock<HashMap<String, Arc<CertifiedKey>>>,
    certs: DashMap<String, Arc<CertifiedKey>>,
    /// Serializes issuance per host
    issuing: DashMap<String, Arc<Mutex<()>>>,
    account: OnceCell<Account>,
}

impl AcmeManager {
    pub fn new(config: AcmeConfig, policy: Arc<dyn HostPolicy>) -> anyhow::Result<Self> {
        let cache_dir = validate_cache_dir(&config.cache_dir)?;
        Ok(Self {
            config,
            cache_dir,
            policy,
            http01_challenges: Http01Challenges::new(),
            alpn_certs: RwLock::new(HashMap::new()),
            certs: DashMap::new(),
            issuing: DashMap::new(),
            account: OnceCell::new(),
        })
    }

    pub fn http01_challenges(&self) -> Http01Challenges {
        self.http01_challenges.clone()
    }

    /// Number of certificates held in memory
    pub fn cached_count(&self) -> usize {
        self.certs.len()
    }

    /// TLS config for one handshake. `challenge` selects the TLS-ALPN-01
    /// certificate for `server_name` instead of the served one.
    pub async fn server_config(
        &self,
        server_name: Option<&str>,
        challenge: bool,
    ) -> anyhow::Result<Arc<rustls::ServerConfig>> {
        let host = server_name.ok_or_else(|| anyhow::anyhow!("client sent no SNI server name"))?;

        let (key, protocols) = if challenge {
            let key = self
                .alpn_certs
                .read()
                .get(host)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no pending TLS-ALPN-01 challenge for {}", host))?;
            (key, vec![ACME_TLS_ALPN_NAME.to_vec()])
        } else {
            let key = self.certificate(host).await?;
            (key, vec![b"h2".to_vec(), b"http/1.1".to_vec()])
        };

        let mut config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(FixedCert(key)));
        config.alpn_protocols = protocols;
        Ok(Arc::new(config))
    }

    /// Certificate for `host`: from memory, else from the disk cache, else
    /// freshly issued. Hosts refused by the policy get an error.
    pub async fn certificate(&self, host: &str) -> anyhow::Result<Arc<CertifiedKey>> {
        if let Some(key) = self.certs.get(host) {
            return Ok(Arc::clone(key.value()));
        }

        self.policy.allow(host)?;
        if host.is_empty() || host.contains(['/', '\\']) || host.contains("..") {
            anyhow::bail!("invalid host name '{}'", host);
        }

        let lock = Arc::clone(&self.issuing.entry(host.to_string()).or_default());
        let _guard = lock.lock().await;

        // another handshake may have finished issuing while we waited
        if let Some(key) = self.certs.get(host) {
            return Ok(Arc::clone(key.value()));
        }

        let key = match self.load_cached_cert(host) {
            Some(key) => key,
            None => self.issue(host).await?,
        };
        self.certs.insert(host.to_string(), Arc::clone(&key));
        Ok(key)
    }

    /// Renew expiring certificates until `shutdown` fires
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(RENEWAL_CHECK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => self.renew_expiring().await,
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("ACME manager shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    async fn renew_expiring(&self) {
        let expiring: Vec<String> = self
            .certs
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .cert
                    .first()
                    .map(|cert| !is_cert_valid_for_days(cert, RENEW_BEFORE_DAYS))
                    .unwrap_or(true)
            })
            .map(|entry| entry.key().clone())
            .collect();

        for host in expiring {
            if let Err(e) = self.policy.allow(&host) {
                debug!(host, error = %e, "Dropping certificate for host no longer served");
                self.certs.remove(&host);
                continue;
            }

            let lock = Arc::clone(&self.issuing.entry(host.clone()).or_default());
            let _guard = lock.lock().await;
            match self.issue(&host).await {
                Ok(key) => {
                    self.certs.insert(host.clone(), key);
                    info!(host, "Certificate renewed");
                }
                Err(e) => error!(host, error = %e, "Failed to renew certificate"),
            }
        }
    }

    async fn account(&self) -> anyhow::Result<&Account> {
        self.account
            .get_or_try_init(|| self.load_or_create_account())
            .await
    }

    async fn load_or_create_account(&self) -> anyhow::Result<Account> {
        let account_path = self.cache_dir.join("account.json");

        if account_path.exists() {
            debug!(path = %account_path.display(), "Loading existing ACME account");
            let data = std::fs::read_to_string(&account_path)?;
            let credentials: AccountCredentials = serde_json::from_str(&data)?;
            return Ok(Account::from_credentials(credentials).await?);
        }

        info!("Creating new ACME account");
        let email = self
            .config
            .email
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("ACME email is required for account creation"))?;

        let directory_url = self
            .config
            .directory_url
            .as_deref()
            .unwrap_or(LetsEncrypt::Production.url());

        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &[&format!("mailto:{}", email)],
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            directory_url,
            None,
        )
        .await?;

        std::fs::create_dir_all(&self.cache_dir)?;
        write_private(&account_path, &serde_json::to_string_pretty(&credentials)?)?;
        info!(path = %account_path.display(), "ACME account credentials saved");

        Ok(account)
    }

    fn host_dir(&self, host: &str) -> PathBuf {
        self.cache_dir.join(host)
    }

    /// Cached certificate for `host` if it has enough validity left
    fn load_cached_cert(&self, host: &str) -> Option<Arc<CertifiedKey>> {
        let dir = self.host_dir(host);
        let cert_data = std::fs::read(dir.join("cert.pem")).ok()?;
        let key_data = std::fs::read(dir.join("key.pem")).ok()?;

        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut BufReader::new(&cert_data[..]))
                .filter_map(|c| c.ok())
                .collect();

        if !is_cert_valid_for_days(certs.first()?, RENEW_BEFORE_DAYS) {
            info!(host, "Cached certificate expires soon, will reissue");
            return None;
        }

        let key = load_private_key(&key_data)?;
        match certified_key(certs, &key) {
            Ok(certified) => {
                debug!(host, "Loaded cached certificate");
                Some(certified)
            }
            Err(e) => {
                warn!(host, error = %e, "Ignoring unusable cached certificate");
                None
            }
        }
    }

    fn save_cert(&self, host: &str, cert_chain_pem: &str, private_key_pem: &str) -> anyhow::Result<()> {
        let dir = self.host_dir(host);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join("cert.pem"), cert_chain_pem)?;
        write_private(&dir.join("key.pem"), private_key_pem)?;
        debug!(host, path = %dir.display(), "Certificate saved to cache");
        Ok(())
    }

    /// Run a full order for `host` and persist the result
    async fn issue(&self, host: &str) -> anyhow::Result<Arc<CertifiedKey>> {
        let account = self.account().await?;
        info!(host, "Requesting new certificate");

        let identifiers = [Identifier::Dns(host.to_string())];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;

        let mut tokens = Vec::new();
        let authorized = self.authorize(&mut order, host, &mut tokens).await;
        self.clear_challenges(host, tokens).await;
        authorized?;

        wait_until_ready(&mut order).await?;

        let mut params = CertificateParams::new(vec![host.to_string()])?;
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, host);

        let private_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let csr = params.serialize_request(&private_key)?;
        order.finalize(csr.der()).await?;

        let cert_chain_pem = wait_for_certificate(&mut order).await?;
        let private_key_pem = private_key.serialize_pem();
        self.save_cert(host, &cert_chain_pem, &private_key_pem)?;

        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut BufReader::new(cert_chain_pem.as_bytes()))
                .filter_map(|c| c.ok())
                .collect();
        let key = PrivateKeyDer::try_from(private_key.serialize_der())
            .map_err(|e| anyhow::anyhow!("Failed to parse private key: {}", e))?;

        info!(host, "Certificate obtained");
        certified_key(certs, &key)
    }

    /// Publish challenge responses and wait for the host's authorization.
    /// HTTP-01 tokens are pushed to `tokens` for cleanup.
    async fn authorize(
        &self,
        order: &mut Order,
        host: &str,
        tokens: &mut Vec<String>,
    ) -> anyhow::Result<()> {
        let challenge_type = match self.config.challenge_type {
            AcmeChallengeType::Http01 => ChallengeType::Http01,
            AcmeChallengeType::TlsAlpn01 => ChallengeType::TlsAlpn01,
        };

        for authz in order.authorizations().await? {
            if authz.status == AuthorizationStatus::Valid {
                continue;
            }

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == challenge_type)
                .ok_or_else(|| {
                    anyhow::anyhow!(
                        "Challenge type {:?} not offered for {}",
                        self.config.challenge_type,
                        host
                    )
                })?;

            let key_auth = order.key_authorization(challenge);
            match self.config.challenge_type {
                AcmeChallengeType::Http01 => {
                    debug!(host, token = %challenge.token, "Setting up HTTP-01 challenge");
                    self.http01_challenges
                        .set(challenge.token.clone(), key_auth.as_str().to_string())
                        .await;
                    tokens.push(challenge.token.clone());
                }
                AcmeChallengeType::TlsAlpn01 => {
                    debug!(host, "Setting up TLS-ALPN-01 challenge");
                    let cert = create_tls_alpn01_cert(host, key_auth.digest().as_ref())?;
                    self.alpn_certs.write().insert(host.to_string(), cert);
                }
            }

            order.set_challenge_ready(&challenge.url).await?;
        }

        for attempt in 1..=MAX_POLL_ATTEMPTS {
            tokio::time::sleep(POLL_INTERVAL).await;
            order.refresh().await?;

            let auths = order.authorizations().await?;
            let current = auths
                .iter()
                .find(|a| matches!(&a.identifier, Identifier::Dns(d) if d == host));

            match current.map(|a| &a.status) {
                Some(AuthorizationStatus::Valid) => {
                    info!(host, "Authorization valid");
                    return Ok(());
                }
                Some(AuthorizationStatus::Invalid) => {
                    anyhow::bail!("Authorization failed for {}", host)
                }
                None => anyhow::bail!("Authorization not found for {}", host),
                Some(status) => {
                    debug!(host, attempt, status = ?status, "Waiting for authorization")
                }
            }
        }

        anyhow::bail!("Authorization timeout for {}", host)
    }

    async fn clear_challenges(&self, host: &str, tokens: Vec<String>) {
        for token in tokens {
            self.http01_challenges.remove(&token).await;
        }
        self.alpn_certs.write().remove(host);
    }
}

async fn wait_until_ready(order: &mut Order) -> anyhow::Result<()> {
    for _ in 0..MAX_POLL_ATTEMPTS {
        let state = order.state();
        match state.status {
            OrderStatus::Ready | OrderStatus::Valid => return Ok(()),
            OrderStatus::Invalid => anyhow::bail!("Order invalid"),
            OrderStatus::Pending | OrderStatus::Processing => {
                tokio::time::sleep(POLL_INTERVAL).await;
                order.refresh().await?;
            }
        }
    }
    anyhow::bail!("Order timeout")
}

async fn wait_for_certificate(order: &mut Order) -> anyhow::Result<String> {
    for _ in 0..MAX_POLL_ATTEMPTS {
        order.refresh().await?;
        let state = order.state();
        match state.status {
            OrderStatus::Valid => {
                return order
                    .certificate()
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("Order valid but no certificate returned"));
            }
            OrderStatus::Processing => tokio::time::sleep(POLL_INTERVAL).await,
            _ => anyhow::bail!("Unexpected order status: {:?}", order.state().status),
        }
    }
    anyhow::bail!("Certificate timeout")
}

fn certified_key(
    certs: Vec<CertificateDer<'static>>,
    key: &PrivateKeyDer<'static>,
) -> anyhow::Result<Arc<CertifiedKey>> {
    if certs.is_empty() {
        anyhow::bail!("certificate chain is empty");
    }
    let signing_key = rustls::crypto::ring::sign::any_supported_type(key)
        .map_err(|e| anyhow::anyhow!("Failed to create signing key: {}", e))?;
    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}

/// Write a file readable only by its owner
fn write_private(path: &std::path::Path, contents: &str) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        std::io::Write::write_all(&mut file, contents.as_bytes())?;
    }
    #[cfg(not(unix))]
    {
        std::fs::write(path, contents)?;
    }
    Ok(())
}

/// Self-signed certificate carrying the acmeIdentifier extension
fn create_tls_alpn01_cert(domain: &str, digest: &[u8]) -> anyhow::Result<Arc<CertifiedKey>> {
    use rcgen::{CustomExtension, IsCa, KeyUsagePurpose};

    let mut params = CertificateParams::new(vec![domain.to_string()])?;
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];

    // OCTET STRING of 32 bytes
    let mut ext_value = vec![0x04, 0x20];
    ext_value.extend_from_slice(digest);
    let mut extension = CustomExtension::from_oid_content(ACME_ALPN_OID, ext_value);
    extension.set_criticality(true);
    params.custom_extensions.push(extension);

    let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
    let cert = params.self_signed(&key_pair)?;

    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| anyhow::anyhow!("Failed to serialize private key: {}", e))?;
    certified_key(vec![CertificateDer::from(cert.der().to_vec())], &key_der)
}

fn load_private_key(data: &[u8]) -> Option<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(data);

    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(rustls_pemfile::Item::Pkcs1Key(key))) => return Some(key.into()),
            Ok(Some(rustls_pemfile::Item::Pkcs8Key(key))) => return Some(key.into()),
            Ok(Some(rustls_pemfile::Item::Sec1Key(key))) => return Some(key.into()),
            Ok(None) => return None,
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

fn is_cert_valid_for_days(cert: &CertificateDer<'_>, days: u64) -> bool {
    use x509_parser::prelude::*;

    let (_, parsed) = match X509Certificate::from_der(cert.as_ref()) {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "Failed to parse X.509 certificate");
            return false;
        }
    };

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let remaining_secs = parsed.validity().not_after.timestamp() - now;
    if remaining_secs < 0 {
        return false;
    }

    let remaining_days = remaining_secs as u64 / (24 * 60 * 60);
    if remaining_days < days {
        debug!(remaining_days, required_days = days, "Certificate expires soon");
        return false;
    }
    true
}

/// Validate and canonicalize the ACME cache directory path
fn validate_cache_dir(path: &str) -> anyhow::Result<PathBuf> {
    if path.contains("..") {
        anyhow::bail!("ACME cache directory path must not contain '..'");
    }

    let path_buf = PathBuf::from(path);
    if path_buf.exists() {
        let canonical = path_buf.canonicalize().map_err(|e| {
            anyhow::anyhow!("Failed to canonicalize ACME cache directory '{}': {}", path, e)
        })?;
        if !canonical.is_dir() {
            anyhow::bail!("ACME cache path '{}' exists but is not a directory", path);
        }
        return Ok(canonical);
    }

    // not created yet; resolve the parent when it exists
    match (path_buf.parent(), path_buf.file_name()) {
        (Some(parent), Some(name)) if !parent.as_os_str().is_empty() && parent.exists() => {
            Ok(parent.canonicalize()?.join(name))
        }
        _ => Ok(path_buf),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct AllowList {
        hosts: Vec<&'static str>,
        checks: AtomicUsize,
    }

    impl AllowList {
        fn new(hosts: &[&'static str]) -> Arc<Self> {
            Arc::new(Self {
                hosts: hosts.to_vec(),
                checks: AtomicUsize::new(0),
            })
        }
    }

    impl HostPolicy for AllowList {
        fn allow(&self, host: &str) -> anyhow::Result<()> {
            self.checks.fetch_add(1, Ordering::SeqCst);
            if self.hosts.contains(&host) {
                Ok(())
            } else {
                anyhow::bail!("host '{}' not allowed", host)
            }
        }
    }

    fn acme_config(cache_dir: &std::path::Path) -> AcmeConfig {
        AcmeConfig {
            enabled: true,
            email: Some("ops@example.com".to_string()),
            // unroutable, so an accidental order fails fast
            directory_url: Some("http://127.0.0.1:9/directory".to_string()),
            cache_dir: cache_dir.to_string_lossy().to_string(),
            challenge_type: AcmeChallengeType::Http01,
        }
    }

    fn write_cached_cert(cache_dir: &std::path::Path, host: &str) {
        let generated = rcgen::generate_simple_self_signed(vec![host.to_string()]).unwrap();
        let dir = cache_dir.join(host);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("cert.pem"), generated.cert.pem()).unwrap();
        std::fs::write(dir.join("key.pem"), generated.key_pair.serialize_pem()).unwrap();
    }

    #[tokio::test]
    async fn test_http01_challenges() {
        let challenges = Http01Challenges::new();
        challenges
            .set("token123".to_string(), "key_auth_123".to_string())
            .await;

        assert_eq!(
            challenges.get("token123").await,
            Some("key_auth_123".to_string())
        );
        assert_eq!(challenges.get("nonexistent").await, None);

        challenges.remove("token123").await;
        assert_eq!(challenges.get("token123").await, None);
    }

    #[tokio::test]
    async fn test_certificate_served_from_disk_cache() {
        let dir = tempfile::tempdir().unwrap();
        write_cached_cert(dir.path(), "app.example.com");

        let policy = AllowList::new(&["app.example.com"]);
        let manager = AcmeManager::new(acme_config(dir.path()), policy.clone()).unwrap();

        let first = manager.certificate("app.example.com").await.unwrap();
        assert_eq!(manager.cached_count(), 1);

        // second lookup is answered from memory without consulting the policy
        let second = manager.certificate("app.example.com").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(policy.checks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_certificate_refused_by_policy() {
        let dir = tempfile::tempdir().unwrap();
        write_cached_cert(dir.path(), "other.example.com");

        let manager =
            AcmeManager::new(acme_config(dir.path()), AllowList::new(&["app.example.com"])).unwrap();

        let err = manager.certificate("other.example.com").await.unwrap_err();
        assert!(err.to_string().contains("not allowed"));
        assert_eq!(manager.cached_count(), 0);
    }

    #[tokio::test]
    async fn test_certificate_rejects_path_like_hosts() {
        let dir = tempfile::tempdir().unwrap();
        let manager =
            AcmeManager::new(acme_config(dir.path()), AllowList::new(&["../escape"])).unwrap();

        assert!(manager.certificate("../escape").await.is_err());
    }

    #[tokio::test]
    async fn test_server_config_alpn() {
        let dir = tempfile::tempdir().unwrap();
        write_cached_cert(dir.path(), "app.example.com");
        let manager =
            AcmeManager::new(acme_config(dir.path()), AllowList::new(&["app.example.com"])).unwrap();

        let config = manager
            .server_config(Some("app.example.com"), false)
            .await
            .unwrap();
        assert_eq!(
            config.alpn_protocols,
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );

        assert!(manager.server_config(None, false).await.is_err());
    }

    #[tokio::test]
    async fn test_server_config_for_alpn_challenge() {
        let dir = tempfile::tempdir().unwrap();
        let manager =
            AcmeManager::new(acme_config(dir.path()), AllowList::new(&["app.example.com"])).unwrap();

        assert!(manager
            .server_config(Some("app.example.com"), true)
            .await
            .is_err());

        let cert = create_tls_alpn01_cert("app.example.com", &[7u8; 32]).unwrap();
        manager
            .alpn_certs
            .write()
            .insert("app.example.com".to_string(), cert);

        let config = manager
            .server_config(Some("app.example.com"), true)
            .await
            .unwrap();
        assert_eq!(config.alpn_protocols, vec![ACME_TLS_ALPN_NAME.to_vec()]);
    }

    #[test]
    fn test_generated_cert_validity() {
        let generated = rcgen::generate_simple_self_signed(vec!["a.test".to_string()]).unwrap();
        let der = CertificateDer::from(generated.cert.der().to_vec());
        assert!(is_cert_valid_for_days(&der, RENEW_BEFORE_DAYS));
        assert!(!is_cert_valid_for_days(&CertificateDer::from(vec![0u8; 4]), 1));
    }

    #[test]
    fn test_load_private_key() {
        let generated = rcgen::generate_simple_self_signed(vec!["a.test".to_string()]).unwrap();
        let pem = generated.key_pair.serialize_pem();
        assert!(load_private_key(pem.as_bytes()).is_some());
        assert!(load_private_key(b"not a key").is_none());
    }

    #[test]
    fn test_validate_cache_dir_rejects_traversal() {
        assert!(validate_cache_dir("../etc/passwd").is_err());
        assert!(validate_cache_dir("/tmp/../etc").is_err());
        assert!(validate_cache_dir("foo/../../bar").is_err());
    }

    #[test]
    fn test_validate_cache_dir_accepts_valid_paths() {
        assert!(validate_cache_dir("/tmp/acme").is_ok());
        assert!(validate_cache_dir("./acme_cache").is_ok());
        assert!(validate_cache_dir("acme_cache").is_ok());
    }
}
