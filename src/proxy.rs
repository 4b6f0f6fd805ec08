use crate::acme::{AcmeManager, HostPolicy, Http01Challenges, ACME_TLS_ALPN_NAME};
use crate::error::{json_error_response, ProxyErrorCode};
use crate::model::{Config, HttpAddr};
use crate::registry::{Registry, RouteMiss};
use crate::rule::DirectorChain;
use crate::upstream::Upstream;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, InvalidHeaderValue};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_rustls::{LazyConfigAcceptor, TlsAcceptor};
use tracing::{debug, error, info, warn};

const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Headers that describe a single connection and are not forwarded
const HOP_BY_HOP: [&str; 7] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "upgrade",
    "transfer-encoding",
];

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(10);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Buffered bytes that force a flush regardless of the tick
const MAX_BUFFERED: usize = 32 * 1024;

/// How much of an unannounced chunked body is held back while looking for
/// trailers to announce in the response head
const TRAILER_PREFETCH_LIMIT: usize = 64 * 1024;
const TRAILER_PREFETCH_WINDOW: Duration = Duration::from_millis(100);

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Request dispatcher: resolves a request against the registry and proxies
/// it to the chosen backend
pub struct Gateway {
    registry: Arc<Registry>,
    upstream: Arc<Upstream>,
    flush_interval: Duration,
    request_timeout: Duration,
}

impl Gateway {
    pub fn new(registry: Arc<Registry>, upstream: Arc<Upstream>) -> Self {
        Self {
            registry,
            upstream,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub async fn dispatch(
        &self,
        mut req: Request<Incoming>,
        client_addr: SocketAddr,
        is_tls: bool,
    ) -> Response<ProxyBody> {
        let hostname = match extract_hostname(&req) {
            Some(h) => h,
            None => {
                return json_error_response(
                    ProxyErrorCode::MissingHostHeader,
                    "Missing or invalid Host header",
                );
            }
        };
        let (domain, has_www) = strip_www(&hostname);
        let path = req.uri().path().to_string();
        let accepts_trailers = req.version() == hyper::Version::HTTP_11
            && client_accepts_trailers(req.headers());

        debug!(hostname, method = %req.method(), uri = %req.uri(), "Incoming request");

        let service = match self.registry.lookup(domain, &path) {
            Ok(service) => service,
            Err(miss) => {
                debug!(hostname, path, ?miss, "No route");
                return route_miss_response(miss);
            }
        };
        let Some(config) = service.config.as_ref() else {
            return json_error_response(ProxyErrorCode::NoInstance, "no service instance available");
        };

        if let Err((code, message)) = check_admission(config, has_www, service.container.active) {
            debug!(hostname, path, container_id = service.id(), code = code.as_header_value(), "Request refused");
            return json_error_response(code, message);
        }

        let target = HttpAddr::new(service.container.addr.clone(), path.as_str());
        let target: Uri = match target.to_string().parse() {
            Ok(uri) => uri,
            Err(e) => {
                error!(container_id = service.id(), error = %e, "Invalid upstream URL");
                return json_error_response(ProxyErrorCode::UpstreamUrl, "invalid upstream url");
            }
        };

        strip_hop_by_hop(req.headers_mut());
        if req.headers().get(hyper::header::HOST).is_none() {
            if let Ok(value) = HeaderValue::from_str(&hostname) {
                req.headers_mut().insert(hyper::header::HOST, value);
            }
        }
        if let Err(e) = set_forwarded_headers(req.headers_mut(), client_addr, is_tls) {
            warn!(addr = %client_addr, error = %e, "Cannot build forwarding headers");
            return json_error_response(ProxyErrorCode::BadRemoteAddress, "invalid remote address");
        }

        let (mut parts, body) = req.into_parts();
        let directed = DirectorChain::new(&target, config.rules.as_slice())
            .and_then(|chain| chain.direct(&mut parts));
        if let Err(e) = directed {
            error!(container_id = service.id(), error = %e, "Failed to rewrite request");
            return json_error_response(ProxyErrorCode::UpstreamUrl, "failed to build upstream request");
        }
        let outbound = Request::from_parts(parts, body);
        let upstream_uri = outbound.uri().to_string();

        match tokio::time::timeout(self.request_timeout, self.upstream.send(outbound)).await {
            Ok(Ok(response)) => {
                let (mut parts, body) = response.into_parts();
                let mut body = FlushBody::new(body, self.flush_interval);

                // HTTP/1 only sends trailer fields named in the head
                if accepts_trailers && trailers_unannounced(&parts.headers) {
                    let names = body
                        .prefetch_trailers(TRAILER_PREFETCH_LIMIT, TRAILER_PREFETCH_WINDOW)
                        .await;
                    if let Some(names) = names {
                        debug!(container_id = service.id(), trailers = ?names, "Announcing upstream trailers");
                        parts.headers.insert(hyper::header::TRAILER, names);
                    }
                }
                Response::from_parts(parts, body.boxed())
            }
            Ok(Err(e)) => {
                error!(container_id = service.id(), upstream = upstream_uri, error = %e, "Failed to forward request");
                json_error_response(ProxyErrorCode::UpstreamFailed, "failed to reach backend")
            }
            Err(_) => {
                warn!(
                    container_id = service.id(),
                    upstream = upstream_uri,
                    timeout_secs = self.request_timeout.as_secs(),
                    "Request timed out"
                );
                json_error_response(
                    ProxyErrorCode::RequestTimeout,
                    format!(
                        "request timed out after {} seconds",
                        self.request_timeout.as_secs()
                    ),
                )
            }
        }
    }
}

/// Certificates are only issued for hosts with a live route. A `www.` host
/// needs a service on its domain that opted in to the prefix.
impl HostPolicy for Gateway {
    fn allow(&self, host: &str) -> anyhow::Result<()> {
        let (domain, has_www) = strip_www(host);
        let served = if has_www {
            self.registry.includes_www(domain)
        } else {
            self.registry.contains_domain(domain)
        };
        if served {
            Ok(())
        } else {
            anyhow::bail!("host '{}' is not served by any container", host)
        }
    }
}

fn strip_www(host: &str) -> (&str, bool) {
    match host.strip_prefix("www.") {
        Some(bare) => (bare, true),
        None => (host, false),
    }
}

fn route_miss_response(miss: RouteMiss) -> Response<ProxyBody> {
    match miss {
        RouteMiss::Host(host) => {
            json_error_response(ProxyErrorCode::UnknownHost, format!("domain {} not found", host))
        }
        RouteMiss::Path(path) => {
            json_error_response(ProxyErrorCode::UnknownPath, format!("path {} not found", path))
        }
        RouteMiss::Empty => {
            json_error_response(ProxyErrorCode::NoInstance, "no service instance available")
        }
    }
}

/// Checks run in order once a service matched
fn check_admission(
    config: &Config,
    has_www: bool,
    active: bool,
) -> Result<(), (ProxyErrorCode, &'static str)> {
    if has_www && !config.include_www {
        return Err((ProxyErrorCode::WwwNotAllowed, "www subdomain not enabled"));
    }
    if !active {
        return Err((ProxyErrorCode::BackendInactive, "service is not active"));
    }
    if !config.ready {
        return Err((ProxyErrorCode::BackendNotReady, "service is not ready"));
    }
    Ok(())
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // headers named by Connection are hop-by-hop too
    let named: Vec<HeaderName> = headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

fn client_accepts_trailers(headers: &HeaderMap) -> bool {
    headers
        .get_all(hyper::header::TE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case("trailers"))
}

/// A length-delimited body cannot carry trailers
fn trailers_unannounced(headers: &HeaderMap) -> bool {
    !headers.contains_key(hyper::header::TRAILER)
        && !headers.contains_key(hyper::header::CONTENT_LENGTH)
}

fn trailer_names(trailers: &HeaderMap) -> Option<HeaderValue> {
    let names: Vec<&str> = trailers.keys().map(|name| name.as_str()).collect();
    if names.is_empty() {
        return None;
    }
    HeaderValue::from_str(&names.join(", ")).ok()
}

/// Overwrite X-Forwarded-* with what this hop observed
fn set_forwarded_headers(
    headers: &mut HeaderMap,
    client_addr: SocketAddr,
    is_tls: bool,
) -> Result<(), InvalidHeaderValue> {
    headers.insert(
        X_FORWARDED_FOR,
        HeaderValue::from_str(&client_addr.ip().to_string())?,
    );
    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    let proto = if is_tls { "https" } else { "http" };
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));
    Ok(())
}

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

fn extract_hostname<B>(req: &Request<B>) -> Option<String> {
    let raw = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))?;

    // Strip port if present
    let hostname = raw.split(':').next()?;
    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }

    // alphanumeric, hyphen and dot only
    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return None;
    }

    Some(hostname.to_lowercase())
}

/// Response body that coalesces upstream data frames and releases them on a
/// fixed tick, so streamed responses reach the client without waiting for
/// the whole body. Trailers are passed through after the last data frame.
pub struct FlushBody<B: Body> {
    inner: B,
    buf: Vec<u8>,
    ticker: Option<Interval>,
    trailers: Option<HeaderMap>,
    /// Upstream error seen while prefetching, reported after the buffered data
    failed: Option<B::Error>,
    done: bool,
}

impl<B: Body<Data = Bytes>> FlushBody<B> {
    /// A zero interval flushes every frame as soon as it arrives
    pub fn new(inner: B, interval: Duration) -> Self {
        let ticker = (!interval.is_zero()).then(|| {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        Self {
            inner,
            buf: Vec::new(),
            ticker,
            trailers: None,
            failed: None,
            done: false,
        }
    }

    fn take_data(&mut self) -> Frame<Bytes> {
        Frame::data(Bytes::from(std::mem::take(&mut self.buf)))
    }

    fn push_frame(&mut self, frame: Frame<Bytes>) {
        match frame.into_data() {
            Ok(data) => self.buf.extend_from_slice(&data),
            Err(frame) => {
                if let Ok(trailers) = frame.into_trailers() {
                    self.trailers = Some(trailers);
                }
            }
        }
    }

    fn finish(&mut self) {
        self.done = true;
        self.ticker = None;
    }
}

// fields are never pinned in place
impl<B: Body> Unpin for FlushBody<B> {}

impl<B> FlushBody<B>
where
    B: Body<Data = Bytes> + Unpin,
{
    /// Reads ahead until the upstream body ends, `limit` bytes are held or
    /// `window` elapses. Returns the trailer field names when the whole body
    /// arrived in that time and ended with trailers.
    pub async fn prefetch_trailers(&mut self, limit: usize, window: Duration) -> Option<HeaderValue> {
        let deadline = tokio::time::Instant::now() + window;
        while !self.done && self.buf.len() < limit {
            let Ok(next) = tokio::time::timeout_at(deadline, self.inner.frame()).await else {
                break;
            };
            match next {
                Some(Ok(frame)) => self.push_frame(frame),
                Some(Err(e)) => {
                    self.failed = Some(e);
                    self.finish();
                }
                None => self.finish(),
            }
        }

        if !self.done {
            return None;
        }
        trailer_names(self.trailers.as_ref()?)
    }
}

impl<B> Body for FlushBody<B>
where
    B: Body<Data = Bytes> + Unpin,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        while !this.done {
            match Pin::new(&mut this.inner).poll_frame(cx) {
                Poll::Ready(Some(Ok(frame))) => {
                    this.push_frame(frame);
                    if this.buf.len() >= MAX_BUFFERED {
                        return Poll::Ready(Some(Ok(this.take_data())));
                    }
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                // copy finished, stop ticking
                Poll::Ready(None) => this.finish(),
                Poll::Pending => {
                    if this.buf.is_empty() {
                        return Poll::Pending;
                    }
                    return match this.ticker.as_mut() {
                        Some(ticker) => match ticker.poll_tick(cx) {
                            Poll::Ready(_) => Poll::Ready(Some(Ok(this.take_data()))),
                            Poll::Pending => Poll::Pending,
                        },
                        None => Poll::Ready(Some(Ok(this.take_data()))),
                    };
                }
            }
        }

        if !this.buf.is_empty() {
            return Poll::Ready(Some(Ok(this.take_data())));
        }
        if let Some(e) = this.failed.take() {
            return Poll::Ready(Some(Err(e)));
        }
        Poll::Ready(this.trailers.take().map(|t| Ok(Frame::trailers(t))))
    }

    fn is_end_stream(&self) -> bool {
        self.done && self.buf.is_empty() && self.failed.is_none() && self.trailers.is_none()
    }

    fn size_hint(&self) -> SizeHint {
        let inner = self.inner.size_hint();
        let buffered = self.buf.len() as u64;
        let mut hint = SizeHint::new();
        hint.set_lower(inner.lower() + buffered);
        if let Some(upper) = inner.upper() {
            hint.set_upper(upper + buffered);
        }
        hint
    }
}

/// How the HTTPS listener obtains its certificates
#[derive(Clone)]
pub enum TlsMode {
    /// One fixed certificate (PEM files or self-signed)
    Static(TlsAcceptor),
    /// Per-host certificates issued on demand
    Acme(Arc<AcmeManager>),
}

/// The listener loop
pub struct ProxyServer {
    bind_addr: SocketAddr,
    gateway: Arc<Gateway>,
    shutdown_rx: watch::Receiver<bool>,
    tls: Option<TlsMode>,
    /// If set, redirect all HTTP requests to this HTTPS port
    https_redirect_port: Option<u16>,
    /// ACME HTTP-01 challenges
    acme_challenges: Option<Http01Challenges>,
}

impl ProxyServer {
    pub fn new(bind_addr: SocketAddr, gateway: Arc<Gateway>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            gateway,
            shutdown_rx,
            tls: None,
            https_redirect_port: None,
            acme_challenges: None,
        }
    }

    pub fn with_tls(mut self, tls: TlsMode) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Enable HTTPS redirect: all HTTP requests will be redirected to HTTPS on the given port
    pub fn with_https_redirect(mut self, port: u16) -> Self {
        self.https_redirect_port = Some(port);
        self
    }

    /// Set ACME HTTP-01 challenge handler
    pub fn with_acme_challenges(mut self, challenges: Http01Challenges) -> Self {
        self.acme_challenges = Some(challenges);
        self
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls.is_some()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let protocol = if self.tls.is_some() { "HTTPS" } else { "HTTP" };
        info!(addr = %listener.local_addr()?, protocol, "Proxy server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let conn = Connection {
                                gateway: Arc::clone(&self.gateway),
                                addr,
                                https_redirect_port: self.https_redirect_port,
                                acme_challenges: self.acme_challenges.clone(),
                            };
                            let tls = self.tls.clone();

                            tokio::spawn(async move {
                                if let Err(e) = conn.accept(stream, tls).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

/// Per-connection state
struct Connection {
    gateway: Arc<Gateway>,
    addr: SocketAddr,
    https_redirect_port: Option<u16>,
    acme_challenges: Option<Http01Challenges>,
}

impl Connection {
    async fn accept(self, stream: TcpStream, tls: Option<TlsMode>) -> anyhow::Result<()> {
        match tls {
            None => self.serve(stream, false).await,
            Some(TlsMode::Static(acceptor)) => {
                let tls_stream = acceptor
                    .accept(stream)
                    .await
                    .map_err(|e| anyhow::anyhow!("TLS handshake failed: {}", e))?;
                self.serve(tls_stream, true).await
            }
            Some(TlsMode::Acme(manager)) => {
                let start = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream)
                    .await
                    .map_err(|e| anyhow::anyhow!("TLS handshake failed: {}", e))?;

                let hello = start.client_hello();
                let server_name = hello.server_name().map(str::to_lowercase);
                let challenge = hello
                    .alpn()
                    .map(|mut protos| protos.any(|p| p == ACME_TLS_ALPN_NAME))
                    .unwrap_or(false);

                let config = manager.server_config(server_name.as_deref(), challenge).await?;
                let tls_stream = start
                    .into_stream(config)
                    .await
                    .map_err(|e| anyhow::anyhow!("TLS handshake failed: {}", e))?;

                if challenge {
                    // the validation server only needs the handshake
                    debug!(?server_name, "Completed TLS-ALPN-01 handshake");
                    return Ok(());
                }
                self.serve(tls_stream, true).await
            }
        }
    }

    async fn serve<S>(self, stream: S, is_tls: bool) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);
        let conn = Arc::new(self);

        let service = service_fn(move |req: Request<Incoming>| {
            let conn = Arc::clone(&conn);
            async move { Ok::<_, hyper::Error>(conn.handle(req, is_tls).await) }
        });

        AutoBuilder::new(TokioExecutor::new())
            .http1()
            .preserve_header_case(true)
            .http2()
            .max_concurrent_streams(250)
            .serve_connection(io, service)
            .await
            .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

        Ok(())
    }

    async fn handle(&self, req: Request<Incoming>, is_tls: bool) -> Response<ProxyBody> {
        // ACME HTTP-01 challenges go before the HTTPS redirect
        if let Some(challenges) = &self.acme_challenges {
            if let Some(token) = req.uri().path().strip_prefix(ACME_CHALLENGE_PREFIX) {
                if let Some(key_auth) = challenges.get(token).await {
                    debug!(token, "Responding to ACME HTTP-01 challenge");
                    return text_response(StatusCode::OK, key_auth);
                }
            }
        }

        if let Some(redirect_port) = self.https_redirect_port {
            if !is_tls {
                return build_https_redirect(&req, redirect_port);
            }
        }

        self.gateway.dispatch(req, self.addr, is_tls).await
    }
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<ProxyBody> {
    let mut response = Response::new(Full::new(body.into()).map_err(|never| match never {}).boxed());
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain"),
    );
    response
}

/// Build an HTTPS redirect response (301 Moved Permanently)
fn build_https_redirect<B>(req: &Request<B>, https_port: u16) -> Response<ProxyBody> {
    let host = extract_hostname(req).unwrap_or_else(|| "localhost".to_string());
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    let location = if https_port == 443 {
        format!("https://{}{}", host, path)
    } else {
        format!("https://{}:{}{}", host, https_port, path)
    };

    let mut response = text_response(StatusCode::MOVED_PERMANENTLY, "Redirecting to HTTPS");
    if let Ok(value) = HeaderValue::from_str(&location) {
        response.headers_mut().insert(hyper::header::LOCATION, value);
    }
    response
}
