//! Client-facing proxy errors and their JSON responses

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde::Serialize;

pub const PROXY_ERROR_HEADER: HeaderName = HeaderName::from_static("x-proxy-error");

/// Every way the dispatcher can refuse or fail a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorCode {
    /// Missing Host header in request
    MissingHostHeader,
    /// Forwarding headers could not be built from the peer address
    BadRemoteAddress,
    /// No service registered for the host
    UnknownHost,
    /// No service registered for the path under a known host
    UnknownPath,
    /// Matching pool has no members
    NoInstance,
    /// `www.` host for a service that did not opt in
    WwwNotAllowed,
    /// Container behind the route is not running
    BackendInactive,
    /// Backend has not declared itself ready
    BackendNotReady,
    /// Outbound URL could not be built
    UpstreamUrl,
    /// Connecting to or talking with the backend failed
    UpstreamFailed,
    /// Backend did not answer in time
    RequestTimeout,
}

impl ProxyErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::MissingHostHeader | ProxyErrorCode::BadRemoteAddress => {
                StatusCode::BAD_REQUEST
            }
            ProxyErrorCode::UnknownHost
            | ProxyErrorCode::UnknownPath
            | ProxyErrorCode::NoInstance
            | ProxyErrorCode::WwwNotAllowed => StatusCode::NOT_FOUND,
            ProxyErrorCode::BackendInactive => StatusCode::SERVICE_UNAVAILABLE,
            // 425 Too Early
            ProxyErrorCode::BackendNotReady => {
                StatusCode::from_u16(425).unwrap_or(StatusCode::SERVICE_UNAVAILABLE)
            }
            ProxyErrorCode::UpstreamUrl | ProxyErrorCode::UpstreamFailed => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Value of the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ProxyErrorCode::BadRemoteAddress => "BAD_REMOTE_ADDRESS",
            ProxyErrorCode::UnknownHost => "UNKNOWN_HOST",
            ProxyErrorCode::UnknownPath => "UNKNOWN_PATH",
            ProxyErrorCode::NoInstance => "NO_INSTANCE",
            ProxyErrorCode::WwwNotAllowed => "WWW_NOT_ALLOWED",
            ProxyErrorCode::BackendInactive => "BACKEND_INACTIVE",
            ProxyErrorCode::BackendNotReady => "BACKEND_NOT_READY",
            ProxyErrorCode::UpstreamUrl => "UPSTREAM_URL",
            ProxyErrorCode::UpstreamFailed => "UPSTREAM_FAILED",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| format!(r#"{{"error":"{}"}}"#, self.error.replace('"', "\\\"")))
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = ErrorResponse::new(message).to_json();

    let mut response = Response::new(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed());
    *response.status_mut() = code.status_code();
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        PROXY_ERROR_HEADER,
        HeaderValue::from_static(code.as_header_value()),
    );
    response
}
