//! Error types, upstream failure classification, and the error responses the
//! preview proxy hands back to browsers.

use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::header::{CACHE_CONTROL, CONTENT_TYPE, RETRY_AFTER};
use hyper::{Response, StatusCode};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Error carried by response bodies: upstream read failures, local file
/// errors, or a stalled transfer
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type of every response produced by the gateway
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

/// Header carrying the machine-readable error code
pub const X_PROXY_ERROR: &str = "x-proxy-error";

pub fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed_unsync()
}

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed_unsync()
}

/// Error codes for gateway responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Request is not preview traffic and nothing else handled it
    NotFound,
    /// Admin API request without a valid bearer token
    Unauthorized,
    /// No dev server port could be resolved for the project
    PreviewNotReady,
    /// Dev server is not (yet) accepting connections
    PreviewStarting,
    /// Dev server failed after it had been running
    PreviewProxyError,
    /// Internal gateway error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::NotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ProxyErrorCode::PreviewNotReady => StatusCode::CONFLICT,
            ProxyErrorCode::PreviewStarting => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::PreviewProxyError => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::NotFound => "NOT_FOUND",
            ProxyErrorCode::Unauthorized => "UNAUTHORIZED",
            ProxyErrorCode::PreviewNotReady => "PREVIEW_NOT_READY",
            ProxyErrorCode::PreviewStarting => "PREVIEW_STARTING",
            ProxyErrorCode::PreviewProxyError => "PREVIEW_PROXY_ERROR",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(code: ProxyErrorCode, message: impl Into<String>) -> Response<ProxyBody> {
    let body = ErrorResponse::new(code, message).to_json();

    Response::builder()
        .status(code.status_code())
        .header(CONTENT_TYPE, "application/json")
        .header(X_PROXY_ERROR, code.as_header_value())
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static headers")
}

/// Which placeholder the embedding editor should see
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderKind {
    /// Dev server has not come up yet (or is coming back up)
    Starting,
    /// Dev server was running and the proxy could not reach it
    ProxyError,
}

impl PlaceholderKind {
    /// Title the editor keys off; these strings are a stable contract
    pub fn title(&self) -> &'static str {
        match self {
            PlaceholderKind::Starting => "Preview starting",
            PlaceholderKind::ProxyError => "Preview proxy error",
        }
    }

    pub fn code(&self) -> ProxyErrorCode {
        match self {
            PlaceholderKind::Starting => ProxyErrorCode::PreviewStarting,
            PlaceholderKind::ProxyError => ProxyErrorCode::PreviewProxyError,
        }
    }
}

/// Invisible page that only carries a title and reloads itself
pub fn placeholder_html(kind: PlaceholderKind, reload_delay_ms: u64) -> String {
    format!(
        "<!doctype html>\n<html><head><meta charset=\"utf-8\"><title>{}</title></head>\
         <body><script>setTimeout(() => location.reload(), {})</script></body></html>\n",
        kind.title(),
        reload_delay_ms
    )
}

/// Placeholder for a failed upstream call. HTML clients get the self-reloading
/// page, everyone else a one-line text body.
pub fn placeholder_response(
    kind: PlaceholderKind,
    wants_html: bool,
    reload_delay_ms: u64,
) -> Response<ProxyBody> {
    let code = kind.code();
    let mut builder = Response::builder()
        .status(code.status_code())
        .header(CACHE_CONTROL, "no-store")
        .header(X_PROXY_ERROR, code.as_header_value());

    if kind == PlaceholderKind::Starting {
        builder = builder.header(RETRY_AFTER, "1");
    }

    let response = if wants_html {
        builder
            .header(CONTENT_TYPE, "text/html; charset=utf-8")
            .body(full_body(placeholder_html(kind, reload_delay_ms)))
    } else {
        builder
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(full_body(format!("{}\n", kind.title())))
    };

    response.expect("valid placeholder response with static headers")
}

/// Empty 409 returned when no dev server port is known; the editor draws its
/// own loading state on top of it
pub fn not_ready_response() -> Response<ProxyBody> {
    let code = ProxyErrorCode::PreviewNotReady;
    Response::builder()
        .status(code.status_code())
        .header(CONTENT_TYPE, "text/html; charset=utf-8")
        .header(CACHE_CONTROL, "no-store")
        .header(X_PROXY_ERROR, code.as_header_value())
        .body(empty_body())
        .expect("valid response with StatusCode enum and static headers")
}

/// Connection failures that feed bad-port memory and auto-restart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCode {
    ConnectionRefused,
    ConnectionReset,
    BrokenPipe,
    TimedOut,
    HostUnreachable,
    NotFound,
}

static FAILURE_MESSAGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"(?i)(econnrefused|connection refused)",
        r"|(econnreset|connection reset|socket hang up|connection closed before message completed)",
        r"|(epipe|broken pipe)",
        r"|(etimedout|timed out)",
        r"|(ehostunreach|host unreachable|no route to host)",
        r"|(enotfound|dns error|failed to lookup address)",
    ))
    .expect("Invalid regex pattern for upstream failure messages")
});

impl FailureCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCode::ConnectionRefused => "ECONNREFUSED",
            FailureCode::ConnectionReset => "ECONNRESET",
            FailureCode::BrokenPipe => "EPIPE",
            FailureCode::TimedOut => "ETIMEDOUT",
            FailureCode::HostUnreachable => "EHOSTUNREACH",
            FailureCode::NotFound => "ENOTFOUND",
        }
    }

    /// Classify an OS error number
    #[cfg(unix)]
    pub fn from_errno(errno: i32) -> Option<Self> {
        match errno {
            libc::ECONNREFUSED => Some(FailureCode::ConnectionRefused),
            libc::ECONNRESET => Some(FailureCode::ConnectionReset),
            libc::EPIPE => Some(FailureCode::BrokenPipe),
            libc::ETIMEDOUT => Some(FailureCode::TimedOut),
            libc::EHOSTUNREACH => Some(FailureCode::HostUnreachable),
            _ => None,
        }
    }

    #[cfg(not(unix))]
    pub fn from_errno(errno: i32) -> Option<Self> {
        Self::from_kind(std::io::Error::from_raw_os_error(errno).kind())
    }

    fn from_kind(kind: std::io::ErrorKind) -> Option<Self> {
        use std::io::ErrorKind;
        match kind {
            ErrorKind::ConnectionRefused => Some(FailureCode::ConnectionRefused),
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => {
                Some(FailureCode::ConnectionReset)
            }
            ErrorKind::BrokenPipe => Some(FailureCode::BrokenPipe),
            ErrorKind::TimedOut => Some(FailureCode::TimedOut),
            _ => None,
        }
    }

    /// Case-insensitive match against an error message
    pub fn from_message(message: &str) -> Option<Self> {
        let captures = FAILURE_MESSAGE.captures(message)?;
        const CODES: [FailureCode; 6] = [
            FailureCode::ConnectionRefused,
            FailureCode::ConnectionReset,
            FailureCode::BrokenPipe,
            FailureCode::TimedOut,
            FailureCode::HostUnreachable,
            FailureCode::NotFound,
        ];
        CODES
            .iter()
            .enumerate()
            .find(|(idx, _)| captures.get(idx + 1).is_some())
            .map(|(_, code)| *code)
    }
}

impl std::fmt::Display for FailureCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify an error chain. An OS error number anywhere in the chain decides
/// on its own; otherwise the joined messages are matched.
pub fn classify_failure(err: &(dyn std::error::Error + 'static)) -> Option<FailureCode> {
    let mut messages = Vec::new();
    let mut current = Some(err);

    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if let Some(errno) = io.raw_os_error() {
                return FailureCode::from_errno(errno);
            }
            if let Some(code) = FailureCode::from_kind(io.kind()) {
                return Some(code);
            }
        }
        messages.push(e.to_string());
        current = e.source();
    }

    FailureCode::from_message(&messages.join(": "))
}

/// Failure talking to a dev server
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream request failed: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),

    #[error("upstream did not respond within {0:?}")]
    Timeout(Duration),

    #[error("failed to read upstream body: {0}")]
    Body(#[source] hyper::Error),

    #[error("upstream i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to build upstream request: {0}")]
    RequestBuild(String),

    #[error("invalid upgrade response from upstream")]
    InvalidUpgradeResponse,
}

impl UpstreamError {
    /// Connection-failure class of this error, if any
    pub fn failure_code(&self) -> Option<FailureCode> {
        match self {
            UpstreamError::Timeout(_) => Some(FailureCode::TimedOut),
            UpstreamError::RequestBuild(_) | UpstreamError::InvalidUpgradeResponse => None,
            other => classify_failure(other),
        }
    }
}

/// Errors surfaced to the host server. Returning one from a service closes the
/// client connection.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("upgrade for project {project_id} could not be forwarded; socket destroyed")]
    SocketDestroyed { project_id: String },
}
