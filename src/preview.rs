//! Preview proxy engine.
//!
//! Requests that belong to a project (see [`crate::route`]) are forwarded to
//! the project's frontend dev server. HTML documents are buffered so the
//! bridge script can be injected; everything else streams through. Upstream
//! failures are classified, remembered, and may trigger an auto-restart.

use crate::config::PreviewSettings;
use crate::error::{
    empty_body, full_body, not_ready_response, placeholder_response, BoxError, FailureCode,
    PlaceholderKind, ProxyBody, ProxyError, UpstreamError,
};
use crate::pool::{upstream_authority, upstream_uri, ConnectionPool};
use crate::project::{ProcessRegistry, ProcessState, ProjectLauncher, ProjectStore};
use crate::restart::AutoRestartController;
use crate::rewrite::{inject_preview_bridge_bytes, is_html_response, strip_csp_headers, BridgeOptions};
use crate::route::{affinity_cookie, ProjectRouteInfo, RouteClassifier, RouteSource};
use crate::target::TargetResolver;
use crate::uploads::try_serve_project_upload;
use http_body_util::BodyExt;
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper::header::{
    HeaderName, HeaderValue, ACCEPT, ACCEPT_ENCODING, CONNECTION, CONTENT_ENCODING,
    CONTENT_LENGTH, HOST, SET_COOKIE, UPGRADE,
};
use hyper::{HeaderMap, Method, Request, Response, StatusCode, Version};
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{Instant, Sleep};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
/// Fetch metadata header sent by browsers for frame navigations
const SEC_FETCH_DEST: &str = "sec-fetch-dest";

/// Headers that only describe a single hop
const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Largest upgrade response head accepted from a dev server
const MAX_UPGRADE_HEAD_BYTES: usize = 16 * 1024;

/// Outcome of offering a request to the preview proxy
pub enum Dispatch {
    /// The request was preview traffic and has been answered
    Handled(Response<ProxyBody>),
    /// Not preview traffic; the host server should handle it
    Next(Request<Incoming>),
}

/// Which project, prefix and port one proxied call belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewRouteContext {
    pub preview_prefix: String,
    pub project_id: String,
    pub port: u16,
}

impl PreviewRouteContext {
    fn new(route: &ProjectRouteInfo, port: u16) -> Self {
        Self {
            preview_prefix: route.preview_prefix(),
            project_id: route.project_id.clone(),
            port,
        }
    }
}

/// The preview proxy. One instance owns all per-project proxy state.
pub struct PreviewProxy {
    settings: PreviewSettings,
    classifier: RouteClassifier,
    resolver: TargetResolver,
    restarts: Arc<AutoRestartController>,
    pool: Arc<ConnectionPool>,
    store: Arc<dyn ProjectStore>,
    registry: Arc<dyn ProcessRegistry>,
}

impl PreviewProxy {
    pub fn new(
        settings: PreviewSettings,
        pool: Arc<ConnectionPool>,
        store: Arc<dyn ProjectStore>,
        registry: Arc<dyn ProcessRegistry>,
        launcher: Arc<dyn ProjectLauncher>,
    ) -> Self {
        let classifier = RouteClassifier::new(settings.bypass_prefixes.clone());
        let resolver = TargetResolver::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            settings.bad_port_ttl(),
            settings.target_host.clone(),
        );
        let restarts = Arc::new(AutoRestartController::new(
            &settings,
            Arc::clone(&store),
            Arc::clone(&registry),
            launcher,
        ));

        Self {
            settings,
            classifier,
            resolver,
            restarts,
            pool,
            store,
            registry,
        }
    }

    pub fn resolver(&self) -> &TargetResolver {
        &self.resolver
    }

    pub fn restarts(&self) -> &Arc<AutoRestartController> {
        &self.restarts
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Middleware entry point. Upgrade requests are forwarded as raw sockets;
    /// an error means the client connection must be dropped.
    pub async fn handle_request(
        &self,
        req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> Result<Dispatch, ProxyError> {
        let Some(route) = self.classifier.classify_request(&req) else {
            return Ok(Dispatch::Next(req));
        };

        debug!(
            project_id = %route.project_id,
            source = ?route.source,
            method = %req.method(),
            forward_path = %route.forward_path,
            "Preview request"
        );

        if is_upgrade_request(&req) {
            return self
                .proxy_upgrade(req, &route, client_addr)
                .await
                .map(Dispatch::Handled);
        }

        Ok(Dispatch::Handled(
            self.proxy_web_request(req, &route, client_addr).await,
        ))
    }

    /// Forward one HTTP request. Never fails; problems become placeholder
    /// responses.
    pub async fn proxy_web_request(
        &self,
        req: Request<Incoming>,
        route: &ProjectRouteInfo,
        client_addr: SocketAddr,
    ) -> Response<ProxyBody> {
        let project_id = route.project_id.as_str();

        if req.method() == Method::GET || req.method() == Method::HEAD {
            if let Some(response) =
                try_serve_project_upload(self.store.as_ref(), project_id, &route.forward_path).await
            {
                return response;
            }
        }

        let Some(port) = self.resolver.resolve_frontend_port(project_id).await else {
            debug!(project_id, "No frontend port known, preview not ready");
            return not_ready_response();
        };

        let ctx = PreviewRouteContext::new(route, port);
        let host = self.resolver.resolve_target_host(req.headers());
        let wants_html = wants_html(req.headers());
        let request_id = request_id(req.headers());

        let timeout = self.settings.proxy_timeout();
        let result = match build_upstream_request(
            req,
            &host,
            port,
            &route.forward_path,
            client_addr,
            &request_id,
        ) {
            Ok(upstream_req) => {
                match tokio::time::timeout(timeout, self.forward(upstream_req, &ctx)).await {
                    Ok(result) => result,
                    Err(_) => Err(UpstreamError::Timeout(timeout)),
                }
            }
            Err(e) => Err(e),
        };

        let mut response = match result {
            Ok(response) => response,
            Err(e) => self.handle_proxy_failure(&ctx, wants_html, &e),
        };

        // Only path-routed requests establish affinity; cookie-routed ones already have it
        if route.source == RouteSource::Path {
            if let Ok(cookie) = HeaderValue::from_str(&affinity_cookie(project_id)) {
                response.headers_mut().append(SET_COOKIE, cookie);
            }
        }

        response
    }

    async fn forward(
        &self,
        req: Request<Incoming>,
        ctx: &PreviewRouteContext,
    ) -> Result<Response<ProxyBody>, UpstreamError> {
        let response = self.pool.send_request(req).await?;
        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);

        if !is_html_response(&parts.headers) {
            parts.headers.remove(CONTENT_LENGTH);
            let body = StalledBodyTimeout::new(body, self.settings.proxy_timeout());
            return Ok(Response::from_parts(parts, body.boxed_unsync()));
        }

        let bytes = body.collect().await.map_err(UpstreamError::Body)?.to_bytes();
        strip_csp_headers(&mut parts.headers);

        if bytes.is_empty() || is_encoded(&parts.headers) {
            return Ok(Response::from_parts(parts, full_body(bytes)));
        }

        let options = BridgeOptions::from_settings(ctx.preview_prefix.clone(), &self.settings);
        let rewritten = inject_preview_bridge_bytes(&bytes, &options);
        parts.headers.insert(CONTENT_LENGTH, HeaderValue::from(rewritten.len()));

        debug!(
            project_id = %ctx.project_id,
            port = ctx.port,
            original_len = bytes.len(),
            rewritten_len = rewritten.len(),
            "Injected preview bridge"
        );

        Ok(Response::from_parts(parts, full_body(rewritten)))
    }

    /// Placeholder for a failed forward, plus the side effects of a
    /// classified connection failure
    fn handle_proxy_failure(
        &self,
        ctx: &PreviewRouteContext,
        wants_html: bool,
        err: &UpstreamError,
    ) -> Response<ProxyBody> {
        let (code, starting) = self.note_upstream_failure(ctx, err);

        if wants_html && code.is_some() && self.restarts.should_attempt_auto_restart(&ctx.project_id)
        {
            info!(project_id = %ctx.project_id, "Repeated preview failures, scheduling auto-restart");
            let restarts = Arc::clone(&self.restarts);
            let project_id = ctx.project_id.clone();
            tokio::spawn(async move {
                restarts.attempt_auto_restart(&project_id).await;
            });
        }

        let kind = if starting {
            PlaceholderKind::Starting
        } else {
            PlaceholderKind::ProxyError
        };
        placeholder_response(kind, wants_html, self.settings.reload_delay_ms)
    }

    /// Remember the bad port and drop a dead frontend from the registry.
    /// Returns the failure class and whether the project looked like it was
    /// still starting when the failure happened.
    fn note_upstream_failure(
        &self,
        ctx: &PreviewRouteContext,
        err: &UpstreamError,
    ) -> (Option<FailureCode>, bool) {
        let project_id = ctx.project_id.as_str();
        let entry = self.registry.get_running_process_entry(project_id);
        let starting = entry
            .as_ref()
            .map(|e| e.state != ProcessState::Running || e.processes.frontend.is_none())
            .unwrap_or(true);

        let code = err.failure_code();
        match code {
            Some(code) => {
                warn!(
                    project_id,
                    port = ctx.port,
                    code = %code,
                    error = %err,
                    "Preview upstream connection failed"
                );
                self.resolver.remember_bad_frontend_port(project_id, ctx.port);

                if let Some(entry) = entry.filter(|e| e.processes.frontend.is_some()) {
                    debug!(project_id, "Clearing dead frontend from process registry");
                    self.registry
                        .store_running_processes(project_id, entry.without_frontend());
                }
            }
            None => {
                warn!(project_id, port = ctx.port, error = %err, "Preview proxy error");
            }
        }

        (code, starting)
    }

    /// Forward a WebSocket (or other) upgrade over a raw TCP connection
    pub async fn proxy_upgrade(
        &self,
        req: Request<Incoming>,
        route: &ProjectRouteInfo,
        client_addr: SocketAddr,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let project_id = route.project_id.clone();
        let destroyed = || ProxyError::SocketDestroyed {
            project_id: project_id.clone(),
        };

        let Some(port) = self.resolver.resolve_upgrade_port(&project_id).await else {
            warn!(project_id = %project_id, "No frontend port for upgrade, destroying socket");
            return Err(destroyed());
        };

        let ctx = PreviewRouteContext::new(route, port);
        let host = self.resolver.resolve_target_host(req.headers());
        let request_id = request_id(req.headers());
        let upgrade_type = req
            .headers()
            .get(UPGRADE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_lowercase())
            .unwrap_or_else(|| "unknown".to_string());

        let raw_request = build_upgrade_request(&req, &route.forward_path, client_addr, &request_id);
        let timeout = self.settings.proxy_timeout();
        let opened = match tokio::time::timeout(timeout, open_upgrade(&host, port, &raw_request)).await
        {
            Ok(result) => result,
            Err(_) => Err(UpstreamError::Timeout(timeout)),
        };

        let (mut upstream, head, leftover) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                self.note_upstream_failure(&ctx, &e);
                return Err(destroyed());
            }
        };

        let Some((status, headers)) = parse_upgrade_response(&head) else {
            warn!(project_id = %project_id, port, "Invalid upgrade response from dev server");
            return Err(destroyed());
        };

        if status != StatusCode::SWITCHING_PROTOCOLS {
            debug!(project_id = %project_id, port, status = %status, "Dev server rejected upgrade");
            let mut response = Response::builder().status(status);
            for (name, value) in &headers {
                let name_lower = name.to_lowercase();
                if name_lower == "content-length" || name_lower == "transfer-encoding" {
                    continue;
                }
                if let Ok(hv) = HeaderValue::from_str(value) {
                    response = response.header(name.as_str(), hv);
                }
            }
            return response.body(full_body(leftover)).map_err(|_| destroyed());
        }

        info!(
            project_id = %project_id,
            port,
            request_id,
            upgrade_type,
            "Upgrade accepted by dev server"
        );

        let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
        for (name, value) in &headers {
            let name_lower = name.to_lowercase();
            if name_lower == "content-length" || name_lower == "transfer-encoding" {
                continue;
            }
            if let Ok(hv) = HeaderValue::from_str(value) {
                response = response.header(name.as_str(), hv);
            }
        }
        let response = response.body(empty_body()).map_err(|_| destroyed())?;

        let task_project_id = project_id.clone();
        tokio::spawn(async move {
            let upgraded = match hyper::upgrade::on(req).await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    warn!(project_id = %task_project_id, error = %e, "Failed to upgrade client connection");
                    return;
                }
            };

            let mut client_io = TokioIo::new(upgraded);
            if !leftover.is_empty() {
                if let Err(e) = client_io.write_all(&leftover).await {
                    debug!(project_id = %task_project_id, error = %e, "Client closed before upgrade data");
                    return;
                }
            }

            match tokio::io::copy_bidirectional(&mut client_io, &mut upstream).await {
                Ok((client_to_upstream, upstream_to_client)) => {
                    debug!(
                        project_id = %task_project_id,
                        client_to_upstream,
                        upstream_to_client,
                        "Upgraded connection closed"
                    );
                }
                Err(e) => {
                    debug!(project_id = %task_project_id, error = %e, "Upgraded connection closed with error");
                }
            }
        });

        Ok(response)
    }
}

/// Streamed upstream body that fails once no frame has arrived for `timeout`
pub struct StalledBodyTimeout<B> {
    inner: B,
    timeout: Duration,
    deadline: Pin<Box<Sleep>>,
    expired: bool,
}

impl<B> StalledBodyTimeout<B> {
    pub fn new(inner: B, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            deadline: Box::pin(tokio::time::sleep(timeout)),
            expired: false,
        }
    }
}

impl<B> Body for StalledBodyTimeout<B>
where
    B: Body<Data = hyper::body::Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    type Data = hyper::body::Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if this.expired {
            return Poll::Ready(None);
        }

        if let Poll::Ready(frame) = Pin::new(&mut this.inner).poll_frame(cx) {
            if matches!(frame, Some(Ok(_))) {
                let next = Instant::now() + this.timeout;
                this.deadline.as_mut().reset(next);
            }
            return Poll::Ready(frame.map(|result| result.map_err(Into::into)));
        }

        if this.deadline.as_mut().poll(cx).is_ready() {
            this.expired = true;
            debug!(timeout_ms = this.timeout.as_millis() as u64, "Upstream body stalled, aborting");
            let err: BoxError = Box::new(UpstreamError::Timeout(this.timeout));
            return Poll::Ready(Some(Err(err)));
        }

        Poll::Pending
    }

    fn is_end_stream(&self) -> bool {
        self.expired || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// True for HTML-accepting clients and iframe navigations
pub fn wants_html(headers: &HeaderMap) -> bool {
    let accepts_html = headers
        .get_all(ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains("text/html"));

    let iframe_navigation = headers
        .get(SEC_FETCH_DEST)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("iframe"))
        .unwrap_or(false);

    accepts_html || iframe_navigation
}

/// Check if a request is a WebSocket upgrade request
pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_lowercase().contains("upgrade"));

    has_upgrade_connection && req.headers().contains_key(UPGRADE)
}

fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn is_encoded(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| !v.trim().is_empty() && !v.trim().eq_ignore_ascii_case("identity"))
        .unwrap_or(false)
}

/// Remove hop-by-hop headers, including any named in `Connection`
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

/// Overwrite forwarding headers. This proxy is assumed to be the first
/// trusted hop, so client-supplied values are never appended to.
fn set_forwarding_headers(
    headers: &mut HeaderMap,
    client_addr: SocketAddr,
    original_host: Option<HeaderValue>,
    request_id: &str,
) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    match original_host {
        Some(host) => {
            headers.insert(X_FORWARDED_HOST, host);
        }
        None => {
            headers.remove(X_FORWARDED_HOST);
        }
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
}

/// Turn the inbound request into the request sent to the dev server. The
/// original `Host` header is kept.
fn build_upstream_request<B>(
    req: Request<B>,
    host: &str,
    port: u16,
    forward_path: &str,
    client_addr: SocketAddr,
    request_id: &str,
) -> Result<Request<B>, UpstreamError> {
    let uri = upstream_uri(host, port, forward_path)?;
    let (mut parts, body) = req.into_parts();

    let original_host = parts.headers.get(HOST).cloned().or_else(|| {
        parts
            .uri
            .authority()
            .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
    });

    strip_hop_by_hop(&mut parts.headers);
    // Uncompressed bodies keep HTML rewritable
    parts.headers.remove(ACCEPT_ENCODING);
    set_forwarding_headers(&mut parts.headers, client_addr, original_host.clone(), request_id);
    if let Some(host_value) = original_host {
        parts.headers.insert(HOST, host_value);
    }

    parts.uri = uri;
    parts.version = Version::HTTP_11;
    parts.extensions.clear();

    Ok(Request::from_parts(parts, body))
}

/// Build the raw HTTP/1.1 upgrade request sent to the dev server
fn build_upgrade_request<B>(
    req: &Request<B>,
    forward_path: &str,
    client_addr: SocketAddr,
    request_id: &str,
) -> Vec<u8> {
    let mut headers = req.headers().clone();
    let original_host = headers.get(HOST).cloned();
    set_forwarding_headers(&mut headers, client_addr, original_host, request_id);

    let mut raw = format!("{} {} HTTP/1.1\r\n", req.method(), forward_path).into_bytes();
    for (name, value) in &headers {
        raw.extend_from_slice(name.as_str().as_bytes());
        raw.extend_from_slice(b": ");
        raw.extend_from_slice(value.as_bytes());
        raw.extend_from_slice(b"\r\n");
    }
    raw.extend_from_slice(b"\r\n");
    raw
}

/// Connect, send the upgrade request and read the response head. Returns the
/// stream, the head, and any bytes that arrived after it.
async fn open_upgrade(
    host: &str,
    port: u16,
    raw_request: &[u8],
) -> Result<(TcpStream, Vec<u8>, Vec<u8>), UpstreamError> {
    debug!(authority = %upstream_authority(host, port), "Opening upgrade connection");
    let mut stream = TcpStream::connect((host, port)).await?;
    stream.set_nodelay(true)?;
    stream.write_all(raw_request).await?;

    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(UpstreamError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "socket hang up",
            )));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let leftover = buf.split_off(pos + 4);
            return Ok((stream, buf, leftover));
        }
        if buf.len() > MAX_UPGRADE_HEAD_BYTES {
            return Err(UpstreamError::InvalidUpgradeResponse);
        }
    }
}

/// Parse a response head: status line plus headers
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    // HTTP/1.1 101 Switching Protocols
    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 || !parts[0].starts_with("HTTP/") {
        return None;
    }

    let status_code: u16 = parts[1].parse().ok()?;
    let status = StatusCode::from_u16(status_code).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}
