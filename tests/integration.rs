//! Integration tests for Previewgate

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use previewgate::config::{DevServerConfig, PortSettings, PreviewSettings, ProjectConfig};
use previewgate::local::{InMemoryRegistry, LocalProjects};
use previewgate::pool::{ConnectionPool, PoolConfig};
use previewgate::preview::PreviewProxy;
use previewgate::project::{
    LaunchType, ProcessInfo, ProcessRegistry, ProcessSet, ProcessState, ProjectLauncher,
    ProjectStore, RunningProcessEntry, StartOptions, StartOutcome,
};
use previewgate::proxy::ProxyServer;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

// ============================================================================
// Upstream dev servers
// ============================================================================

type Handler = Arc<dyn Fn(&Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync>;

#[derive(Debug, Clone)]
struct SeenRequest {
    path: String,
    headers: HeaderMap,
}

/// In-process HTTP/1.1 server standing in for a dev server
struct Upstream {
    port: u16,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
}

impl Upstream {
    fn seen(&self) -> Vec<SeenRequest> {
        self.seen.lock().clone()
    }
}

async fn spawn_upstream(handler: Handler) -> Upstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let task_seen = Arc::clone(&seen);

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let handler = Arc::clone(&handler);
            let seen = Arc::clone(&task_seen);
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    seen.lock().push(SeenRequest {
                        path: req
                            .uri()
                            .path_and_query()
                            .map(|p| p.to_string())
                            .unwrap_or_default(),
                        headers: req.headers().clone(),
                    });
                    let response = handler(&req);
                    async move { Ok::<_, Infallible>(response) }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    Upstream { port, seen }
}

const APP_HTML: &str =
    "<!doctype html><html><head><title>App</title></head><body><div id=\"root\"></div></body></html>";

fn html_handler() -> Handler {
    Arc::new(|_req| {
        Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/html; charset=utf-8")
            .header("content-security-policy", "default-src 'self'")
            .body(Full::new(Bytes::from(APP_HTML)))
            .unwrap()
    })
}

fn js_handler() -> Handler {
    Arc::new(|_req| {
        Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/javascript")
            .header("content-security-policy", "default-src 'self'")
            .body(Full::new(Bytes::from("export const answer = 42;")))
            .unwrap()
    })
}

/// Raw TCP server that accepts every upgrade and echoes bytes afterwards
async fn spawn_upgrade_echo() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let head = read_head(&mut stream).await;
                if !head.to_lowercase().contains("upgrade: websocket") {
                    return;
                }
                let reply = "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
                if stream.write_all(reply.as_bytes()).await.is_err() {
                    return;
                }
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    port
}

/// Read up to and including the blank line ending an HTTP head
async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(0) | Err(_) => break,
            Ok(_) => head.push(byte[0]),
        }
    }
    String::from_utf8_lossy(&head).into_owned()
}

/// A port nothing listens on
async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

/// Upstream that accepts connections and never answers
async fn spawn_silent_upstream() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    port
}

/// Upstream that sends a response head and part of the body, then stalls
async fn spawn_stalling_upstream() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((mut stream, _)) = listener.accept().await {
            let _ = read_head(&mut stream).await;
            let _ = stream
                .write_all(
                    b"HTTP/1.1 200 OK\r\nContent-Type: application/javascript\r\nContent-Length: 100\r\n\r\npartial",
                )
                .await;
            held.push(stream);
        }
    });
    port
}

// ============================================================================
// Gateway harness
// ============================================================================

/// Launcher that "starts" a project by pointing it at an already running
/// upstream
struct MockLauncher {
    frontend_port: u16,
    starts: AtomicUsize,
    terminations: AtomicUsize,
}

impl MockLauncher {
    fn new(frontend_port: u16) -> Self {
        Self {
            frontend_port,
            starts: AtomicUsize::new(0),
            terminations: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ProjectLauncher for MockLauncher {
    async fn terminate_running_processes(&self, _project_id: &str) -> anyhow::Result<()> {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn start_project(
        &self,
        _project_id: &str,
        _project_path: &Path,
        _options: StartOptions,
    ) -> anyhow::Result<StartOutcome> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(StartOutcome {
            success: true,
            processes: ProcessSet {
                frontend: Some(ProcessInfo {
                    pid: None,
                    port: self.frontend_port,
                }),
                backend: None,
            },
        })
    }
}

struct Gateway {
    port: u16,
    registry: Arc<InMemoryRegistry>,
    store: Arc<LocalProjects>,
    preview: Arc<PreviewProxy>,
    shutdown_tx: watch::Sender<bool>,
}

impl Gateway {
    fn mark_running(&self, project_id: &str, frontend_port: u16) {
        self.registry.store_running_processes(
            project_id,
            RunningProcessEntry::new(
                ProcessSet {
                    frontend: Some(ProcessInfo {
                        pid: Some(4242),
                        port: frontend_port,
                    }),
                    backend: None,
                },
                ProcessState::Running,
                LaunchType::Manual,
            ),
        );
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn start_gateway(
    projects: HashMap<String, ProjectConfig>,
    launcher: Arc<dyn ProjectLauncher>,
) -> Gateway {
    start_gateway_with_settings(projects, launcher, PreviewSettings::default()).await
}

async fn start_gateway_with_settings(
    projects: HashMap<String, ProjectConfig>,
    launcher: Arc<dyn ProjectLauncher>,
    settings: PreviewSettings,
) -> Gateway {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let registry = Arc::new(InMemoryRegistry::new());
    let store = Arc::new(LocalProjects::new(projects, PortSettings::default()));

    let pool = Arc::new(ConnectionPool::new(PoolConfig {
        connect_timeout: Some(settings.proxy_timeout()),
        ..PoolConfig::default()
    }));
    let preview = Arc::new(PreviewProxy::new(
        settings,
        pool,
        store.clone(),
        registry.clone(),
        launcher,
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    let server = ProxyServer::new(addr, Arc::clone(&preview), shutdown_rx);
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    Gateway {
        port: addr.port(),
        registry,
        store,
        preview,
        shutdown_tx,
    }
}

fn project_at(path: &Path, frontend_port: Option<u16>) -> HashMap<String, ProjectConfig> {
    let mut frontend = DevServerConfig::new("npm").with_args(vec!["run".into(), "dev".into()]);
    if let Some(port) = frontend_port {
        frontend = frontend.with_port(port);
    }
    let mut projects = HashMap::new();
    projects.insert(
        "p1".to_string(),
        ProjectConfig::new(path).with_frontend(frontend),
    );
    projects
}

/// Send a request with `Connection: close` and return the raw response
async fn http_request(
    port: u16,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
) -> Result<String, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;

    let mut request = format!(
        "{} {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: close\r\n",
        method, path, port
    );
    for (name, value) in headers {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

/// Lowercased head and raw body of a response
fn split_response(response: &str) -> (String, String) {
    let (head, body) = response.split_once("\r\n\r\n").unwrap_or((response, ""));
    (head.to_lowercase(), body.to_string())
}

async fn wait_for<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

// ============================================================================
// Routing and rewriting
// ============================================================================

#[tokio::test]
async fn test_path_route_injects_bridge_and_sets_cookie() {
    let dir = tempfile::tempdir().unwrap();
    let upstream = spawn_upstream(html_handler()).await;
    let gateway = start_gateway(project_at(dir.path(), None), Arc::new(MockLauncher::new(0))).await;
    gateway.mark_running("p1", upstream.port);

    let response = http_request(
        gateway.port,
        "GET",
        "/preview/p1/index.html?x=1",
        &[("Accept", "text/html"), ("Accept-Encoding", "gzip, br")],
    )
    .await
    .unwrap();
    let (head, body) = split_response(&response);

    assert!(head.starts_with("http/1.1 200"), "unexpected head: {}", head);
    assert!(head.contains("set-cookie: lucidcoder_preview_project=p1; path=/; samesite=lax"));
    assert!(!head.contains("content-security-policy"));
    assert!(head.contains(&format!("content-length: {}", body.len())));

    assert!(body.contains("<script"));
    assert!(body.contains("LUCIDCODER_PREVIEW_"));
    assert!(body.contains("/preview/p1"));
    assert!(body.contains("<div id=\"root\"></div>"));
    let script_at = body.find("<script").unwrap();
    assert!(script_at < body.find("<title>").unwrap());

    let seen = upstream.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].path, "/index.html?x=1");
    assert!(seen[0].headers.get("accept-encoding").is_none());
    assert_eq!(seen[0].headers["x-forwarded-for"], "127.0.0.1");
    assert!(seen[0].headers.get("x-request-id").is_some());
}

#[tokio::test]
async fn test_cookie_route_streams_assets_unmodified() {
    let dir = tempfile::tempdir().unwrap();
    let upstream = spawn_upstream(js_handler()).await;
    let gateway = start_gateway(project_at(dir.path(), None), Arc::new(MockLauncher::new(0))).await;
    gateway.mark_running("p1", upstream.port);

    let response = http_request(
        gateway.port,
        "GET",
        "/src/main.js?v=abc",
        &[("Cookie", "theme=dark; lucidcoder_preview_project=p1")],
    )
    .await
    .unwrap();
    let (head, body) = split_response(&response);

    assert!(head.starts_with("http/1.1 200"), "unexpected head: {}", head);
    assert!(!head.contains("set-cookie"));
    // Non-HTML passes through with its headers intact
    assert!(head.contains("content-security-policy: default-src 'self'"));
    assert!(body.contains("export const answer = 42;"));
    assert!(!body.contains("<script"));

    assert_eq!(upstream.seen()[0].path, "/src/main.js?v=abc");
}

#[tokio::test]
async fn test_bypassed_and_unrouted_requests_fall_through() {
    let dir = tempfile::tempdir().unwrap();
    let upstream = spawn_upstream(html_handler()).await;
    let gateway = start_gateway(project_at(dir.path(), None), Arc::new(MockLauncher::new(0))).await;
    gateway.mark_running("p1", upstream.port);

    let response = http_request(
        gateway.port,
        "GET",
        "/api/projects",
        &[("Cookie", "lucidcoder_preview_project=p1")],
    )
    .await
    .unwrap();
    let (head, body) = split_response(&response);
    assert!(head.starts_with("http/1.1 404"), "unexpected head: {}", head);
    assert!(head.contains("x-proxy-error: not_found"));
    assert!(body.contains("NOT_FOUND"));

    let response = http_request(gateway.port, "GET", "/somewhere", &[]).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 404"));

    assert!(upstream.seen().is_empty());
}

// ============================================================================
// Uploads and readiness
// ============================================================================

#[tokio::test]
async fn test_upload_served_from_project_directory() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("uploads/docs")).unwrap();
    std::fs::write(dir.path().join("uploads/docs/notes.txt"), "uploaded notes").unwrap();

    // No dev server at all: uploads must not need one
    let gateway = start_gateway(project_at(dir.path(), None), Arc::new(MockLauncher::new(0))).await;

    let response = http_request(gateway.port, "GET", "/preview/p1/uploads/docs/notes.txt", &[])
        .await
        .unwrap();
    let (head, body) = split_response(&response);

    assert!(head.starts_with("http/1.1 200"), "unexpected head: {}", head);
    assert!(head.contains("content-type: application/octet-stream"));
    assert!(head.contains("content-length: 14"));
    assert!(head.contains("cache-control: no-store"));
    assert!(!head.contains("set-cookie"));
    assert_eq!(body, "uploaded notes");

    // Traversal out of the uploads directory is not served from disk
    let response = http_request(
        gateway.port,
        "GET",
        "/preview/p1/uploads/../secret.txt",
        &[],
    )
    .await
    .unwrap();
    assert!(response.starts_with("HTTP/1.1 409"));
}

#[tokio::test]
async fn test_no_known_port_is_not_ready() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = start_gateway(project_at(dir.path(), None), Arc::new(MockLauncher::new(0))).await;

    let response = http_request(gateway.port, "GET", "/preview/p1/", &[("Accept", "text/html")])
        .await
        .unwrap();
    let (head, body) = split_response(&response);

    assert!(head.starts_with("http/1.1 409"), "unexpected head: {}", head);
    assert!(head.contains("x-proxy-error: preview_not_ready"));
    assert!(head.contains("cache-control: no-store"));
    assert!(!head.contains("set-cookie"));
    assert!(body.is_empty());
}

// ============================================================================
// Failures and auto-restart
// ============================================================================

#[tokio::test]
async fn test_refused_port_is_remembered_and_cleared_from_registry() {
    let dir = tempfile::tempdir().unwrap();
    let dead = closed_port().await;
    let gateway = start_gateway(project_at(dir.path(), None), Arc::new(MockLauncher::new(0))).await;
    gateway.mark_running("p1", dead);

    let response = http_request(gateway.port, "GET", "/preview/p1/", &[("Accept", "text/html")])
        .await
        .unwrap();
    let (head, body) = split_response(&response);

    assert!(head.starts_with("http/1.1 502"), "unexpected head: {}", head);
    assert!(head.contains("x-proxy-error: preview_proxy_error"));
    assert!(head.contains("content-type: text/html"));
    assert!(head.contains("set-cookie: lucidcoder_preview_project=p1"));
    assert!(body.contains("location.reload"));

    assert!(gateway
        .preview
        .resolver()
        .is_frontend_port_remembered_bad("p1", dead));

    let entry = gateway.registry.get_running_process_entry("p1").unwrap();
    assert!(entry.processes.frontend.is_none());
    assert_eq!(entry.state, ProcessState::Stopped);
    assert_eq!(entry.launch_type, LaunchType::Manual);
}

#[tokio::test]
async fn test_non_html_client_gets_plain_placeholder() {
    let dir = tempfile::tempdir().unwrap();
    let dead = closed_port().await;
    let gateway = start_gateway(project_at(dir.path(), Some(dead)), Arc::new(MockLauncher::new(0))).await;

    // Only the configured hint is known, so the project looks like it is starting
    let response = http_request(
        gateway.port,
        "GET",
        "/preview/p1/src/App.tsx",
        &[("Accept", "*/*")],
    )
    .await
    .unwrap();
    let (head, body) = split_response(&response);

    assert!(head.starts_with("http/1.1 503"), "unexpected head: {}", head);
    assert!(head.contains("x-proxy-error: preview_starting"));
    assert!(head.contains("retry-after: 1"));
    assert!(head.contains("content-type: text/plain"));
    assert!(!body.contains("<html"));
}

#[tokio::test]
async fn test_repeated_failures_trigger_auto_restart() {
    let dir = tempfile::tempdir().unwrap();
    let dead = closed_port().await;
    let upstream = spawn_upstream(html_handler()).await;
    let launcher = Arc::new(MockLauncher::new(upstream.port));
    let gateway = start_gateway(project_at(dir.path(), Some(dead)), launcher.clone()).await;
    gateway.mark_running("p1", dead);

    // First failure of the window is tolerated
    let response = http_request(gateway.port, "GET", "/preview/p1/", &[("Accept", "text/html")])
        .await
        .unwrap();
    assert!(response.starts_with("HTTP/1.1 502"));
    assert_eq!(launcher.starts.load(Ordering::SeqCst), 0);

    // Second failure falls back to the port hint, still dead, and restarts
    let response = http_request(gateway.port, "GET", "/preview/p1/", &[("Accept", "text/html")])
        .await
        .unwrap();
    assert!(response.starts_with("HTTP/1.1 503"));

    let registry = Arc::clone(&gateway.registry);
    let live = upstream.port;
    assert!(
        wait_for(
            move || registry
                .get_running_process_entry("p1")
                .and_then(|e| e.running_frontend_port())
                == Some(live),
            Duration::from_secs(5),
        )
        .await,
        "auto-restart did not register the new frontend"
    );

    assert_eq!(launcher.starts.load(Ordering::SeqCst), 1);
    assert_eq!(launcher.terminations.load(Ordering::SeqCst), 1);
    let entry = gateway.registry.get_running_process_entry("p1").unwrap();
    assert_eq!(entry.launch_type, LaunchType::Auto);
    assert_eq!(
        gateway.store.stored_ports("p1").await.unwrap().frontend,
        Some(upstream.port)
    );

    let response = http_request(gateway.port, "GET", "/preview/p1/", &[("Accept", "text/html")])
        .await
        .unwrap();
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("LUCIDCODER_PREVIEW_"));
}

#[tokio::test]
async fn test_asset_failures_never_restart() {
    let dir = tempfile::tempdir().unwrap();
    let dead = closed_port().await;
    let launcher = Arc::new(MockLauncher::new(0));
    let gateway = start_gateway(project_at(dir.path(), Some(dead)), launcher.clone()).await;

    for _ in 0..3 {
        let response = http_request(gateway.port, "GET", "/preview/p1/src/main.ts", &[])
            .await
            .unwrap();
        assert!(response.starts_with("HTTP/1.1 503"));
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(launcher.starts.load(Ordering::SeqCst), 0);
    assert!(!gateway.preview.restarts().is_restart_in_flight("p1"));
}

// ============================================================================
// WebSocket upgrades
// ============================================================================

#[tokio::test]
async fn test_websocket_upgrade_is_tunneled() {
    let dir = tempfile::tempdir().unwrap();
    let upstream_port = spawn_upgrade_echo().await;
    let gateway = start_gateway(project_at(dir.path(), None), Arc::new(MockLauncher::new(0))).await;
    gateway.mark_running("p1", upstream_port);

    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", gateway.port))
        .await
        .unwrap();
    let request = format!(
        "GET /preview/p1/@vite/hmr HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
        gateway.port
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let head = read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 101"), "unexpected head: {}", head);
    assert!(head.to_lowercase().contains("upgrade: websocket"));

    stream.write_all(b"hmr-ping").await.unwrap();
    let mut echoed = [0u8; 8];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut echoed))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(&echoed, b"hmr-ping");
}

#[tokio::test]
async fn test_upgrade_without_port_closes_socket() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = start_gateway(project_at(dir.path(), None), Arc::new(MockLauncher::new(0))).await;

    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", gateway.port))
        .await
        .unwrap();
    let request = format!(
        "GET /preview/p1/ws HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
        gateway.port
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response)).await;
    assert!(read.is_ok(), "socket was not closed");
    assert!(!String::from_utf8_lossy(&response).starts_with("HTTP/1.1 101"));
}

// ============================================================================
// Timeouts
// ============================================================================

fn short_timeout_settings() -> PreviewSettings {
    PreviewSettings {
        proxy_timeout_ms: 300,
        ..PreviewSettings::default()
    }
}

#[tokio::test]
async fn test_silent_upstream_times_out_to_placeholder() {
    let dir = tempfile::tempdir().unwrap();
    let silent = spawn_silent_upstream().await;
    let gateway = start_gateway_with_settings(
        project_at(dir.path(), None),
        Arc::new(MockLauncher::new(0)),
        short_timeout_settings(),
    )
    .await;
    gateway.mark_running("p1", silent);

    let started = std::time::Instant::now();
    let response = tokio::time::timeout(
        Duration::from_secs(3),
        http_request(gateway.port, "GET", "/preview/p1/", &[("Accept", "text/html")]),
    )
    .await
    .expect("gateway did not answer")
    .unwrap();
    let (head, body) = split_response(&response);

    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(head.starts_with("http/1.1 502"), "unexpected head: {}", head);
    assert!(head.contains("x-proxy-error: preview_proxy_error"));
    assert!(body.contains("location.reload"));
    assert!(gateway
        .preview
        .resolver()
        .is_frontend_port_remembered_bad("p1", silent));
}

#[tokio::test]
async fn test_stalled_asset_body_is_cut_off() {
    let dir = tempfile::tempdir().unwrap();
    let stalling = spawn_stalling_upstream().await;
    let gateway = start_gateway_with_settings(
        project_at(dir.path(), None),
        Arc::new(MockLauncher::new(0)),
        short_timeout_settings(),
    )
    .await;
    gateway.mark_running("p1", stalling);

    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", gateway.port))
        .await
        .unwrap();
    let request = format!(
        "GET /preview/p1/app.js HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nAccept: */*\r\nConnection: close\r\n\r\n",
        gateway.port
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    // The connection ends (cleanly or with a reset) once the body stalls
    let received = tokio::time::timeout(Duration::from_secs(5), async {
        let mut received = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => received.extend_from_slice(&buf[..n]),
            }
        }
        received
    })
    .await
    .expect("stalled body kept the connection open");

    let text = String::from_utf8_lossy(&received);
    assert!(text.starts_with("HTTP/1.1 200"), "unexpected response: {}", text);
    assert!(text.contains("partial"));
}
