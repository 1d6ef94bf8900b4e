use crate::error::{full_body, json_error_response, ProxyBody, ProxyErrorCode};
use crate::local::InMemoryRegistry;
use crate::preview::PreviewProxy;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the gateway
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

fn text_response(status: StatusCode, body: &'static str) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .body(full_body(body))
        .expect("valid response with StatusCode enum")
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(full_body(body.to_string()))
        .expect("valid response with StatusCode enum and static header")
}

/// Admin API for the embedding editor
pub struct AdminServer {
    bind_addr: SocketAddr,
    registry: Arc<InMemoryRegistry>,
    preview: Arc<PreviewProxy>,
    shutdown_rx: watch::Receiver<bool>,
    auth_token: Arc<String>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        registry: Arc<InMemoryRegistry>,
        preview: Arc<PreviewProxy>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            registry,
            preview,
            shutdown_rx,
            auth_token: Arc::new(auth_token),
        }
    }

    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Admin API server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = AdminState {
                                registry: Arc::clone(&self.registry),
                                preview: Arc::clone(&self.preview),
                                auth_token: Arc::clone(&self.auth_token),
                            };

                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, state).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

#[derive(Clone)]
struct AdminState {
    registry: Arc<InMemoryRegistry>,
    preview: Arc<PreviewProxy>,
    auth_token: Arc<String>,
}

async fn serve_admin_connection<S>(stream: S, state: AdminState) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = state.clone();
        async move { handle_admin_request(req, state).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth<B>(req: &Request<B>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| {
            auth.strip_prefix("Bearer ")
                .unwrap_or(auth)
                .eq(expected_token)
        })
        .unwrap_or(false)
}

async fn handle_admin_request<B>(
    req: Request<B>,
    state: AdminState,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let path = req.uri().path();
    let method = req.method();

    debug!(%method, %path, "Admin API request");

    let response = match (method, path) {
        (&Method::GET, "/health") => text_response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => json_response(
            StatusCode::OK,
            serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            }),
        ),

        // Registry snapshot: GET /projects (auth required)
        (&Method::GET, "/projects") => {
            if !check_auth(&req, &state.auth_token) {
                warn!(path, "Unauthorized admin API request");
                json_error_response(ProxyErrorCode::Unauthorized, "Missing or invalid bearer token")
            } else {
                json_response(StatusCode::OK, projects_snapshot(&state))
            }
        }

        _ => json_error_response(ProxyErrorCode::NotFound, "Unknown admin endpoint"),
    };

    Ok(response)
}

fn projects_snapshot(state: &AdminState) -> serde_json::Value {
    let projects: Vec<serde_json::Value> = state
        .registry
        .list()
        .into_iter()
        .map(|(project_id, entry)| {
            let restarting = state.preview.restarts().is_restart_in_flight(&project_id);
            serde_json::json!({
                "project_id": project_id,
                "state": entry.state,
                "launch_type": entry.launch_type,
                "processes": entry.processes,
                "restart_in_flight": restarting,
            })
        })
        .collect();

    let stats = state.preview.pool().stats();
    serde_json::json!({
        "count": projects.len(),
        "projects": projects,
        "upstream": {
            "total_requests": stats.get_total_requests(),
            "failed_requests": stats.get_failed_requests(),
        },
    })
}
