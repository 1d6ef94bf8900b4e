//! Host HTTP server: accepts connections, hands each request to the preview
//! proxy, and passes everything else to a fallback handler.

use crate::error::{json_error_response, ProxyBody, ProxyError, ProxyErrorCode};
use crate::preview::{Dispatch, PreviewProxy};
use async_trait::async_trait;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Handles requests that are not preview traffic
#[async_trait]
pub trait FallbackHandler: Send + Sync {
    async fn handle(&self, req: Request<Incoming>, client_addr: SocketAddr) -> Response<ProxyBody>;
}

/// Default fallback: JSON 404
pub struct NotFoundFallback;

#[async_trait]
impl FallbackHandler for NotFoundFallback {
    async fn handle(&self, req: Request<Incoming>, _client_addr: SocketAddr) -> Response<ProxyBody> {
        debug!(method = %req.method(), uri = %req.uri(), "No preview route for request");
        json_error_response(ProxyErrorCode::NotFound, "No preview route for this request")
    }
}

/// The gateway's HTTP listener
pub struct ProxyServer {
    bind_addr: SocketAddr,
    preview: Arc<PreviewProxy>,
    fallback: Arc<dyn FallbackHandler>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        preview: Arc<PreviewProxy>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            preview,
            fallback: Arc::new(NotFoundFallback),
            shutdown_rx,
        }
    }

    /// Replace the handler for non-preview traffic (builder pattern)
    pub fn with_fallback(mut self, fallback: Arc<dyn FallbackHandler>) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn preview(&self) -> &Arc<PreviewProxy> {
        &self.preview
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Preview gateway listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let preview = Arc::clone(&self.preview);
                            let fallback = Arc::clone(&self.fallback);

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, preview, fallback).await {
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
                        info!("Preview gateway shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    preview: Arc<PreviewProxy>,
    fallback: Arc<dyn FallbackHandler>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let preview = Arc::clone(&preview);
        let fallback = Arc::clone(&fallback);
        async move { handle_request(req, preview, fallback, addr).await }
    });

    // HTTP/1.1 connections keep upgrade support for HMR sockets
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    preview: Arc<PreviewProxy>,
    fallback: Arc<dyn FallbackHandler>,
    client_addr: SocketAddr,
) -> Result<Response<ProxyBody>, ProxyError> {
    match preview.handle_request(req, client_addr).await? {
        Dispatch::Handled(response) => Ok(response),
        Dispatch::Next(req) => Ok(fallback.handle(req, client_addr).await),
    }
}
