//! Connection pool for dev server HTTP connections
//!
//! Dev servers are hit with many small requests (modules, assets, HMR
//! pings), so connections are kept alive and reused per host and port.

use crate::error::UpstreamError;
use hyper::body::Incoming;
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Statistics for the connection pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Total number of requests made through the pool
    pub total_requests: AtomicU64,
    /// Requests that failed before a response head arrived
    pub failed_requests: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
    /// Upper bound for establishing a TCP connection
    pub connect_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
            connect_timeout: None,
        }
    }
}

/// `host:port` with IPv6 literals bracketed
pub fn upstream_authority(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Absolute `http://` URI for a dev server request
pub fn upstream_uri(host: &str, port: u16, path_and_query: &str) -> Result<Uri, UpstreamError> {
    let path = if path_and_query.starts_with('/') {
        path_and_query.to_string()
    } else {
        format!("/{}", path_and_query)
    };

    format!("http://{}{}", upstream_authority(host, port), path)
        .parse()
        .map_err(|e: hyper::http::uri::InvalidUri| UpstreamError::RequestBuild(e.to_string()))
}

/// Pooled HTTP/1.1 client for dev servers
pub struct ConnectionPool {
    client: Client<HttpConnector, Incoming>,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl ConnectionPool {
    /// Create a new connection pool with the given configuration
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);
        connector.set_connect_timeout(config.connect_timeout);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self {
            client,
            stats: Arc::new(PoolStats::default()),
            config,
        }
    }

    /// Get the pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Get pool statistics
    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Send a request whose URI is already absolute (see [`upstream_uri`]).
    /// The response body is handed back unread.
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<Incoming>, UpstreamError> {
        self.stats.record_request();

        match self.client.request(req).await {
            Ok(response) => Ok(response),
            Err(e) => {
                self.stats.record_failure();
                Err(UpstreamError::Client(e))
            }
        }
    }
}
