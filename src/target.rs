//! Target resolution: which host and port a project's preview is proxied to.

use crate::project::{ProcessRegistry, ProjectStore};
use hyper::HeaderMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";

/// Hosts a preview may be dialed on
const LOOPBACK_HOSTS: [&str; 3] = ["localhost", "127.0.0.1", "::1"];

#[derive(Debug, Clone, Copy)]
struct BadPortEntry {
    port: u16,
    until: Instant,
}

/// Short-lived memory of frontend ports that just refused a connection.
/// One entry per project; entries are purged lazily when read.
#[derive(Debug)]
pub struct BadPortCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, BadPortEntry>>,
}

impl BadPortCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn remember(&self, project_id: &str, port: u16) {
        self.remember_at(project_id, port, Instant::now());
    }

    pub fn is_remembered_bad(&self, project_id: &str, port: u16) -> bool {
        self.is_remembered_bad_at(project_id, port, Instant::now())
    }

    fn remember_at(&self, project_id: &str, port: u16, now: Instant) {
        self.entries.lock().insert(
            project_id.to_string(),
            BadPortEntry {
                port,
                until: now + self.ttl,
            },
        );
    }

    fn is_remembered_bad_at(&self, project_id: &str, port: u16, now: Instant) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get(project_id).copied() else {
            return false;
        };

        if entry.port != port || now >= entry.until {
            entries.remove(project_id);
            return false;
        }

        true
    }

    /// Number of entries currently held (expired ones included until read)
    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resolves upstream ports and hosts for preview requests
pub struct TargetResolver {
    registry: Arc<dyn ProcessRegistry>,
    store: Arc<dyn ProjectStore>,
    bad_ports: BadPortCache,
    target_host: Option<String>,
}

impl TargetResolver {
    pub fn new(
        registry: Arc<dyn ProcessRegistry>,
        store: Arc<dyn ProjectStore>,
        bad_port_ttl: Duration,
        target_host: Option<String>,
    ) -> Self {
        Self {
            registry,
            store,
            bad_ports: BadPortCache::new(bad_port_ttl),
            target_host,
        }
    }

    pub fn bad_ports(&self) -> &BadPortCache {
        &self.bad_ports
    }

    pub fn remember_bad_frontend_port(&self, project_id: &str, port: u16) {
        debug!(project_id, port, "Remembering bad frontend port");
        self.bad_ports.remember(project_id, port);
    }

    pub fn is_frontend_port_remembered_bad(&self, project_id: &str, port: u16) -> bool {
        self.bad_ports.is_remembered_bad(project_id, port)
    }

    /// Frontend port for HTTP traffic. A running registry entry wins unless its
    /// port just failed; then persisted ports, then configuration hints.
    pub async fn resolve_frontend_port(&self, project_id: &str) -> Option<u16> {
        self.resolve_port(project_id, true).await
    }

    /// Frontend port for WebSocket upgrades. Unlike HTTP traffic this does not
    /// skip remembered-bad ports.
    pub async fn resolve_upgrade_port(&self, project_id: &str) -> Option<u16> {
        self.resolve_port(project_id, false).await
    }

    async fn resolve_port(&self, project_id: &str, consult_bad_ports: bool) -> Option<u16> {
        let live_port = self
            .registry
            .get_running_process_entry(project_id)
            .and_then(|entry| entry.running_frontend_port());

        if let Some(port) = live_port {
            if !consult_bad_ports || !self.bad_ports.is_remembered_bad(project_id, port) {
                return Some(port);
            }
            debug!(project_id, port, "Skipping remembered-bad frontend port");
        }

        match self.store.stored_ports(project_id).await {
            Ok(ports) => {
                if let Some(port) = ports.frontend {
                    return Some(port);
                }
            }
            Err(e) => {
                warn!(project_id, error = %e, "Failed to read stored ports");
            }
        }

        match self.store.port_hints(project_id).await {
            Ok(hints) => hints.frontend,
            Err(e) => {
                warn!(project_id, error = %e, "Failed to read port hints");
                None
            }
        }
    }

    pub fn resolve_target_host(&self, headers: &HeaderMap) -> String {
        resolve_preview_target_host(headers, self.target_host.as_deref())
    }
}

/// Pick the host to dial for a preview.
///
/// A configured override is used as-is (`0.0.0.0` maps to `localhost`). Without
/// one the request's host header is consulted, but only loopback literals are
/// accepted; anything else becomes `localhost` so request headers can never
/// point the proxy at a remote machine.
pub fn resolve_preview_target_host(headers: &HeaderMap, override_host: Option<&str>) -> String {
    if let Some(host) = override_host.map(str::trim).filter(|h| !h.is_empty()) {
        if host == "0.0.0.0" {
            return "localhost".to_string();
        }
        return host.to_string();
    }

    let header_value = headers
        .get(X_FORWARDED_HOST)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
        .or_else(|| {
            headers
                .get(hyper::header::HOST)
                .and_then(|v| v.to_str().ok())
        });

    header_value
        .and_then(loopback_host)
        .unwrap_or("localhost")
        .to_string()
}

fn loopback_host(raw: &str) -> Option<&'static str> {
    let first = raw.split(',').next()?.trim();

    let host = if let Some(rest) = first.strip_prefix('[') {
        rest.split(']').next().unwrap_or(rest)
    } else if first.matches(':').count() == 1 {
        first.split(':').next().unwrap_or(first)
    } else {
        first
    };

    LOOPBACK_HOSTS
        .iter()
        .find(|candidate| host == **candidate)
        .copied()
}
