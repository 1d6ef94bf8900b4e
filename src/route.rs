//! Request classification: which project a request belongs to and which path
//! should be forwarded to its dev server.

use hyper::header::COOKIE;
use hyper::{HeaderMap, Request, Uri};
use std::collections::HashMap;

/// Path prefix for preview traffic: `/preview/<projectId>/<rest>`
pub const PREVIEW_PREFIX: &str = "/preview/";

/// Cookie pinning a browsing context to a project
pub const PREVIEW_COOKIE_NAME: &str = "lucidcoder_preview_project";

/// Where the project identity came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteSource {
    Path,
    Cookie,
}

/// Routing decision for a single request; never persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectRouteInfo {
    pub source: RouteSource,
    pub project_id: String,
    pub forward_path: String,
}

impl ProjectRouteInfo {
    /// Preview prefix of this project, used to scope bridge messages
    pub fn preview_prefix(&self) -> String {
        preview_prefix_for(&self.project_id)
    }
}

pub fn preview_prefix_for(project_id: &str) -> String {
    format!("/preview/{}", urlencoding::encode(project_id))
}

/// Classifies requests against the bypass list, the preview prefix and the
/// affinity cookie
#[derive(Debug, Clone)]
pub struct RouteClassifier {
    bypass_prefixes: Vec<String>,
}

impl RouteClassifier {
    pub fn new(bypass_prefixes: Vec<String>) -> Self {
        let bypass_prefixes = bypass_prefixes
            .into_iter()
            .map(|p| p.trim_end_matches('/').to_string())
            .filter(|p| !p.is_empty())
            .collect();
        Self { bypass_prefixes }
    }

    /// True when the path belongs to the host application rather than a preview
    pub fn is_bypassed(&self, path: &str) -> bool {
        self.bypass_prefixes.iter().any(|prefix| {
            path.strip_prefix(prefix.as_str())
                .map(|rest| rest.is_empty() || rest.starts_with('/') || rest.starts_with('?'))
                .unwrap_or(false)
        })
    }

    pub fn classify_request<B>(&self, req: &Request<B>) -> Option<ProjectRouteInfo> {
        let url = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let cookie_header = cookie_header(req.headers());
        self.classify(url, cookie_header.as_deref())
    }

    /// Classify a raw request target (`path?query`) with its cookie header
    pub fn classify(&self, url: &str, cookie_header: Option<&str>) -> Option<ProjectRouteInfo> {
        let uri: Uri = url.parse().ok()?;
        let path = uri.path();

        if self.is_bypassed(path) {
            return None;
        }

        if let Some(route) = route_from_path(path, uri.query()) {
            return Some(route);
        }

        let cookies = parse_cookies(cookie_header?);
        let project_id = cookies.get(PREVIEW_COOKIE_NAME)?.trim();
        if project_id.is_empty() {
            return None;
        }

        Some(ProjectRouteInfo {
            source: RouteSource::Cookie,
            project_id: project_id.to_string(),
            forward_path: url.to_string(),
        })
    }
}

fn route_from_path(path: &str, query: Option<&str>) -> Option<ProjectRouteInfo> {
    let remainder = path.strip_prefix(PREVIEW_PREFIX)?;
    let (raw_id, rest) = remainder.split_once('/').unwrap_or((remainder, ""));
    if raw_id.is_empty() {
        return None;
    }

    let project_id = urlencoding::decode(raw_id)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| raw_id.to_string());
    if project_id.trim().is_empty() {
        return None;
    }

    let mut forward_path = format!("/{}", rest.trim_start_matches('/'));
    if let Some(query) = query {
        forward_path.push('?');
        forward_path.push_str(query);
    }

    Some(ProjectRouteInfo {
        source: RouteSource::Path,
        project_id,
        forward_path,
    })
}

/// All `Cookie` header values joined the way browsers send them
fn cookie_header(headers: &HeaderMap) -> Option<String> {
    let values: Vec<&str> = headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(values.join("; "))
    }
}

/// Loose cookie parsing: split on `;`, first `=` separates key and value,
/// values are percent-decoded when possible and kept raw otherwise. The first
/// occurrence of a name wins.
///
/// This is deliberately not RFC 6265 parsing; quoted values keep their quotes.
pub fn parse_cookies(header: &str) -> HashMap<String, String> {
    let mut cookies = HashMap::new();

    for part in header.split(';') {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value.trim();
        let value = urlencoding::decode(value)
            .map(|decoded| decoded.into_owned())
            .unwrap_or_else(|_| value.to_string());
        cookies.entry(key.to_string()).or_insert(value);
    }

    cookies
}

/// `Set-Cookie` value for the affinity cookie. Not `HttpOnly` so it can be
/// inspected from devtools.
pub fn affinity_cookie(project_id: &str) -> String {
    format!(
        "{}={}; Path=/; SameSite=Lax",
        PREVIEW_COOKIE_NAME,
        urlencoding::encode(project_id)
    )
}
