//! Serves files under a project's `uploads/` directory straight from disk.

use crate::error::{BoxError, ProxyBody};
use crate::project::ProjectStore;
use futures::TryStreamExt;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use hyper::header::{CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use std::path::{Component, Path, PathBuf};
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

/// Forwarded paths under this prefix are served from disk
pub const UPLOADS_PREFIX: &str = "/uploads/";

const UPLOADS_DIR: &str = "uploads";

/// Relative upload path (`uploads/...`) for a forwarded path, or `None` when
/// the path is not an upload, cannot be decoded, or escapes the uploads
/// directory once `.` and `..` are resolved.
pub fn parse_upload_forward_path(forward_path: &str) -> Option<String> {
    let path = forward_path.split('?').next().unwrap_or(forward_path);
    if !path.starts_with(UPLOADS_PREFIX) {
        return None;
    }

    let decoded = urlencoding::decode(path).ok()?;

    let mut segments: Vec<&str> = Vec::new();
    for segment in decoded.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            other => segments.push(other),
        }
    }

    if segments.len() < 2 || segments[0] != UPLOADS_DIR {
        return None;
    }

    Some(segments.join("/"))
}

/// Content type for an upload, by file extension
pub fn upload_content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        Some("avif") => "image/avif",
        Some("ico") => "image/x-icon",
        Some("bmp") => "image/bmp",
        Some("tif") | Some("tiff") => "image/tiff",
        _ => "application/octet-stream",
    }
}

/// Serve `forward_path` from the project's uploads directory. `None` means the
/// request was not served and should be proxied instead.
pub async fn try_serve_project_upload(
    store: &dyn ProjectStore,
    project_id: &str,
    forward_path: &str,
) -> Option<Response<ProxyBody>> {
    let relative = parse_upload_forward_path(forward_path)?;

    let project_path = match store.project_path(project_id).await {
        Ok(Some(path)) => path,
        Ok(None) => return None,
        Err(e) => {
            warn!(project_id, error = %e, "Failed to look up project path for upload");
            return None;
        }
    };

    let uploads_root = project_path.join(UPLOADS_DIR);
    let file_path = resolve_within(&uploads_root, &relative)?;

    let (file, len) = match open_upload(&file_path).await {
        Ok(Some(opened)) => opened,
        Ok(None) => return None,
        Err(e) => {
            warn!(
                project_id,
                path = %file_path.display(),
                error = %e,
                "Failed to open project upload, falling back to proxy"
            );
            return None;
        }
    };

    debug!(project_id, path = %file_path.display(), len, "Streaming project upload");
    let stream = ReaderStream::new(file)
        .map_ok(Frame::data)
        .map_err(BoxError::from);

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, upload_content_type(&file_path))
        .header(CONTENT_LENGTH, len)
        .header(CACHE_CONTROL, "no-store")
        .body(StreamBody::new(stream).boxed_unsync())
        .ok()
}

/// Open a regular file and read its length. Missing files and directories
/// yield `None`.
async fn open_upload(path: &Path) -> std::io::Result<Option<(File, u64)>> {
    let file = match File::open(path).await {
        Ok(file) => file,
        Err(e) if is_missing_file(&e) => return Ok(None),
        Err(e) => return Err(e),
    };

    let metadata = match file.metadata().await {
        Ok(metadata) => metadata,
        Err(e) if is_missing_file(&e) => return Ok(None),
        Err(e) => return Err(e),
    };
    if !metadata.is_file() {
        return Ok(None);
    }

    Ok(Some((file, metadata.len())))
}

/// Join `relative` (which starts with `uploads/`) onto the uploads root and
/// make sure the result stays inside it
fn resolve_within(uploads_root: &Path, relative: &str) -> Option<PathBuf> {
    let inner = relative.strip_prefix(UPLOADS_DIR)?.trim_start_matches('/');
    let resolved = uploads_root.join(inner);

    let escapes = Path::new(inner)
        .components()
        .any(|c| !matches!(c, Component::Normal(_)));
    if escapes || !resolved.starts_with(uploads_root) {
        warn!(path = %resolved.display(), "Blocked upload path outside uploads directory");
        return None;
    }

    Some(resolved)
}

#[cfg(unix)]
fn is_missing_file(err: &std::io::Error) -> bool {
    match err.raw_os_error() {
        Some(errno) => matches!(errno, libc::ENOENT | libc::EISDIR | libc::ENOTDIR),
        None => err.kind() == std::io::ErrorKind::NotFound,
    }
}

#[cfg(not(unix))]
fn is_missing_file(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::NotFound
}
