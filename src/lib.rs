//! Previewgate - a preview reverse proxy for per-project dev servers
//!
//! This library provides the gateway an embedding editor puts in front of
//! the dev servers of the projects it edits:
//! - Routes `/preview/<project>/...` traffic (and its follow-up requests, via
//!   an affinity cookie) to the project's frontend dev server
//! - Serves uploaded project files directly from disk
//! - Injects a bridge script into HTML documents and strips CSP headers so
//!   the preview can talk to the editor
//! - Forwards WebSocket upgrades for hot module reloading
//! - Shows self-reloading placeholder pages while a dev server is starting
//!   or has crashed, and restarts crashed dev servers automatically

pub mod admin;
pub mod config;
pub mod error;
pub mod local;
pub mod pool;
pub mod preview;
pub mod project;
pub mod proxy;
pub mod restart;
pub mod rewrite;
pub mod route;
pub mod target;
pub mod uploads;
