//! HTML response rewriting: bridge script injection and CSP header stripping.
//!
//! Injection is regex based on purpose. The first `<head ...>` tag gets the
//! script right after it; documents without one get it prepended.

use crate::config::PreviewSettings;
use hyper::header::CONTENT_TYPE;
use hyper::HeaderMap;
use once_cell::sync::Lazy;
use regex::Regex;

/// Version carried in every bridge message
pub const BRIDGE_VERSION: u32 = 1;

/// Prefix of every bridge message type
pub const BRIDGE_MESSAGE_PREFIX: &str = "LUCIDCODER_PREVIEW_";

/// Headers that would block the inline bridge script
pub const CSP_HEADERS: [&str; 6] = [
    "content-security-policy",
    "content-security-policy-report-only",
    "x-content-security-policy",
    "x-content-security-policy-report-only",
    "x-webkit-csp",
    "x-webkit-csp-report-only",
];

static HEAD_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)<head(?:\s[^>]*)?>").expect("Invalid regex pattern for head tag")
});

static HEAD_TAG_BYTES: Lazy<regex::bytes::Regex> = Lazy::new(|| {
    regex::bytes::Regex::new(r"(?i-u)<head(?:\s[^>]*)?>")
        .expect("Invalid regex pattern for head tag")
});

/// Parameters templated into the bridge script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeOptions {
    pub preview_prefix: String,
    pub nav_poll_interval_ms: u64,
    pub context_menu_debounce_ms: u64,
}

impl BridgeOptions {
    pub fn new(preview_prefix: impl Into<String>) -> Self {
        Self::from_settings(preview_prefix, &PreviewSettings::default())
    }

    pub fn from_settings(preview_prefix: impl Into<String>, settings: &PreviewSettings) -> Self {
        Self {
            preview_prefix: preview_prefix.into(),
            nav_poll_interval_ms: settings.nav_poll_interval_ms,
            context_menu_debounce_ms: settings.context_menu_debounce_ms,
        }
    }
}

/// Insert the bridge script after the first `<head>` tag, or in front of the
/// document when there is none. Empty input is returned unchanged.
pub fn inject_preview_bridge(html: &str, options: &BridgeOptions) -> String {
    if html.is_empty() {
        return String::new();
    }

    let script = bridge_script(options);
    let at = HEAD_TAG.find(html).map(|m| m.end()).unwrap_or(0);

    let mut out = String::with_capacity(html.len() + script.len());
    out.push_str(&html[..at]);
    out.push_str(&script);
    out.push_str(&html[at..]);
    out
}

/// Byte-level variant for bodies that are not guaranteed to be UTF-8
pub fn inject_preview_bridge_bytes(html: &[u8], options: &BridgeOptions) -> Vec<u8> {
    if html.is_empty() {
        return Vec::new();
    }

    let script = bridge_script(options);
    let at = HEAD_TAG_BYTES.find(html).map(|m| m.end()).unwrap_or(0);

    let mut out = Vec::with_capacity(html.len() + script.len());
    out.extend_from_slice(&html[..at]);
    out.extend_from_slice(script.as_bytes());
    out.extend_from_slice(&html[at..]);
    out
}

/// Remove every CSP-family header
pub fn strip_csp_headers(headers: &mut HeaderMap) {
    for name in CSP_HEADERS {
        headers.remove(name);
    }
}

pub fn is_html_response(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.to_ascii_lowercase().contains("text/html"))
        .unwrap_or(false)
}

/// JSON string literal that is safe inside an inline `<script>`
fn script_string_literal(value: &str) -> String {
    serde_json::to_string(value)
        .unwrap_or_else(|_| "\"\"".to_string())
        .replace("</", "<\\/")
        .replace("<!--", "<\\!--")
}

/// The bridge script with its parameters filled in
pub fn bridge_script(options: &BridgeOptions) -> String {
    BRIDGE_TEMPLATE
        .replace("__BRIDGE_VERSION__", &BRIDGE_VERSION.to_string())
        .replace("__MESSAGE_PREFIX__", &script_string_literal(BRIDGE_MESSAGE_PREFIX))
        .replace("__NAV_POLL_MS__", &options.nav_poll_interval_ms.to_string())
        .replace(
            "__CONTEXT_MENU_DEBOUNCE_MS__",
            &options.context_menu_debounce_ms.to_string(),
        )
        // Last, so a prefix can never be mistaken for a placeholder
        .replace("__PREVIEW_PREFIX__", &script_string_literal(&options.preview_prefix))
}

const BRIDGE_TEMPLATE: &str = r#"<script data-lucidcoder-preview-bridge>
(function () {
  if (window.__lucidcoderPreviewBridge) return;
  window.__lucidcoderPreviewBridge = true;

  var BRIDGE_VERSION = __BRIDGE_VERSION__;
  var MESSAGE_PREFIX = __MESSAGE_PREFIX__;
  var PREVIEW_PREFIX = __PREVIEW_PREFIX__;
  var NAV_POLL_MS = __NAV_POLL_MS__;
  var CONTEXT_MENU_DEBOUNCE_MS = __CONTEXT_MENU_DEBOUNCE_MS__;

  var nested = false;
  try {
    nested = window.parent !== window;
  } catch (err) {
    nested = true;
  }

  var lastHref = null;
  var lastContextMenuAt = 0;

  function post(type, payload) {
    if (!nested) return;
    var message = {
      type: MESSAGE_PREFIX + type,
      bridgeVersion: BRIDGE_VERSION,
      previewPrefix: PREVIEW_PREFIX
    };
    if (payload) {
      for (var key in payload) {
        if (Object.prototype.hasOwnProperty.call(payload, key)) message[key] = payload[key];
      }
    }
    try {
      window.parent.postMessage(message, '*');
    } catch (err) {}
  }

  function sendNav(force) {
    var href = window.location.href;
    if (!force && href === lastHref) return;
    lastHref = href;
    post('NAV', { href: href, title: document.title || '' });
  }

  function wrapHistory(name) {
    var original = window.history && window.history[name];
    if (typeof original !== 'function') return;
    window.history[name] = function () {
      var result = original.apply(this, arguments);
      sendNav(false);
      return result;
    };
  }

  function navigate(target) {
    try {
      var next = new URL(target, window.location.href);
      if (next.origin === window.location.origin) {
        window.history.pushState(null, '', next.pathname + next.search + next.hash);
        window.dispatchEvent(new PopStateEvent('popstate', { state: null }));
        sendNav(false);
        return;
      }
    } catch (err) {}
    try {
      window.location.assign(target);
    } catch (err) {}
  }

  function describeTarget(target) {
    var el = target && target.nodeType === 1 ? target : target && target.parentElement;
    return {
      tagName: el && el.tagName ? el.tagName.toLowerCase() : null,
      id: el && el.id ? el.id : null,
      className: el && typeof el.className === 'string' ? el.className : null
    };
  }

  function signalContextMenu(event) {
    var now = Date.now();
    if (now - lastContextMenuAt < CONTEXT_MENU_DEBOUNCE_MS) return;
    lastContextMenuAt = now;
    post('HELPER_CONTEXT_MENU', {
      clientX: event.clientX,
      clientY: event.clientY,
      target: describeTarget(event.target)
    });
  }

  window.addEventListener('message', function (event) {
    if (event.source !== window.parent) return;
    var data = event.data;
    if (!data || typeof data.type !== 'string') return;

    if (data.type === MESSAGE_PREFIX + 'BRIDGE_PING') {
      post('BRIDGE_PONG', { nonce: data.nonce });
      sendNav(true);
    } else if (data.type === MESSAGE_PREFIX + 'BRIDGE_GET_LOCATION') {
      sendNav(true);
    } else if (data.type === MESSAGE_PREFIX + 'NAVIGATE' && typeof data.href === 'string') {
      navigate(data.href);
    }
  });

  document.addEventListener('contextmenu', function (event) {
    if (!nested) return;
    event.preventDefault();
    signalContextMenu(event);
  }, true);

  document.addEventListener('mousedown', function (event) {
    if (!nested || event.button !== 2) return;
    signalContextMenu(event);
  }, true);

  document.addEventListener('pointerdown', function (event) {
    if (event.button !== 0) return;
    post('BRIDGE_POINTER', { clientX: event.clientX, clientY: event.clientY });
  }, true);

  wrapHistory('pushState');
  wrapHistory('replaceState');
  window.addEventListener('popstate', function () { sendNav(false); });
  window.addEventListener('hashchange', function () { sendNav(false); });
  setInterval(function () { sendNav(false); }, NAV_POLL_MS);

  post('BRIDGE_READY', { href: window.location.href });
  sendNav(true);
})();
</script>"#;
