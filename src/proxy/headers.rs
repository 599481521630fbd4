//! HTTP header constants and utilities for the proxy service
//!
//! Centralizes the header names and markers the interception layer
//! relies on when forwarding requests and re-framing rewritten responses.

use ::http::header;
use ::http::HeaderMap;

/// Legacy header some clients send instead of `Connection` when talking to a proxy
pub const PROXY_CONNECTION: &str = "proxy-connection";

/// Keep-alive parameters header (hop-by-hop)
pub const KEEP_ALIVE: &str = "keep-alive";

/// Encoding value meaning "no content coding applied"
pub const IDENTITY_ENCODING: &str = "identity";

/// Standard header re-exports for convenience
pub use header::{
    ACCEPT_ENCODING, CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, HOST,
    PROXY_AUTHORIZATION, TE, TRAILER, TRANSFER_ENCODING, UPGRADE,
};

/// Well-known paths served by the companion asset server
pub mod paths {
    /// Root CA download
    pub const CERT: &str = "/cert";

    /// Root CA download, file-style alias
    pub const CERT_FILE: &str = "/ca.crt";

    /// Injected script directory
    pub const SCRIPTS: &str = "/js";
}

/// Strip headers that only describe the client-to-proxy hop
pub fn remove_hop_by_hop(headers: &mut HeaderMap) {
    for name in [CONNECTION, PROXY_AUTHORIZATION, TE, TRAILER, UPGRADE] {
        headers.remove(name);
    }
    headers.remove(PROXY_CONNECTION);
    headers.remove(KEEP_ALIVE);
}

/// Whether the body carries a content coding other than identity
pub fn has_content_coding(headers: &HeaderMap) -> bool {
    headers
        .get_all(CONTENT_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .any(|coding| !coding.is_empty() && !coding.eq_ignore_ascii_case(IDENTITY_ENCODING))
}

/// Replace framing headers after the body has been rebuilt in memory
pub fn reframe(headers: &mut HeaderMap, body_len: usize) {
    headers.remove(TRANSFER_ENCODING);
    headers.insert(CONTENT_LENGTH, header::HeaderValue::from(body_len));
}
