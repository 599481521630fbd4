//! Log message constants
//!
//! Centralizes the message texts used by the proxy and its lifecycle so
//! operators can grep for them and wording stays consistent.

/// Application startup and lifecycle messages
pub mod application {
    pub const STARTING: &str = "Starting FFRK proxy";
    pub const STARTED_SUCCESSFULLY: &str = "FFRK proxy started; configure the client to use it";
    pub const SHUTTING_DOWN: &str = "Shutdown signal received, stopping listeners";
    pub const LOCAL_IP_DISCOVERED: &str = "Using local address for injected script URLs";
    pub const LOCAL_IP_FALLBACK: &str = "Local address discovery failed, falling back to loopback";
}

/// Listener messages
pub mod server {
    pub const PROXY_LISTENING: &str = "Proxy listening";
    pub const ASSETS_LISTENING: &str = "Certificate and script server listening";
    pub const ACCEPT_FAILED: &str = "Failed to accept client connection";
    pub const CONNECTION_CLOSED: &str = "Client connection closed with error";
    pub const UPGRADE_FAILED: &str = "CONNECT upgrade failed";
    pub const TUNNEL_FAILED: &str = "TLS tunnel failed";
}

/// Per-exchange messages
pub mod interception {
    pub const PROXYING: &str = "Proxying:";
    pub const LISTENER_COUNT: &str = "Number of listeners for intercepted event";
    pub const UPSTREAM_FAILED: &str = "Upstream request failed; closing client connection";
    pub const RESPONSE_FAILED: &str = "Could not complete transformed response; closing client connection";
}
