//! Infrastructure layer
//!
//! Host-level concerns the proxy core depends on but does not own.

pub mod local_address;
pub mod log_messages;
