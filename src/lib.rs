//! FFRK proxy - an intercepting HTTP(S) proxy for the FFRK game client
//!
//! The proxy terminates TLS for game-server hosts, forwards requests
//! upstream, and selectively rewrites responses: scripts are injected into
//! the battle page, and battle-init JSON is handed to registered
//! [`proxy::InterceptionListener`]s before it reaches the client.

pub mod application;
pub mod config;
pub mod error;
pub mod infrastructure;
pub mod proxy;

pub use application::Application;
pub use error::{Error, Result};
