//! Intercepting proxy core
//!
//! Request flow:
//! - [`service`] accepts connections and terminates `CONNECT` tunnels with an
//!   identity from [`certificate`]
//! - [`interceptor`] resolves a [`resolver::TransformDecision`] per exchange
//!   and forwards the request through a [`forwarder::Forwarder`]
//! - [`pipeline`] applies the decision, consulting [`event_bus`] and [`dump`]

pub mod certificate;
pub mod dump;
pub mod event_bus;
pub mod forwarder;
pub mod headers;
pub mod interceptor;
pub mod pipeline;
pub mod resolver;
pub mod service;
pub mod types;

pub use certificate::{CertificateAuthority, CertificateSelector, RcgenAuthority, WhitelistTable};
pub use event_bus::{Continuation, InterceptEvent, InterceptionBus, InterceptionListener, ListenerId};
pub use forwarder::{Forwarder, HttpForwarder};
pub use interceptor::Interceptor;
pub use pipeline::ResponsePipeline;
pub use resolver::{TransformDecision, TransformResolver};
pub use service::ProxyServer;
pub use types::{ProxyError, ProxyResult};
