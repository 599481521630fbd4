//! Type definitions for the proxy module

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

// ========== Body Types ==========

/// Boxed error carried by proxied bodies
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type used on both sides of the proxy
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

/// Boxed `Send` future returned by the per-exchange stages
///
/// Spawned connection tasks hold these across awaits, so `Send` is fixed at
/// the stage boundary instead of being inferred through nested borrows.
pub type ProxyFuture<'a, T> = Pin<Box<dyn Future<Output = ProxyResult<T>> + Send + 'a>>;

/// Body holding `bytes` in memory
pub fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Maximum number of body bytes buffered for a whole-document transform
#[nutype(
    derive(Clone, Copy, Debug, Display, Deserialize, Serialize, TryFrom, AsRef, PartialEq),
    validate(predicate = |size: &usize| *size > 0),
)]
pub struct BodySizeLimit(usize);

// ========== Naming Types ==========

/// Host name as requested by the client (SNI or `Host` header, port removed)
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Hostname(String);

impl Hostname {
    pub fn try_new(value: impl AsRef<str>) -> Result<Self, InvalidName> {
        let value = value.as_ref().trim().to_ascii_lowercase();
        if value.is_empty() || value.chars().any(|c| c.is_whitespace() || c == '/') {
            return Err(InvalidName(value));
        }
        Ok(Self(value))
    }

    /// Parse a `Host` header value, dropping any `:port` suffix
    pub fn from_host_header(value: &str) -> Option<Self> {
        let value = value.trim();
        let host = if let Some(rest) = value.strip_prefix('[') {
            rest.split_once(']').map_or(rest, |(host, _)| host)
        } else if value.matches(':').count() == 1 {
            value.split_once(':').map_or(value, |(host, _)| host)
        } else {
            value
        };
        Self::try_new(host).ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Hostname {
    type Error = InvalidName;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_new(value)
    }
}

impl From<Hostname> for String {
    fn from(host: Hostname) -> Self {
        host.0
    }
}

impl fmt::Display for Hostname {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Logical name a diagnostic dump is filed under; becomes part of a file name
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct DumpName(String);

impl DumpName {
    pub fn try_new(value: impl AsRef<str>) -> Result<Self, InvalidName> {
        let value = value.as_ref().trim();
        let valid = !value.is_empty()
            && value
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if valid {
            Ok(Self(value.to_string()))
        } else {
            Err(InvalidName(value.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DumpName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Rejected host or dump name
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid name: {0:?}")]
pub struct InvalidName(pub String);

/// Correlation id attached to every intercepted exchange
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExchangeId(Uuid);

impl ExchangeId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ExchangeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ========== Configuration Types ==========

/// Rewrite mode selected by `application.proxy.method`
///
/// Deserialized through [`FromStr`], so unknown values select `Off`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum ProxyMethod {
    /// Append scripts to the battle page
    Inject,
    /// Decode battle-init JSON and hand it to listeners
    Intercept,
    /// Any other configured value; traffic is never rewritten
    Off,
}

impl FromStr for ProxyMethod {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "inject" => Self::Inject,
            "intercept" => Self::Intercept,
            _ => Self::Off,
        })
    }
}

impl From<String> for ProxyMethod {
    fn from(value: String) -> Self {
        match value.parse() {
            Ok(method) => method,
            Err(never) => match never {},
        }
    }
}

// ========== Exchange ==========

/// One client request as seen by the interception layer
#[derive(Clone, Debug)]
pub struct InterceptedExchange {
    pub id: ExchangeId,
    pub method: http::Method,
    /// Request target exactly as the client sent it
    pub request_url: String,
    /// Raw `Host` header (or URI authority when the header is absent)
    pub host_header: Option<String>,
    /// True when the inbound connection was TLS-terminated by the proxy
    pub is_encrypted: bool,
}

impl InterceptedExchange {
    /// Build the exchange view of an inbound request
    pub fn from_request<B>(request: &http::Request<B>, is_encrypted: bool) -> Self {
        let host_header = request
            .headers()
            .get(http::header::HOST)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string)
            .or_else(|| request.uri().authority().map(|a| a.as_str().to_string()));

        Self {
            id: ExchangeId::new(),
            method: request.method().clone(),
            request_url: request.uri().to_string(),
            host_header,
            is_encrypted,
        }
    }

    /// Host the request was addressed to, without port
    pub fn host(&self) -> Option<Hostname> {
        self.host_header
            .as_deref()
            .and_then(Hostname::from_host_header)
    }

    /// Absolute URL used for logging and upstream forwarding
    pub fn effective_url(&self) -> String {
        if self.is_encrypted && self.request_url.starts_with('/') {
            format!(
                "https://{}{}",
                self.host_header.as_deref().unwrap_or_default(),
                self.request_url
            )
        } else {
            self.request_url.clone()
        }
    }
}

// ========== Errors ==========

/// Errors that can occur in the proxy
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Response too large: more than {max_size} bytes")]
    ResponseTooLarge { max_size: BodySizeLimit },

    #[error("Upstream error: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),

    #[error("Body error: {0}")]
    Body(BoxError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Hyper error: {0}")]
    HyperError(#[from] hyper::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Invalid target: {0}")]
    InvalidTarget(String),
}

/// Result type for proxy operations
pub type ProxyResult<T> = Result<T, ProxyError>;
