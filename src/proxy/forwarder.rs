//! Upstream forwarding
//!
//! The [`Forwarder`] trait is the seam between the interception layer and the
//! network; [`HttpForwarder`] is the pooled hyper client used in production.

use crate::proxy::types::{BoxError, ProxyBody, ProxyError, ProxyResult};
use async_trait::async_trait;
use http::{Request, Response};
use http_body_util::BodyExt;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;

/// Sends a prepared request to its origin and returns the streaming response
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(&self, request: Request<ProxyBody>) -> ProxyResult<Response<ProxyBody>>;
}

/// Forwarder over HTTP and HTTPS; upstream certificates are verified against webpki roots
#[derive(Clone)]
pub struct HttpForwarder {
    client: Client<HttpsConnector<HttpConnector>, ProxyBody>,
}

impl HttpForwarder {
    pub fn new() -> ProxyResult<Self> {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let tls = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();

        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_http1()
            .build();

        let client = Client::builder(TokioExecutor::new())
            .http1_title_case_headers(true)
            .http1_preserve_header_case(true)
            .build(connector);

        Ok(Self { client })
    }
}

impl std::fmt::Debug for HttpForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpForwarder").finish_non_exhaustive()
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(&self, request: Request<ProxyBody>) -> ProxyResult<Response<ProxyBody>> {
        let response = self.client.request(request).await?;
        Ok(response.map(|body| body.map_err(BoxError::from).boxed_unsync()))
    }
}
