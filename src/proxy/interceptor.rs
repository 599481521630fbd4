//! Per-request interception
//!
//! Ties the pieces together for one exchange: log it, resolve the transform
//! from the request alone, forward upstream, then run the response pipeline.

use crate::infrastructure::log_messages::interception;
use crate::proxy::forwarder::Forwarder;
use crate::proxy::headers::{self, ACCEPT_ENCODING, IDENTITY_ENCODING};
use crate::proxy::pipeline::ResponsePipeline;
use crate::proxy::resolver::TransformResolver;
use crate::proxy::types::{
    InterceptedExchange, ProxyBody, ProxyError, ProxyFuture, ProxyResult,
};
use http::{HeaderValue, Request, Response, Uri};
use std::sync::Arc;
use tracing::{debug, error, info};

pub struct Interceptor {
    resolver: TransformResolver,
    pipeline: ResponsePipeline,
    forwarder: Arc<dyn Forwarder>,
}

impl Interceptor {
    pub fn new(
        resolver: TransformResolver,
        pipeline: ResponsePipeline,
        forwarder: Arc<dyn Forwarder>,
    ) -> Self {
        Self {
            resolver,
            pipeline,
            forwarder,
        }
    }

    /// Handle one client request
    ///
    /// `is_encrypted` is true for requests read from a TLS stream the proxy
    /// terminated. An error means the client connection must be dropped.
    pub fn intercept(
        &self,
        request: Request<ProxyBody>,
        is_encrypted: bool,
    ) -> ProxyFuture<'_, Response<ProxyBody>> {
        Box::pin(async move {
            let exchange = InterceptedExchange::from_request(&request, is_encrypted);
            info!(
                id = %exchange.id,
                "{} {} {}",
                interception::PROXYING,
                exchange.method,
                exchange.effective_url()
            );

            let decision = self.resolver.resolve(&exchange);
            debug!(id = %exchange.id, decision = decision.kind(), "Resolved transform");

            let outgoing = prepare_upstream_request(request, &exchange, decision.buffers_body())?;

            let response = match self.forwarder.forward(outgoing).await {
                Ok(response) => response,
                Err(e) => {
                    error!(id = %exchange.id, url = %exchange.effective_url(), error = ?e, "{}", interception::UPSTREAM_FAILED);
                    return Err(e);
                }
            };

            match self.pipeline.handle(decision, response).await {
                Ok(response) => Ok(response),
                Err(e) => {
                    error!(id = %exchange.id, error = %e, "{}", interception::RESPONSE_FAILED);
                    Err(e)
                }
            }
        })
    }
}

impl std::fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interceptor")
            .field("resolver", &self.resolver)
            .field("pipeline", &self.pipeline)
            .finish_non_exhaustive()
    }
}

/// Rewrite the client request into the form sent upstream
///
/// The target becomes absolute, hop-by-hop headers are dropped, and
/// transforms that buffer the body ask the origin for an unencoded response.
pub fn prepare_upstream_request(
    request: Request<ProxyBody>,
    exchange: &InterceptedExchange,
    identity_encoding: bool,
) -> ProxyResult<Request<ProxyBody>> {
    let (mut parts, body) = request.into_parts();

    parts.uri = absolute_target(&parts.uri, exchange)?;
    headers::remove_hop_by_hop(&mut parts.headers);
    if identity_encoding {
        parts
            .headers
            .insert(ACCEPT_ENCODING, HeaderValue::from_static(IDENTITY_ENCODING));
    }

    Ok(Request::from_parts(parts, body))
}

fn absolute_target(uri: &Uri, exchange: &InterceptedExchange) -> ProxyResult<Uri> {
    if uri.scheme().is_some() && uri.authority().is_some() {
        return Ok(uri.clone());
    }

    let host = exchange
        .host_header
        .as_deref()
        .ok_or_else(|| ProxyError::InvalidTarget(format!("no host for {uri}")))?;
    let scheme = if exchange.is_encrypted { "https" } else { "http" };
    let path = uri.path_and_query().map_or("/", |p| p.as_str());

    format!("{scheme}://{host}{path}")
        .parse::<Uri>()
        .map_err(|e| ProxyError::InvalidTarget(e.to_string()))
}
