//! Proxy listener
//!
//! Accepts client connections and serves them as HTTP/1.1. Absolute-form
//! requests are intercepted directly; `CONNECT` tunnels are answered with
//! `200`, the upgraded stream is TLS-terminated with an identity chosen by
//! the [`CertificateSelector`], and the requests inside are intercepted as
//! encrypted exchanges.

use crate::infrastructure::log_messages::server;
use crate::proxy::certificate::{self, CertificateSelector};
use crate::proxy::interceptor::Interceptor;
use crate::proxy::types::{
    empty_body, BoxError, Hostname, ProxyBody, ProxyError, ProxyResult,
};
use http::{Method, Request, Response};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct ProxyServer {
    interceptor: Arc<Interceptor>,
    selector: Arc<CertificateSelector>,
}

impl ProxyServer {
    pub fn new(interceptor: Arc<Interceptor>, selector: Arc<CertificateSelector>) -> Self {
        Self {
            interceptor,
            selector,
        }
    }

    pub async fn bind(address: &str) -> ProxyResult<TcpListener> {
        let listener = TcpListener::bind(address).await?;
        info!(address = %listener.local_addr()?, "{}", server::PROXY_LISTENING);
        Ok(listener)
    }

    /// Accept connections forever; failed accepts are logged and skipped
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> ProxyResult<()> {
        loop {
            let Some((stream, peer)) = accepted(listener.accept().await) else {
                continue;
            };
            debug!(%peer, "Accepted connection");

            let proxy = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = proxy.serve_client(stream).await {
                    debug!(%peer, error = %e, "{}", server::CONNECTION_CLOSED);
                }
            });
        }
    }

    async fn serve_client(self: Arc<Self>, stream: TcpStream) -> Result<(), hyper::Error> {
        let service = service_fn(move |request: Request<Incoming>| {
            let proxy = Arc::clone(&self);
            async move { proxy.route(request).await }
        });

        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades()
            .await
    }

    async fn route(self: Arc<Self>, request: Request<Incoming>) -> ProxyResult<Response<ProxyBody>> {
        if request.method() == Method::CONNECT {
            return self.open_tunnel(request);
        }
        self.interceptor.intercept(boxed(request), false).await
    }

    fn open_tunnel(self: Arc<Self>, request: Request<Incoming>) -> ProxyResult<Response<ProxyBody>> {
        let authority = request
            .uri()
            .authority()
            .map(|a| a.to_string())
            .ok_or_else(|| ProxyError::InvalidTarget(request.uri().to_string()))?;
        let fallback = Hostname::from_host_header(&authority);

        let config = certificate::server_config(Arc::clone(&self.selector), fallback)
            .map_err(|e| ProxyError::Tls(e.to_string()))?;
        let acceptor = TlsAcceptor::from(config);

        tokio::spawn(async move {
            match hyper::upgrade::on(request).await {
                Ok(upgraded) => {
                    if let Err(e) = self.serve_tunnel(TokioIo::new(upgraded), acceptor).await {
                        warn!(%authority, error = %e, "{}", server::TUNNEL_FAILED);
                    }
                }
                Err(e) => warn!(%authority, error = %e, "{}", server::UPGRADE_FAILED),
            }
        });

        Ok(Response::new(empty_body()))
    }

    /// Terminate TLS on a tunnel and serve the requests inside it
    async fn serve_tunnel<S>(self: Arc<Self>, io: S, acceptor: TlsAcceptor) -> ProxyResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let tls = acceptor
            .accept(io)
            .await
            .map_err(|e| ProxyError::Tls(format!("handshake failed: {e}")))?;

        let service = service_fn(move |request: Request<Incoming>| {
            let proxy = Arc::clone(&self);
            async move { proxy.interceptor.intercept(boxed(request), true).await }
        });

        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .serve_connection(TokioIo::new(tls), service)
            .await?;
        Ok(())
    }
}

/// Run the proxy on an already bound listener in the background
pub fn spawn(server: ProxyServer, listener: TcpListener) -> ProxyResult<SocketAddr> {
    let address = listener.local_addr()?;
    tokio::spawn(async move {
        if let Err(e) = Arc::new(server).serve(listener).await {
            warn!(error = %e, "Proxy listener stopped");
        }
    });
    Ok(address)
}

/// Transient accept failures such as descriptor exhaustion must not stop the proxy
fn accepted<T>(result: std::io::Result<T>) -> Option<T> {
    match result {
        Ok(connection) => Some(connection),
        Err(e) => {
            warn!(error = %e, "{}", server::ACCEPT_FAILED);
            None
        }
    }
}

fn boxed(request: Request<Incoming>) -> Request<ProxyBody> {
    request.map(|body| body.map_err(BoxError::from).boxed_unsync())
}
