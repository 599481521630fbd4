pub mod asset_server;

use crate::config::Settings;
use crate::infrastructure::local_address;
use crate::infrastructure::log_messages::{application, server};
use crate::proxy::certificate::{
    CertificateAuthority, CertificateSelector, RcgenAuthority, WhitelistTable,
};
use crate::proxy::dump::DiagnosticDump;
use crate::proxy::event_bus::InterceptionBus;
use crate::proxy::forwarder::{Forwarder, HttpForwarder};
use crate::proxy::interceptor::Interceptor;
use crate::proxy::pipeline::ResponsePipeline;
use crate::proxy::resolver::{ScriptInjector, TransformResolver};
use crate::proxy::service::ProxyServer;
use crate::proxy::types::{BodySizeLimit, Hostname};
use crate::{Error, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, instrument, warn};

/// Wires every component together and owns both listeners
pub struct Application {
    settings: Settings,
    bus: Arc<InterceptionBus>,
    proxy: ProxyServer,
    proxy_listener: TcpListener,
    assets: axum::Router,
    asset_listener: TcpListener,
}

impl Application {
    /// Build the proxy with the production upstream forwarder and bind its listeners
    #[instrument(skip_all)]
    pub async fn new(settings: Settings) -> Result<Self> {
        let forwarder = HttpForwarder::new()?;
        Self::with_forwarder(settings, Arc::new(forwarder)).await
    }

    #[instrument(skip_all)]
    pub async fn with_forwarder(settings: Settings, forwarder: Arc<dyn Forwarder>) -> Result<Self> {
        info!("{}", application::STARTING);
        let app = &settings.application;

        let authority = Arc::new(RcgenAuthority::load_or_generate(&app.cert.dir)?);
        let whitelist = if app.proxy.whitelist {
            WhitelistTable::load(&app.proxy.whitelist_hosts)?
        } else {
            WhitelistTable::Disabled
        };
        let root_certificate_pem = authority.root_certificate_pem().to_string();
        let selector = Arc::new(CertificateSelector::new(whitelist, authority));

        let domains = app
            .proxy
            .domains
            .iter()
            .map(Hostname::try_new)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| Error::invalid_input("application.proxy.domains"))?;
        // Scripts are served by the asset listener, so its bound port goes into the URLs
        let asset_listener = TcpListener::bind(settings.asset_bind_address()).await?;
        let asset_address = asset_listener.local_addr()?;
        info!(address = %asset_address, "{}", server::ASSETS_LISTENING);

        let local_ip = local_address::resolve(app.proxy.local_ip).await;
        let injector =
            ScriptInjector::new(local_ip, asset_address.port(), app.inject.scripts.clone());

        let bus = Arc::new(InterceptionBus::new());
        let resolver = TransformResolver::new(domains, app.proxy.method, injector, Arc::clone(&bus));

        let enabled_dumps = app
            .dump
            .iter()
            .filter(|(_, enabled)| **enabled)
            .map(|(name, _)| name.clone());
        let dump = DiagnosticDump::new(&app.dump_dir, enabled_dumps);
        let max_body_size = BodySizeLimit::try_new(app.proxy.max_body_size)
            .map_err(|_| Error::invalid_input("application.proxy.max_body_size"))?;
        let pipeline = ResponsePipeline::new(
            Arc::clone(&bus),
            dump,
            max_body_size,
            settings.listener_timeout(),
        );

        let interceptor = Arc::new(Interceptor::new(resolver, pipeline, forwarder));
        let proxy = ProxyServer::new(interceptor, selector);
        let proxy_listener = ProxyServer::bind(&settings.proxy_bind_address()).await?;

        let assets = asset_server::router(root_certificate_pem, &app.cert.static_dir);

        Ok(Self {
            settings,
            bus,
            proxy,
            proxy_listener,
            assets,
            asset_listener,
        })
    }

    /// Serve until Ctrl-C
    #[instrument(skip(self))]
    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Could not listen for Ctrl-C; running until killed");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Serve until `shutdown` completes or a listener fails
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!(
            proxy = %self.proxy_listener.local_addr()?,
            method = ?self.settings.application.proxy.method,
            whitelist = self.settings.application.proxy.whitelist,
            "{}",
            application::STARTED_SUCCESSFULLY
        );

        let proxy = Arc::new(self.proxy);
        tokio::select! {
            result = proxy.serve(self.proxy_listener) => result.map_err(Error::from),
            result = asset_server::serve(self.asset_listener, self.assets) => result.map_err(Error::from),
            () = shutdown => {
                info!("{}", application::SHUTTING_DOWN);
                Ok(())
            }
        }
    }

    /// Registration point for interception listeners
    pub fn event_bus(&self) -> Arc<InterceptionBus> {
        Arc::clone(&self.bus)
    }

    pub fn proxy_address(&self) -> Result<SocketAddr> {
        Ok(self.proxy_listener.local_addr()?)
    }

    pub fn asset_address(&self) -> Result<SocketAddr> {
        Ok(self.asset_listener.local_addr()?)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::types::ProxyMethod;

    fn settings(cert_dir: &std::path::Path, overrides: &[(&str, &str)]) -> Settings {
        let mut builder = Settings::builder()
            .unwrap()
            .set_override("application.host", "127.0.0.1")
            .unwrap()
            .set_override("application.port", 0)
            .unwrap()
            .set_override("application.cert.port", 0)
            .unwrap()
            .set_override("application.proxy.local_ip", "127.0.0.1")
            .unwrap()
            .set_override("application.cert.dir", cert_dir.to_string_lossy().to_string())
            .unwrap();
        for (key, value) in overrides {
            builder = builder.set_override(*key, *value).unwrap();
        }
        builder.build().unwrap().try_deserialize().unwrap()
    }

    #[tokio::test]
    async fn test_application_binds_and_persists_root() {
        let dir = tempfile::tempdir().unwrap();

        let app = Application::new(settings(dir.path(), &[])).await.unwrap();

        assert_ne!(app.proxy_address().unwrap().port(), 0);
        assert_ne!(app.asset_address().unwrap().port(), 0);
        assert!(dir.path().join("ca.crt").exists());
        assert_eq!(
            app.settings().application.proxy.method,
            ProxyMethod::Intercept
        );
    }

    #[tokio::test]
    async fn test_whitelist_with_missing_files_fails_startup() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path(), &[("application.proxy.whitelist", "true")]);
        for host in &mut settings.application.proxy.whitelist_hosts {
            host.certificate_path = dir.path().join("missing.crt");
        }

        assert!(matches!(
            Application::new(settings).await,
            Err(Error::Certificate(_))
        ));
    }

    #[tokio::test]
    async fn test_run_until_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let app = Application::new(settings(dir.path(), &[])).await.unwrap();

        let result = app.run_until(async {}).await;
        assert!(result.is_ok());
    }
}
