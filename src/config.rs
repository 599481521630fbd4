use crate::proxy::certificate::HostIdentity;
use crate::proxy::types::ProxyMethod;
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Game-server hosts whose responses are eligible for rewriting
pub const DEFAULT_GAME_DOMAINS: [&str; 2] = ["ffrk.denagames.com", "dff.sp.mbga.jp"];

/// Scripts appended to the battle page, in load order
pub const DEFAULT_INJECT_SCRIPTS: [&str; 6] =
    ["inject", "buddy", "enemy", "magicite", "rounds", "supporter"];

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub application: ApplicationSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApplicationSettings {
    pub host: String,
    pub port: u16,
    pub proxy: ProxySettings,
    pub cert: CertSettings,
    /// Per-name dump switches, `application.dump.<name> = true`
    #[serde(default)]
    pub dump: HashMap<String, bool>,
    pub dump_dir: PathBuf,
    #[serde(default)]
    pub inject: InjectSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxySettings {
    pub whitelist: bool,
    #[serde(default = "default_whitelist_hosts")]
    pub whitelist_hosts: Vec<HostIdentity>,
    pub method: ProxyMethod,
    #[serde(default = "default_domains")]
    pub domains: Vec<String>,
    #[serde(default)]
    pub local_ip: Option<IpAddr>,
    pub max_body_size: usize,
    pub listener_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CertSettings {
    pub port: u16,
    pub dir: PathBuf,
    pub static_dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InjectSettings {
    #[serde(default = "default_inject_scripts")]
    pub scripts: Vec<String>,
}

impl Default for InjectSettings {
    fn default() -> Self {
        Self {
            scripts: default_inject_scripts(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
    pub format: String,
}

fn default_domains() -> Vec<String> {
    DEFAULT_GAME_DOMAINS.iter().map(|d| d.to_string()).collect()
}

fn default_inject_scripts() -> Vec<String> {
    DEFAULT_INJECT_SCRIPTS.iter().map(|s| s.to_string()).collect()
}

fn default_whitelist_hosts() -> Vec<HostIdentity> {
    vec![
        HostIdentity {
            hostname: "ffrk.denagames.com".to_string(),
            certificate_path: PathBuf::from("cert/wwe.crt"),
            key_path: PathBuf::from("cert/wwe.key"),
        },
        HostIdentity {
            hostname: "dff.sp.mbga.jp".to_string(),
            certificate_path: PathBuf::from("cert/jp.crt"),
            key_path: PathBuf::from("cert/jp.key"),
        },
    ]
}

impl Settings {
    /// Load settings from defaults, optional config files and `FFRK_PROXY__*` variables
    pub fn new() -> Result<Self, ConfigError> {
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        let config = Self::builder()?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{environment}")).required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(Environment::with_prefix("FFRK_PROXY").separator("__"))
            .build()?;

        config.try_deserialize()
    }

    /// Builder pre-populated with every default; callers add sources or overrides
    pub fn builder() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        Config::builder()
            .set_default("application.host", "0.0.0.0")?
            .set_default("application.port", 8888)?
            .set_default("application.proxy.whitelist", false)?
            .set_default("application.proxy.method", "intercept")?
            .set_default("application.proxy.max_body_size", 10 * 1024 * 1024)?
            .set_default("application.proxy.listener_timeout_ms", 10_000)?
            .set_default("application.cert.port", 8889)?
            .set_default("application.cert.dir", "cert")?
            .set_default("application.cert.static_dir", "public/js")?
            .set_default("application.dump_dir", "dump")?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")
    }

    pub fn proxy_bind_address(&self) -> String {
        format!("{}:{}", self.application.host, self.application.port)
    }

    pub fn asset_bind_address(&self) -> String {
        format!("{}:{}", self.application.host, self.application.cert.port)
    }

    /// Whether raw payloads captured under `name` should be written to disk
    pub fn dump_enabled(&self, name: &str) -> bool {
        self.application.dump.get(name).copied().unwrap_or(false)
    }

    pub fn listener_timeout(&self) -> Duration {
        Duration::from_millis(self.application.proxy.listener_timeout_ms)
    }
}
