//! TLS identity selection for intercepted connections
//!
//! This module provides:
//! - The [`CertificateAuthority`] seam and an rcgen-backed implementation that
//!   mints per-host leaf certificates from a persisted root
//! - The whitelist table of statically provisioned identities
//! - [`CertificateSelector`], which picks the identity presented for a host
//! - [`SniResolver`], which plugs the selector into the rustls handshake

use crate::proxy::types::Hostname;
use parking_lot::RwLock;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// File name of the persisted root certificate
pub const ROOT_CERT_FILE: &str = "ca.crt";

/// File name of the persisted root private key
pub const ROOT_KEY_FILE: &str = "ca.key";

/// How long a signed leaf is reused before it is minted again
pub const LEAF_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Host used when the client sends no SNI and nothing better is known
pub const DEFAULT_IDENTITY_HOST: &str = "localhost";

/// Errors raised while loading or minting certificates
#[derive(Error, Debug)]
pub enum CertificateError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No {kind} found in {path}")]
    MissingPem { path: PathBuf, kind: &'static str },

    #[error("Certificate generation failed: {0}")]
    Generation(#[from] rcgen::Error),

    #[error("Signing for '{hostname}' failed: {reason}")]
    Signing { hostname: String, reason: String },

    #[error("Invalid whitelist hostname '{hostname}': {reason}")]
    InvalidHostname { hostname: String, reason: String },

    #[error("Unusable private key: {0}")]
    InvalidKey(String),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),
}

impl CertificateError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Certificate chain and private key presented during a handshake
pub struct TlsIdentity {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl TlsIdentity {
    /// Convert into the form rustls hands to the handshake
    pub fn certified_key(&self) -> Result<Arc<CertifiedKey>, CertificateError> {
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&self.key)
            .map_err(|e| CertificateError::InvalidKey(e.to_string()))?;
        Ok(Arc::new(CertifiedKey::new(
            self.cert_chain.clone(),
            signing_key,
        )))
    }

    /// Leaf certificate (first in chain)
    pub fn leaf(&self) -> Option<&CertificateDer<'static>> {
        self.cert_chain.first()
    }
}

impl Clone for TlsIdentity {
    fn clone(&self) -> Self {
        Self {
            cert_chain: self.cert_chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("chain_len", &self.cert_chain.len())
            .finish_non_exhaustive()
    }
}

// ========== Certificate Authority ==========

/// Source of dynamically signed identities
pub trait CertificateAuthority: Send + Sync + fmt::Debug {
    /// Root certificate in PEM form, as users install it
    fn root_certificate_pem(&self) -> &str;

    /// Root certificate in DER form
    fn root_certificate(&self) -> &CertificateDer<'static>;

    /// Sign a leaf for `hostname`
    fn sign(&self, hostname: &str) -> Result<TlsIdentity, CertificateError>;

    /// Identity used when no host name is available at all
    fn default_identity(&self) -> Result<TlsIdentity, CertificateError> {
        self.sign(DEFAULT_IDENTITY_HOST)
    }
}

struct CachedIdentity {
    identity: TlsIdentity,
    expires_at: Instant,
}

/// Root authority backed by rcgen; leaves are cached per host name
pub struct RcgenAuthority {
    ca_cert: rcgen::Certificate,
    ca_key: rcgen::KeyPair,
    ca_cert_pem: String,
    ca_cert_der: CertificateDer<'static>,
    cache: RwLock<HashMap<String, CachedIdentity>>,
}

impl fmt::Debug for RcgenAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RcgenAuthority")
            .field("cached_leaves", &self.cache.read().len())
            .finish_non_exhaustive()
    }
}

impl RcgenAuthority {
    /// Generate a fresh root, valid for ten years
    pub fn generate() -> Result<Self, CertificateError> {
        use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
        use time::{Duration as TimeDuration, OffsetDateTime};

        let ca_key = KeyPair::generate()?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "FFRK Proxy Root CA");
        dn.push(DnType::OrganizationName, "FFRK Proxy");
        params.distinguished_name = dn;

        let now = OffsetDateTime::now_utc();
        params.not_before = now - TimeDuration::minutes(5);
        params.not_after = now + TimeDuration::days(3650);
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params.key_usages = vec![
            rcgen::KeyUsagePurpose::KeyCertSign,
            rcgen::KeyUsagePurpose::CrlSign,
        ];

        let ca_cert = params.self_signed(&ca_key)?;
        let ca_cert_pem = ca_cert.pem();
        let ca_cert_der = CertificateDer::from(ca_cert.der().to_vec());

        Ok(Self {
            ca_cert,
            ca_key,
            ca_cert_pem,
            ca_cert_der,
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// Load a root from PEM text
    ///
    /// The signing certificate is rebuilt from the stored subject and key so
    /// issued leaves chain to the PEM that clients have installed.
    pub fn from_pem(ca_cert_pem: &str, ca_key_pem: &str) -> Result<Self, CertificateError> {
        let ca_key = rcgen::KeyPair::from_pem(ca_key_pem)?;
        let params = rcgen::CertificateParams::from_ca_cert_pem(ca_cert_pem)?;
        let ca_cert = params.self_signed(&ca_key)?;

        let ca_cert_der = rustls_pemfile::certs(&mut ca_cert_pem.as_bytes())
            .next()
            .ok_or_else(|| CertificateError::MissingPem {
                path: PathBuf::from(ROOT_CERT_FILE),
                kind: "certificate",
            })?
            .map_err(|e| CertificateError::io(Path::new(ROOT_CERT_FILE), e))?;

        Ok(Self {
            ca_cert,
            ca_key,
            ca_cert_pem: ca_cert_pem.to_string(),
            ca_cert_der,
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// Load `ca.crt`/`ca.key` from `dir`, creating and persisting them on first run
    pub fn load_or_generate(dir: &Path) -> Result<Self, CertificateError> {
        let cert_path = dir.join(ROOT_CERT_FILE);
        let key_path = dir.join(ROOT_KEY_FILE);

        if cert_path.exists() && key_path.exists() {
            let cert_pem = std::fs::read_to_string(&cert_path)
                .map_err(|e| CertificateError::io(&cert_path, e))?;
            let key_pem = std::fs::read_to_string(&key_path)
                .map_err(|e| CertificateError::io(&key_path, e))?;
            info!(path = %cert_path.display(), "Loaded root certificate");
            return Self::from_pem(&cert_pem, &key_pem);
        }

        let authority = Self::generate()?;
        std::fs::create_dir_all(dir).map_err(|e| CertificateError::io(dir, e))?;
        std::fs::write(&cert_path, authority.ca_cert_pem.as_bytes())
            .map_err(|e| CertificateError::io(&cert_path, e))?;
        std::fs::write(&key_path, authority.ca_key.serialize_pem().as_bytes())
            .map_err(|e| CertificateError::io(&key_path, e))?;
        info!(path = %cert_path.display(), "Generated new root certificate");

        Ok(authority)
    }

    fn mint(&self, hostname: &str) -> Result<TlsIdentity, CertificateError> {
        use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
        use time::{Duration as TimeDuration, OffsetDateTime};

        let signing_error = |reason: String| CertificateError::Signing {
            hostname: hostname.to_string(),
            reason,
        };

        let key_pair = KeyPair::generate().map_err(|e| signing_error(e.to_string()))?;

        let mut params = if let Ok(ip) = hostname.parse::<std::net::IpAddr>() {
            let mut p = CertificateParams::default();
            p.subject_alt_names = vec![SanType::IpAddress(ip)];
            p
        } else {
            CertificateParams::new(vec![hostname.to_string()])
                .map_err(|e| signing_error(e.to_string()))?
        };

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, hostname);
        params.distinguished_name = dn;

        let now = OffsetDateTime::now_utc();
        params.not_before = now - TimeDuration::minutes(5);
        params.not_after = now + TimeDuration::days(30);
        params.is_ca = rcgen::IsCa::NoCa;
        params.key_usages = vec![
            rcgen::KeyUsagePurpose::DigitalSignature,
            rcgen::KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];

        let cert = params
            .signed_by(&key_pair, &self.ca_cert, &self.ca_key)
            .map_err(|e| signing_error(e.to_string()))?;

        Ok(TlsIdentity {
            cert_chain: vec![
                CertificateDer::from(cert.der().to_vec()),
                self.ca_cert_der.clone(),
            ],
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der())),
        })
    }
}

impl CertificateAuthority for RcgenAuthority {
    fn root_certificate_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    fn root_certificate(&self) -> &CertificateDer<'static> {
        &self.ca_cert_der
    }

    fn sign(&self, hostname: &str) -> Result<TlsIdentity, CertificateError> {
        let now = Instant::now();
        if let Some(cached) = self.cache.read().get(hostname) {
            if cached.expires_at > now {
                return Ok(cached.identity.clone());
            }
        }

        debug!(hostname, "Signing leaf certificate");
        let identity = self.mint(hostname)?;

        let mut cache = self.cache.write();
        cache.retain(|_, entry| entry.expires_at > now);
        cache.insert(
            hostname.to_string(),
            CachedIdentity {
                identity: identity.clone(),
                expires_at: now + LEAF_CACHE_TTL,
            },
        );

        Ok(identity)
    }
}

// ========== Whitelist ==========

/// Statically provisioned identity for one host, as configured
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct HostIdentity {
    pub hostname: String,
    pub certificate_path: PathBuf,
    pub key_path: PathBuf,
}

impl HostIdentity {
    /// Read the PEM files this entry points at
    pub fn load(&self) -> Result<TlsIdentity, CertificateError> {
        let cert_pem = std::fs::read(&self.certificate_path)
            .map_err(|e| CertificateError::io(&self.certificate_path, e))?;
        let cert_chain = rustls_pemfile::certs(&mut cert_pem.as_slice())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CertificateError::io(&self.certificate_path, e))?;
        if cert_chain.is_empty() {
            return Err(CertificateError::MissingPem {
                path: self.certificate_path.clone(),
                kind: "certificate",
            });
        }

        let key_pem =
            std::fs::read(&self.key_path).map_err(|e| CertificateError::io(&self.key_path, e))?;
        let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
            .map_err(|e| CertificateError::io(&self.key_path, e))?
            .ok_or_else(|| CertificateError::MissingPem {
                path: self.key_path.clone(),
                kind: "private key",
            })?;

        Ok(TlsIdentity { cert_chain, key })
    }
}

/// Hosts that present a static identity instead of a signed one
#[derive(Debug, Default)]
pub enum WhitelistTable {
    /// Whitelist mode off; every host is signed dynamically
    #[default]
    Disabled,
    Enabled(HashMap<Hostname, TlsIdentity>),
}

impl WhitelistTable {
    /// Load every configured identity; any unreadable entry fails startup
    pub fn load(entries: &[HostIdentity]) -> Result<Self, CertificateError> {
        let mut table = HashMap::with_capacity(entries.len());
        for entry in entries {
            let hostname = Hostname::try_new(&entry.hostname).map_err(|e| {
                CertificateError::InvalidHostname {
                    hostname: entry.hostname.clone(),
                    reason: e.to_string(),
                }
            })?;
            table.insert(hostname, entry.load()?);
            info!(hostname = %entry.hostname, "Whitelisted static identity");
        }
        Ok(Self::Enabled(table))
    }

    /// Static identity for `hostname`, exact match only
    pub fn get(&self, hostname: &Hostname) -> Option<&TlsIdentity> {
        match self {
            Self::Disabled => None,
            Self::Enabled(table) => table.get(hostname),
        }
    }
}

// ========== Selection ==========

/// Chooses the identity presented for a requested host
#[derive(Debug)]
pub struct CertificateSelector {
    whitelist: WhitelistTable,
    authority: Arc<dyn CertificateAuthority>,
}

impl CertificateSelector {
    pub fn new(whitelist: WhitelistTable, authority: Arc<dyn CertificateAuthority>) -> Self {
        Self {
            whitelist,
            authority,
        }
    }

    /// Static pair when whitelisted, otherwise a leaf signed by the root
    pub fn select_identity(&self, hostname: &Hostname) -> Result<TlsIdentity, CertificateError> {
        if let Some(identity) = self.whitelist.get(hostname) {
            debug!(%hostname, "Presenting whitelisted identity");
            return Ok(identity.clone());
        }
        self.authority.sign(hostname.as_str())
    }

    pub fn authority(&self) -> &Arc<dyn CertificateAuthority> {
        &self.authority
    }
}

/// rustls hook that resolves the server certificate from the client's SNI
#[derive(Debug)]
pub struct SniResolver {
    selector: Arc<CertificateSelector>,
    fallback: Option<Hostname>,
}

impl SniResolver {
    /// `fallback` is used when the client omits SNI (e.g. the CONNECT host)
    pub fn new(selector: Arc<CertificateSelector>, fallback: Option<Hostname>) -> Self {
        Self { selector, fallback }
    }

    fn identity_for(&self, sni: Option<&str>) -> Result<TlsIdentity, CertificateError> {
        let requested = sni.and_then(|name| Hostname::try_new(name).ok());
        match requested.as_ref().or(self.fallback.as_ref()) {
            Some(hostname) => self.selector.select_identity(hostname),
            None => self.selector.authority().default_identity(),
        }
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let sni = client_hello.server_name();
        match self.identity_for(sni).and_then(|id| id.certified_key()) {
            Ok(key) => Some(key),
            Err(e) => {
                // Returning None aborts this handshake only
                warn!(sni = ?sni, error = %e, "No certificate for handshake");
                None
            }
        }
    }
}

/// Server-side TLS configuration for one intercepted connection
pub fn server_config(
    selector: Arc<CertificateSelector>,
    fallback: Option<Hostname>,
) -> Result<Arc<ServerConfig>, CertificateError> {
    let mut config =
        ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(SniResolver::new(selector, fallback)));
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}
