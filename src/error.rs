use crate::proxy::certificate::CertificateError;
use crate::proxy::types::ProxyError;
use thiserror::Error;

/// FFRK proxy application error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Certificate error: {0}")]
    Certificate(#[from] CertificateError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid input: {field}")]
    InvalidInput { field: String },
}

impl Error {
    pub fn invalid_input(field: impl Into<String>) -> Self {
        Self::InvalidInput {
            field: field.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
