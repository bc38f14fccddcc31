//! Certificate error types.

use std::io;
use thiserror::Error;

/// Errors raised by certificate authority operations.
#[derive(Debug, Error)]
pub enum CertError {
    /// Reading or writing certificate material failed.
    #[error("certificate I/O on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    /// PEM or DER content could not be parsed.
    #[error("failed to parse {what}: {reason}")]
    Parse { what: String, reason: String },

    /// The peer sent an empty certificate signing request.
    #[error("received empty CSR from {os} device")]
    EmptyCsr { os: String },

    /// The CSR subject is not an acceptable app identity.
    #[error("CSR common name {0:?} is not a valid app identity")]
    InvalidIdentity(String),

    /// The staging destination supplied by the peer was rejected.
    #[error("rejected certificate destination {0:?}")]
    InvalidDestination(String),

    /// Key generation or certificate signing failed.
    #[error("signing failed: {0}")]
    Signing(String),

    /// rustls refused the assembled configuration.
    #[error("TLS configuration error: {0}")]
    TlsConfig(String),
}

impl CertError {
    pub(crate) fn io(path: impl Into<String>, source: io::Error) -> Self {
        CertError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn parse(what: impl Into<String>, reason: impl ToString) -> Self {
        CertError::Parse {
            what: what.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type for certificate operations.
pub type CertResult<T> = Result<T, CertError>;
