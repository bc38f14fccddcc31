//! The certificate authority seam used by the connection server.

use async_trait::async_trait;
use rustls::ServerConfig;
use std::sync::Arc;

use crate::error::CertResult;

/// Outcome of signing a device CSR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedCsr {
    pub device_id: String,
}

/// Issues and validates the certificates that let a peer move from the
/// insecure listener to the mutually authenticated one.
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// TLS configuration for the secure listener. Must require client certificates.
    async fn load_server_tls_config(&self) -> CertResult<Arc<ServerConfig>>;

    /// App identity embedded in the CSR subject.
    async fn extract_identity_from_csr(&self, csr: &str) -> CertResult<String>;

    /// Device that produced `csr`, as seen by the desktop side.
    async fn resolve_device_id(
        &self,
        os: &str,
        identity: &str,
        csr_path: &str,
        csr: &str,
    ) -> CertResult<String>;

    /// Sign `csr` and deliver the resulting material to `destination`.
    async fn sign_csr(&self, csr: &str, os: &str, destination: &str) -> CertResult<SignedCsr>;
}
