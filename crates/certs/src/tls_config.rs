//! rustls configuration builders for the secure listener and its peers.
//!
//! Both builders pin the ring provider instead of relying on a process-wide
//! default, so callers never have to install one first.

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{CertError, CertResult};

fn root_store(ca_certs: Vec<CertificateDer<'static>>) -> CertResult<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in ca_certs {
        roots
            .add(cert)
            .map_err(|e| CertError::TlsConfig(format!("failed to add CA certificate: {}", e)))?;
    }
    Ok(roots)
}

/// Server configuration that only admits clients whose certificate chains to `ca_certs`.
pub fn mtls_server_config(
    server_certs: Vec<CertificateDer<'static>>,
    server_key: PrivateKeyDer<'static>,
    ca_certs: Vec<CertificateDer<'static>>,
) -> CertResult<Arc<ServerConfig>> {
    info!("Building mTLS server configuration");

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let roots = root_store(ca_certs)?;

    let client_verifier =
        WebPkiClientVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider))
            .build()
            .map_err(|e| CertError::TlsConfig(format!("failed to build client verifier: {}", e)))?;

    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| CertError::TlsConfig(e.to_string()))?
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(server_certs, server_key)
        .map_err(|e| CertError::TlsConfig(format!("failed to build server config: {}", e)))?;

    debug!("mTLS server configuration ready");
    Ok(Arc::new(config))
}

/// Client configuration a paired device uses to reach the secure listener.
pub fn mtls_client_config(
    client_certs: Vec<CertificateDer<'static>>,
    client_key: PrivateKeyDer<'static>,
    ca_certs: Vec<CertificateDer<'static>>,
) -> CertResult<Arc<ClientConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let roots = root_store(ca_certs)?;

    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| CertError::TlsConfig(e.to_string()))?
        .with_root_certificates(roots)
        .with_client_auth_cert(client_certs, client_key)
        .map_err(|e| CertError::TlsConfig(format!("failed to build client config: {}", e)))?;

    Ok(Arc::new(config))
}
