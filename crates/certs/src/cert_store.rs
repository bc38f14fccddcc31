//! On-disk layout of the desktop side's certificate material.
//!
//! The store keeps the CA key pair and the secure listener's key pair in
//! one directory and knows how to load and inspect them.

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;
use x509_parser::prelude::*;

use crate::error::{CertError, CertResult};

pub const CA_KEY_FILE: &str = "ca.key";
pub const CA_CERT_FILE: &str = "ca.crt";
pub const SERVER_KEY_FILE: &str = "server.key";
pub const SERVER_CERT_FILE: &str = "server.crt";

/// File names a device expects in its certificate destination.
pub const DEVICE_CA_CERT_FILE: &str = "sonarCA.crt";
pub const DEVICE_CLIENT_CERT_FILE: &str = "device.crt";

#[derive(Debug, Clone)]
pub struct CertificateStore {
    dir: PathBuf,
}

impl CertificateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ca_key_path(&self) -> PathBuf {
        self.dir.join(CA_KEY_FILE)
    }

    pub fn ca_cert_path(&self) -> PathBuf {
        self.dir.join(CA_CERT_FILE)
    }

    pub fn server_key_path(&self) -> PathBuf {
        self.dir.join(SERVER_KEY_FILE)
    }

    pub fn server_cert_path(&self) -> PathBuf {
        self.dir.join(SERVER_CERT_FILE)
    }

    pub fn ca_exists(&self) -> bool {
        self.ca_key_path().exists() && self.ca_cert_path().exists()
    }

    pub fn server_cert_exists(&self) -> bool {
        self.server_key_path().exists() && self.server_cert_path().exists()
    }

    pub fn read_pem(&self, path: &Path) -> CertResult<String> {
        std::fs::read_to_string(path).map_err(|e| CertError::io(path.display().to_string(), e))
    }

    pub fn write_pem(&self, path: &Path, contents: &str) -> CertResult<()> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| CertError::io(self.dir.display().to_string(), e))?;
        std::fs::write(path, contents).map_err(|e| CertError::io(path.display().to_string(), e))
    }

    /// Load a certificate chain from a PEM file.
    pub fn load_cert_chain(&self, path: &Path) -> CertResult<Vec<CertificateDer<'static>>> {
        let file = File::open(path).map_err(|e| CertError::io(path.display().to_string(), e))?;
        let mut reader = BufReader::new(file);
        let certs: Vec<CertificateDer> = rustls_pemfile::certs(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CertError::parse(path.display().to_string(), e))?;

        if certs.is_empty() {
            return Err(CertError::parse(
                path.display().to_string(),
                "no certificates found",
            ));
        }

        Ok(certs)
    }

    /// Load a private key from a PEM file. PKCS8 first, then PKCS1 (RSA).
    pub fn load_private_key(&self, path: &Path) -> CertResult<PrivateKeyDer<'static>> {
        let file = File::open(path).map_err(|e| CertError::io(path.display().to_string(), e))?;
        let mut reader = BufReader::new(file);

        if let Some(key) = rustls_pemfile::pkcs8_private_keys(&mut reader)
            .next()
            .transpose()
            .map_err(|e| CertError::parse(path.display().to_string(), e))?
        {
            debug!("Loaded PKCS8 private key from {}", path.display());
            return Ok(PrivateKeyDer::Pkcs8(key));
        }

        let file = File::open(path).map_err(|e| CertError::io(path.display().to_string(), e))?;
        let mut reader = BufReader::new(file);

        if let Some(key) = rustls_pemfile::rsa_private_keys(&mut reader)
            .next()
            .transpose()
            .map_err(|e| CertError::parse(path.display().to_string(), e))?
        {
            debug!("Loaded PKCS1 (RSA) private key from {}", path.display());
            return Ok(PrivateKeyDer::Pkcs1(key));
        }

        Err(CertError::parse(
            path.display().to_string(),
            "no private key found",
        ))
    }

    /// True when the first certificate in `path` expires within `window`.
    pub fn expires_within(&self, path: &Path, window: Duration) -> CertResult<bool> {
        let certs = self.load_cert_chain(path)?;
        let cert = &certs[0];
        let (_, parsed) = X509Certificate::from_der(cert.as_ref())
            .map_err(|e| CertError::parse(path.display().to_string(), e))?;

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| CertError::parse("system clock", e))?
            .as_secs() as i64;

        let not_after = parsed.validity().not_after.timestamp();
        let remaining = not_after - now;

        Ok(remaining < window.as_secs() as i64)
    }

    /// True when the server certificate names the stored CA as its issuer.
    pub fn server_cert_issued_by_ca(&self) -> CertResult<bool> {
        let ca_chain = self.load_cert_chain(&self.ca_cert_path())?;
        let server_chain = self.load_cert_chain(&self.server_cert_path())?;

        let (_, ca) = X509Certificate::from_der(ca_chain[0].as_ref())
            .map_err(|e| CertError::parse("CA certificate", e))?;
        let (_, server) = X509Certificate::from_der(server_chain[0].as_ref())
            .map_err(|e| CertError::parse("server certificate", e))?;

        Ok(server.issuer().to_string() == ca.subject().to_string())
    }
}
