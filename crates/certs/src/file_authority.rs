//! Certificate authority backed by PEM files in a local directory.
//!
//! ## Certificate Hierarchy
//!
//! ```text
//! DevlinkCA (self-signed, ca.crt / ca.key)
//!     │
//!     ├── localhost (server.crt / server.key, secure listener)
//!     └── <app identity> (device.crt, one per signed CSR)
//! ```
//!
//! Key generation and signing run on the blocking pool so the caller's
//! runtime threads stay free for socket work.

use async_trait::async_trait;
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::ServerConfig;
use sha2::{Digest, Sha256};
use std::path::{Component, Path};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::FromDer;

use crate::authority::{CertificateAuthority, SignedCsr};
use crate::cert_store::{CertificateStore, DEVICE_CA_CERT_FILE, DEVICE_CLIENT_CERT_FILE};
use crate::error::{CertError, CertResult};
use crate::tls_config::mtls_server_config;

const CA_COMMON_NAME: &str = "DevlinkCA";
const SERVER_COMMON_NAME: &str = "localhost";
const ORG_NAME: &str = "Devlink";

const CA_VALIDITY_DAYS: u64 = 3650;
const LEAF_VALIDITY_DAYS: u64 = 365;

/// Certificates expiring inside this window are regenerated on load.
const MIN_CERT_EXPIRY_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Device id reported for platforms whose apps run on the desktop itself.
pub const LOCAL_DEVICE_ID: &str = "unknown";

const FINGERPRINT_BYTES: usize = 16;

pub struct FileCertificateAuthority {
    store: CertificateStore,
    // Serializes check-then-generate of the CA and server material.
    init_lock: Mutex<()>,
}

impl FileCertificateAuthority {
    pub fn new(store: CertificateStore) -> Self {
        Self {
            store,
            init_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &CertificateStore {
        &self.store
    }

    /// Make sure the CA and a valid server certificate issued by it exist.
    pub async fn ensure_certificate_material(&self) -> CertResult<()> {
        let _guard = self.init_lock.lock().await;
        let store = self.store.clone();
        run_blocking(move || ensure_material(&store)).await
    }
}

#[async_trait]
impl CertificateAuthority for FileCertificateAuthority {
    async fn load_server_tls_config(&self) -> CertResult<Arc<ServerConfig>> {
        self.ensure_certificate_material().await?;

        let store = self.store.clone();
        run_blocking(move || {
            let certs = store.load_cert_chain(&store.server_cert_path())?;
            let key = store.load_private_key(&store.server_key_path())?;
            let ca_certs = store.load_cert_chain(&store.ca_cert_path())?;
            mtls_server_config(certs, key, ca_certs)
        })
        .await
    }

    async fn extract_identity_from_csr(&self, csr: &str) -> CertResult<String> {
        extract_identity(&sanitize_csr(csr))
    }

    async fn resolve_device_id(
        &self,
        os: &str,
        identity: &str,
        csr_path: &str,
        csr: &str,
    ) -> CertResult<String> {
        let device_id = resolve_device(os, &sanitize_csr(csr))?;
        debug!(
            "Resolved device {} for {} on {} (csr path {})",
            device_id, identity, os, csr_path
        );
        Ok(device_id)
    }

    async fn sign_csr(&self, csr: &str, os: &str, destination: &str) -> CertResult<SignedCsr> {
        let csr = sanitize_csr(csr);
        if csr.trim().is_empty() {
            return Err(CertError::EmptyCsr { os: os.to_string() });
        }
        let destination_dir = validate_destination(destination)?.to_path_buf();

        self.ensure_certificate_material().await?;

        let store = self.store.clone();
        let os = os.to_string();
        run_blocking(move || {
            let identity = extract_identity(&csr)?;
            info!("Signing CSR for {} on {}", identity, os);

            let (issuer, issuer_key, ca_pem) = load_issuer(&store)?;
            let client_pem = sign_client_certificate(&csr, &issuer, &issuer_key)?;

            std::fs::create_dir_all(&destination_dir)
                .map_err(|e| CertError::io(destination_dir.display().to_string(), e))?;
            write_file(&destination_dir.join(DEVICE_CA_CERT_FILE), &ca_pem)?;
            write_file(&destination_dir.join(DEVICE_CLIENT_CERT_FILE), &client_pem)?;

            let device_id = resolve_device(&os, &csr)?;
            info!(
                "Finished processing CSR for {}, device identifier is '{}'",
                identity, device_id
            );
            Ok(SignedCsr { device_id })
        })
        .await
    }
}

async fn run_blocking<T, F>(f: F) -> CertResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> CertResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CertError::Signing(format!("certificate task failed: {}", e)))?
}

/// Strip everything that cannot appear in a PEM encoded CSR.
pub fn sanitize_csr(csr: &str) -> String {
    csr.chars()
        .filter(|c| c.is_ascii_alphanumeric() || "+/=-_".contains(*c) || c.is_ascii_whitespace())
        .collect()
}

fn is_valid_identity(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
}

fn with_csr<T>(csr: &str, f: impl FnOnce(&X509CertificationRequest<'_>) -> CertResult<T>) -> CertResult<T> {
    let (_, pem) = parse_x509_pem(csr.as_bytes()).map_err(|e| CertError::parse("CSR PEM", e))?;
    if pem.label != "CERTIFICATE REQUEST" {
        return Err(CertError::parse(
            "CSR PEM",
            format!("unexpected label {}", pem.label),
        ));
    }
    let (_, request) = X509CertificationRequest::from_der(&pem.contents)
        .map_err(|e| CertError::parse("CSR", e))?;
    f(&request)
}

/// Subject common name of a PEM CSR, validated as an app identity.
pub fn extract_identity(csr: &str) -> CertResult<String> {
    with_csr(csr, |request| {
        let cn = request
            .certification_request_info
            .subject
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .ok_or_else(|| CertError::parse("CSR subject", "no common name"))?
            .to_string();

        if !is_valid_identity(&cn) {
            return Err(CertError::InvalidIdentity(cn));
        }
        Ok(cn)
    })
}

fn resolve_device(os: &str, csr: &str) -> CertResult<String> {
    match os {
        "Android" | "iOS" => with_csr(csr, |request| {
            let digest = Sha256::digest(request.certification_request_info.subject_pki.raw);
            Ok(hex::encode(&digest[..FINGERPRINT_BYTES]))
        }),
        _ => Ok(LOCAL_DEVICE_ID.to_string()),
    }
}

/// Peers choose the destination, so only absolute paths without `..` are accepted.
fn validate_destination(destination: &str) -> CertResult<&Path> {
    let path = Path::new(destination);
    let traverses = path.components().any(|c| matches!(c, Component::ParentDir));
    if destination.is_empty() || !path.is_absolute() || traverses {
        return Err(CertError::InvalidDestination(destination.to_string()));
    }
    Ok(path)
}

fn write_file(path: &Path, contents: &str) -> CertResult<()> {
    std::fs::write(path, contents).map_err(|e| CertError::io(path.display().to_string(), e))
}

fn validity(params: &mut CertificateParams, days: u64) {
    let now = SystemTime::now();
    params.not_before = now.into();
    params.not_after = (now + Duration::from_secs(days * 24 * 60 * 60)).into();
}

fn generate_ca(store: &CertificateStore) -> CertResult<()> {
    info!("Generating certificate authority in {}", store.dir().display());

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, CA_COMMON_NAME);
    dn.push(DnType::OrganizationName, ORG_NAME);
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    validity(&mut params, CA_VALIDITY_DAYS);

    let key_pair = KeyPair::generate()
        .map_err(|e| CertError::Signing(format!("failed to generate CA key pair: {}", e)))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| CertError::Signing(format!("failed to create CA certificate: {}", e)))?;

    store.write_pem(&store.ca_key_path(), &key_pair.serialize_pem())?;
    store.write_pem(&store.ca_cert_path(), &cert.pem())?;
    Ok(())
}

/// Issuer handle for the stored CA plus the CA certificate as distributed.
fn load_issuer(store: &CertificateStore) -> CertResult<(rcgen::Certificate, KeyPair, String)> {
    let key_pem = store.read_pem(&store.ca_key_path())?;
    let cert_pem = store.read_pem(&store.ca_cert_path())?;

    let key_pair = KeyPair::from_pem(&key_pem).map_err(|e| CertError::parse("CA key", e))?;
    let params = CertificateParams::from_ca_cert_pem(&cert_pem)
        .map_err(|e| CertError::parse("CA certificate", e))?;
    // Re-signing with the stored key keeps subject and key identical to ca.crt.
    let issuer = params
        .self_signed(&key_pair)
        .map_err(|e| CertError::Signing(format!("failed to load CA: {}", e)))?;

    Ok((issuer, key_pair, cert_pem))
}

fn generate_server_cert(store: &CertificateStore) -> CertResult<()> {
    info!("Generating server certificate for the secure listener");

    let (issuer, issuer_key, _) = load_issuer(store)?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, SERVER_COMMON_NAME);
    dn.push(DnType::OrganizationName, ORG_NAME);
    params.distinguished_name = dn;
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    let dns_name = rcgen::Ia5String::try_from(SERVER_COMMON_NAME.to_string())
        .map_err(|e| CertError::Signing(format!("invalid DNS name: {:?}", e)))?;
    params.subject_alt_names = vec![
        SanType::DnsName(dns_name),
        SanType::IpAddress(std::net::IpAddr::from([127, 0, 0, 1])),
    ];
    validity(&mut params, LEAF_VALIDITY_DAYS);

    let key_pair = KeyPair::generate()
        .map_err(|e| CertError::Signing(format!("failed to generate server key pair: {}", e)))?;
    let cert = params
        .signed_by(&key_pair, &issuer, &issuer_key)
        .map_err(|e| CertError::Signing(format!("failed to sign server certificate: {}", e)))?;

    store.write_pem(&store.server_key_path(), &key_pair.serialize_pem())?;
    store.write_pem(&store.server_cert_path(), &cert.pem())?;
    Ok(())
}

fn sign_client_certificate(
    csr: &str,
    issuer: &rcgen::Certificate,
    issuer_key: &KeyPair,
) -> CertResult<String> {
    let mut request =
        CertificateSigningRequestParams::from_pem(csr).map_err(|e| CertError::parse("CSR", e))?;

    request.params.is_ca = IsCa::NoCa;
    request.params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    request.params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
    validity(&mut request.params, LEAF_VALIDITY_DAYS);

    let cert = request
        .signed_by(issuer, issuer_key)
        .map_err(|e| CertError::Signing(format!("failed to sign client certificate: {}", e)))?;
    Ok(cert.pem())
}

fn ensure_material(store: &CertificateStore) -> CertResult<()> {
    let ca_usable = store.ca_exists()
        && !store.expires_within(&store.ca_cert_path(), MIN_CERT_EXPIRY_WINDOW)?;
    if !ca_usable {
        generate_ca(store)?;
    }

    let server_usable = ca_usable
        && store.server_cert_exists()
        && !store.expires_within(&store.server_cert_path(), MIN_CERT_EXPIRY_WINDOW)?
        && store.server_cert_issued_by_ca()?;
    if !server_usable {
        if store.server_cert_exists() {
            warn!("Server certificate is stale or not issued by the current CA, regenerating");
        }
        generate_server_cert(store)?;
    }

    Ok(())
}
