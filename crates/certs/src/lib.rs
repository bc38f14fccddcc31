//! Certificate handling for the device connection server.
//!
//! The connection server only talks to the [`CertificateAuthority`] trait.
//! [`FileCertificateAuthority`] is the stock implementation: it keeps its CA
//! and server key pairs in a directory and signs device CSRs with rcgen.

pub mod authority;
pub mod cert_store;
pub mod error;
pub mod file_authority;
pub mod tls_config;

pub use authority::{CertificateAuthority, SignedCsr};
pub use cert_store::CertificateStore;
pub use error::{CertError, CertResult};
pub use file_authority::{FileCertificateAuthority, LOCAL_DEVICE_ID};
pub use tls_config::{mtls_client_config, mtls_server_config};
