use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Minimum client SDK version whose app name is stable across reconnects.
pub const MIN_STABLE_SDK_VERSION: u32 = 3;

/// Suffix appended to app names reported by SDKs older than [`MIN_STABLE_SDK_VERSION`].
pub const OUTDATED_SDK_SUFFIX: &str = " (Outdated SDK)";

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Malformed query: {0}")]
    MalformedQuery(String),

    #[error("Certificate error: {0}")]
    CertificateError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Platform {os} is disabled")]
    PlatformDisabled { os: String },

    #[error("Session {id} failed to initialize: {reason}")]
    SessionInitFailed { id: String, reason: String },
}

/// Identity a peer claims before any trust is established.
///
/// Every field is attacker controlled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerQuery {
    pub app: String,
    pub os: String,
    pub device: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdk_version: Option<u32>,
}

impl PeerQuery {
    pub fn new(app: impl Into<String>, os: impl Into<String>, device: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            os: os.into(),
            device: device.into(),
            device_id: None,
            sdk_version: None,
        }
    }

    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn with_sdk_version(mut self, sdk_version: u32) -> Self {
        self.sdk_version = Some(sdk_version);
        self
    }

    /// Older SDKs report an app name that is not fixed across emulator
    /// restarts, so their sessions may land under the wrong device.
    pub fn is_outdated_sdk(&self) -> bool {
        self.sdk_version
            .map(|v| v < MIN_STABLE_SDK_VERSION)
            .unwrap_or(true)
    }

    /// App name with the outdated-SDK marker applied when it is due.
    pub fn app_name_with_update_hint(&self) -> String {
        if self.is_outdated_sdk() {
            format!("{}{}", self.app, OUTDATED_SDK_SUFFIX)
        } else {
            self.app.clone()
        }
    }

    /// Key used by the reconnect-storm tracker.
    pub fn tracker_key(&self) -> String {
        format!("{}-{}-{}", self.os, self.device, self.app)
    }

    /// Key correlating a CSR exchange with the secure connection that should follow it.
    pub fn setup_key(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.app,
            self.os,
            self.device,
            self.device_id.as_deref().unwrap_or_default()
        )
    }
}

/// CSR material that may accompany a query on the secure path.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CsrQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub csr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub csr_path: Option<String>,
}

impl CsrQuery {
    /// Both halves are required before the certificate authority is consulted.
    pub fn pair(&self) -> Option<(&str, &str)> {
        match (self.csr.as_deref(), self.csr_path.as_deref()) {
            (Some(csr), Some(path)) if !csr.is_empty() && !path.is_empty() => Some((csr, path)),
            _ => None,
        }
    }
}

/// First frame sent on the secure listener.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecureQuery {
    #[serde(flatten)]
    pub query: PeerQuery,
    #[serde(flatten)]
    pub csr: CsrQuery,
}

/// De-duplication key of one logical peer: `{app}#{os}#{device}#{device_id}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// `query.app` is used verbatim; apply the outdated-SDK marker before calling.
    pub fn derive(query: &PeerQuery, resolved_device_id: &str) -> Self {
        ConnectionId(format!(
            "{}#{}#{}#{}",
            query.app, query.os, query.device, resolved_device_id
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        ConnectionId(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        ConnectionId(s.to_string())
    }
}

/// A peer that has started pairing on the insecure listener.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UninitializedClient {
    pub os: String,
    pub device_name: String,
    pub app_name: String,
}

impl From<&PeerQuery> for UninitializedClient {
    fn from(query: &PeerQuery) -> Self {
        Self {
            os: query.os.clone(),
            device_name: query.device.clone(),
            app_name: query.app_name_with_update_hint(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ListenerKind {
    Secure,
    Insecure,
}

impl fmt::Display for ListenerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerKind::Secure => write!(f, "SECURE"),
            ListenerKind::Insecure => write!(f, "INSECURE"),
        }
    }
}

/// Read-only view of one registry entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSnapshot {
    pub id: ConnectionId,
    pub query: PeerQuery,
    pub plugins: Vec<String>,
    pub connected_at: DateTime<Utc>,
}

pub type Result<T> = std::result::Result<T, LinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_format() {
        let query = PeerQuery::new("Foo", "Android", "Pixel").with_device_id("abc");
        let id = ConnectionId::derive(&query, "abc");
        assert_eq!(id.as_str(), "Foo#Android#Pixel#abc");
    }

    #[test]
    fn test_outdated_sdk_hint() {
        let missing = PeerQuery::new("Foo", "iOS", "iPhone");
        assert_eq!(missing.app_name_with_update_hint(), "Foo (Outdated SDK)");

        let old = missing.clone().with_sdk_version(2);
        assert!(old.is_outdated_sdk());

        let current = missing.with_sdk_version(3);
        assert!(!current.is_outdated_sdk());
        assert_eq!(current.app_name_with_update_hint(), "Foo");
    }

    #[test]
    fn test_secure_query_wire_names() {
        let raw = r#"{"app":"Foo","os":"Android","device":"Pixel","device_id":"abc","sdk_version":5,"csr":"C","csr_path":"/p"}"#;
        let parsed: SecureQuery = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.query.device_id.as_deref(), Some("abc"));
        assert_eq!(parsed.query.sdk_version, Some(5));
        assert_eq!(parsed.csr.pair(), Some(("C", "/p")));
    }

    #[test]
    fn test_csr_pair_requires_both_halves() {
        let only_csr = CsrQuery {
            csr: Some("C".to_string()),
            csr_path: None,
        };
        assert!(only_csr.pair().is_none());
        assert!(CsrQuery::default().pair().is_none());
    }

    #[test]
    fn test_tracker_and_setup_keys() {
        let query = PeerQuery::new("Foo", "Android", "Pixel");
        assert_eq!(query.tracker_key(), "Android-Pixel-Foo");
        assert_eq!(query.setup_key(), "Foo/Android/Pixel/");
    }
}
