//! Wire messages exchanged with device peers.
//!
//! Every frame on both listeners is a 4-byte big-endian length followed by
//! one JSON encoded [`Frame`]. Payloads inside a frame are JSON strings so
//! the envelope never has to understand plugin traffic.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Envelope for one frame on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    /// First frame of every connection, carries the peer query.
    Setup { data: String },
    FireAndForget { data: String },
    Request { id: u32, data: String },
    Response { id: u32, data: String },
    Error { id: u32, message: String },
}

impl Frame {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Frame::Setup { .. } => "setup",
            Frame::FireAndForget { .. } => "fire_and_forget",
            Frame::Request { .. } => "request",
            Frame::Response { .. } => "response",
            Frame::Error { .. } => "error",
        }
    }

    /// Decode the payload of a setup frame. Any other frame kind is malformed.
    pub fn setup_payload<T: DeserializeOwned>(&self) -> Option<T> {
        match self {
            Frame::Setup { data } => serde_json::from_str(data).ok(),
            _ => None,
        }
    }
}

/// Requests accepted on the insecure listener. Anything else is ignored.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "method")]
pub enum UntrustedRequest {
    #[serde(rename = "signCertificate")]
    SignCertificate { csr: String, destination: String },
}

impl UntrustedRequest {
    /// `None` for malformed JSON and for unknown methods alike.
    pub fn parse(data: &str) -> Option<Self> {
        serde_json::from_str(data).ok()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignCertificateResponse {
    #[serde(rename = "deviceId")]
    pub device_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_wire_format() {
        let frame = Frame::Request {
            id: 7,
            data: "{}".to_string(),
        };
        let json = String::from_utf8(frame.to_bytes().unwrap()).unwrap();
        assert_eq!(json, r#"{"kind":"request","id":7,"data":"{}"}"#);

        let ff: Frame = Frame::from_bytes(br#"{"kind":"fire_and_forget","data":"x"}"#).unwrap();
        assert_eq!(ff.kind_name(), "fire_and_forget");
    }

    #[test]
    fn test_untrusted_request_is_a_closed_set() {
        let sign = UntrustedRequest::parse(
            r#"{"method":"signCertificate","csr":"C","destination":"/d"}"#,
        );
        assert_eq!(
            sign,
            Some(UntrustedRequest::SignCertificate {
                csr: "C".to_string(),
                destination: "/d".to_string()
            })
        );

        assert!(UntrustedRequest::parse(r#"{"method":"getPlugins"}"#).is_none());
        assert!(UntrustedRequest::parse(r#"{"method":"signCertificate"}"#).is_none());
        assert!(UntrustedRequest::parse("not json").is_none());
    }

    #[test]
    fn test_setup_payload_only_from_setup_frames() {
        let setup = Frame::Setup {
            data: r#"{"app":"Foo","os":"iOS","device":"iPhone"}"#.to_string(),
        };
        let query: Option<devlink_types::PeerQuery> = setup.setup_payload();
        assert_eq!(query.unwrap().app, "Foo");

        let other = Frame::FireAndForget {
            data: r#"{"app":"Foo","os":"iOS","device":"iPhone"}"#.to_string(),
        };
        assert!(other.setup_payload::<devlink_types::PeerQuery>().is_none());
    }

    #[test]
    fn test_sign_response_uses_camel_case_device_id() {
        let body = serde_json::to_string(&SignCertificateResponse {
            device_id: "abc".to_string(),
        })
        .unwrap();
        assert_eq!(body, r#"{"deviceId":"abc"}"#);
    }
}
