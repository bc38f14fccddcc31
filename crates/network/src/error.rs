use devlink_certs::CertError;
use devlink_types::{LinkError, ListenerKind};
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Server already started")]
    AlreadyStarted,

    #[error("Server is shutting down")]
    ShuttingDown,

    #[error("Failed to bind {kind} listener on {address}: {source}")]
    Bind {
        kind: ListenerKind,
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to load TLS configuration: {0}")]
    TlsConfig(#[source] CertError),

    #[error("Certificate authority error: {0}")]
    Certificate(#[from] CertError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Malformed frame: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Peer returned an error: {0}")]
    Peer(String),

    #[error(transparent)]
    Link(#[from] LinkError),
}

impl ServerError {
    pub(crate) fn bind(kind: ListenerKind, address: impl Into<String>, source: io::Error) -> Self {
        ServerError::Bind {
            kind,
            address: address.into(),
            source,
        }
    }

    /// End-of-stream from the peer, as opposed to a transport failure.
    pub fn is_disconnect(&self) -> bool {
        match self {
            ServerError::ConnectionClosed => true,
            ServerError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;
