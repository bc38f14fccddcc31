//! Device connection server.
//!
//! Two listeners run side by side:
//!
//! - the insecure listener lets a fresh peer exchange a CSR for a signed
//!   client certificate, and nothing else;
//! - the secure listener requires that certificate (mTLS) and turns each
//!   connection into a registered [`PeerSession`].
//!
//! Sessions are keyed by [`devlink_types::ConnectionId`]; a reconnecting
//! peer evicts its own stale connection. State changes are published as
//! [`ServerEvent`]s.

pub mod error;
pub mod events;
pub mod messages;
mod pairing;
pub mod registry;
pub mod server;
pub mod session;
pub mod tracker;
pub mod transport;
pub mod trusted;

pub use error::{Result, ServerError};
pub use events::{EventBus, ServerEvent};
pub use messages::{Frame, SignCertificateResponse, UntrustedRequest};
pub use registry::{ConnectionRegistry, RegistryEntry};
pub use server::{ConnectionServer, ServerConfig};
pub use session::{
    PeerMessage, PeerSession, PluginSession, PluginSessionFactory, SessionEvent, SessionFactory,
};
pub use tracker::ConnectionTracker;
pub use transport::PeerConnection;
