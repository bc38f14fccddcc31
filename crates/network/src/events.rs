//! Server notifications.
//!
//! Events go out on a tokio broadcast channel. A subscriber that falls more
//! than [`EVENT_CHANNEL_CAPACITY`] events behind sees `RecvError::Lagged`
//! and skips ahead; the server itself never waits on subscribers.

use devlink_types::{ConnectionId, ListenerKind, UninitializedClient};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

use crate::error::ServerError;
use crate::session::PeerSession;

pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone)]
pub enum ServerEvent {
    Listening { kind: ListenerKind, port: u16 },
    NewClient(Arc<dyn PeerSession>),
    RemovedClient(ConnectionId),
    ClientsChange,
    Error(Arc<ServerError>),
    StartClientSetup(UninitializedClient),
    FinishClientSetup {
        client: UninitializedClient,
        device_id: String,
    },
    ClientSetupError {
        client: UninitializedClient,
        error: String,
    },
    ClientUnresponsive {
        client: UninitializedClient,
        device_id: String,
    },
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Listening { .. } => "listening",
            ServerEvent::NewClient(_) => "new-client",
            ServerEvent::RemovedClient(_) => "removed-client",
            ServerEvent::ClientsChange => "clients-change",
            ServerEvent::Error(_) => "error",
            ServerEvent::StartClientSetup(_) => "start-client-setup",
            ServerEvent::FinishClientSetup { .. } => "finish-client-setup",
            ServerEvent::ClientSetupError { .. } => "client-setup-error",
            ServerEvent::ClientUnresponsive { .. } => "client-unresponsive",
        }
    }
}

impl fmt::Debug for ServerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerEvent::Listening { kind, port } => f
                .debug_struct("Listening")
                .field("kind", kind)
                .field("port", port)
                .finish(),
            ServerEvent::NewClient(session) => f.debug_tuple("NewClient").field(session.id()).finish(),
            ServerEvent::RemovedClient(id) => f.debug_tuple("RemovedClient").field(id).finish(),
            ServerEvent::ClientsChange => write!(f, "ClientsChange"),
            ServerEvent::Error(e) => f.debug_tuple("Error").field(e).finish(),
            ServerEvent::StartClientSetup(client) => {
                f.debug_tuple("StartClientSetup").field(client).finish()
            }
            ServerEvent::FinishClientSetup { client, device_id } => f
                .debug_struct("FinishClientSetup")
                .field("client", client)
                .field("device_id", device_id)
                .finish(),
            ServerEvent::ClientSetupError { client, error } => f
                .debug_struct("ClientSetupError")
                .field("client", client)
                .field("error", error)
                .finish(),
            ServerEvent::ClientUnresponsive { client, device_id } => f
                .debug_struct("ClientUnresponsive")
                .field("client", client)
                .field("device_id", device_id)
                .finish(),
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ServerEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: ServerEvent) {
        trace!("Emitting {}", event.name());
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }
}
