//! Logical sessions layered on top of a trusted connection.
//!
//! The server owns the transport; a [`PeerSession`] owns what travels over
//! it. [`SessionFactory`] is the seam where callers plug in their own
//! session type. [`PluginSession`] is the stock one: it asks the peer for
//! its plugin list and republishes inbound messages.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use devlink_types::{ConnectionId, LinkError, PeerQuery};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::{Result, ServerError};
use crate::transport::PeerConnection;

const SESSION_EVENT_CAPACITY: usize = 256;

#[async_trait]
pub trait PeerSession: Send + Sync {
    fn id(&self) -> &ConnectionId;

    fn query(&self) -> &PeerQuery;

    fn connected_at(&self) -> DateTime<Utc>;

    /// Exchange the initial handshake with the peer. Returns its plugin list.
    async fn initialize(&self) -> Result<Vec<String>>;

    /// Handle one fire-and-forget payload from the peer.
    async fn dispatch_incoming(&self, raw: String);

    fn plugins(&self) -> Vec<String>;

    /// Called once the session is visible in the registry.
    fn on_plugins_ready(&self);

    /// Stop the session. Idempotent.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

pub trait SessionFactory: Send + Sync {
    fn create_session(
        &self,
        id: ConnectionId,
        query: PeerQuery,
        connection: PeerConnection,
    ) -> Arc<dyn PeerSession>;
}

/// Message sent by a peer outside of a request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerMessage {
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    PluginsChanged(Vec<String>),
    Message(PeerMessage),
    Closed,
}

#[derive(Debug, Deserialize)]
struct GetPluginsResponse {
    success: Option<PluginList>,
    error: Option<ResponseError>,
}

#[derive(Debug, Deserialize)]
struct PluginList {
    plugins: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseError {
    message: String,
}

pub struct PluginSession {
    id: ConnectionId,
    query: PeerQuery,
    connection: PeerConnection,
    connected_at: DateTime<Utc>,
    plugins: RwLock<Vec<String>>,
    events: broadcast::Sender<SessionEvent>,
    closed: AtomicBool,
}

impl PluginSession {
    pub fn new(id: ConnectionId, query: PeerQuery, connection: PeerConnection) -> Self {
        let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        Self {
            id,
            query,
            connection,
            connected_at: Utc::now(),
            plugins: RwLock::new(Vec::new()),
            events,
            closed: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Send a fire-and-forget message to the peer.
    pub fn send(&self, message: &PeerMessage) -> Result<()> {
        self.connection.fire_and_forget(serde_json::to_string(message)?)
    }

    fn init_failed(&self, reason: impl Into<String>) -> ServerError {
        LinkError::SessionInitFailed {
            id: self.id.to_string(),
            reason: reason.into(),
        }
        .into()
    }
}

#[async_trait]
impl PeerSession for PluginSession {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn query(&self) -> &PeerQuery {
        &self.query
    }

    fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    async fn initialize(&self) -> Result<Vec<String>> {
        let request = serde_json::json!({ "method": "getPlugins" }).to_string();
        let raw = self.connection.request(request).await?;

        let response: GetPluginsResponse = serde_json::from_str(&raw)?;
        let plugins = match (response.success, response.error) {
            (Some(list), _) => list.plugins,
            (None, Some(error)) => return Err(self.init_failed(error.message)),
            (None, None) => return Err(self.init_failed("empty getPlugins response")),
        };

        *self.plugins.write().unwrap_or_else(|p| p.into_inner()) = plugins.clone();
        Ok(plugins)
    }

    async fn dispatch_incoming(&self, raw: String) {
        match serde_json::from_str::<PeerMessage>(&raw) {
            Ok(message) => {
                debug!("{} -> {}", self.id, message.method);
                let _ = self.events.send(SessionEvent::Message(message));
            }
            Err(e) => warn!("Dropping malformed message from {}: {}", self.id, e),
        }
    }

    fn plugins(&self) -> Vec<String> {
        self.plugins.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn on_plugins_ready(&self) {
        let _ = self.events.send(SessionEvent::PluginsChanged(self.plugins()));
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.connection.close();
        let _ = self.events.send(SessionEvent::Closed);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.connection.is_closed()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PluginSessionFactory;

impl SessionFactory for PluginSessionFactory {
    fn create_session(
        &self,
        id: ConnectionId,
        query: PeerQuery,
        connection: PeerConnection,
    ) -> Arc<dyn PeerSession> {
        Arc::new(PluginSession::new(id, query, connection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Frame;
    use crate::transport::read_envelope;
    use tokio::io::duplex;

    fn session() -> (PluginSession, tokio::io::DuplexStream) {
        let (local, remote) = duplex(4096);
        let connection = PeerConnection::spawn(local, "127.0.0.1:9".parse().unwrap());
        let query = PeerQuery::new("Foo", "Android", "Pixel").with_sdk_version(4);
        let id = ConnectionId::derive(&query, "abc");
        (PluginSession::new(id, query, connection), remote)
    }

    async fn answer_get_plugins(
        session: &PluginSession,
        remote: &mut tokio::io::DuplexStream,
        reply: Frame,
    ) {
        let frame = read_envelope(remote, 4096).await.unwrap();
        let id = match frame {
            Frame::Request { id, data } => {
                assert_eq!(data, r#"{"method":"getPlugins"}"#);
                id
            }
            other => panic!("unexpected frame {:?}", other),
        };
        let reply = match reply {
            Frame::Response { data, .. } => Frame::Response { id, data },
            Frame::Error { message, .. } => Frame::Error { id, message },
            other => other,
        };
        session.connection.resolve(reply);
    }

    #[tokio::test]
    async fn test_initialize_reads_plugin_list() {
        let (session, mut remote) = session();
        let reply = Frame::Response {
            id: 0,
            data: r#"{"success":{"plugins":["Network","Layout"]}}"#.to_string(),
        };

        let (plugins, _) = tokio::join!(
            session.initialize(),
            answer_get_plugins(&session, &mut remote, reply)
        );

        assert_eq!(plugins.unwrap(), vec!["Network", "Layout"]);
        assert_eq!(session.plugins(), vec!["Network", "Layout"]);
    }

    #[tokio::test]
    async fn test_initialize_surfaces_peer_error() {
        let (session, mut remote) = session();
        let reply = Frame::Response {
            id: 0,
            data: r#"{"error":{"message":"not ready"}}"#.to_string(),
        };

        let (result, _) = tokio::join!(
            session.initialize(),
            answer_get_plugins(&session, &mut remote, reply)
        );

        assert!(matches!(
            result,
            Err(ServerError::Link(LinkError::SessionInitFailed { .. }))
        ));
    }

    #[tokio::test]
    async fn test_dispatch_republishes_messages() {
        let (session, _remote) = session();
        let mut events = session.subscribe();

        session
            .dispatch_incoming(r#"{"method":"execute","params":{"api":"Network"}}"#.to_string())
            .await;
        session.dispatch_incoming("garbage".to_string()).await;

        match events.recv().await.unwrap() {
            SessionEvent::Message(message) => {
                assert_eq!(message.method, "execute");
                assert_eq!(message.params["api"], "Network");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (session, _remote) = session();
        let mut events = session.subscribe();

        session.close();
        session.close();

        assert!(session.is_closed());
        assert!(matches!(events.recv().await.unwrap(), SessionEvent::Closed));
        assert!(events.try_recv().is_err());
    }
}
