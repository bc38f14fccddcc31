//! Insecure listener: CSR exchange with peers that hold no certificate yet.
//!
//! Nothing a peer sends here is trusted. The only thing it can ask for is a
//! signed certificate; every other request is ignored without a reply.

use devlink_types::{LinkError, PeerQuery, UninitializedClient};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ServerError;
use crate::events::{EventBus, ServerEvent};
use crate::messages::{Frame, SignCertificateResponse, UntrustedRequest};
use crate::server::ServerShared;
use crate::transport::{read_envelope, PeerConnection};

/// Timers for peers that were handed a certificate but have not yet
/// reconnected on the secure listener, keyed by [`PeerQuery::setup_key`].
pub(crate) struct SetupTimers {
    timeout: Duration,
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl SetupTimers {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// Start (or restart) the timer for `key`.
    pub(crate) fn arm(
        &self,
        key: String,
        client: UninitializedClient,
        device_id: String,
        events: EventBus,
    ) {
        let timeout = self.timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            warn!(
                "{} on {} did not connect on the secure listener within {}s",
                client.app_name,
                client.device_name,
                timeout.as_secs()
            );
            events.emit(ServerEvent::ClientUnresponsive { client, device_id });
        });

        let mut timers = self.timers.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(previous) = timers.insert(key, handle) {
            previous.abort();
        }
    }

    pub(crate) fn cancel(&self, key: &str) {
        let mut timers = self.timers.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(handle) = timers.remove(key) {
            handle.abort();
        }
    }

    pub(crate) fn cancel_all(&self) {
        let mut timers = self.timers.lock().unwrap_or_else(|p| p.into_inner());
        for (_, handle) in timers.drain() {
            handle.abort();
        }
    }
}

pub(crate) async fn handle_socket(
    shared: Arc<ServerShared>,
    socket: TcpStream,
    peer_addr: SocketAddr,
    shutdown: CancellationToken,
) {
    let max_len = shared.config.max_frame_len;
    let (mut reader, writer) = socket.into_split();

    let setup = tokio::select! {
        _ = shutdown.cancelled() => return,
        frame = read_envelope(&mut reader, max_len) => frame,
    };
    let query = match setup.map(|frame| frame.setup_payload::<PeerQuery>()) {
        Ok(Some(query)) => query,
        Ok(None) => {
            let reason = LinkError::MalformedQuery("setup payload is not a peer query".into());
            debug!("Dropping insecure connection from {}: {}", peer_addr, reason);
            return;
        }
        Err(e) => {
            debug!("Dropping insecure connection from {}: {}", peer_addr, e);
            return;
        }
    };

    shared.tracker.log_connection_attempt(&query);
    let client = UninitializedClient::from(&query);
    info!(
        "Starting certificate exchange with {} on {} ({})",
        client.app_name, client.device_name, client.os
    );
    shared.events.emit(ServerEvent::StartClientSetup(client.clone()));

    let connection = PeerConnection::spawn(writer, peer_addr);
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = connection.closed() => break,
            frame = read_envelope(&mut reader, max_len) => frame,
        };

        match frame {
            Ok(Frame::Request { id, data }) => {
                let Some(request) = UntrustedRequest::parse(&data) else {
                    debug!("Ignoring request {} from {}", id, peer_addr);
                    continue;
                };
                let outcome = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    outcome = process(&shared, &query, &client, request) => outcome,
                };
                let reply = match outcome {
                    Ok(response) => serde_json::to_string(&response)
                        .map_err(ServerError::from)
                        .and_then(|body| connection.respond(id, body)),
                    Err(message) => connection.respond_error(id, message),
                };
                if let Err(e) = reply {
                    debug!("Could not reply to {}: {}", peer_addr, e);
                }
            }
            Ok(Frame::FireAndForget { data }) => {
                let Some(request) = UntrustedRequest::parse(&data) else {
                    continue;
                };
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = process(&shared, &query, &client, request) => {}
                }
            }
            Ok(other) => debug!("Ignoring {} frame from {}", other.kind_name(), peer_addr),
            Err(ServerError::Codec(_)) => continue,
            Err(e) => {
                if !e.is_disconnect() {
                    debug!("Insecure connection from {} failed: {}", peer_addr, e);
                }
                break;
            }
        }
    }

    connection.close();
}

/// Run one untrusted request. The error string is what the peer gets back.
async fn process(
    shared: &ServerShared,
    query: &PeerQuery,
    client: &UninitializedClient,
    request: UntrustedRequest,
) -> std::result::Result<SignCertificateResponse, String> {
    match request {
        UntrustedRequest::SignCertificate { csr, destination } => {
            debug!("CSR received from {} on {}", client.app_name, client.device_name);
            match shared.authority.sign_csr(&csr, &query.os, &destination).await {
                Ok(signed) => {
                    shared.events.emit(ServerEvent::FinishClientSetup {
                        client: client.clone(),
                        device_id: signed.device_id.clone(),
                    });
                    shared.setup_timers.arm(
                        query.setup_key(),
                        client.clone(),
                        signed.device_id.clone(),
                        shared.events.clone(),
                    );
                    Ok(SignCertificateResponse {
                        device_id: signed.device_id,
                    })
                }
                Err(e) => {
                    warn!(
                        "Failed to sign CSR for {} on {}: {}",
                        client.app_name, client.device_name, e
                    );
                    let message = e.to_string();
                    shared.events.emit(ServerEvent::ClientSetupError {
                        client: client.clone(),
                        error: message.clone(),
                    });
                    Err(message)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> UninitializedClient {
        UninitializedClient::from(&PeerQuery::new("Foo", "Android", "Pixel"))
    }

    #[tokio::test(start_paused = true)]
    async fn test_armed_timer_reports_unresponsive_client() {
        let timers = SetupTimers::new(Duration::from_secs(30));
        let events = EventBus::default();
        let mut rx = events.subscribe();

        timers.arm("k".into(), client(), "abc".into(), events.clone());
        tokio::time::sleep(Duration::from_secs(31)).await;

        match rx.recv().await.unwrap() {
            ServerEvent::ClientUnresponsive { device_id, .. } => assert_eq!(device_id, "abc"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_stays_silent() {
        let timers = SetupTimers::new(Duration::from_secs(30));
        let events = EventBus::default();
        let mut rx = events.subscribe();

        timers.arm("k".into(), client(), "abc".into(), events.clone());
        tokio::time::sleep(Duration::from_secs(10)).await;
        timers.cancel("k");
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearming_replaces_previous_timer() {
        let timers = SetupTimers::new(Duration::from_secs(30));
        let events = EventBus::default();
        let mut rx = events.subscribe();

        timers.arm("k".into(), client(), "first".into(), events.clone());
        tokio::time::sleep(Duration::from_secs(20)).await;
        timers.arm("k".into(), client(), "second".into(), events.clone());
        tokio::time::sleep(Duration::from_secs(31)).await;

        match rx.recv().await.unwrap() {
            ServerEvent::ClientUnresponsive { device_id, .. } => assert_eq!(device_id, "second"),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }
}
