//! Secure listener: mTLS peers become registered sessions.

use devlink_certs::CertificateAuthority;
use devlink_types::{ConnectionId, CsrQuery, LinkError, PeerQuery, SecureQuery};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Result, ServerError};
use crate::messages::Frame;
use crate::registry::RegistryEntry;
use crate::server::ServerShared;
use crate::session::PeerSession;
use crate::transport::{read_envelope, PeerConnection};

pub(crate) async fn handle_socket(
    shared: Arc<ServerShared>,
    acceptor: TlsAcceptor,
    socket: TcpStream,
    peer_addr: SocketAddr,
    shutdown: CancellationToken,
) {
    let tls = tokio::select! {
        _ = shutdown.cancelled() => return,
        tls = acceptor.accept(socket) => match tls {
            Ok(tls) => tls,
            Err(e) => {
                warn!("TLS handshake with {} failed: {}", peer_addr, e);
                return;
            }
        },
    };
    let (mut reader, writer) = tokio::io::split(tls);

    let setup = tokio::select! {
        _ = shutdown.cancelled() => return,
        frame = read_envelope(&mut reader, shared.config.max_frame_len) => frame,
    };
    let secure = match setup.map(|frame| frame.setup_payload::<SecureQuery>()) {
        Ok(Some(secure)) => secure,
        Ok(None) => {
            let reason = LinkError::MalformedQuery("setup payload is not a peer query".into());
            warn!("Dropping secure connection from {}: {}", peer_addr, reason);
            return;
        }
        Err(e) => {
            debug!("Secure connection from {} closed before setup: {}", peer_addr, e);
            return;
        }
    };

    let connection = PeerConnection::spawn(writer, peer_addr);
    match serve(&shared, secure, connection.clone(), reader, &shutdown).await {
        Ok(()) => {}
        Err(ServerError::ShuttingDown) => debug!("Abandoned connection from {}", peer_addr),
        Err(e @ ServerError::Link(LinkError::PlatformDisabled { .. })) => {
            error!("Refusing connection from {}: {}", peer_addr, e)
        }
        Err(e) if e.is_disconnect() => debug!("{} disconnected: {}", peer_addr, e),
        Err(e @ ServerError::Io(_)) => {
            warn!("Secure connection from {} failed: {}", peer_addr, e);
            shared.emit_error(e);
        }
        // Anything else was caused by the peer and stays with its connection.
        Err(e) => warn!("Dropping secure connection from {}: {}", peer_addr, e),
    }
    connection.close();
}

async fn serve<R>(
    shared: &ServerShared,
    secure: SecureQuery,
    connection: PeerConnection,
    reader: R,
    shutdown: &CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let SecureQuery { query, csr } = secure;
    if !shared.config.is_platform_enabled(&query.os) {
        return Err(LinkError::PlatformDisabled { os: query.os }.into());
    }

    shared.tracker.log_connection_attempt(&query);
    shared.setup_timers.cancel(&query.setup_key());

    let (id, query) = until_cancelled(
        shutdown,
        resolve_connection_id(shared.authority.as_ref(), query, &csr),
    )
    .await??;
    info!("Device connected: {}", id);

    let session = shared
        .sessions
        .create_session(id.clone(), query, connection.clone());
    let (dispatch_tx, dispatch_rx) = mpsc::channel(shared.config.dispatch_queue_depth);
    tokio::spawn(dispatch_loop(Arc::clone(&session), dispatch_rx));

    let reading = read_frames(
        reader,
        connection.clone(),
        dispatch_tx,
        shared.config.max_frame_len,
        shared.config.dispatch_budget,
    );
    tokio::pin!(reading);

    let init_timeout = shared.config.init_timeout;
    let initialized = tokio::select! {
        _ = shutdown.cancelled() => Err(ServerError::ShuttingDown),
        ended = &mut reading => Err(ended.err().unwrap_or(ServerError::ConnectionClosed)),
        result = tokio::time::timeout(init_timeout, session.initialize()) => match result {
            Ok(result) => result,
            Err(_) => Err(ServerError::Timeout(format!(
                "{} did not initialize within {}s",
                id,
                init_timeout.as_secs()
            ))),
        },
    };
    let plugins = match initialized {
        Ok(plugins) => plugins,
        Err(e) => {
            session.close();
            return Err(e);
        }
    };
    debug!(
        "Device client initialized: {}. Supported plugins: {}",
        id,
        plugins.join(", ")
    );

    let entry = RegistryEntry::new(Arc::clone(&session), Some(connection.clone()));
    if !shared.register(entry).await {
        session.close();
        return Err(ServerError::ShuttingDown);
    }

    let ended = tokio::select! {
        _ = shutdown.cancelled() => Ok(()),
        ended = &mut reading => ended,
    };
    debug!("Device disconnected: {}", id);
    shared.remove_connection(&id, connection.serial()).await;
    ended
}

/// Work out which logical peer a secure connection belongs to.
///
/// With a CSR and its path, the device id comes from the certificate
/// authority. Without them the peer's claimed `device_id` is taken as sent,
/// which lets an mTLS peer impersonate another device id. Older SDKs get
/// the outdated marker on their app name before the id is derived.
pub async fn resolve_connection_id(
    authority: &dyn CertificateAuthority,
    mut query: PeerQuery,
    csr: &CsrQuery,
) -> Result<(ConnectionId, PeerQuery)> {
    let device_id = match csr.pair() {
        Some((csr, csr_path)) => {
            let identity = authority.extract_identity_from_csr(csr).await?;
            let device_id = authority
                .resolve_device_id(&query.os, &identity, csr_path, csr)
                .await?;
            debug!("Detected {} on {} in certificate", identity, device_id);
            device_id
        }
        None => query.device_id.clone().unwrap_or_default(),
    };

    query.app = query.app_name_with_update_hint();
    query.device_id = Some(device_id.clone());
    Ok((ConnectionId::derive(&query, &device_id), query))
}

async fn until_cancelled<F: Future>(shutdown: &CancellationToken, fut: F) -> Result<F::Output> {
    tokio::select! {
        _ = shutdown.cancelled() => Err(ServerError::ShuttingDown),
        output = fut => Ok(output),
    }
}

async fn dispatch_loop(session: Arc<dyn PeerSession>, mut rx: mpsc::Receiver<String>) {
    while let Some(raw) = rx.recv().await {
        session.dispatch_incoming(raw).await;
    }
}

/// Route inbound frames until the peer goes away or the connection is closed.
///
/// Replies complete pending requests; fire-and-forget payloads go to the
/// dispatch queue in order. A full queue holds back this reader only, with a
/// warning once it has waited longer than `budget`.
async fn read_frames<R: AsyncRead + Unpin>(
    mut reader: R,
    connection: PeerConnection,
    dispatch: mpsc::Sender<String>,
    max_len: usize,
    budget: Duration,
) -> Result<()> {
    let peer = connection.peer_addr();
    let result = loop {
        let frame = tokio::select! {
            _ = connection.closed() => break Ok(()),
            frame = read_envelope(&mut reader, max_len) => frame,
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(ServerError::Codec(e)) => {
                warn!("Malformed frame from {}: {}", peer, e);
                continue;
            }
            Err(e) if e.is_disconnect() => break Ok(()),
            Err(e) => break Err(e),
        };

        match connection.resolve(frame) {
            None => {}
            Some(Frame::FireAndForget { data }) => {
                let send = dispatch.send(data);
                tokio::pin!(send);
                let waited = tokio::time::timeout(budget, &mut send).await;
                let sent = match waited {
                    Ok(sent) => sent,
                    Err(_) => {
                        warn!("Dispatch queue for {} is backed up, holding its reader", peer);
                        send.await
                    }
                };
                if sent.is_err() {
                    break Ok(());
                }
            }
            Some(Frame::Request { id, .. }) => {
                let _ = connection.respond_error(id, "requests are not accepted from clients");
            }
            Some(other) => debug!("Ignoring {} frame from {}", other.kind_name(), peer),
        }
    };

    connection.close();
    result
}
