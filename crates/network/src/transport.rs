//! Length-prefixed framing and the per-connection write handle.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, ServerError};
use crate::messages::Frame;

/// Big-endian length prefix for a payload of `len` bytes.
fn frame_header(len: usize) -> Result<[u8; 4]> {
    u32::try_from(len)
        .map(u32::to_be_bytes)
        .map_err(|_| ServerError::FrameTooLarge {
            len,
            max: u32::MAX as usize,
        })
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> Result<()> {
    writer.write_all(&frame_header(data.len())?).await?;

    writer.write_all(data).await?;
    writer.flush().await?;

    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, max_len: usize) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_len {
        return Err(ServerError::FrameTooLarge { len, max: max_len });
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;

    Ok(data)
}

/// Read one frame and decode its envelope.
///
/// A decode failure leaves the stream aligned on the next frame.
pub async fn read_envelope<R: AsyncRead + Unpin>(reader: &mut R, max_len: usize) -> Result<Frame> {
    let bytes = read_frame(reader, max_len).await?;
    Frame::from_bytes(&bytes)
}

pub async fn write_envelope<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    write_frame(writer, &frame.to_bytes()?).await
}

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

type PendingRequests = Mutex<HashMap<u32, oneshot::Sender<Result<String>>>>;

struct ConnectionInner {
    serial: u64,
    peer_addr: SocketAddr,
    write_tx: mpsc::UnboundedSender<Frame>,
    pending: PendingRequests,
    next_request_id: AtomicU32,
    closed: CancellationToken,
}

/// Handle to one accepted peer connection.
///
/// Frames are queued to a writer task, so sends never block the caller.
/// Clones share the same connection; `serial` tells different connections
/// apart even when they claim the same identity.
#[derive(Clone)]
pub struct PeerConnection {
    inner: Arc<ConnectionInner>,
}

impl PeerConnection {
    /// Take ownership of the write half and spawn its writer task.
    pub fn spawn<W>(mut writer: W, peer_addr: SocketAddr) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<Frame>();
        let closed = CancellationToken::new();

        let inner = Arc::new(ConnectionInner {
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            peer_addr,
            write_tx,
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicU32::new(1),
            closed: closed.clone(),
        });

        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = closed.cancelled() => break,
                    frame = write_rx.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                };
                if let Err(e) = write_envelope(&mut writer, &frame).await {
                    debug!("Write to {} failed: {}", peer_addr, e);
                    closed.cancel();
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        Self { inner }
    }

    pub fn serial(&self) -> u64 {
        self.inner.serial
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    pub fn send(&self, frame: Frame) -> Result<()> {
        if self.is_closed() {
            return Err(ServerError::ConnectionClosed);
        }
        self.inner
            .write_tx
            .send(frame)
            .map_err(|_| ServerError::ConnectionClosed)
    }

    pub fn fire_and_forget(&self, data: String) -> Result<()> {
        self.send(Frame::FireAndForget { data })
    }

    pub fn respond(&self, id: u32, data: String) -> Result<()> {
        self.send(Frame::Response { id, data })
    }

    pub fn respond_error(&self, id: u32, message: impl Into<String>) -> Result<()> {
        self.send(Frame::Error {
            id,
            message: message.into(),
        })
    }

    /// Send a request and wait for the matching response.
    pub async fn request(&self, data: String) -> Result<String> {
        let id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending().insert(id, tx);

        if let Err(e) = self.send(Frame::Request { id, data }) {
            self.pending().remove(&id);
            return Err(e);
        }

        tokio::select! {
            _ = self.inner.closed.cancelled() => {
                self.pending().remove(&id);
                Err(ServerError::ConnectionClosed)
            }
            response = rx => response.unwrap_or(Err(ServerError::ConnectionClosed)),
        }
    }

    /// Complete a pending request from a response or error frame.
    ///
    /// Returns frames that are not replies so the caller can route them.
    pub fn resolve(&self, frame: Frame) -> Option<Frame> {
        let (id, outcome) = match frame {
            Frame::Response { id, data } => (id, Ok(data)),
            Frame::Error { id, message } => (id, Err(ServerError::Peer(message))),
            other => return Some(other),
        };

        match self.pending().remove(&id) {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => warn!("Reply {} from {} matches no pending request", id, self.peer_addr()),
        }
        None
    }

    /// Close the connection. Pending requests fail with `ConnectionClosed`.
    pub fn close(&self) {
        self.inner.closed.cancel();
        self.pending().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<u32, oneshot::Sender<Result<String>>>> {
        // A poisoned map only holds senders; keep using it.
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("serial", &self.inner.serial)
            .field("peer_addr", &self.inner.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn addr() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    #[tokio::test]
    async fn test_frame_length_limit() {
        let (mut client, mut server) = duplex(64);
        write_frame(&mut client, &[1u8; 32]).await.unwrap();

        let err = read_frame(&mut server, 16).await.unwrap_err();
        assert!(matches!(err, ServerError::FrameTooLarge { len: 32, max: 16 }));
    }

    #[test]
    fn test_frame_header_rejects_lengths_past_u32() {
        assert_eq!(frame_header(258).unwrap(), [0, 0, 1, 2]);
        assert_eq!(frame_header(u32::MAX as usize).unwrap(), [0xff; 4]);

        #[cfg(target_pointer_width = "64")]
        {
            let len = u32::MAX as usize + 1;
            let err = frame_header(len).unwrap_err();
            assert!(matches!(err, ServerError::FrameTooLarge { len: l, .. } if l == len));
        }
    }

    #[tokio::test]
    async fn test_request_resolves_from_response_frame() {
        let (local, mut remote) = duplex(4096);
        let connection = PeerConnection::spawn(local, addr());

        let requester = connection.clone();
        let pending = tokio::spawn(async move { requester.request("ping".to_string()).await });

        let frame = read_envelope(&mut remote, 4096).await.unwrap();
        let id = match frame {
            Frame::Request { id, data } => {
                assert_eq!(data, "ping");
                id
            }
            other => panic!("unexpected frame {:?}", other),
        };

        assert!(connection
            .resolve(Frame::Response {
                id,
                data: "pong".to_string()
            })
            .is_none());
        assert_eq!(pending.await.unwrap().unwrap(), "pong");
    }

    #[tokio::test]
    async fn test_close_fails_pending_requests() {
        let (local, _remote) = duplex(4096);
        let connection = PeerConnection::spawn(local, addr());

        let requester = connection.clone();
        let pending = tokio::spawn(async move { requester.request("ping".to_string()).await });
        tokio::task::yield_now().await;

        connection.close();
        assert!(matches!(
            pending.await.unwrap(),
            Err(ServerError::ConnectionClosed)
        ));
        assert!(connection.send(Frame::FireAndForget { data: "x".into() }).is_err());
    }

    #[tokio::test]
    async fn test_serials_are_unique() {
        let (a, _ra) = duplex(64);
        let (b, _rb) = duplex(64);
        let first = PeerConnection::spawn(a, addr());
        let second = PeerConnection::spawn(b, addr());
        assert_ne!(first.serial(), second.serial());
    }
}
