//! Shared fixtures: an in-memory PKI, a canned certificate authority and
//! peers that speak the wire protocol.

#![allow(dead_code)]

use async_trait::async_trait;
use devlink_certs::{
    mtls_client_config, mtls_server_config, CertError, CertResult, CertificateAuthority,
    SignedCsr,
};
use devlink_network::transport::{read_envelope, write_envelope};
use devlink_network::{
    ConnectionServer, Frame, PeerSession, PluginSession, ServerConfig, ServerEvent, SessionFactory,
};
use devlink_network::PeerConnection;
use devlink_types::{ConnectionId, ListenerKind, PeerQuery};
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose,
};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);
pub const MAX_FRAME: usize = 1024 * 1024;
pub const CSR_REJECTED: &str = "reject-me";

pub struct TestPki {
    pub server_config: Arc<rustls::ServerConfig>,
    pub client_config: Arc<rustls::ClientConfig>,
}

fn pkcs8(key: &KeyPair) -> PrivateKeyDer<'static> {
    PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()))
}

impl TestPki {
    pub fn new() -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "Devlink Test CA");
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let ca = ca_params.self_signed(&ca_key).unwrap();

        let server_key = KeyPair::generate().unwrap();
        let mut server_params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        server_params
            .distinguished_name
            .push(DnType::CommonName, "localhost");
        server_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let server = server_params.signed_by(&server_key, &ca, &ca_key).unwrap();

        let client_key = KeyPair::generate().unwrap();
        let mut client_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        client_params
            .distinguished_name
            .push(DnType::CommonName, "com.example.app");
        client_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        let client = client_params.signed_by(&client_key, &ca, &ca_key).unwrap();

        let server_config = mtls_server_config(
            vec![server.der().clone()],
            pkcs8(&server_key),
            vec![ca.der().clone()],
        )
        .unwrap();
        let client_config = mtls_client_config(
            vec![client.der().clone()],
            pkcs8(&client_key),
            vec![ca.der().clone()],
        )
        .unwrap();

        Self {
            server_config,
            client_config,
        }
    }
}

/// Authority that resolves every peer to one fixed device id.
pub struct StaticAuthority {
    server_config: Arc<rustls::ServerConfig>,
    device_id: String,
}

impl StaticAuthority {
    pub fn new(pki: &TestPki, device_id: &str) -> Self {
        Self {
            server_config: Arc::clone(&pki.server_config),
            device_id: device_id.to_string(),
        }
    }
}

#[async_trait]
impl CertificateAuthority for StaticAuthority {
    async fn load_server_tls_config(&self) -> CertResult<Arc<rustls::ServerConfig>> {
        Ok(Arc::clone(&self.server_config))
    }

    async fn extract_identity_from_csr(&self, _csr: &str) -> CertResult<String> {
        Ok("com.example.app".to_string())
    }

    async fn resolve_device_id(
        &self,
        _os: &str,
        _identity: &str,
        _csr_path: &str,
        _csr: &str,
    ) -> CertResult<String> {
        Ok(self.device_id.clone())
    }

    async fn sign_csr(&self, csr: &str, os: &str, _destination: &str) -> CertResult<SignedCsr> {
        if csr == CSR_REJECTED {
            return Err(CertError::EmptyCsr { os: os.to_string() });
        }
        Ok(SignedCsr {
            device_id: self.device_id.clone(),
        })
    }
}

/// Creates stock plugin sessions and keeps a handle to each.
#[derive(Default)]
pub struct RecordingFactory {
    sessions: Mutex<Vec<Arc<PluginSession>>>,
}

impl RecordingFactory {
    pub fn last(&self) -> Option<Arc<PluginSession>> {
        self.sessions.lock().unwrap().last().cloned()
    }

    pub fn count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}

impl SessionFactory for RecordingFactory {
    fn create_session(
        &self,
        id: ConnectionId,
        query: PeerQuery,
        connection: PeerConnection,
    ) -> Arc<dyn PeerSession> {
        let session = Arc::new(PluginSession::new(id, query, connection));
        self.sessions.lock().unwrap().push(Arc::clone(&session));
        session
    }
}

pub struct Harness {
    pub server: ConnectionServer,
    pub events: broadcast::Receiver<ServerEvent>,
    pub factory: Arc<RecordingFactory>,
    pub pki: Arc<TestPki>,
    pub secure: SocketAddr,
    pub insecure: SocketAddr,
}

pub fn test_config() -> ServerConfig {
    let mut config = ServerConfig::new(0, 0);
    config.listen_host = "127.0.0.1".parse().unwrap();
    config
}

pub async fn start_server(config: ServerConfig) -> Harness {
    start_server_with_device(config, "abc").await
}

/// A server that has not been started yet.
pub fn new_server(
    config: ServerConfig,
    device_id: &str,
) -> (ConnectionServer, Arc<RecordingFactory>, Arc<TestPki>) {
    let pki = Arc::new(TestPki::new());
    let factory = Arc::new(RecordingFactory::default());
    let authority = Arc::new(StaticAuthority::new(&pki, device_id));
    let server = ConnectionServer::new(
        config,
        authority,
        Arc::clone(&factory) as Arc<dyn SessionFactory>,
    );
    (server, factory, pki)
}

pub async fn bound_addr(server: &ConnectionServer, kind: ListenerKind) -> Option<SocketAddr> {
    server
        .local_addrs()
        .await
        .into_iter()
        .find(|(k, _)| *k == kind)
        .map(|(_, addr)| addr)
}

pub async fn start_server_with_device(config: ServerConfig, device_id: &str) -> Harness {
    let (server, factory, pki) = new_server(config, device_id);

    let events = server.subscribe();
    server.start().await.unwrap();

    Harness {
        secure: bound_addr(&server, ListenerKind::Secure).await.unwrap(),
        insecure: bound_addr(&server, ListenerKind::Insecure).await.unwrap(),
        server,
        events,
        factory,
        pki,
    }
}

/// Wait for the first event matching `pred`, skipping the rest.
pub async fn expect_event<F>(rx: &mut broadcast::Receiver<ServerEvent>, pred: F) -> ServerEvent
where
    F: Fn(&ServerEvent) -> bool,
{
    tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            let event = rx.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

pub fn is_error(event: &ServerEvent) -> bool {
    matches!(event, ServerEvent::Error(_))
}

/// True if no event matching `pred` shows up within `window`.
pub async fn no_event_within<F>(
    rx: &mut broadcast::Receiver<ServerEvent>,
    window: Duration,
    pred: F,
) -> bool
where
    F: Fn(&ServerEvent) -> bool,
{
    tokio::time::timeout(window, async {
        loop {
            let event = rx.recv().await.unwrap();
            if pred(&event) {
                return;
            }
        }
    })
    .await
    .is_err()
}

pub fn setup_frame(query: &serde_json::Value) -> Frame {
    Frame::Setup {
        data: query.to_string(),
    }
}

pub fn pixel_query() -> serde_json::Value {
    serde_json::json!({
        "app": "Foo",
        "os": "Android",
        "device": "Pixel",
        "device_id": "abc",
        "sdk_version": 4
    })
}

/// A device on the secure listener.
pub struct SecurePeer {
    reader: ReadHalf<TlsStream<TcpStream>>,
    writer: WriteHalf<TlsStream<TcpStream>>,
}

impl SecurePeer {
    pub async fn connect(harness: &Harness, query: &serde_json::Value) -> Self {
        Self::connect_to(&harness.pki, harness.secure, query).await
    }

    pub async fn connect_to(pki: &TestPki, addr: SocketAddr, query: &serde_json::Value) -> Self {
        let mut peer = Self::handshake(pki, addr).await;
        peer.send(&setup_frame(query)).await;
        peer
    }

    /// Complete the TLS handshake without sending a setup frame.
    pub async fn handshake(pki: &TestPki, addr: SocketAddr) -> Self {
        let connector = TlsConnector::from(Arc::clone(&pki.client_config));
        let tcp = TcpStream::connect(addr).await.unwrap();
        let tls = connector
            .connect(ServerName::try_from("localhost").unwrap(), tcp)
            .await
            .unwrap();
        let (reader, writer) = tokio::io::split(tls);
        Self { reader, writer }
    }

    pub async fn send(&mut self, frame: &Frame) {
        write_envelope(&mut self.writer, frame).await.unwrap();
    }

    /// Write bytes that bypass the framing.
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    /// `None` once the server has closed the connection.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        tokio::time::timeout(EVENT_TIMEOUT, read_envelope(&mut self.reader, MAX_FRAME))
            .await
            .expect("timed out waiting for a frame")
            .ok()
    }

    /// Answer the server's `getPlugins` request.
    pub async fn answer_get_plugins(&mut self, plugins: &[&str]) {
        match self.next_frame().await {
            Some(Frame::Request { id, data }) => {
                assert!(data.contains("getPlugins"), "unexpected request {}", data);
                let body = serde_json::json!({ "success": { "plugins": plugins } });
                self.send(&Frame::Response {
                    id,
                    data: body.to_string(),
                })
                .await;
            }
            other => panic!("expected getPlugins request, got {:?}", other),
        }
    }
}

/// A device on the insecure listener.
pub struct InsecurePeer {
    stream: TcpStream,
}

impl InsecurePeer {
    pub async fn connect(harness: &Harness, query: &serde_json::Value) -> Self {
        let stream = TcpStream::connect(harness.insecure).await.unwrap();
        let mut peer = Self { stream };
        peer.send(&setup_frame(query)).await;
        peer
    }

    pub async fn connect_raw(harness: &Harness) -> Self {
        Self {
            stream: TcpStream::connect(harness.insecure).await.unwrap(),
        }
    }

    pub async fn send(&mut self, frame: &Frame) {
        write_envelope(&mut self.stream, frame).await.unwrap();
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    pub async fn next_frame(&mut self) -> Option<Frame> {
        tokio::time::timeout(EVENT_TIMEOUT, read_envelope(&mut self.stream, MAX_FRAME))
            .await
            .expect("timed out waiting for a frame")
            .ok()
    }

    pub async fn sign_request(&mut self, id: u32, csr: &str) {
        let data = serde_json::json!({
            "method": "signCertificate",
            "csr": csr,
            "destination": "/data/data/com.example.app/files/sonar"
        });
        self.send(&Frame::Request {
            id,
            data: data.to_string(),
        })
        .await;
    }
}
