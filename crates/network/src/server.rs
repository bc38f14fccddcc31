//! Connection server: two listeners, one registry.
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────────────────────┐
//!  insecure:8089  │  pairing::handle_socket      │──► CertificateAuthority::sign_csr
//!  ─────────────► │  (CSR exchange only)         │
//!                 └──────────────────────────────┘
//!                 ┌──────────────────────────────┐
//!  secure:8088    │  trusted::handle_socket      │──► SessionFactory ──► PeerSession
//!  ─── mTLS ────► │  (sessions, registry)        │
//!                 └──────────────┬───────────────┘
//!                                ▼
//!                   ConnectionRegistry + EventBus
//! ```
//!
//! Each accepted socket gets its own task, tracked so [`ConnectionServer::stop`]
//! can wait for every in-flight handshake to be abandoned.

use devlink_certs::CertificateAuthority;
use devlink_types::{ClientSnapshot, ConnectionId, LinkError, ListenerKind};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::{Result, ServerError};
use crate::events::{EventBus, ServerEvent};
use crate::pairing::{self, SetupTimers};
use crate::registry::{ConnectionRegistry, RegistryEntry};
use crate::session::{PeerSession, SessionFactory};
use crate::tracker::ConnectionTracker;
use crate::trusted;

pub const DEFAULT_INSECURE_PORT: u16 = 8089;
pub const DEFAULT_SECURE_PORT: u16 = 8088;
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_UNRESPONSIVE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_DISPATCH_BUDGET: Duration = Duration::from_millis(500);
pub const DEFAULT_DISPATCH_QUEUE_DEPTH: usize = 256;
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port of the CSR listener. 0 picks a free port.
    pub insecure_port: u16,
    /// Port of the mTLS listener. 0 picks a free port.
    pub secure_port: u16,
    pub listen_host: IpAddr,
    pub enable_android: bool,
    pub enable_ios: bool,
    /// Upper bound for `PeerSession::initialize`.
    pub init_timeout: Duration,
    /// How long a signed peer has to come back on the secure listener.
    pub unresponsive_timeout: Duration,
    /// How long a reader waits on a full dispatch queue before warning.
    pub dispatch_budget: Duration,
    pub dispatch_queue_depth: usize,
    pub max_frame_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            insecure_port: DEFAULT_INSECURE_PORT,
            secure_port: DEFAULT_SECURE_PORT,
            listen_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            enable_android: true,
            enable_ios: true,
            init_timeout: DEFAULT_INIT_TIMEOUT,
            unresponsive_timeout: DEFAULT_UNRESPONSIVE_TIMEOUT,
            dispatch_budget: DEFAULT_DISPATCH_BUDGET,
            dispatch_queue_depth: DEFAULT_DISPATCH_QUEUE_DEPTH,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl ServerConfig {
    pub fn new(insecure_port: u16, secure_port: u16) -> Self {
        Self {
            insecure_port,
            secure_port,
            ..Default::default()
        }
    }

    pub fn is_platform_enabled(&self, os: &str) -> bool {
        match os {
            "Android" => self.enable_android,
            "iOS" => self.enable_ios,
            _ => true,
        }
    }
}

struct RegistryState {
    registry: ConnectionRegistry,
    accepting: bool,
}

/// State shared by the listener and connection tasks.
pub(crate) struct ServerShared {
    pub(crate) config: ServerConfig,
    pub(crate) authority: Arc<dyn CertificateAuthority>,
    pub(crate) sessions: Arc<dyn SessionFactory>,
    pub(crate) events: EventBus,
    pub(crate) tracker: ConnectionTracker,
    pub(crate) setup_timers: SetupTimers,
    state: Mutex<RegistryState>,
}

impl ServerShared {
    /// Evict any other connection under the same id, then insert `entry`.
    ///
    /// Returns false once the server has stopped; the caller must then
    /// close the session itself.
    pub(crate) async fn register(&self, entry: RegistryEntry) -> bool {
        let mut state = self.state.lock().await;
        if !state.accepting {
            return false;
        }

        let id = entry.id().clone();
        if let Some(stale) = state.registry.insert(entry.clone()) {
            info!("Evicting stale connection {}", id);
            stale.close();
            self.events.emit(ServerEvent::RemovedClient(id.clone()));
            self.events.emit(ServerEvent::ClientsChange);
        }

        info!("Registered client {}", id);
        self.events.emit(ServerEvent::NewClient(Arc::clone(&entry.session)));
        self.events.emit(ServerEvent::ClientsChange);
        entry.session.on_plugins_ready();
        true
    }

    /// Drop `id` if the connection with `serial` still owns it.
    pub(crate) async fn remove_connection(&self, id: &ConnectionId, serial: u64) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.registry.remove_if_owned(id, serial) {
            info!("Removed client {}", id);
            entry.close();
            self.events.emit(ServerEvent::RemovedClient(id.clone()));
            self.events.emit(ServerEvent::ClientsChange);
        }
    }

    pub(crate) fn emit_error(&self, error: ServerError) {
        self.events.emit(ServerEvent::Error(Arc::new(error)));
    }
}

struct Running {
    shutdown: CancellationToken,
    listeners: Vec<JoinHandle<()>>,
    tasks: TaskTracker,
    bound: Vec<(ListenerKind, SocketAddr)>,
}

pub struct ConnectionServer {
    shared: Arc<ServerShared>,
    running: Mutex<Option<Running>>,
}

impl ConnectionServer {
    pub fn new(
        config: ServerConfig,
        authority: Arc<dyn CertificateAuthority>,
        sessions: Arc<dyn SessionFactory>,
    ) -> Self {
        let setup_timers = SetupTimers::new(config.unresponsive_timeout);
        Self {
            shared: Arc::new(ServerShared {
                config,
                authority,
                sessions,
                events: EventBus::default(),
                tracker: ConnectionTracker::default(),
                setup_timers,
                state: Mutex::new(RegistryState {
                    registry: ConnectionRegistry::new(),
                    accepting: false,
                }),
            }),
            running: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.shared.events.subscribe()
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.shared.tracker
    }

    /// Bind both listeners and start accepting.
    ///
    /// If one listener fails to bind, the other keeps running and the bind
    /// error is returned; `stop` releases whatever did come up.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(ServerError::AlreadyStarted);
        }

        let tls_config = match self.shared.authority.load_server_tls_config().await {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load TLS configuration: {}", e);
                self.shared
                    .emit_error(LinkError::CertificateError(e.to_string()).into());
                return Err(ServerError::TlsConfig(e));
            }
        };
        let acceptor = TlsAcceptor::from(tls_config);

        self.shared.state.lock().await.accepting = true;

        let shutdown = CancellationToken::new();
        let tasks = TaskTracker::new();
        let mut listeners = Vec::new();
        let mut bound = Vec::new();
        let mut first_error = None;

        let plan = [
            (ListenerKind::Secure, self.shared.config.secure_port, Some(acceptor)),
            (ListenerKind::Insecure, self.shared.config.insecure_port, None),
        ];
        for (kind, port, acceptor) in plan {
            let address = SocketAddr::new(self.shared.config.listen_host, port);
            let listener = match TcpListener::bind(address).await {
                Ok(listener) => listener,
                Err(source) => {
                    let for_event = io::Error::new(source.kind(), source.to_string());
                    self.shared
                        .emit_error(ServerError::bind(kind, address.to_string(), for_event));
                    let e = ServerError::bind(kind, address.to_string(), source);
                    error!("{}", e);
                    first_error.get_or_insert(e);
                    continue;
                }
            };

            let local = listener.local_addr().unwrap_or(address);
            info!("{} server started on port {}", kind, local.port());
            self.shared.events.emit(ServerEvent::Listening {
                kind,
                port: local.port(),
            });
            bound.push((kind, local));

            listeners.push(tokio::spawn(accept_loop(
                Arc::clone(&self.shared),
                listener,
                kind,
                acceptor,
                shutdown.clone(),
                tasks.clone(),
            )));
        }

        *running = Some(Running {
            shutdown,
            listeners,
            tasks,
            bound,
        });

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Addresses the listeners are actually bound to.
    pub async fn local_addrs(&self) -> Vec<(ListenerKind, SocketAddr)> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|r| r.bound.clone())
            .unwrap_or_default()
    }

    /// Close both listeners and every registered session.
    ///
    /// Connections still mid-handshake are abandoned and never registered.
    pub async fn stop(&self) {
        // Held until the end so a concurrent start cannot interleave.
        let mut running_slot = self.running.lock().await;
        let Some(running) = running_slot.take() else {
            return;
        };
        info!("Stopping connection server");

        {
            let mut state = self.shared.state.lock().await;
            state.accepting = false;
            for entry in state.registry.drain() {
                entry.close();
                self.shared.events.emit(ServerEvent::RemovedClient(entry.id().clone()));
                self.shared.events.emit(ServerEvent::ClientsChange);
            }
        }

        running.shutdown.cancel();
        for result in futures::future::join_all(running.listeners).await {
            if let Err(e) = result {
                warn!("Listener task ended abnormally: {}", e);
            }
        }
        running.tasks.close();
        running.tasks.wait().await;
        self.shared.setup_timers.cancel_all();

        info!("Connection server stopped");
    }

    pub async fn clients(&self) -> Vec<ClientSnapshot> {
        self.shared.state.lock().await.registry.snapshot()
    }

    pub async fn client(&self, id: &ConnectionId) -> Option<Arc<dyn PeerSession>> {
        let state = self.shared.state.lock().await;
        state.registry.get(id).map(|e| Arc::clone(&e.session))
    }
}

async fn accept_loop(
    shared: Arc<ServerShared>,
    listener: TcpListener,
    kind: ListenerKind,
    acceptor: Option<TlsAcceptor>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
) {
    loop {
        let (socket, peer_addr) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept connection on {} listener: {}", kind, e);
                    shared.emit_error(
                        LinkError::NetworkError(format!("{} accept failed: {}", kind, e)).into(),
                    );
                    continue;
                }
            },
        };
        debug!("{} connection from {}", kind, peer_addr);

        let shared = Arc::clone(&shared);
        let shutdown = shutdown.clone();
        match &acceptor {
            Some(acceptor) => {
                tasks.spawn(trusted::handle_socket(
                    shared,
                    acceptor.clone(),
                    socket,
                    peer_addr,
                    shutdown,
                ));
            }
            None => {
                tasks.spawn(pairing::handle_socket(shared, socket, peer_addr, shutdown));
            }
        }
    }
    debug!("{} listener closed", kind);
}

impl Drop for ConnectionServer {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.try_lock() {
            if let Some(running) = running.take() {
                running.shutdown.cancel();
            }
        }
    }
}
