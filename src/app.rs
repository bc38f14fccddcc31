use crate::config::AppConfig;
use chrono::Utc;
use devlink_certs::{CertificateAuthority, CertificateStore, FileCertificateAuthority};
use devlink_network::{ConnectionServer, PluginSessionFactory, ServerEvent};
use devlink_types::LinkError;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

pub struct DevlinkApp {
    config: AppConfig,
    authority: Arc<FileCertificateAuthority>,
    server: ConnectionServer,
}

impl DevlinkApp {
    pub fn new(config: AppConfig) -> Result<Self, LinkError> {
        config.validate()?;

        info!("Initializing device connection server");
        info!("Insecure port: {}", config.server.insecure_port);
        info!("Secure port: {}", config.server.secure_port);
        info!("Certificates: {}", config.certs.dir);

        let authority = Arc::new(FileCertificateAuthority::new(CertificateStore::new(
            &config.certs.dir,
        )));
        let server = ConnectionServer::new(
            config.server_config()?,
            Arc::clone(&authority) as Arc<dyn CertificateAuthority>,
            Arc::new(PluginSessionFactory),
        );

        Ok(Self {
            config,
            authority,
            server,
        })
    }

    pub fn authority(&self) -> &FileCertificateAuthority {
        &self.authority
    }

    pub async fn ensure_certificates(&self) -> Result<(), LinkError> {
        self.authority
            .ensure_certificate_material()
            .await
            .map_err(|e| LinkError::CertificateError(e.to_string()))
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let events = self.server.subscribe();
        let logger = tokio::spawn(log_events(events));

        if let Err(e) = self.server.start().await {
            error!("Failed to start server: {}", e);
            self.server.stop().await;
            logger.abort();
            return Err(e.into());
        }

        info!(
            "Accepting devices on {} (insecure {}, secure {})",
            self.config.server.listen_host,
            self.config.server.insecure_port,
            self.config.server.secure_port
        );

        tokio::signal::ctrl_c().await?;
        info!("Shutdown requested");

        let now = Utc::now();
        for client in self.server.clients().await {
            info!(
                "Disconnecting {} (connected {}s, plugins: {})",
                client.id,
                (now - client.connected_at).num_seconds(),
                client.plugins.join(", ")
            );
        }

        self.server.stop().await;
        logger.abort();
        Ok(())
    }
}

async fn log_events(mut events: tokio::sync::broadcast::Receiver<ServerEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!("Event logger fell behind, skipped {} events", skipped);
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        match event {
            ServerEvent::Listening { kind, port } => info!("{} listener ready on port {}", kind, port),
            ServerEvent::NewClient(session) => {
                info!("Client connected: {} ({} plugins)", session.id(), session.plugins().len())
            }
            ServerEvent::RemovedClient(id) => info!("Client removed: {}", id),
            ServerEvent::ClientsChange => {}
            ServerEvent::Error(e) => error!("Server error: {}", e),
            ServerEvent::StartClientSetup(client) => info!(
                "Pairing started: {} on {} ({})",
                client.app_name, client.device_name, client.os
            ),
            ServerEvent::FinishClientSetup { client, device_id } => info!(
                "Pairing finished: {} on {} as {}",
                client.app_name, client.device_name, device_id
            ),
            ServerEvent::ClientSetupError { client, error } => warn!(
                "Pairing failed: {} on {}: {}",
                client.app_name, client.device_name, error
            ),
            ServerEvent::ClientUnresponsive { client, device_id } => warn!(
                "{} on {} ({}) never connected after pairing",
                client.app_name, client.device_name, device_id
            ),
        }
    }
}
