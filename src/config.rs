use devlink_network::ServerConfig;
use devlink_types::LinkError;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "config/default.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub certs: CertsSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub insecure_port: u16,
    pub secure_port: u16,
    pub listen_host: String,
    pub enable_android: bool,
    pub enable_ios: bool,
    pub init_timeout_secs: u64,
    pub unresponsive_timeout_secs: u64,
    pub dispatch_budget_ms: u64,
    pub dispatch_queue_depth: usize,
    pub max_frame_len: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        let defaults = ServerConfig::default();
        Self {
            insecure_port: defaults.insecure_port,
            secure_port: defaults.secure_port,
            listen_host: defaults.listen_host.to_string(),
            enable_android: defaults.enable_android,
            enable_ios: defaults.enable_ios,
            init_timeout_secs: defaults.init_timeout.as_secs(),
            unresponsive_timeout_secs: defaults.unresponsive_timeout.as_secs(),
            dispatch_budget_ms: defaults.dispatch_budget.as_millis() as u64,
            dispatch_queue_depth: defaults.dispatch_queue_depth,
            max_frame_len: defaults.max_frame_len,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CertsSection {
    pub dir: String,
}

impl Default for CertsSection {
    fn default() -> Self {
        Self {
            dir: "certs".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    /// "text" or "json"
    pub format: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

fn config_error(what: &str, e: impl std::fmt::Display) -> LinkError {
    LinkError::ConfigError(format!("Invalid {}: {}", what, e))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, LinkError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(config_error(key, format!("expected a boolean, got {:?}", other))),
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, LinkError> {
        let mut app_config = if Path::new(DEFAULT_CONFIG_FILE).exists() {
            Self::load_from(Path::new(DEFAULT_CONFIG_FILE))?
        } else {
            AppConfig::default()
        };

        Self::override_from_env(&mut app_config)?;
        app_config.validate()?;

        Ok(app_config)
    }

    pub fn load_from(path: &Path) -> Result<Self, LinkError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .build()
            .map_err(|e| LinkError::ConfigError(format!("Failed to load config file: {}", e)))?;

        settings
            .try_deserialize::<AppConfig>()
            .map_err(|e| LinkError::ConfigError(format!("Failed to parse config file: {}", e)))
    }

    fn override_from_env(config: &mut AppConfig) -> Result<(), LinkError> {
        Self::apply_overrides(config, |key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(config: &mut AppConfig, lookup: F) -> Result<(), LinkError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("DEVLINK_INSECURE_PORT") {
            config.server.insecure_port = port
                .parse()
                .map_err(|e| config_error("DEVLINK_INSECURE_PORT", e))?;
        }

        if let Some(port) = lookup("DEVLINK_SECURE_PORT") {
            config.server.secure_port = port
                .parse()
                .map_err(|e| config_error("DEVLINK_SECURE_PORT", e))?;
        }

        if let Some(host) = lookup("DEVLINK_LISTEN_HOST") {
            config.server.listen_host = host;
        }

        if let Some(dir) = lookup("DEVLINK_CERT_DIR") {
            config.certs.dir = dir;
        }

        if let Some(flag) = lookup("DEVLINK_ENABLE_ANDROID") {
            config.server.enable_android = parse_bool("DEVLINK_ENABLE_ANDROID", &flag)?;
        }

        if let Some(flag) = lookup("DEVLINK_ENABLE_IOS") {
            config.server.enable_ios = parse_bool("DEVLINK_ENABLE_IOS", &flag)?;
        }

        if let Some(format) = lookup("DEVLINK_LOG_FORMAT") {
            config.logging.format = format;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), LinkError> {
        let server = &self.server;

        if server.insecure_port == 0 || server.secure_port == 0 {
            return Err(LinkError::ConfigError("ports cannot be 0".to_string()));
        }

        if server.insecure_port == server.secure_port {
            return Err(LinkError::ConfigError(format!(
                "insecure and secure listeners cannot share port {}",
                server.secure_port
            )));
        }

        self.listen_host()?;

        if server.init_timeout_secs == 0
            || server.unresponsive_timeout_secs == 0
            || server.dispatch_budget_ms == 0
        {
            return Err(LinkError::ConfigError("timeouts must be non-zero".to_string()));
        }

        if server.dispatch_queue_depth == 0 || server.max_frame_len == 0 {
            return Err(LinkError::ConfigError(
                "dispatch_queue_depth and max_frame_len must be non-zero".to_string(),
            ));
        }

        if self.certs.dir.is_empty() {
            return Err(LinkError::ConfigError("certs.dir cannot be empty".to_string()));
        }

        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return Err(LinkError::ConfigError(format!(
                "unknown log format {:?}, expected text or json",
                self.logging.format
            )));
        }

        Ok(())
    }

    pub fn listen_host(&self) -> Result<IpAddr, LinkError> {
        self.server
            .listen_host
            .parse()
            .map_err(|e| config_error("listen_host", e))
    }

    pub fn server_config(&self) -> Result<ServerConfig, LinkError> {
        let server = &self.server;
        Ok(ServerConfig {
            insecure_port: server.insecure_port,
            secure_port: server.secure_port,
            listen_host: self.listen_host()?,
            enable_android: server.enable_android,
            enable_ios: server.enable_ios,
            init_timeout: Duration::from_secs(server.init_timeout_secs),
            unresponsive_timeout: Duration::from_secs(server.unresponsive_timeout_secs),
            dispatch_budget: Duration::from_millis(server.dispatch_budget_ms),
            dispatch_queue_depth: server.dispatch_queue_depth,
            max_frame_len: server.max_frame_len,
        })
    }
}
