mod app;
mod cli;
mod config;

use app::DevlinkApp;
use clap::Parser;
use cli::{Cli, Commands};
use config::AppConfig;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Install default crypto provider for rustls before any TLS operations
    let _ = rustls::crypto::ring::default_provider().install_default();

    if let Err(e) = run().await {
        error!("Application error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match AppConfig::load() {
        Ok(config) => {
            init_tracing(&config.logging.level, &config.logging.format);
            config
        }
        Err(e) => {
            init_tracing("info", "text");
            error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };
    info!("Configuration loaded successfully");

    match cli.command {
        Some(Commands::Run) | None => run_server(config).await?,
        Some(Commands::Info { json }) => show_info(&config, json)?,
        Some(Commands::Certs) => ensure_certs(config).await?,
    }

    Ok(())
}

async fn run_server(config: AppConfig) -> anyhow::Result<()> {
    let app = DevlinkApp::new(config)?;
    app.run().await
}

fn show_info(config: &AppConfig, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(config)?);
        return Ok(());
    }

    println!("\n📡 Listeners");
    println!("─────────────────────────────────────");
    println!("  Host:          {}", config.server.listen_host);
    println!("  Insecure port: {}", config.server.insecure_port);
    println!("  Secure port:   {}", config.server.secure_port);
    println!("  Android:       {}", enabled(config.server.enable_android));
    println!("  iOS:           {}", enabled(config.server.enable_ios));
    println!("\n⏱  Timeouts");
    println!("─────────────────────────────────────");
    println!("  Init:          {}s", config.server.init_timeout_secs);
    println!("  Unresponsive:  {}s", config.server.unresponsive_timeout_secs);
    println!("  Dispatch:      {}ms", config.server.dispatch_budget_ms);
    println!("\n🔒 Certificates");
    println!("─────────────────────────────────────");
    println!("  Directory:     {}", config.certs.dir);

    Ok(())
}

fn enabled(flag: bool) -> &'static str {
    if flag {
        "enabled"
    } else {
        "disabled"
    }
}

async fn ensure_certs(config: AppConfig) -> anyhow::Result<()> {
    let app = DevlinkApp::new(config)?;
    app.ensure_certificates().await?;

    let store = app.authority().store();
    println!("\n🔒 Certificate material");
    println!("─────────────────────────────────────");
    println!("  CA cert:       {}", store.ca_cert_path().display());
    println!("  CA key:        {}", store.ca_key_path().display());
    println!("  Server cert:   {}", store.server_cert_path().display());
    println!("  Server key:    {}", store.server_key_path().display());

    Ok(())
}

fn init_tracing(level: &str, format: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(filter);
    if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
