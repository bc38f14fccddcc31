use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "devlink-server")]
#[command(version, about = "Device connection server with mTLS pairing", long_about = None)]
#[command(author = "Devlink Team")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run both listeners until interrupted (default mode)
    Run,

    /// Show the effective configuration
    Info {
        #[arg(long, default_value = "false", help = "Print as JSON")]
        json: bool,
    },

    /// Create the CA and server certificate if missing, then print their paths
    Certs,
}
