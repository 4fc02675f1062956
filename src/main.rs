//! voxhub server entry point

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use voxhub::config::Config;

#[derive(Parser)]
#[command(name = "voxhub", version, about = "Real-time voice dialog session orchestrator")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, env = "VOXHUB_CONFIG", default_value = "voxhub.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestrator server (default)
    Serve {
        /// Bind host override
        #[arg(long)]
        host: Option<String>,
        /// Bind port override
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print the effective configuration and exit
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(&cli.config)?;

    match cli.command.unwrap_or(Command::Serve {
        host: None,
        port: None,
    }) {
        Command::Serve { host, port } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            voxhub::server::start(config).await
        }
        Command::ShowConfig => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
