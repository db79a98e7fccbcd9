use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use onelease::{DhcpServer, LeaseParameters, Result, ServerConfig};

#[derive(Parser)]
#[command(name = "onelease")]
#[command(author, version, about = "A single-lease DHCP server for one peer", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Local address to bind the DHCP socket to.
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: Ipv4Addr,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the lease until interrupted.
    Run,
    /// Print the lease parameters derived from the config.
    ShowParams,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = ServerConfig::load(&cli.config)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            info!("Starting DHCP server with config: {:?}", cli.config);
            let server = Arc::new(DhcpServer::new(config)?);
            server.setup_listener(cli.bind).await?;

            let serving = Arc::clone(&server);
            let mut handle = tokio::spawn(async move { serving.serve().await });

            tokio::select! {
                joined = &mut handle => return flatten(joined),
                signal = tokio::signal::ctrl_c() => {
                    if let Err(error) = signal {
                        error!("Failed to listen for shutdown signal: {}", error);
                    }
                    info!("Received shutdown signal, stopping server...");
                }
            }

            server.close();
            flatten(handle.await)
        }
        Commands::ShowParams => {
            let params = LeaseParameters::from_config(&config)?;
            println!("{}", serde_json::to_string_pretty(&params)?);
            Ok(())
        }
    }
}

fn flatten(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    joined.map_err(|error| std::io::Error::other(error.to_string()))?
}
