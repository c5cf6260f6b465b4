use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use scripthost::{Config, logging, start_server_with_config};

#[derive(Debug, Parser)]
#[command(name = "scripthost", about = "Stored server scripts over HTTP")]
struct Cli {
    /// TOML or YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overrides server.port
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    logging::init_tracing(&config.logging);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let server_task = tokio::spawn(start_server_with_config(config, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested, stopping server...");
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(Duration::from_secs(5), server_task).await {
        Ok(joined) => joined??,
        Err(_) => tracing::warn!("server did not stop within 5s"),
    }

    tracing::info!("server stopped");
    Ok(())
}
