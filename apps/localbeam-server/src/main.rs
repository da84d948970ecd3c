mod cli;

use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use localbeam_server::{Config, LocalBeamServer};

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG wins; otherwise info for everything.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    if let Some(Commands::Watch {
        url,
        client_id,
        count,
    }) = cli.command
    {
        return cli::run_watch_client(url, client_id, count).await;
    }

    let config = cli.serve.apply(Config::from_env());
    info!(
        port = config.port,
        bind = %config.bind_host,
        service = %config.service_name,
        advertise = config.advertise,
        "starting LocalBeam server"
    );

    let mut server = LocalBeamServer::new(config).start().await?;

    let _ = signal::ctrl_c().await;
    warn!("shutdown signal received");
    server.stop().await;
    info!("LocalBeam server stopped");
    Ok(())
}
