//! Tunnel server daemon
//!
//! Binds the tunnel listener, serves flows until interrupted, and tears
//! every live tunnel down on shutdown.

use anyhow::Result;
use clap::Parser;
use muxtun_server::{ServerConfig, TunnelServer};
use std::path::PathBuf;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Multiplexing tunnel server
#[derive(Parser, Debug)]
#[command(name = "muxtun-serverd")]
#[command(about = "Run a multiplexing tunnel server", long_about = None)]
struct Cli {
    /// Tunnel listener bind address
    #[arg(long, default_value = "0.0.0.0:9870", env = "MUXTUN_LISTEN")]
    listen: String,

    /// Configuration file (JSON). Without one the server runs with host DNS
    /// settings only and no address pool.
    #[arg(long, env = "MUXTUN_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let config = match &cli.config {
        Some(path) => {
            info!(path = %path.display(), "loading configuration");
            ServerConfig::load(path)?
        }
        None => {
            let mut config = ServerConfig::default();
            config.fill_system_dns();
            config
        }
    };

    let server = TunnelServer::new(config)?;
    if let Some(pool) = server.pool() {
        info!(addresses = pool.size(), "address pool ready");
    }
    let tunnels = server.tunnel_set();

    let listener = TcpListener::bind(&cli.listen).await?;

    tokio::select! {
        result = server.run(listener) => {
            result?;
        }
        _ = signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            tunnels.close_all();
        }
    }

    Ok(())
}
