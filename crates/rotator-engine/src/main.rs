//! rotator – authenticating SOCKS5 server that tunnels every accepted
//! stream through a rotating pool of upstream proxies, with an optional
//! direct-dial edge mode.

mod server;

use anyhow::{Context, Result};
use clap::Parser;
use rotator_core::stats::ConnectionStats;
use rotator_core::{config, Manager, ProxyDialer};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use server::Server;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "rotator", about = "SOCKS5 server with rotating upstream proxies")]
struct Cli {
    /// Path to the proxy list (one URL per line)
    #[arg(long, default_value = config::DEFAULT_PROXIES_FILE)]
    proxies: PathBuf,

    /// Path to the user credentials file (username:password per line)
    #[arg(long, default_value = config::DEFAULT_USERS_FILE)]
    users: PathBuf,

    /// Listen address
    #[arg(short, long, default_value = config::DEFAULT_LISTEN_ADDR)]
    listen: String,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    let credentials = config::load_credentials(&cli.users)?;

    let edge_enabled = config::edge_mode_from_env();
    let manager = Arc::new(Manager::new(edge_enabled));

    // A missing proxy list is tolerated in edge mode: the server then runs
    // on direct connections until a pool exists. Parse errors always abort.
    let entries = if cli.proxies.exists() || !edge_enabled {
        config::load_proxy_list(&cli.proxies)?
    } else {
        warn!(
            "Proxy list '{}' not found, serving direct connections only",
            cli.proxies.display()
        );
        Vec::new()
    };
    manager.load(entries).context("loading proxy pool")?;

    let dialer = Arc::new(ProxyDialer::new(Arc::clone(&manager)));

    let listener = TcpListener::bind(&cli.listen)
        .await
        .with_context(|| format!("failed to bind {}", cli.listen))?;
    let local_addr = listener.local_addr()?;

    info!(
        "SOCKS5 server running on {} (edge mode: {}, users: {}, proxies: {})",
        local_addr,
        edge_enabled,
        credentials.len(),
        manager.proxy_count()
    );

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, shutting down");
            signal_token.cancel();
        }
    });

    let server = Server::new(
        listener,
        dialer,
        Arc::new(credentials),
        ConnectionStats::new(),
        shutdown,
    );
    server.run().await
}
