//! rk8-notifyd - authenticated push notification daemon.
//!
//! Serves the push-socket channel for clients and the notify endpoint for
//! trusted senders. See the `rk8_notifyd` library for the core.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use mimalloc::MiMalloc;
use tokio::net::TcpListener;

use rk8_notifyd::auth::AuthCheck;
use rk8_notifyd::channel::WebSocketChannel;
use rk8_notifyd::crypto::EciesProvider;
use rk8_notifyd::trigger::TriggerServer;
use rk8_notifyd::{pki, Config, SharedSockets};

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "rk8-notifyd")]
#[command(version)]
#[command(about = "Authenticated push notification daemon")]
struct Cli {
    /// Config file (default: <config dir>/rk8-notifyd/config.json)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Push-socket channel port
    #[arg(long)]
    port: Option<u16>,

    /// Notify endpoint port
    #[arg(long)]
    notify_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(port) = cli.notify_port {
        config.notify_port = port;
    }
    log::info!(
        "rk8-notifyd {} starting (pki: {:?} at {}, auth: {:?})",
        env!("CARGO_PKG_VERSION"),
        config.pki.backend,
        config.pki.dir.display(),
        config.auth.policy
    );

    let store = pki::open_store(&config.pki).context("Failed to open PKI store")?;
    let auth = AuthCheck::from_config(&config.auth).context("No usable auth module")?;
    log::info!(
        "Auth modules: {}",
        auth.module_names().collect::<Vec<_>>().join(", ")
    );

    let sockets = SharedSockets::new(
        Arc::new(EciesProvider::new()),
        store,
        Arc::new(auth),
        config.timeouts(),
    );

    let channel_listener = TcpListener::bind(config.channel_addr())
        .await
        .with_context(|| format!("Failed to bind {}", config.channel_addr()))?;
    let notify_listener = TcpListener::bind(config.notify_addr())
        .await
        .with_context(|| format!("Failed to bind {}", config.notify_addr()))?;

    let channel = WebSocketChannel::new(sockets.clone(), config.identify_timeout());
    let trigger = TriggerServer::new(sockets);

    tokio::select! {
        result = channel.serve(channel_listener) => result.context("Push-socket channel stopped")?,
        result = trigger.serve(notify_listener) => result.context("Notify endpoint stopped")?,
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
            log::info!("Shutting down");
        }
    }

    Ok(())
}
