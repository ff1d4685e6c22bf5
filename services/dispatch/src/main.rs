//! rnm
//!
//! REALITY-aware TCP front-end.
//!
//! This service:
//! - Loads port groups and their identities from a JSON config file
//! - Accepts TCP connections on every configured port
//! - Authenticates each ClientHello against the port's identities
//! - Proxies authenticated clients to their identity's backend
//! - Sends everything else to the fallback, or drains it
//! - Reloads the config file on SIGUSR1

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rnm_dispatch::proxy::DEFAULT_MAX_CONNECTIONS;
use rnm_dispatch::{reload, Config, Registry, Resolver};
use rnm_reality::PrivateKey;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "rnm", version, about = "REALITY-aware TCP front-end")]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, env = "RNM_CONF", default_value = "config.json")]
    conf: PathBuf,

    /// Log level when RUST_LOG is not set (trace, debug, info, warn, error).
    #[arg(long, env = "RNM_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[arg(long, value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    /// Omit timestamps from log lines.
    #[arg(long)]
    suppress_timestamps: bool,

    /// Concurrent connection cap per listening port.
    #[arg(long, env = "RNM_MAX_CONNECTIONS", default_value_t = DEFAULT_MAX_CONNECTIONS)]
    max_connections: usize,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate an X25519 key pair for a server entry.
    Keygen,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Keygen) = cli.command {
        keygen();
        return Ok(());
    }

    init_tracing(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting rnm");

    let config = Config::load(&cli.conf)?;
    let groups = config.build_groups().context("invalid configuration")?;
    info!(
        conf = %cli.conf.display(),
        group_count = groups.len(),
        "Configuration loaded"
    );

    let registry = Arc::new(
        Registry::new(Arc::new(Resolver::new())).with_max_connections(cli.max_connections),
    );
    registry
        .apply(groups)
        .await
        .context("failed to start listeners")?;
    info!(ports = ?registry.ports().await, "Listening");

    let watcher = tokio::spawn(reload::watch_signals(Arc::clone(&registry), cli.conf.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("Shutting down");
    watcher.abort();
    registry.shutdown().await;
    Ok(())
}

fn init_tracing(cli: &Cli) {
    // Prefer RUST_LOG, fall back to --log-level
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    match (cli.log_format, cli.suppress_timestamps) {
        (LogFormat::Json, false) => registry.with(fmt::layer().json()).init(),
        (LogFormat::Json, true) => registry.with(fmt::layer().json().without_time()).init(),
        (LogFormat::Text, false) => registry.with(fmt::layer()).init(),
        (LogFormat::Text, true) => registry.with(fmt::layer().without_time()).init(),
    }
}

fn keygen() {
    let key = PrivateKey::from_bytes(rand::random());
    println!("Private key: {}", key.to_base64());
    println!("Public key: {}", key.public_key_base64());
}
