//! Configuration reload.
//!
//! Reload re-reads the config file and hands the result to
//! [`Registry::apply`]. A file that fails to load or validate is rejected
//! as a whole and the running configuration stays in place.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};

use crate::config::Config;
use crate::registry::Registry;

/// Load `path`, validate it and apply it to `registry`.
pub async fn reload(registry: &Registry, path: &Path) -> Result<()> {
    let config = Config::load(path)?;
    let groups = config
        .build_groups()
        .with_context(|| format!("invalid configuration in {}", path.display()))?;
    registry.apply(groups).await?;
    let ports = registry.ports().await;
    info!(path = %path.display(), ports = ?ports, "Configuration applied");
    Ok(())
}

/// Reload on every SIGUSR1 until the signal stream ends.
#[cfg(unix)]
pub async fn watch_signals(registry: Arc<Registry>, path: PathBuf) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut signals =
        signal(SignalKind::user_defined1()).context("failed to install SIGUSR1 handler")?;
    info!(path = %path.display(), "Send SIGUSR1 to reload the configuration");

    while signals.recv().await.is_some() {
        info!(path = %path.display(), "SIGUSR1 received, reloading");
        if let Err(e) = reload(&registry, &path).await {
            error!(error = %format!("{:#}", e), "Reload failed, keeping running configuration");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
pub async fn watch_signals(_registry: Arc<Registry>, _path: PathBuf) -> Result<()> {
    tracing::warn!("Signal-driven reload is not available on this platform");
    std::future::pending::<()>().await;
    Ok(())
}
