//! Hot reload: watch the config file, publish validated snapshots.
//!
//! The watcher debounces filesystem events (editors write several times per
//! save), re-parses the file, and only publishes snapshots that validate.
//! A broken edit leaves the running snapshot untouched and logs the reason.
//! Subscribers read through a `tokio::sync::watch` channel, so in-flight
//! requests keep whatever snapshot they started with.

use std::{path::PathBuf, sync::Arc, time::Duration};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};

use super::{ConfigError, GatewayConfig};

/// Quiet period after the last filesystem event before reloading.
const DEBOUNCE: Duration = Duration::from_millis(300);

/// Handle keeping the watch alive; dropping it stops reloads.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    _task: tokio::task::JoinHandle<()>,
}

/// Starts watching `path`, returning the watcher handle and a receiver whose
/// value is always the latest valid snapshot.
///
/// The initial load must succeed; later failures are logged and skipped.
///
/// # Errors
///
/// [`ConfigError`] if the initial load fails or the filesystem watch cannot
/// be established.
pub fn watch_config(
    path: PathBuf,
) -> Result<(ConfigWatcher, watch::Receiver<Arc<GatewayConfig>>), ConfigError> {
    let initial = Arc::new(GatewayConfig::from_file(&path)?);
    let (snapshot_tx, snapshot_rx) = watch::channel(Arc::clone(&initial));

    let (event_tx, event_rx) = mpsc::unbounded_channel::<()>();
    let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
        match result {
            Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                let _ = event_tx.send(());
            }
            Ok(_) => {}
            Err(error) => tracing::warn!(%error, "config watch error"),
        }
    })
    .map_err(|e| ConfigError::Invalid(format!("failed to create file watcher: {e}")))?;

    watcher
        .watch(&path, RecursiveMode::NonRecursive)
        .map_err(|e| ConfigError::Invalid(format!("failed to watch {}: {e}", path.display())))?;

    let task = tokio::spawn(reload_loop(path, event_rx, snapshot_tx));

    Ok((ConfigWatcher { _watcher: watcher, _task: task }, snapshot_rx))
}

async fn reload_loop(
    path: PathBuf,
    mut events: mpsc::UnboundedReceiver<()>,
    snapshots: watch::Sender<Arc<GatewayConfig>>,
) {
    while events.recv().await.is_some() {
        // Debounce: absorb the burst of events one save produces.
        loop {
            match tokio::time::timeout(DEBOUNCE, events.recv()).await {
                Ok(Some(())) => {}
                Ok(None) => return,
                Err(_elapsed) => break,
            }
        }

        match GatewayConfig::from_file(&path) {
            Ok(config) => {
                tracing::info!(
                    path = %path.display(),
                    paths = config.paths.len(),
                    "config reloaded"
                );
                let _ = snapshots.send(Arc::new(config));
            }
            Err(error) => {
                tracing::warn!(
                    path = %path.display(),
                    %error,
                    "config reload rejected, keeping previous snapshot"
                );
            }
        }
    }
}
