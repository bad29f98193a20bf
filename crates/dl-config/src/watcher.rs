//! Reload-on-change for the config and overrides files.
//!
//! A polling task compares file mtimes once a second; when either file (or
//! the target behind a symlinked path) changes, the whole configuration is
//! reloaded from disk and pushed down the channel. A file that briefly
//! disappears is ignored, so atomic-replace editors (write temp file,
//! rename over) behave as a single modification.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dl_codec::ProtocolVersion;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::{Config, ConfigProvider};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Spawn the watcher task. New snapshots arrive on the first channel. A
/// reload failure arrives on the second and ends the watcher: the process
/// must not keep running against a config it can no longer parse.
pub fn watch_config(
    config_path: PathBuf,
    overrides_path: Option<PathBuf>,
    version: ProtocolVersion,
    provider: Arc<dyn ConfigProvider>,
) -> (mpsc::Receiver<Arc<Config>>, mpsc::Receiver<anyhow::Error>) {
    let (config_tx, config_rx) = mpsc::channel(1);
    let (err_tx, err_rx) = mpsc::channel(1);

    tokio::spawn(async move {
        let mut fingerprint = snapshot_mtimes(&config_path, overrides_path.as_deref());
        let mut interval = tokio::time::interval(POLL_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            let current = snapshot_mtimes(&config_path, overrides_path.as_deref());
            if current == fingerprint {
                continue;
            }
            fingerprint = current;

            info!("configuration file changed, reloading");
            match Config::load(&config_path, overrides_path.as_deref(), version, &*provider) {
                Ok(config) => {
                    if config_tx.send(Arc::new(config)).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    let _ = err_tx.send(e).await;
                    return;
                }
            }
        }
    });

    (config_rx, err_rx)
}

/// Modification times of the watched paths and their symlink targets.
/// Missing files contribute `None`, which only triggers a reload once the
/// file comes back with a different mtime.
fn snapshot_mtimes(config_path: &Path, overrides_path: Option<&Path>) -> Vec<Option<SystemTime>> {
    let mut stamps = Vec::with_capacity(4);
    for path in [Some(config_path), overrides_path].into_iter().flatten() {
        stamps.push(mtime(path));
        match std::fs::canonicalize(path) {
            Ok(target) if target != path => stamps.push(mtime(&target)),
            Ok(_) => stamps.push(None),
            Err(_) => stamps.push(None),
        }
    }
    stamps
}

fn mtime(path: &Path) -> Option<SystemTime> {
    match std::fs::metadata(path) {
        Ok(meta) => meta.modified().ok(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!("stat {} failed: {}", path.display(), e);
            None
        }
    }
}
