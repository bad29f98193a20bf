//! Pool reconciliation and config application.
//!
//! The reconciler periodically asks the host sourcer for the stable and RC
//! lists, diffs them against the live pools, carries sockets over, and
//! feeds the balancer. Config swaps reuse the same pools: a freshly built
//! algorithm instance starts empty and must observe the current lists
//! before the next selection.

use std::sync::Arc;
use std::time::Duration;

use dl_balance::{carry_over_connections, diff_server_lists, DhcpServer};
use dl_config::{Config, ConfigStore};
use dl_throttle::Throttle;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::override_engine::schedule_disconnect;

/// The live stable and RC server lists, shared between the reconciler and
/// whatever wants to inspect them (diagnostics, config application).
#[derive(Default)]
pub struct ServerPools {
    stable: Mutex<Vec<Arc<DhcpServer>>>,
    rc: Mutex<Vec<Arc<DhcpServer>>>,
}

impl ServerPools {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn has_servers(&self) -> bool {
        !self.stable.lock().await.is_empty() || !self.rc.lock().await.is_empty()
    }

    pub async fn stable_snapshot(&self) -> Vec<Arc<DhcpServer>> {
        self.stable.lock().await.clone()
    }

    pub async fn rc_snapshot(&self) -> Vec<Arc<DhcpServer>> {
        self.rc.lock().await.clone()
    }
}

/// Fetch both lists once and reconcile them into the pools and the
/// balancer. An empty or failed fetch leaves the previous list in place.
pub async fn reconcile_once(config: &Config, pools: &ServerPools) {
    match config.host_sourcer.stable_servers().await {
        Ok(list) if !list.is_empty() => {
            let list = apply_list(config.free_conn_timeout, &pools.stable, list).await;
            config.algorithm.update_stable(list);
        }
        Ok(_) => {}
        Err(e) => error!("failed to fetch stable servers: {e:#}"),
    }
    match config.host_sourcer.rc_servers().await {
        Ok(list) if !list.is_empty() => {
            let list = apply_list(config.free_conn_timeout, &pools.rc, list).await;
            config.algorithm.update_rc(list);
        }
        Ok(_) => {}
        Err(e) => error!("failed to fetch RC servers: {e:#}"),
    }
}

async fn apply_list(
    free_conn_timeout: Duration,
    current: &Mutex<Vec<Arc<DhcpServer>>>,
    updated: Vec<Arc<DhcpServer>>,
) -> Vec<Arc<DhcpServer>> {
    let mut current = current.lock().await;
    let (added, removed) = diff_server_lists(&current, &updated);
    if !added.is_empty() || !removed.is_empty() {
        info!(
            "server list updated ({} added, {} removed)",
            added.len(),
            removed.len()
        );
    }
    // surviving entries inherit their socket even when nothing changed, so
    // sockets never leak across refreshes
    carry_over_connections(&current, &updated).await;
    // removed servers drain in-flight sends before their socket closes
    for server in removed {
        schedule_disconnect(server, free_conn_timeout);
    }
    *current = updated.clone();
    updated
}

/// Run reconciliation on the configured cadence, following the interval of
/// whatever config snapshot is current at each turn.
pub async fn run_reconciler(store: Arc<ConfigStore>, pools: Arc<ServerPools>) -> anyhow::Result<()> {
    info!("starting to update server lists");
    loop {
        let config = store.get();
        reconcile_once(&config, &pools).await;
        tokio::time::sleep(config.update_server_interval).await;
    }
}

/// Publish a reloaded config: the new algorithm instance learns the current
/// pools before the snapshot becomes visible to workers, and the throttle
/// picks up the new per-key rate.
pub async fn apply_config(
    store: &ConfigStore,
    pools: &ServerPools,
    throttle: &Throttle,
    config: Arc<Config>,
) {
    info!("updating server config");
    config.algorithm.update_stable(pools.stable_snapshot().await);
    config.algorithm.update_rc(pools.rc_snapshot().await);
    throttle.set_rate(config.rate);
    store.set(config);
    info!("updated server config");
}
