//! Sticky (hash-modulo) balancing: the same client id always lands on the
//! same backend for a given list, which keeps sessions and canary buckets
//! stable across packets.

use std::sync::{Arc, RwLock};

use dl_codec::DhcpMessage;

use crate::fnv::fnv1a32;
use crate::server::DhcpServer;
use crate::{BalanceError, BalancingAlgorithm};

#[derive(Default)]
struct Pools {
    stable: Vec<Arc<DhcpServer>>,
    rc: Vec<Arc<DhcpServer>>,
    rc_ratio: u32,
}

#[derive(Default)]
pub struct StickyHash {
    pools: RwLock<Pools>,
}

impl StickyHash {
    pub fn new() -> Self {
        Self::default()
    }

    fn pick(
        list: &[Arc<DhcpServer>],
        msg: &DhcpMessage,
    ) -> Result<Arc<DhcpServer>, BalanceError> {
        if list.is_empty() {
            return Err(BalanceError::EmptyServerList);
        }
        let hash = fnv1a32(&msg.client_id);
        Ok(list[hash as usize % list.len()].clone())
    }
}

impl BalancingAlgorithm for StickyHash {
    fn select_from_list(
        &self,
        list: &[Arc<DhcpServer>],
        msg: &DhcpMessage,
    ) -> Result<Arc<DhcpServer>, BalanceError> {
        Self::pick(list, msg)
    }

    fn select_ratio_based(&self, msg: &DhcpMessage) -> Result<Arc<DhcpServer>, BalanceError> {
        let pools = self.pools.read().unwrap_or_else(|e| e.into_inner());
        // bucket the client into 0..100 and compare against the RC share
        if fnv1a32(&msg.client_id) % 100 < pools.rc_ratio {
            Self::pick(&pools.rc, msg)
        } else {
            Self::pick(&pools.stable, msg)
        }
    }

    fn update_stable(&self, list: Vec<Arc<DhcpServer>>) {
        let mut pools = self.pools.write().unwrap_or_else(|e| e.into_inner());
        log_server_list("stable", &list);
        pools.stable = list;
    }

    fn update_rc(&self, list: Vec<Arc<DhcpServer>>) {
        let mut pools = self.pools.write().unwrap_or_else(|e| e.into_inner());
        log_server_list("RC", &list);
        pools.rc = list;
    }

    fn set_rc_ratio(&self, ratio: u32) {
        self.pools
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .rc_ratio = ratio;
    }

    fn name(&self) -> &'static str {
        "xid"
    }
}

pub(crate) fn log_server_list(name: &str, list: &[Arc<DhcpServer>]) {
    tracing::info!("list of available {} servers:", name);
    for server in list {
        tracing::info!("  {}", server);
    }
}
