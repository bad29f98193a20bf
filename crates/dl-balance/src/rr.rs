//! Round-robin balancing. RC membership is still decided by the client-id
//! hash (so canary bucketing stays sticky per client), but within the
//! chosen pool servers are handed out in rotation.
//!
//! Three cursors: one per pool, plus a shared `list` cursor that lets
//! `select_from_list` serve both arbitrary tier lists and the pool paths
//! without duplicating state. Cursors are reduced modulo the list length
//! at read time so a shrinking list cannot leave them out of range.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use dl_codec::DhcpMessage;

use crate::fnv::fnv1a32;
use crate::modulo::log_server_list;
use crate::server::DhcpServer;
use crate::{BalanceError, BalancingAlgorithm};

#[derive(Default)]
struct Cursors {
    stable: Vec<Arc<DhcpServer>>,
    rc: Vec<Arc<DhcpServer>>,
    iter_stable: usize,
    iter_rc: usize,
    iter_list: usize,
}

enum Pool {
    Stable,
    Rc,
}

#[derive(Default)]
pub struct RoundRobin {
    state: RwLock<Cursors>,
    rc_ratio: AtomicU32,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    fn pick_from_pool(state: &mut Cursors, pool: Pool) -> Result<Arc<DhcpServer>, BalanceError> {
        let len = match pool {
            Pool::Stable => state.stable.len(),
            Pool::Rc => state.rc.len(),
        };
        if len == 0 {
            return Err(BalanceError::EmptyServerList);
        }
        state.iter_list %= len;
        let server = match pool {
            Pool::Stable => state.stable[state.iter_list].clone(),
            Pool::Rc => state.rc[state.iter_list].clone(),
        };
        state.iter_list += 1;
        Ok(server)
    }
}

impl BalancingAlgorithm for RoundRobin {
    fn select_from_list(
        &self,
        list: &[Arc<DhcpServer>],
        _msg: &DhcpMessage,
    ) -> Result<Arc<DhcpServer>, BalanceError> {
        if list.is_empty() {
            return Err(BalanceError::EmptyServerList);
        }
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.iter_list %= list.len();
        let server = list[state.iter_list].clone();
        state.iter_list += 1;
        Ok(server)
    }

    fn select_ratio_based(&self, msg: &DhcpMessage) -> Result<Arc<DhcpServer>, BalanceError> {
        let hash = fnv1a32(&msg.client_id);
        let rc_ratio = self.rc_ratio.load(Ordering::Relaxed);
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if hash % 100 < rc_ratio {
            state.iter_list = state.iter_rc;
            state.iter_rc += 1;
            Self::pick_from_pool(&mut state, Pool::Rc)
        } else {
            state.iter_list = state.iter_stable;
            state.iter_stable += 1;
            Self::pick_from_pool(&mut state, Pool::Stable)
        }
    }

    fn update_stable(&self, list: Vec<Arc<DhcpServer>>) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        log_server_list("stable", &list);
        state.stable = list;
        state.iter_stable = 0;
        state.iter_rc = 0;
    }

    fn update_rc(&self, list: Vec<Arc<DhcpServer>>) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        log_server_list("RC", &list);
        state.rc = list;
        state.iter_stable = 0;
        state.iter_rc = 0;
    }

    fn set_rc_ratio(&self, ratio: u32) {
        self.rc_ratio.store(ratio, Ordering::Relaxed);
    }

    fn name(&self) -> &'static str {
        "rr"
    }
}
