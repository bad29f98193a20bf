//! Backend selection: the two balancing strategies, the backend server
//! handle with its connected socket, list diffing, and host sourcing.

pub mod fnv;
pub mod modulo;
pub mod rr;
pub mod server;
pub mod sourcer;

pub use modulo::StickyHash;
pub use rr::RoundRobin;
pub use server::{carry_over_connections, diff_server_lists, DhcpServer};
pub use sourcer::{FileSourcer, HostSourcer};

use std::sync::Arc;

use dl_codec::DhcpMessage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BalanceError {
    #[error("server list is empty")]
    EmptyServerList,
    #[error("'{0}' is not a supported balancing algorithm (supported: xid, rr)")]
    UnknownAlgorithm(String),
}

/// A balancing strategy over the stable and release-candidate pools.
///
/// `select_from_list` picks from an arbitrary list (used by tier
/// overrides); `select_ratio_based` buckets the client by hash into the RC
/// pool with `rc_ratio`% probability, sticky per client, then picks within
/// the chosen pool.
pub trait BalancingAlgorithm: Send + Sync {
    fn select_from_list(
        &self,
        list: &[Arc<DhcpServer>],
        msg: &DhcpMessage,
    ) -> Result<Arc<DhcpServer>, BalanceError>;

    fn select_ratio_based(&self, msg: &DhcpMessage) -> Result<Arc<DhcpServer>, BalanceError>;

    fn update_stable(&self, list: Vec<Arc<DhcpServer>>);

    fn update_rc(&self, list: Vec<Arc<DhcpServer>>);

    fn set_rc_ratio(&self, ratio: u32);

    fn name(&self) -> &'static str;
}

/// Build an algorithm from its config name.
pub fn algorithm_by_name(
    name: &str,
    rc_ratio: u32,
) -> Result<Arc<dyn BalancingAlgorithm>, BalanceError> {
    let algorithm: Arc<dyn BalancingAlgorithm> = match name {
        "xid" => Arc::new(StickyHash::new()),
        "rr" => Arc::new(RoundRobin::new()),
        other => return Err(BalanceError::UnknownAlgorithm(other.to_string())),
    };
    algorithm.set_rc_ratio(rc_ratio);
    Ok(algorithm)
}
