//! Lock-free configuration snapshots.

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::Config;

/// Holds the current `Config` behind an atomic pointer. Readers load a
/// snapshot once per request and keep using it even if a reload lands
/// mid-flight; the single writer is the config-apply task.
pub struct ConfigStore {
    current: ArcSwap<Config>,
}

impl ConfigStore {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            current: ArcSwap::from(config),
        }
    }

    pub fn get(&self) -> Arc<Config> {
        self.current.load_full()
    }

    pub fn set(&self, config: Arc<Config>) {
        self.current.store(config);
    }
}
