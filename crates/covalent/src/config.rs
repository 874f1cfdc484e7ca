//! Node configuration.

use std::time::Duration;

use covalent_core::MAX_RECOMMENDED_TX_SIZE;
use covalent_sync::SyncConfig;

/// Configuration for a [`LocalNode`](crate::LocalNode).
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// How long `load` waits for peers before reporting `Unavailable`.
    pub load_timeout: Duration,
    /// Local writes whose changes serialize larger than this are logged.
    pub max_recommended_tx_size: usize,
    /// Sync configuration.
    pub sync: SyncConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            load_timeout: Duration::from_secs(10),
            max_recommended_tx_size: MAX_RECOMMENDED_TX_SIZE,
            sync: SyncConfig::default(),
        }
    }
}

impl NodeConfig {
    /// A config with a different load timeout.
    pub fn with_load_timeout(mut self, timeout: Duration) -> Self {
        self.load_timeout = timeout;
        self
    }
}
