//! Consensus loop settings read from configuration

use crate::script_checks::default_thread_count;
use bulwark_common::params::Network;
use config::Config;
use tracing::info;

const DEFAULT_NETWORK: (&str, &str) = ("network", "regtest");
const DEFAULT_PREFETCH: (&str, bool) = ("prefetch", true);
const SCRIPT_THREADS_KEY: &str = "script-threads";
const MAX_FUTURE_BLOCK_TIME_KEY: &str = "max-future-block-time";

#[derive(Debug, Clone)]
pub struct ConsensusSettings {
    /// Name of the network preset
    pub network: String,

    /// Threads verifying input scripts
    pub script_threads: usize,

    /// Warm the coin view with the next block's inputs while validating
    pub prefetch: bool,

    /// Override of the network's future timestamp allowance, in seconds
    pub max_future_block_time: Option<i64>,
}

impl Default for ConsensusSettings {
    fn default() -> Self {
        Self {
            network: DEFAULT_NETWORK.1.to_string(),
            script_threads: default_thread_count(),
            prefetch: DEFAULT_PREFETCH.1,
            max_future_block_time: None,
        }
    }
}

impl ConsensusSettings {
    pub fn from_config(config: &Config) -> Self {
        let network = config.get_string(DEFAULT_NETWORK.0).unwrap_or(DEFAULT_NETWORK.1.to_string());
        info!("Consensus on network '{}'", network);

        let script_threads = config
            .get_int(SCRIPT_THREADS_KEY)
            .ok()
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or_else(default_thread_count);
        info!("Verifying scripts on {} threads", script_threads);

        let prefetch = config.get_bool(DEFAULT_PREFETCH.0).unwrap_or(DEFAULT_PREFETCH.1);
        let max_future_block_time = config.get_int(MAX_FUTURE_BLOCK_TIME_KEY).ok();

        Self {
            network,
            script_threads,
            prefetch,
            max_future_block_time,
        }
    }

    /// The configured network preset with any overrides applied
    pub fn resolve_network(&self) -> anyhow::Result<Network> {
        let mut network = Network::from_name(&self.network)
            .ok_or_else(|| anyhow::anyhow!("unknown network '{}'", self.network))?;
        if let Some(seconds) = self.max_future_block_time {
            network.consensus.max_future_block_time = seconds;
        }
        Ok(network)
    }
}
