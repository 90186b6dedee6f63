//! Version-bits soft fork activation (BIP9)
//!
//! State is defined per confirmation window: every block in a window shares
//! the state computed at the last block of the previous window. States are
//! memoized by that block's hash, and since a window's state only depends
//! on its ancestors a cached entry is never recomputed.

use bulwark_common::chain::ChainedBlock;
use bulwark_common::params::{Deployment, DeploymentId, Network};
use bulwark_common::BlockHash;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Activation state of a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ThresholdState {
    /// First state, before the start time
    Defined,

    /// Signalling is being counted
    Started,

    /// Enough signalling seen, activates in the next window
    LockedIn,

    /// Rules are enforced
    Active,

    /// Timed out without locking in
    Failed,
}

/// Activation state of every deployment as of a chain tip
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentStatus {
    pub tip: BlockHash,
    pub height: u32,
    pub states: BTreeMap<DeploymentId, ThresholdState>,
}

/// Memoized activation states keyed by deployment and window-end block
pub struct ThresholdConditionCache {
    network: Arc<Network>,

    /// `None` stands for the (virtual) parent of genesis
    cache: HashMap<DeploymentId, HashMap<Option<BlockHash>, ThresholdState>>,
}

impl ThresholdConditionCache {
    pub fn new(network: Arc<Network>) -> Self {
        Self {
            network,
            cache: HashMap::new(),
        }
    }

    /// State of every known deployment for the block following `prev`
    pub fn get_states(&mut self, prev: Option<&Arc<ChainedBlock>>) -> BTreeMap<DeploymentId, ThresholdState> {
        let ids: Vec<DeploymentId> = self.network.deployments.keys().copied().collect();
        ids.into_iter().map(|id| (id, self.get_state(prev, id))).collect()
    }

    /// State of `id` for the block following `prev`
    ///
    /// A deployment the network does not define never activates.
    pub fn get_state(&mut self, prev: Option<&Arc<ChainedBlock>>, id: DeploymentId) -> ThresholdState {
        let Some(deployment) = self.network.deployments.get(&id).cloned() else {
            return ThresholdState::Failed;
        };
        if deployment.start_time == Deployment::ALWAYS_ACTIVE {
            return ThresholdState::Active;
        }

        let period = self.network.miner_confirmation_window;
        let cache = self.cache.entry(id).or_default();

        // Move to the last block of the previous window
        let mut cursor = prev.and_then(|block| {
            block.height.checked_sub((block.height + 1) % period).and_then(|height| block.ancestor(height))
        });

        // Walk back a window at a time until a known state
        let mut to_compute = Vec::new();
        let mut state = loop {
            let key = cursor.as_ref().map(|block| block.hash);
            if let Some(state) = cache.get(&key) {
                break *state;
            }

            let Some(block) = cursor else {
                cache.insert(None, ThresholdState::Defined);
                break ThresholdState::Defined;
            };

            // Nothing before the start time can have changed state
            if block.median_time_past() < deployment.start_time {
                cache.insert(key, ThresholdState::Defined);
                break ThresholdState::Defined;
            }

            cursor = if block.height >= period {
                block.ancestor(block.height - period)
            } else {
                None
            };
            to_compute.push(block);
        };

        // Apply transitions forward
        while let Some(block) = to_compute.pop() {
            let median_time = block.median_time_past();
            state = match state {
                ThresholdState::Defined => {
                    if median_time >= deployment.timeout {
                        ThresholdState::Failed
                    } else if median_time >= deployment.start_time {
                        ThresholdState::Started
                    } else {
                        ThresholdState::Defined
                    }
                }
                ThresholdState::Started => {
                    if median_time >= deployment.timeout {
                        ThresholdState::Failed
                    } else if count_signalling(&self.network, &block, &deployment)
                        >= self.network.rule_change_activation_threshold
                    {
                        ThresholdState::LockedIn
                    } else {
                        ThresholdState::Started
                    }
                }
                ThresholdState::LockedIn => ThresholdState::Active,
                ThresholdState::Failed | ThresholdState::Active => state,
            };
            cache.insert(Some(block.hash), state);
        }

        state
    }
}

/// Blocks signalling `deployment` in the window ending at `last`
fn count_signalling(network: &Network, last: &Arc<ChainedBlock>, deployment: &Deployment) -> u32 {
    let mut count = 0;
    let mut cursor = Some(last.clone());
    for _ in 0..network.miner_confirmation_window {
        let Some(block) = cursor else { break };
        if condition(network, block.header.version, deployment) {
            count += 1;
        }
        cursor = block.previous.clone();
    }
    count
}

/// Version carries the signalling marker and the deployment's bit
fn condition(network: &Network, version: i32, deployment: &Deployment) -> bool {
    let version = version as u32;
    (version & network.version_bits_top_mask) == network.version_bits_top_bits
        && (version & deployment.mask()) != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulwark_common::BlockHeader;

    const PERIOD: u32 = 10;
    const THRESHOLD: u32 = 8;
    const SIGNAL: i32 = 0x2000_0001;
    const QUIET: i32 = 0x2000_0000;

    fn network(start_time: i64, timeout: i64) -> Arc<Network> {
        let mut network = Network::regtest();
        network.miner_confirmation_window = PERIOD;
        network.rule_change_activation_threshold = THRESHOLD;
        network.deployments.insert(DeploymentId::Csv, Deployment {
            bit: 0,
            start_time,
            timeout,
        });
        Arc::new(network)
    }

    /// Chain of `versions.len()` blocks on top of a genesis, one minute apart
    fn chain(versions: &[i32]) -> Vec<Arc<ChainedBlock>> {
        let header = |prev: BlockHash, time: u32, version: i32| BlockHeader {
            version,
            prev_block: prev,
            merkle_root: Default::default(),
            time,
            bits: 0x207fffff,
            nonce: 0,
        };
        let mut blocks = vec![ChainedBlock::genesis(header(BlockHash::zero(), 1000, 1))];
        for (i, version) in versions.iter().enumerate() {
            let prev = blocks[blocks.len() - 1].clone();
            blocks.push(ChainedBlock::extend(&prev, header(prev.hash, 1060 + 60 * i as u32, *version)));
        }
        blocks
    }

    /// First window quiet, second window with `signalling` signalling blocks
    fn versions(signalling: u32, extra: usize) -> Vec<i32> {
        let mut versions = vec![QUIET; (PERIOD - 1) as usize];
        for i in 0..PERIOD {
            versions.push(if i < signalling { SIGNAL } else { QUIET });
        }
        versions.resize(versions.len() + extra, QUIET);
        versions
    }

    #[test]
    fn genesis_parent_is_defined() {
        let mut cache = ThresholdConditionCache::new(network(0, Deployment::NO_TIMEOUT));
        assert_eq!(cache.get_state(None, DeploymentId::Csv), ThresholdState::Defined);
    }

    #[test]
    fn one_below_threshold_stays_started() {
        let mut cache = ThresholdConditionCache::new(network(0, Deployment::NO_TIMEOUT));
        let blocks = chain(&versions(THRESHOLD - 1, 0));
        let tip = blocks.last().unwrap();
        assert_eq!(tip.height, 2 * PERIOD - 1);
        assert_eq!(cache.get_state(Some(&blocks[PERIOD as usize - 1]), DeploymentId::Csv), ThresholdState::Started);
        assert_eq!(cache.get_state(Some(tip), DeploymentId::Csv), ThresholdState::Started);
    }

    #[test]
    fn threshold_locks_in_then_activates() {
        let mut cache = ThresholdConditionCache::new(network(0, Deployment::NO_TIMEOUT));
        let blocks = chain(&versions(THRESHOLD, 3 * PERIOD as usize));
        let window_end = |n: u32| &blocks[(n * PERIOD - 1) as usize];

        assert_eq!(cache.get_state(Some(window_end(2)), DeploymentId::Csv), ThresholdState::LockedIn);
        assert_eq!(cache.get_state(Some(window_end(3)), DeploymentId::Csv), ThresholdState::Active);

        // Every descendant stays active, with or without signalling
        for block in &blocks[(3 * PERIOD) as usize..] {
            assert_eq!(cache.get_state(Some(block), DeploymentId::Csv), ThresholdState::Active);
        }
    }

    #[test]
    fn wrong_marker_bits_do_not_count() {
        let mut cache = ThresholdConditionCache::new(network(0, Deployment::NO_TIMEOUT));
        let mut versions = versions(0, 0);
        for version in versions.iter_mut().skip((PERIOD - 1) as usize) {
            *version = 0x6000_0001;
        }
        let blocks = chain(&versions);
        assert_eq!(cache.get_state(blocks.last(), DeploymentId::Csv), ThresholdState::Started);
    }

    #[test]
    fn timeout_fails_and_stays_failed() {
        // Times run from 1000; the second window's end passes the timeout
        let mut cache = ThresholdConditionCache::new(network(0, 1500));
        let blocks = chain(&versions(PERIOD, 2 * PERIOD as usize));
        assert_eq!(cache.get_state(Some(&blocks[(PERIOD - 1) as usize]), DeploymentId::Csv), ThresholdState::Started);
        assert_eq!(cache.get_state(blocks.last(), DeploymentId::Csv), ThresholdState::Failed);
    }

    #[test]
    fn before_start_time_is_defined() {
        let mut cache = ThresholdConditionCache::new(network(1_000_000, Deployment::NO_TIMEOUT));
        let blocks = chain(&versions(PERIOD, 0));
        assert_eq!(cache.get_state(blocks.last(), DeploymentId::Csv), ThresholdState::Defined);
    }

    #[test]
    fn always_active_and_unknown_deployments() {
        let mut network = Network::regtest();
        network.deployments.remove(&DeploymentId::Csv);
        let mut cache = ThresholdConditionCache::new(Arc::new(network));
        assert_eq!(cache.get_state(None, DeploymentId::Segwit), ThresholdState::Active);
        assert_eq!(cache.get_state(None, DeploymentId::Csv), ThresholdState::Failed);
        assert_eq!(cache.get_states(None).len(), 1);
    }
}
