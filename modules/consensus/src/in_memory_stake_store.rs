//! In-memory stake metadata store using DashMap
// Sharded locks keep lookups from the validator and writes from the loop
// from contending on a single lock

use crate::interfaces::StakeStore;
use crate::stake::BlockStake;
use bulwark_common::{Block, BlockHash};
use dashmap::DashMap;
use tracing::info;

pub struct InMemoryStakeStore {
    /// Stake metadata by block hash
    stakes: DashMap<BlockHash, BlockStake>,
}

impl InMemoryStakeStore {
    /// Create a store seeded with the genesis block's metadata
    pub fn new(genesis: &Block) -> Self {
        info!("Storing stake metadata in memory (DashMap)");
        let stakes = DashMap::new();
        stakes.insert(genesis.hash(), BlockStake::genesis(genesis));
        Self { stakes }
    }

    pub fn len(&self) -> usize {
        self.stakes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stakes.is_empty()
    }
}

impl StakeStore for InMemoryStakeStore {
    fn get(&self, hash: &BlockHash) -> Option<BlockStake> {
        // Clone out so no shard lock is held by the caller
        self.stakes.get(hash).map(|stake| stake.clone())
    }

    fn set(&self, hash: BlockHash, stake: BlockStake) {
        self.stakes.insert(hash, stake);
    }
}
