//! Per-block validation scratchpad

use crate::flags::ConsensusFlags;
use crate::stake::BlockStake;
use crate::utxo_set::UnspentOutputSet;
use bulwark_common::chain::ChainedBlock;
use bulwark_common::{Amount, Block, BlockHash, BlockHeader, ConsensusError};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Outcome of validating one candidate block
#[derive(Debug, Clone)]
pub struct BlockResult {
    pub block: Block,

    /// The candidate anchored in the chain, once known
    pub chained_block: Option<Arc<ChainedBlock>>,

    pub error: Option<ConsensusError>,
}

impl BlockResult {
    pub fn new(block: Block) -> Self {
        Self {
            block,
            chained_block: None,
            error: None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.error.is_none()
    }
}

/// Snapshot of the block being built upon
#[derive(Debug, Clone)]
pub struct BestBlock {
    pub hash: BlockHash,
    pub header: BlockHeader,
    pub height: u32,
    pub median_time_past: i64,
    pub chained: Arc<ChainedBlock>,
}

impl BestBlock {
    pub fn new(chained: Arc<ChainedBlock>) -> Self {
        Self {
            hash: chained.hash,
            header: chained.header.clone(),
            height: chained.height,
            median_time_past: chained.median_time_past(),
            chained,
        }
    }
}

/// Stake sub-context of a proof-of-stake chain
#[derive(Debug, Clone, Default)]
pub struct StakeContext {
    pub block_stake: BlockStake,

    /// Value consumed by the coinstake
    pub total_coinstake_value_in: Amount,
}

/// Everything validation of a single block reads or accumulates
#[derive(Debug)]
pub struct ContextInformation {
    /// The candidate, anchored on `best_block`
    pub chained_block: Arc<ChainedBlock>,

    pub best_block: BestBlock,

    /// Wall clock at the start of acceptance
    pub time: DateTime<Utc>,

    pub flags: ConsensusFlags,

    /// Compact target the candidate must carry
    pub next_work_required: Option<u32>,

    pub stake: Option<StakeContext>,

    /// Working set of referenced outputs
    pub set: UnspentOutputSet,

    pub check_pow: bool,
    pub check_merkle_root: bool,
}

impl ContextInformation {
    /// Start validating `chained_block`, whose parent must be present
    pub fn new(chained_block: Arc<ChainedBlock>, time: DateTime<Utc>) -> Option<Self> {
        let best_block = BestBlock::new(chained_block.previous.clone()?);
        Some(Self {
            chained_block,
            best_block,
            time,
            flags: ConsensusFlags::default(),
            next_work_required: None,
            stake: None,
            set: UnspentOutputSet::new(),
            check_pow: true,
            check_merkle_root: true,
        })
    }

    /// Height of the candidate
    pub fn height(&self) -> u32 {
        self.chained_block.height
    }

    /// Stake sub-context, created on first use
    pub fn stake_mut(&mut self) -> &mut StakeContext {
        self.stake.get_or_insert_with(StakeContext::default)
    }
}
