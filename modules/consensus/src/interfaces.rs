//! Collaborators the consensus loop drives

use crate::flags::ScriptFlags;
use crate::stake::BlockStake;
use crate::utxo_set::UnspentOutputs;
use anyhow::Result;
use async_trait::async_trait;
use bulwark_common::chain::ChainedBlock;
use bulwark_common::{Block, BlockHash, ConsensusError, Transaction, TxId, TxOut};
use chrono::{DateTime, Utc};

/// Extra data requested from peers along with blocks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionOptions {
    pub witness: bool,
}

/// Supplier of candidate blocks, following a chain position
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// The block after the current location, `None` if there is none for now
    async fn next_block(&self) -> Result<Option<Block>>;

    /// Continue from `location`
    async fn set_location(&self, location: &ChainedBlock);

    /// A block `count` positions past the current location, if already held
    async fn try_peek_ahead(&self, count: usize) -> Option<Block>;

    async fn request_options(&self, options: TransactionOptions);
}

/// Records returned by [`CoinView::fetch_outputs`]
#[derive(Debug, Clone)]
pub struct FetchedCoins {
    /// Tip the coin view was at when read
    pub block_hash: BlockHash,

    /// One entry per requested id, in request order
    pub outputs: Vec<Option<UnspentOutputs>>,
}

/// Persisted UTXO set
///
/// Fetches return snapshots, never live records. A save is atomic and
/// rewinding is idempotent.
#[async_trait]
pub trait CoinView: Send + Sync {
    async fn fetch_outputs(&self, txids: &[TxId]) -> Result<FetchedCoins>;

    /// Persist a block's changeset, moving the tip from `previous` to `next`
    async fn save_changes(
        &self,
        changes: Vec<UnspentOutputs>,
        previous: BlockHash,
        next: BlockHash,
    ) -> Result<()>;

    /// Undo the last saved block, returning the tip now persisted
    async fn rewind(&self) -> Result<BlockHash>;

    async fn block_hash(&self) -> Result<BlockHash>;

    /// Whether fetches warm a cache worth prefetching into
    fn supports_prefetch(&self) -> bool {
        false
    }
}

/// Persisted stake metadata
pub trait StakeStore: Send + Sync {
    fn get(&self, hash: &BlockHash) -> Option<BlockStake>;
    fn set(&self, hash: BlockHash, stake: BlockStake);
}

/// External signature and script interpreter
pub trait ScriptVerifier: Send + Sync {
    /// Verify input `index` of `tx` against the output it spends
    fn verify_input(&self, tx: &Transaction, index: usize, spent: &TxOut, flags: ScriptFlags) -> bool;

    /// Verify a proof-of-stake block's signature by the staking key
    fn verify_block_signature(&self, block: &Block) -> bool;
}

/// Wall clock used for future-timestamp checks
pub trait TimeProvider: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTime;

impl TimeProvider for SystemTime {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Callback receiver for consensus loop events
pub trait ConsensusObserver: Send + Sync {
    /// A block passed validation and is the new tip
    fn block_connected(&self, block: &Block, chained: &ChainedBlock);

    /// A block failed validation
    fn block_rejected(&self, block: &Block, error: ConsensusError);

    /// The coin view was rewound to `tip`
    fn rewound(&self, tip: &ChainedBlock);
}
