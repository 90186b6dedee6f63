//! Bulwark consensus loop
//! Pulls candidate blocks from a block source, validates them against the
//! coin view and advances the validated tip

pub mod accept_error;
pub mod context;
pub mod flags;
pub mod in_memory_coin_view;
pub mod in_memory_stake_store;
pub mod interfaces;
pub mod memory_block_source;
pub mod script_checks;
pub mod settings;
pub mod stake;
pub mod stake_validator;
pub mod threshold_cache;
pub mod utxo_set;
pub mod validator;

pub use accept_error::BlockAcceptError;
pub use context::{BlockResult, ContextInformation};
pub use interfaces::{BlockSource, CoinView, ConsensusObserver, ScriptVerifier, StakeStore, TimeProvider};
pub use settings::ConsensusSettings;
pub use threshold_cache::{DeploymentStatus, ThresholdConditionCache, ThresholdState};
pub use validator::{BlockValidator, PosValidator, PowValidator};

use anyhow::{anyhow, bail, Result};
use bulwark_common::chain::{ChainIndex, ChainedBlock};
use bulwark_common::params::Network;
use bulwark_common::{Block, BlockHash, ConsensusError, TxId};
use flags::ConsensusFlags;
use interfaces::{SystemTime, TransactionOptions};
use script_checks::ScriptCheckPool;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Validator matching the network's consensus rules
///
/// Proof-of-stake networks need the stake store the loop persists into.
pub fn build_validator(
    network: Arc<Network>,
    settings: &ConsensusSettings,
    verifier: Arc<dyn ScriptVerifier>,
    stake_store: Option<Arc<dyn StakeStore>>,
) -> Result<Box<dyn BlockValidator>> {
    let pool = ScriptCheckPool::new(settings.script_threads)?;
    if !network.is_proof_of_stake() {
        return Ok(Box::new(PowValidator::new(network, verifier, pool)));
    }

    let store = stake_store.ok_or_else(|| anyhow!("network '{}' needs a stake store", network.name))?;
    Ok(Box::new(PosValidator::new(network, verifier, pool, store)?))
}

/// Transaction ids whose outputs executing `block` reads
///
/// The block's own ids are only needed to detect overwrites under BIP30.
fn referenced_ids(block: &Block, enforce_bip30: bool) -> Vec<TxId> {
    let mut ids = Vec::new();
    let mut seen = HashSet::new();
    for tx in &block.transactions {
        if enforce_bip30 {
            let txid = tx.txid();
            if seen.insert(txid) {
                ids.push(txid);
            }
        }
        if !tx.is_coinbase() {
            for input in &tx.inputs {
                if seen.insert(input.prevout.hash) {
                    ids.push(input.prevout.hash);
                }
            }
        }
    }
    ids
}

/// Drives blocks from a source through validation into the coin view
///
/// The loop owns its chain index and threshold cache. Outside readers get
/// deployment state through [`ConsensusLoop::subscribe_status`].
pub struct ConsensusLoop {
    network: Arc<Network>,
    validator: Box<dyn BlockValidator>,

    /// Validated chain; its tip is the block the coin view is at
    chain: ChainIndex,

    coin_view: Arc<dyn CoinView>,
    block_source: Arc<dyn BlockSource>,
    stake_store: Option<Arc<dyn StakeStore>>,
    threshold_cache: ThresholdConditionCache,
    status: watch::Sender<DeploymentStatus>,

    /// Hashes of blocks that failed validation
    invalid: HashSet<BlockHash>,

    observers: Vec<Arc<dyn ConsensusObserver>>,
    prefetch: bool,
    time: Arc<dyn TimeProvider>,
}

impl ConsensusLoop {
    pub fn new(
        network: Arc<Network>,
        validator: Box<dyn BlockValidator>,
        coin_view: Arc<dyn CoinView>,
        block_source: Arc<dyn BlockSource>,
        stake_store: Option<Arc<dyn StakeStore>>,
        settings: &ConsensusSettings,
    ) -> Self {
        let genesis = ChainedBlock::genesis(network.genesis.header.clone());
        let prefetch = settings.prefetch && coin_view.supports_prefetch();
        info!("Prefetching next block inputs: {prefetch}");

        let (status, _) = watch::channel(DeploymentStatus::default());
        Self {
            threshold_cache: ThresholdConditionCache::new(network.clone()),
            chain: ChainIndex::new(genesis),
            network,
            validator,
            coin_view,
            block_source,
            stake_store,
            status,
            invalid: HashSet::new(),
            observers: Vec::new(),
            prefetch,
            time: Arc::new(SystemTime),
        }
    }

    /// Start from a chain index already holding known blocks
    pub fn with_chain(mut self, chain: ChainIndex) -> Self {
        self.chain = chain;
        self
    }

    pub fn with_time_provider(mut self, time: Arc<dyn TimeProvider>) -> Self {
        self.time = time;
        self
    }

    pub fn add_observer(&mut self, observer: Arc<dyn ConsensusObserver>) {
        self.observers.push(observer);
    }

    /// Deployment states as of the tip, updated whenever the tip moves
    pub fn subscribe_status(&self) -> watch::Receiver<DeploymentStatus> {
        self.status.subscribe()
    }

    pub fn tip(&self) -> &Arc<ChainedBlock> {
        self.chain.tip()
    }

    pub fn chain(&self) -> &ChainIndex {
        &self.chain
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    /// Line the chain index up with the coin view and point the block source
    /// at the resulting tip
    ///
    /// A coin view ahead of the chain index is rewound until it reaches a
    /// known block.
    pub async fn initialize(&mut self) -> Result<()> {
        let mut hash = self.coin_view.block_hash().await?;
        let tip = loop {
            if let Some(block) = self.chain.get(&hash) {
                break block;
            }

            let rewound = self.coin_view.rewind().await?;
            if rewound == hash {
                bail!("coin view is stuck at unknown block {hash}");
            }
            warn!("Coin view at unknown block {hash}, rewound to {rewound}");
            hash = rewound;
        };

        info!(height = tip.height, hash = %tip.hash, "Consensus initialized");
        self.chain.set_tip(tip.clone());
        self.block_source.set_location(&tip).await;
        self.publish_status();
        Ok(())
    }

    /// Validate the next block the source offers
    ///
    /// Rule violations are reported in the returned result. `Ok(None)` means
    /// the loop was cancelled while waiting. Errors are fatal to the loop.
    pub async fn execute_next_block(&mut self, cancel: &CancellationToken) -> Result<Option<BlockResult>> {
        let block = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                next = self.block_source.next_block() => next?,
            };

            match next {
                Some(block) => break block,
                None => self.rewind().await?,
            }
        };

        let mut result = BlockResult::new(block);
        let span = info_span!("consensus", height = self.chain.height() + 1);
        let outcome = self.accept_block(&mut result).instrument(span).await;

        match outcome {
            Ok(()) => {
                if let Some(chained) = &result.chained_block {
                    debug!(height = chained.height, hash = %chained.hash, "Block connected");
                    for observer in &self.observers {
                        observer.block_connected(&result.block, chained);
                    }
                }
            }
            Err(BlockAcceptError::Consensus { hash, error }) => {
                warn!(%hash, code = error.code(), "Block rejected: {error}");
                // Missing witness data is the source's fault, not the block's
                if error != ConsensusError::BadWitnessNonceSize {
                    self.invalid.insert(hash);
                }
                for observer in &self.observers {
                    observer.block_rejected(&result.block, error);
                }
                result.error = Some(error);
            }
            Err(BlockAcceptError::Fatal(e)) => {
                let tip = self.chain.tip();
                error!(height = tip.height, hash = %tip.hash, "Consensus failed: {e:#}");
                return Err(e);
            }
        }

        Ok(Some(result))
    }

    /// Validate a candidate on top of the tip and commit it
    ///
    /// A candidate not building on the tip is left alone with no chained
    /// block set.
    async fn accept_block(&mut self, result: &mut BlockResult) -> Result<(), BlockAcceptError> {
        let BlockResult {
            block, chained_block, ..
        } = result;
        let hash = block.hash();
        let reject = |error: ConsensusError| BlockAcceptError::Consensus { hash, error };

        let tip = self.chain.tip().clone();
        if block.header.prev_block != tip.hash {
            debug!(%hash, parent = %block.header.prev_block, "Block does not build on the tip");
            return Ok(());
        }

        if self.invalid.contains(&hash) {
            return Err(reject(ConsensusError::BadBlockPreviouslyInvalid));
        }

        let chained = match self.chain.get(&hash) {
            Some(known) if known.previous.as_ref().is_some_and(|prev| prev.hash == tip.hash) => known,
            _ => ChainedBlock::extend(&tip, block.header.clone()),
        };
        *chained_block = Some(chained.clone());

        let mut context = ContextInformation::new(chained.clone(), self.time.now())
            .ok_or_else(|| anyhow!("block {hash} has no parent"))?;

        let validator = self.validator.as_ref();
        validator.check_block_header(block, &mut context).map_err(reject)?;
        validator.contextual_check_block_header(block, &mut context).map_err(reject)?;

        let states = self.threshold_cache.get_states(Some(&tip));
        context.flags = ConsensusFlags::new(&chained, &states, &self.network);

        validator.contextual_check_block(block, &mut context).map_err(reject)?;
        validator.check_block(block, &mut context).map_err(reject)?;

        let enforce_bip30 = context.flags.enforce_bip30;
        let ids = referenced_ids(block, enforce_bip30);
        let fetched = self.coin_view.fetch_outputs(&ids).await?;
        if fetched.block_hash != tip.hash {
            return Err(anyhow!("coin view is at {}, expected {}", fetched.block_hash, tip.hash).into());
        }
        context.set.set_coins(fetched.outputs.into_iter().flatten());

        if self.prefetch {
            self.prefetch_next(enforce_bip30);
        }

        validator.execute_block(block, &mut context).map_err(reject)?;

        let changes = std::mem::take(&mut context.set).into_changes();
        self.coin_view.save_changes(changes, tip.hash, hash).await?;

        if let (Some(store), Some(stake)) = (&self.stake_store, context.stake.take()) {
            store.set(hash, stake.block_stake);
        }

        self.chain.set_tip(chained);
        self.publish_status();
        Ok(())
    }

    /// Warm the coin view with the inputs of the block after the current one
    fn prefetch_next(&self, enforce_bip30: bool) {
        let source = self.block_source.clone();
        let coin_view = self.coin_view.clone();
        tokio::spawn(async move {
            let Some(next) = source.try_peek_ahead(0).await else {
                return;
            };
            let ids = referenced_ids(&next, enforce_bip30);
            if let Err(e) = coin_view.fetch_outputs(&ids).await {
                debug!("Prefetch failed: {e}");
            }
        });
    }

    /// Undo the last committed block and follow the source from there
    async fn rewind(&mut self) -> Result<()> {
        let current = self.chain.tip().clone();
        let hash = self.coin_view.rewind().await?;
        if hash == current.hash {
            bail!("block source has nothing to follow {hash} with");
        }

        let tip = self
            .chain
            .get(&hash)
            .ok_or_else(|| anyhow!("coin view rewound to unknown block {hash}"))?;
        info!(height = tip.height, hash = %tip.hash, "Rewound from {}", current.hash);

        self.chain.set_tip(tip.clone());
        self.block_source.set_location(&tip).await;
        self.publish_status();
        for observer in &self.observers {
            observer.rewound(&tip);
        }
        Ok(())
    }

    fn publish_status(&mut self) {
        let tip = self.chain.tip().clone();
        let states = self.threshold_cache.get_states(Some(&tip));
        self.status.send_replace(DeploymentStatus {
            tip: tip.hash,
            height: tip.height,
            states,
        });
    }

    /// Validate blocks until cancelled
    ///
    /// After a rejection the source is pointed back at the tip. Returns the
    /// first fatal error.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        info!(height = self.chain.height(), "Consensus loop started");
        while let Some(result) = self.execute_next_block(&cancel).await? {
            match result.error {
                None if result.chained_block.is_some() => continue,
                Some(ConsensusError::BadWitnessNonceSize) => {
                    self.block_source.request_options(TransactionOptions { witness: true }).await;
                }
                _ => {}
            }
            self.block_source.set_location(self.chain.tip()).await;
        }

        info!(height = self.chain.height(), "Consensus loop stopped");
        Ok(())
    }
}
