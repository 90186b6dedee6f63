//! Feeds a file of blocks through the consensus loop

use anyhow::{Context, Result};
use bulwark_common::{Block, BlockHash, ConsensusError};
use bulwark_module_consensus::memory_block_source::MemoryBlockSource;
use bulwark_module_consensus::ConsensusLoop;
use std::fs::read_to_string;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Read a JSON array of blocks
pub fn load_blocks(path: &Path) -> Result<Vec<Block>> {
    let text = read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let blocks: Vec<Block> =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    info!("Loaded {} blocks from {}", blocks.len(), path.display());
    Ok(blocks)
}

#[derive(Debug, Default)]
pub struct ReplaySummary {
    pub connected: usize,

    /// Blocks not building on the tip, left after a rejection
    pub skipped: usize,

    /// First rejected block and the rule it broke
    pub rejected: Option<(BlockHash, ConsensusError)>,
}

/// Validate every block the source holds
///
/// Stops early when cancelled, or at the first rejection if asked to.
pub async fn replay(
    consensus: &mut ConsensusLoop,
    source: &MemoryBlockSource,
    cancel: &CancellationToken,
    stop_on_rejection: bool,
) -> Result<ReplaySummary> {
    let mut summary = ReplaySummary::default();

    while !source.is_drained().await {
        let Some(result) = consensus.execute_next_block(cancel).await? else {
            info!("Replay cancelled");
            break;
        };

        match (result.error, &result.chained_block) {
            (None, Some(_)) => summary.connected += 1,
            (None, None) => summary.skipped += 1,
            (Some(error), _) => {
                let hash = result.block.hash();
                warn!(%hash, "Replay hit a rejected block: {error}");
                summary.rejected.get_or_insert((hash, error));
                if stop_on_rejection {
                    break;
                }
            }
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulwark_common::params::Network;
    use bulwark_module_consensus::in_memory_coin_view::InMemoryCoinView;
    use bulwark_module_consensus::script_checks::AcceptAllScriptVerifier;
    use bulwark_module_consensus::validator::pow_reward;
    use bulwark_module_consensus::{build_validator, ConsensusSettings};
    use bulwark_test_utils::TestChain;
    use std::sync::Arc;

    async fn consensus_over(chain: &TestChain, blocks: Vec<Block>) -> (ConsensusLoop, Arc<MemoryBlockSource>) {
        let network = Arc::new(chain.network.clone());
        let settings = ConsensusSettings::default();
        let coin_view = Arc::new(InMemoryCoinView::new(network.genesis_hash()));
        let source = Arc::new(MemoryBlockSource::new(network.genesis_hash(), blocks));
        let validator =
            build_validator(network.clone(), &settings, Arc::new(AcceptAllScriptVerifier), None).unwrap();
        let mut consensus = ConsensusLoop::new(network, validator, coin_view, source.clone(), None, &settings);
        consensus.initialize().await.unwrap();
        (consensus, source)
    }

    fn chain_with_bad_block() -> (TestChain, Vec<Block>) {
        let mut chain = TestChain::new(Network::regtest());
        chain.mine_block(pow_reward(&chain.network, 1), vec![]);
        chain.mine_block(pow_reward(&chain.network, 2), vec![]);
        chain.mine_block(pow_reward(&chain.network, 3) + 1, vec![]);
        chain.mine_block(pow_reward(&chain.network, 4), vec![]);
        let blocks = chain.blocks.clone();
        (chain, blocks)
    }

    #[tokio::test]
    async fn stops_at_first_rejection() {
        let (chain, blocks) = chain_with_bad_block();
        let (mut consensus, source) = consensus_over(&chain, blocks.clone()).await;

        let summary = replay(&mut consensus, &source, &CancellationToken::new(), true).await.unwrap();
        assert_eq!(summary.connected, 2);
        assert_eq!(summary.skipped, 0);
        assert_eq!(summary.rejected, Some((blocks[2].hash(), ConsensusError::BadCoinbaseAmount)));
        assert_eq!(consensus.tip().hash, blocks[1].hash());
    }

    #[tokio::test]
    async fn skips_the_branch_of_a_rejected_block() {
        let (chain, blocks) = chain_with_bad_block();
        let (mut consensus, source) = consensus_over(&chain, blocks).await;

        let summary = replay(&mut consensus, &source, &CancellationToken::new(), false).await.unwrap();
        assert_eq!(summary.connected, 2);
        assert_eq!(summary.skipped, 1);
        assert!(source.is_drained().await);
    }

    #[tokio::test]
    async fn cancelled_replay_connects_nothing() {
        let mut chain = TestChain::new(Network::regtest());
        chain.mine_block(pow_reward(&chain.network, 1), vec![]);
        let (mut consensus, source) = consensus_over(&chain, chain.blocks.clone()).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let summary = replay(&mut consensus, &source, &cancel, true).await.unwrap();
        assert_eq!(summary.connected, 0);
        assert_eq!(consensus.tip().height, 0);
    }

    #[test]
    fn loads_blocks_from_json() {
        let mut chain = TestChain::new(Network::regtest());
        chain.mine_block(pow_reward(&chain.network, 1), vec![]);

        let path = std::env::temp_dir().join(format!("bulwark-replay-{}.json", std::process::id()));
        std::fs::write(&path, serde_json::to_string(&chain.blocks).unwrap()).unwrap();
        let loaded = load_blocks(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(loaded, chain.blocks);
        assert!(load_blocks(&path).is_err());
    }
}
