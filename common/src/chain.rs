//! Chain index
//! Headers anchored at a height and linked to their parent

use crate::hash::BlockHash;
use crate::types::BlockHeader;
use std::collections::HashMap;
use std::sync::Arc;

/// Number of blocks taken into account for the median time past
pub const MEDIAN_TIME_SPAN: usize = 11;

/// A header anchored at a height, linked to its parent
#[derive(Debug)]
pub struct ChainedBlock {
    pub hash: BlockHash,
    pub height: u32,
    pub header: BlockHeader,
    pub previous: Option<Arc<ChainedBlock>>,
}

impl ChainedBlock {
    /// The first block of a chain
    pub fn genesis(header: BlockHeader) -> Arc<Self> {
        Arc::new(Self {
            hash: header.hash(),
            height: 0,
            header,
            previous: None,
        })
    }

    /// Chain a header onto its parent
    pub fn extend(previous: &Arc<ChainedBlock>, header: BlockHeader) -> Arc<Self> {
        Arc::new(Self {
            hash: header.hash(),
            height: previous.height + 1,
            header,
            previous: Some(previous.clone()),
        })
    }

    /// Walk back to the ancestor at `height`
    pub fn ancestor(self: &Arc<Self>, height: u32) -> Option<Arc<ChainedBlock>> {
        if height > self.height {
            return None;
        }
        let mut block = self.clone();
        while block.height > height {
            block = block.previous.clone()?;
        }
        Some(block)
    }

    /// Median of the timestamps of this block and its ten predecessors
    pub fn median_time_past(&self) -> i64 {
        let mut times = Vec::with_capacity(MEDIAN_TIME_SPAN);
        let mut block = Some(self);
        while let Some(current) = block {
            if times.len() == MEDIAN_TIME_SPAN {
                break;
            }
            times.push(current.header.time as i64);
            block = current.previous.as_deref();
        }
        times.sort_unstable();
        times[times.len() / 2]
    }

    /// Header timestamp widened for arithmetic
    pub fn time(&self) -> i64 {
        self.header.time as i64
    }
}

/// Index of known blocks with a selected best chain
pub struct ChainIndex {
    blocks: HashMap<BlockHash, Arc<ChainedBlock>>,

    /// Best chain by height
    best: Vec<Arc<ChainedBlock>>,
}

impl ChainIndex {
    /// Create an index holding only the genesis block
    pub fn new(genesis: Arc<ChainedBlock>) -> Self {
        let mut blocks = HashMap::new();
        blocks.insert(genesis.hash, genesis.clone());
        Self {
            blocks,
            best: vec![genesis],
        }
    }

    pub fn genesis(&self) -> &Arc<ChainedBlock> {
        &self.best[0]
    }

    pub fn tip(&self) -> &Arc<ChainedBlock> {
        &self.best[self.best.len() - 1]
    }

    pub fn height(&self) -> u32 {
        self.tip().height
    }

    pub fn get(&self, hash: &BlockHash) -> Option<Arc<ChainedBlock>> {
        self.blocks.get(hash).cloned()
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.blocks.contains_key(hash)
    }

    /// Block at `height` on the best chain
    pub fn get_by_height(&self, height: u32) -> Option<Arc<ChainedBlock>> {
        self.best.get(height as usize).cloned()
    }

    /// True if the block is on the best chain
    pub fn is_on_best_chain(&self, block: &ChainedBlock) -> bool {
        self.best.get(block.height as usize).is_some_and(|b| b.hash == block.hash)
    }

    /// Make `tip` the head of the best chain, registering it and any
    /// unknown ancestors
    pub fn set_tip(&mut self, tip: Arc<ChainedBlock>) {
        let fork_height = match self.find_fork(&tip) {
            Some(fork) => fork.height,
            None => 0,
        };
        self.best.truncate(fork_height as usize + 1);

        let mut path = Vec::new();
        let mut block = Some(tip);
        while let Some(current) = block {
            if current.height <= fork_height {
                break;
            }
            block = current.previous.clone();
            path.push(current);
        }

        for block in path.into_iter().rev() {
            self.blocks.entry(block.hash).or_insert_with(|| block.clone());
            self.best.push(block);
        }
    }

    /// Last common ancestor of `block` and the best chain
    pub fn find_fork(&self, block: &Arc<ChainedBlock>) -> Option<Arc<ChainedBlock>> {
        let mut current = Some(block.clone());
        while let Some(candidate) = current {
            if self.is_on_best_chain(&candidate) {
                return Some(candidate);
            }
            current = candidate.previous.clone();
        }
        None
    }
}

impl Drop for ChainIndex {
    // Release from the tip down so no block drops a long run of ancestors
    // recursively
    fn drop(&mut self) {
        let mut blocks: Vec<_> = self.blocks.drain().map(|(_, block)| block).collect();
        blocks.sort_by_key(|block| std::cmp::Reverse(block.height));
        self.best.clear();
        for block in blocks {
            drop(block);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(prev: BlockHash, time: u32, nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_block: prev,
            merkle_root: Default::default(),
            time,
            bits: 0x207fffff,
            nonce,
        }
    }

    fn build(length: u32, nonce: u32) -> Vec<Arc<ChainedBlock>> {
        let genesis = ChainedBlock::genesis(header(BlockHash::zero(), 1000, 0));
        let mut chain = vec![genesis];
        for i in 1..length {
            let prev = chain.last().unwrap().clone();
            chain.push(ChainedBlock::extend(&prev, header(prev.hash, 1000 + i * 60, nonce)));
        }
        chain
    }

    #[test]
    fn ancestor_walks_back() {
        let chain = build(20, 0);
        let tip = chain.last().unwrap();
        assert_eq!(tip.ancestor(5).unwrap().hash, chain[5].hash);
        assert_eq!(tip.ancestor(19).unwrap().hash, tip.hash);
        assert!(tip.ancestor(20).is_none());
    }

    #[test]
    fn median_time_past_is_middle_of_window() {
        let chain = build(20, 0);
        // times 1000 + 60*i; window for block 19 is blocks 9..=19, middle is 14
        assert_eq!(chain[19].median_time_past(), 1000 + 14 * 60);
        // short chains use what they have
        assert_eq!(chain[2].median_time_past(), 1060);
        assert_eq!(chain[0].median_time_past(), 1000);
    }

    #[test]
    fn median_time_past_ignores_order() {
        let genesis = ChainedBlock::genesis(header(BlockHash::zero(), 5000, 0));
        let b1 = ChainedBlock::extend(&genesis, header(genesis.hash, 1000, 0));
        let b2 = ChainedBlock::extend(&b1, header(b1.hash, 3000, 0));
        assert_eq!(b2.median_time_past(), 3000);
    }

    #[test]
    fn set_tip_switches_to_fork() {
        let main = build(10, 0);
        let mut index = ChainIndex::new(main[0].clone());
        index.set_tip(main[9].clone());
        assert_eq!(index.height(), 9);
        assert_eq!(index.get_by_height(4).unwrap().hash, main[4].hash);

        // fork from height 5
        let mut fork = main[5].clone();
        for i in 0..6 {
            fork = ChainedBlock::extend(&fork, header(fork.hash, 9000 + i, 77));
        }
        assert_eq!(index.find_fork(&fork).unwrap().hash, main[5].hash);

        index.set_tip(fork.clone());
        assert_eq!(index.tip().hash, fork.hash);
        assert_eq!(index.height(), 11);
        assert_eq!(index.get_by_height(5).unwrap().hash, main[5].hash);
        assert!(!index.is_on_best_chain(&main[6]));
        // blocks of the old branch stay known
        assert!(index.contains(&main[9].hash));
    }
}
