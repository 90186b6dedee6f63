//! Block source serving a chain held in memory

use crate::interfaces::{BlockSource, TransactionOptions};
use anyhow::Result;
use async_trait::async_trait;
use bulwark_common::chain::ChainedBlock;
use bulwark_common::{Block, BlockHash};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info};

struct State {
    /// Block the served chain starts on
    base: BlockHash,

    /// Served chain, in order
    blocks: Vec<Block>,

    /// Last block handed out
    location: BlockHash,

    options: TransactionOptions,
}

impl State {
    /// Index of the first block after the location, `None` if the location
    /// is not on the served chain
    fn next_index(&self) -> Option<usize> {
        if self.location == self.base {
            return Some(0);
        }
        self.blocks.iter().position(|block| block.hash() == self.location).map(|i| i + 1)
    }
}

/// Serves blocks in chain order following its location
///
/// When the location is not on the served chain, for instance after
/// [`MemoryBlockSource::reorganize`], `next_block` yields `None` so the
/// caller can step back. At the end of the chain it waits for more blocks.
pub struct MemoryBlockSource {
    state: Mutex<State>,
    added: Notify,
}

impl MemoryBlockSource {
    pub fn new(base: BlockHash, blocks: Vec<Block>) -> Self {
        info!("Serving {} blocks from memory", blocks.len());
        Self {
            state: Mutex::new(State {
                base,
                blocks,
                location: base,
                options: TransactionOptions::default(),
            }),
            added: Notify::new(),
        }
    }

    /// Append blocks to the served chain
    pub async fn push(&self, blocks: impl IntoIterator<Item = Block>) {
        self.state.lock().await.blocks.extend(blocks);
        self.added.notify_waiters();
    }

    /// Replace the served chain
    pub async fn reorganize(&self, blocks: Vec<Block>) {
        self.state.lock().await.blocks = blocks;
        self.added.notify_waiters();
    }

    /// True when nothing follows the current location
    pub async fn is_drained(&self) -> bool {
        let state = self.state.lock().await;
        state.next_index().is_some_and(|index| index >= state.blocks.len())
    }

    pub async fn options(&self) -> TransactionOptions {
        self.state.lock().await.options
    }
}

#[async_trait]
impl BlockSource for MemoryBlockSource {
    async fn next_block(&self) -> Result<Option<Block>> {
        loop {
            // Register before checking so a push in between is not missed
            let added = self.added.notified();
            {
                let mut state = self.state.lock().await;
                let Some(index) = state.next_index() else {
                    debug!(location = %state.location, "Location left the served chain");
                    return Ok(None);
                };
                if let Some(block) = state.blocks.get(index).cloned() {
                    state.location = block.hash();
                    return Ok(Some(block));
                }
            }
            added.await;
        }
    }

    async fn set_location(&self, location: &ChainedBlock) {
        self.state.lock().await.location = location.hash;
    }

    async fn try_peek_ahead(&self, count: usize) -> Option<Block> {
        let state = self.state.lock().await;
        let index = state.next_index()?;
        state.blocks.get(index + count).cloned()
    }

    async fn request_options(&self, options: TransactionOptions) {
        info!(witness = options.witness, "Block source options requested");
        self.state.lock().await.options = options;
    }
}
