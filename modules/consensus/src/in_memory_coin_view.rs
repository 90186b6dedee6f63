//! In-memory coin view with undo history

use crate::interfaces::{CoinView, FetchedCoins};
use crate::utxo_set::UnspentOutputs;
use anyhow::{bail, Result};
use async_trait::async_trait;
use bulwark_common::{BlockHash, TxId};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Records a saved block overwrote, to put back on rewind
struct Undo {
    previous_tip: BlockHash,
    previous: Vec<(TxId, Option<UnspentOutputs>)>,
}

struct State {
    coins: HashMap<TxId, UnspentOutputs>,
    tip: BlockHash,
    undo: Vec<Undo>,
}

pub struct InMemoryCoinView {
    state: RwLock<State>,
}

impl InMemoryCoinView {
    /// Empty view positioned at the genesis block
    pub fn new(genesis: BlockHash) -> Self {
        info!("Storing coins in memory (standard)");
        Self {
            state: RwLock::new(State {
                coins: HashMap::new(),
                tip: genesis,
                undo: Vec::new(),
            }),
        }
    }

    /// Number of transactions with unspent outputs
    pub async fn len(&self) -> usize {
        self.state.read().await.coins.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.coins.is_empty()
    }
}

#[async_trait]
impl CoinView for InMemoryCoinView {
    async fn fetch_outputs(&self, txids: &[TxId]) -> Result<FetchedCoins> {
        let state = self.state.read().await;
        // Clone out: callers mutate their copies
        let outputs = txids.iter().map(|txid| state.coins.get(txid).cloned()).collect();
        Ok(FetchedCoins {
            block_hash: state.tip,
            outputs,
        })
    }

    async fn save_changes(
        &self,
        changes: Vec<UnspentOutputs>,
        previous: BlockHash,
        next: BlockHash,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        if state.tip != previous {
            bail!("coin view is at {}, not {}", state.tip, previous);
        }

        let mut undo = Undo {
            previous_tip: previous,
            previous: Vec::with_capacity(changes.len()),
        };
        for record in changes {
            let txid = record.txid;
            let old = if record.is_prunable() {
                state.coins.remove(&txid)
            } else {
                state.coins.insert(txid, record)
            };
            undo.previous.push((txid, old));
        }

        debug!(tip = %next, records = undo.previous.len(), "Coin changes saved");
        state.undo.push(undo);
        state.tip = next;
        Ok(())
    }

    async fn rewind(&self) -> Result<BlockHash> {
        let mut state = self.state.write().await;
        let Some(undo) = state.undo.pop() else {
            return Ok(state.tip);
        };

        // Reverse order so a txid touched twice ends at its oldest value
        for (txid, old) in undo.previous.into_iter().rev() {
            match old {
                Some(record) => state.coins.insert(txid, record),
                None => state.coins.remove(&txid),
            };
        }

        state.tip = undo.previous_tip;
        Ok(state.tip)
    }

    async fn block_hash(&self) -> Result<BlockHash> {
        Ok(self.state.read().await.tip)
    }

    fn supports_prefetch(&self) -> bool {
        true
    }
}
