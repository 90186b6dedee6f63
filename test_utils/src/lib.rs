//! Builders for transactions, blocks and chains used across Bulwark tests

use bulwark_common::merkle::block_merkle_root;
use bulwark_common::params::Network;
use bulwark_common::script::{Script, OP_1};
use bulwark_common::target::check_proof_of_work;
use bulwark_common::{Amount, Block, BlockHash, BlockHeader, OutPoint, Transaction, TxIn, TxOut};

/// Spacing between consecutive test blocks, in seconds
pub const BLOCK_SPACING: u32 = 600;

/// Script anyone can spend
pub fn anyone_can_spend() -> Script {
    Script::new().push_opcode(OP_1)
}

/// Coinbase paying `value` and committing to `height`
pub fn coinbase(height: u32, value: Amount) -> Transaction {
    let script_sig = Script::new().push_int(height as i64).push_data(b"bulwark");
    Transaction {
        version: 1,
        time: None,
        inputs: vec![TxIn::new(OutPoint::null(), script_sig)],
        outputs: vec![TxOut::new(value, anyone_can_spend())],
        lock_time: 0,
    }
}

/// Transaction spending `prevouts` into a single output of `value`
pub fn spend(prevouts: &[OutPoint], value: Amount) -> Transaction {
    Transaction {
        version: 1,
        time: None,
        inputs: prevouts.iter().map(|prevout| TxIn::new(*prevout, Script::new())).collect(),
        outputs: vec![TxOut::new(value, anyone_can_spend())],
        lock_time: 0,
    }
}

/// Block on top of `prev_block` with a correct merkle root, not yet mined
pub fn assemble_block(prev_block: BlockHash, time: u32, bits: u32, transactions: Vec<Transaction>) -> Block {
    let mut block = Block {
        header: BlockHeader {
            version: 4,
            prev_block,
            merkle_root: BlockHash::zero(),
            time,
            bits,
            nonce: 0,
        },
        transactions,
        signature: Vec::new(),
    };
    refresh_merkle_root(&mut block);
    block
}

/// Recompute the merkle root after the transactions were changed
pub fn refresh_merkle_root(block: &mut Block) {
    block.header.merkle_root = block_merkle_root(block).root;
}

/// Grind the nonce until the header meets its own target
pub fn mine(block: &mut Block, network: &Network) {
    let limit = network.pow_limit();
    while !check_proof_of_work(&block.hash(), block.header.bits, &limit) {
        block.header.nonce = block.header.nonce.wrapping_add(1);
    }
}

/// A chain of mined proof-of-work blocks on top of a network's genesis
pub struct TestChain {
    pub network: Network,

    /// Blocks after genesis, in order
    pub blocks: Vec<Block>,
}

impl TestChain {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            blocks: Vec::new(),
        }
    }

    pub fn height(&self) -> u32 {
        self.blocks.len() as u32
    }

    pub fn tip(&self) -> &Block {
        self.blocks.last().unwrap_or(&self.network.genesis)
    }

    /// Mined block at the next height without adding it to the chain
    pub fn build_block(&self, coinbase_value: Amount, transactions: Vec<Transaction>) -> Block {
        let tip = self.tip();
        let height = self.height() + 1;

        let mut all = vec![coinbase(height, coinbase_value)];
        all.extend(transactions);

        let mut block = assemble_block(
            tip.hash(),
            tip.header.time + BLOCK_SPACING,
            self.network.pow_limit_bits,
            all,
        );
        mine(&mut block, &self.network);
        block
    }

    /// Mine the next block and add it to the chain
    pub fn mine_block(&mut self, coinbase_value: Amount, transactions: Vec<Transaction>) -> Block {
        let block = self.build_block(coinbase_value, transactions);
        self.blocks.push(block.clone());
        block
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mined_blocks_link_up() {
        let mut chain = TestChain::new(Network::regtest());
        let first = chain.mine_block(50, vec![]);
        let second = chain.mine_block(50, vec![]);

        assert_eq!(first.header.prev_block, chain.network.genesis_hash());
        assert_eq!(second.header.prev_block, first.hash());
        assert_eq!(chain.height(), 2);
        assert!(check_proof_of_work(&second.hash(), second.header.bits, &chain.network.pow_limit()));
    }

    #[test]
    fn coinbase_is_recognised() {
        let tx = coinbase(7, 1);
        assert!(tx.is_coinbase());
        assert!(tx.inputs[0].script_sig.starts_with(&Script::new().push_int(7)));
    }
}
