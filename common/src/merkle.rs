//! Merkle roots over transaction ids
//!
//! The tree is the classic binary tree where an odd level duplicates its
//! last entry. That duplication makes two different transaction lists hash
//! to the same root (CVE-2012-2459), so whenever two *adjacent* entries on a
//! level are identical the result is flagged as mutated and the block must
//! be rejected as a duplicate-transaction violation.

use crate::hash::{Hash, TxId};
use crate::types::Block;

/// Merkle root and whether the leaf list was found to be mutated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MerkleRoot {
    pub root: Hash<32>,
    pub mutated: bool,
}

/// Compute the merkle root of a list of leaves
pub fn compute_merkle_root(mut hashes: Vec<Hash<32>>) -> MerkleRoot {
    let mut mutated = false;

    while hashes.len() > 1 {
        for pair in hashes.chunks_exact(2) {
            if pair[0] == pair[1] {
                mutated = true;
            }
        }

        if hashes.len() % 2 == 1 {
            let last = hashes[hashes.len() - 1];
            hashes.push(last);
        }

        hashes = hashes.chunks_exact(2).map(|pair| hash_pair(&pair[0], &pair[1])).collect();
    }

    MerkleRoot {
        root: hashes.first().copied().unwrap_or_default(),
        mutated,
    }
}

/// Merkle root over the block's transaction ids
pub fn block_merkle_root(block: &Block) -> MerkleRoot {
    compute_merkle_root(block.transactions.iter().map(|tx| tx.txid()).collect())
}

/// Merkle root over witness ids, with the coinbase counted as the zero hash
pub fn block_witness_merkle_root(block: &Block) -> MerkleRoot {
    let leaves = block
        .transactions
        .iter()
        .enumerate()
        .map(|(index, tx)| if index == 0 { TxId::zero() } else { tx.wtxid() })
        .collect();
    compute_merkle_root(leaves)
}

/// Double SHA-256 of two concatenated nodes
pub fn hash_pair(left: &Hash<32>, right: &Hash<32>) -> Hash<32> {
    let mut buffer = [0u8; 64];
    buffer[..32].copy_from_slice(left.as_ref());
    buffer[32..].copy_from_slice(right.as_ref());
    Hash::double_sha256(&buffer)
}
