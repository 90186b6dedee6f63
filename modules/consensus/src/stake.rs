//! Stake metadata recorded for every block of a proof-of-stake chain

use bulwark_common::{Block, Hash, OutPoint};
use serde::{Deserialize, Serialize};

/// Per-block flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStakeFlags {
    pub proof_of_stake: bool,

    /// Entropy bit contributed to stake modifiers
    pub stake_entropy: bool,

    /// The block generated a new legacy stake modifier
    pub stake_modifier: bool,
}

/// Stake metadata of a block
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStake {
    pub flags: BlockStakeFlags,

    /// Legacy 64-bit stake modifier
    pub stake_modifier: u64,

    pub stake_modifier_v2: Hash<32>,

    /// Kernel hash for stake blocks, the block hash otherwise
    pub hash_proof: Hash<32>,

    /// Coinstake timestamp
    pub stake_time: u32,

    /// Output staked by the coinstake
    pub prevout_stake: Option<OutPoint>,
}

impl BlockStake {
    /// Metadata skeleton for a block about to be validated
    pub fn new(block: &Block) -> Self {
        let mut stake = Self::default();
        if block.is_proof_of_stake() {
            let coinstake = &block.transactions[1];
            stake.flags.proof_of_stake = true;
            stake.prevout_stake = Some(coinstake.inputs[0].prevout);
            stake.stake_time = coinstake.time.unwrap_or(block.header.time);
        }
        stake
    }

    /// Metadata of a genesis block: zero modifiers, modifier generated
    pub fn genesis(block: &Block) -> Self {
        let mut stake = Self::default();
        stake.flags.stake_modifier = true;
        stake.hash_proof = block.hash();
        stake.flags.stake_entropy = Self::entropy_bit_of(block) == 1;
        stake
    }

    pub fn is_proof_of_stake(&self) -> bool {
        self.flags.proof_of_stake
    }

    pub fn is_proof_of_work(&self) -> bool {
        !self.flags.proof_of_stake
    }

    pub fn generated_stake_modifier(&self) -> bool {
        self.flags.stake_modifier
    }

    pub fn entropy_bit(&self) -> u64 {
        self.flags.stake_entropy as u64
    }

    /// Lowest bit of the block hash
    pub fn entropy_bit_of(block: &Block) -> u64 {
        block.hash().low_u64() & 1
    }
}
