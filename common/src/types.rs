//! Bulwark definitions for the primitive chain types
//! Blocks, headers, transactions, inputs and outputs

use crate::encoding::{self, Encoder};
use crate::hash::{BlockHash, TxId};
use crate::script::Script;
use serde::{Deserialize, Serialize};

/// Amount of money in the smallest unit (satoshi)
pub type Amount = i64;

/// Number of smallest units in one coin
pub const COIN: Amount = 100_000_000;

/// Sequence number that disables locktime and relative locktime for an input
pub const SEQUENCE_FINAL: u32 = 0xffff_ffff;

/// Locktime values below this are block heights, at or above are unix times
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// Reference to one output of a previous transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    /// Transaction id
    pub hash: TxId,

    /// Output index
    pub n: u32,
}

impl OutPoint {
    pub fn new(hash: TxId, n: u32) -> Self {
        Self { hash, n }
    }

    /// The null outpoint referenced by coinbase inputs
    pub fn null() -> Self {
        Self {
            hash: TxId::zero(),
            n: u32::MAX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.hash.is_zero() && self.n == u32::MAX
    }
}

impl std::fmt::Display for OutPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.hash, self.n)
    }
}

/// Transaction input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxIn {
    /// Output being spent
    pub prevout: OutPoint,

    /// Unlocking script
    pub script_sig: Script,

    /// Sequence number (BIP68 relative locktime when enforced)
    pub sequence: u32,

    /// Segregated witness stack
    #[serde(default)]
    pub witness: Vec<Vec<u8>>,
}

impl TxIn {
    pub fn new(prevout: OutPoint, script_sig: Script) -> Self {
        Self {
            prevout,
            script_sig,
            sequence: SEQUENCE_FINAL,
            witness: Vec::new(),
        }
    }
}

/// Transaction output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOut {
    /// Value in smallest units
    pub value: Amount,

    /// Locking script
    pub script_pubkey: Script,
}

impl TxOut {
    pub fn new(value: Amount, script_pubkey: Script) -> Self {
        Self {
            value,
            script_pubkey,
        }
    }

    /// The empty output used as a marker by proof-of-stake blocks
    pub fn empty() -> Self {
        Self {
            value: 0,
            script_pubkey: Script::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.value == 0 && self.script_pubkey.is_empty()
    }
}

/// Transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: i32,

    /// Timestamp carried by proof-of-stake chain transactions
    #[serde(default)]
    pub time: Option<u32>,

    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    /// Transaction id - hash of the serialisation without witness data
    pub fn txid(&self) -> TxId {
        TxId::double_sha256(&self.serialize(false))
    }

    /// Witness transaction id - hash of the full serialisation
    pub fn wtxid(&self) -> TxId {
        TxId::double_sha256(&self.serialize(true))
    }

    /// Consensus serialisation, optionally including witness data
    pub fn serialize(&self, with_witness: bool) -> Vec<u8> {
        let mut e = Encoder::default();
        encoding::encode_transaction(&mut e, self, with_witness && self.has_witness());
        e.to_vec()
    }

    /// Size without witness data
    pub fn stripped_size(&self) -> usize {
        self.serialize(false).len()
    }

    /// Size including witness data
    pub fn total_size(&self) -> usize {
        self.serialize(true).len()
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prevout.is_null()
    }

    /// A coinstake spends at least one real output and marks itself with an
    /// empty first output
    pub fn is_coinstake(&self) -> bool {
        !self.inputs.is_empty()
            && !self.inputs[0].prevout.is_null()
            && self.outputs.len() >= 2
            && self.outputs[0].is_empty()
    }

    pub fn has_witness(&self) -> bool {
        self.inputs.iter().any(|input| !input.witness.is_empty())
    }

    /// Sum of all output values, saturating on overflow
    pub fn total_out(&self) -> Amount {
        self.outputs.iter().fold(0, |acc: Amount, out| acc.saturating_add(out.value))
    }

    /// Finality against a height and a locktime cutoff time
    pub fn is_final(&self, height: u32, cutoff_time: i64) -> bool {
        if self.lock_time == 0 {
            return true;
        }

        let limit = if self.lock_time < LOCKTIME_THRESHOLD {
            height as i64
        } else {
            cutoff_time
        };
        if (self.lock_time as i64) < limit {
            return true;
        }

        self.inputs.iter().all(|input| input.sequence == SEQUENCE_FINAL)
    }
}

/// Block header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: BlockHash,
    pub merkle_root: TxId,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    /// Header hash - also the proof-of-work hash
    pub fn hash(&self) -> BlockHash {
        let mut e = Encoder::default();
        encoding::encode_header(&mut e, self);
        BlockHash::double_sha256(&e.to_vec())
    }
}

/// Full block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,

    /// Signature of a proof-of-stake block by the coinstake key
    #[serde(default)]
    pub signature: Vec<u8>,
}

impl Block {
    pub fn hash(&self) -> BlockHash {
        self.header.hash()
    }

    /// Proof-of-stake blocks carry a coinstake as their second transaction
    pub fn is_proof_of_stake(&self) -> bool {
        self.transactions.len() > 1 && self.transactions[1].is_coinstake()
    }

    pub fn is_proof_of_work(&self) -> bool {
        !self.is_proof_of_stake()
    }

    /// Serialised size without witness data
    pub fn stripped_size(&self) -> usize {
        self.size(false)
    }

    /// Serialised size with witness data
    pub fn total_size(&self) -> usize {
        self.size(true)
    }

    /// Block weight: three times the stripped size plus the total size
    pub fn weight(&self) -> usize {
        self.stripped_size() * 3 + self.total_size()
    }

    fn size(&self, with_witness: bool) -> usize {
        let mut e = Encoder::default();
        encoding::encode_header(&mut e, &self.header);
        e.push_compact_size(self.transactions.len() as u64);
        for tx in &self.transactions {
            encoding::encode_transaction(&mut e, tx, with_witness && tx.has_witness());
        }
        if self.is_proof_of_stake() || !self.signature.is_empty() {
            e.push_bytes(&self.signature);
        }
        e.len()
    }
}
