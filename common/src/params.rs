//! Network consensus parameters
//!
//! Every limit, reward, maturity and activation setting the rule engine
//! consults lives here. Two presets are provided: a proof-of-work
//! regression-test network and a proof-of-stake test network.

use crate::chain::ChainedBlock;
use crate::hash::BlockHash;
use crate::merkle::block_merkle_root;
use crate::script::{Script, OP_CHECKSIG, OP_RETURN};
use crate::target::{from_compact, to_compact};
use crate::types::{Amount, Block, BlockHeader, OutPoint, Transaction, TxIn, TxOut, COIN};
use dashu_int::UBig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Soft forks activated by version-bits signalling
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentId {
    /// Relative lock-times (BIP68, BIP112, BIP113)
    Csv,

    /// Segregated witness (BIP141, BIP143, BIP147)
    Segwit,
}

impl DeploymentId {
    pub const ALL: [DeploymentId; 2] = [DeploymentId::Csv, DeploymentId::Segwit];
}

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeploymentId::Csv => write!(f, "csv"),
            DeploymentId::Segwit => write!(f, "segwit"),
        }
    }
}

/// A version-bits deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    /// Version bit signalled by miners
    pub bit: u8,

    /// Median-time-past from which signalling counts
    pub start_time: i64,

    /// Median-time-past after which the deployment fails if not locked in
    pub timeout: i64,
}

impl Deployment {
    /// Start time marking a deployment active from genesis
    pub const ALWAYS_ACTIVE: i64 = -1;

    pub const NO_TIMEOUT: i64 = i64::MAX;

    pub fn mask(&self) -> u32 {
        1u32 << self.bit
    }
}

/// Deployments activated at a fixed height
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuriedDeployments {
    /// Height in coinbase, version 2 minimum
    pub bip34: u32,

    /// Strict DER signatures, version 3 minimum
    pub bip66: u32,

    /// CHECKLOCKTIMEVERIFY, version 4 minimum
    pub bip65: u32,
}

/// One-off reward paid at a single height
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Premine {
    pub height: u32,
    pub reward: Amount,
}

/// Limits shared by every network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusOptions {
    /// Serialised size limit without witness data
    pub max_block_base_size: usize,

    pub max_block_weight: usize,

    pub max_block_sigops_cost: u32,

    pub witness_scale_factor: u32,

    pub max_money: Amount,

    /// Confirmations before a coinbase output may be spent
    pub coinbase_maturity: u32,

    /// How far past the wall clock a header timestamp may be, in seconds
    pub max_future_block_time: i64,
}

impl ConsensusOptions {
    pub fn money_range(&self, value: Amount) -> bool {
        (0..=self.max_money).contains(&value)
    }

    /// Legacy sig-op limit derived from the cost limit
    pub fn max_block_sigops(&self) -> u32 {
        self.max_block_sigops_cost / self.witness_scale_factor
    }
}

/// Proof-of-stake protocol settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofOfStakeParams {
    /// Easiest allowed stake target, compact form
    pub pos_limit_bits: u32,

    pub target_spacing: i64,
    pub target_timespan: i64,

    /// Confirmations a staked coin needs once protocol V3 is active
    pub stake_min_confirmations: u32,

    /// Minimum coin age in seconds before protocol V3
    pub stake_min_age: i64,

    pub coinstake_maturity: u32,

    /// Fixed reward of a stake block, on top of fees
    pub stake_reward: Amount,

    /// Coinstake timestamps must have these low bits clear
    pub stake_timestamp_mask: u32,

    /// Seconds between stake modifier recomputations
    pub modifier_interval: i64,

    /// Ratio of the first to the last selection section
    pub modifier_interval_ratio: i64,

    /// First height using the V2 kernel and modifier
    pub protocol_v2_height: u32,

    /// First coinstake time using protocol V3 rules
    pub protocol_v3_time: i64,

    /// First height whose stake retarget rejects negative spacing
    pub retarget_fix_height: u32,

    /// Last height at which a proof-of-work block is accepted
    pub last_pow_block: u32,
}

impl ProofOfStakeParams {
    pub fn is_protocol_v2(&self, height: u32) -> bool {
        height >= self.protocol_v2_height
    }

    pub fn is_protocol_v3(&self, time: i64) -> bool {
        time >= self.protocol_v3_time
    }

    pub fn pos_limit(&self) -> UBig {
        from_compact(self.pos_limit_bits).value
    }
}

/// Complete parameter set of one network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub name: String,

    pub genesis: Block,

    pub consensus: ConsensusOptions,

    /// Easiest allowed proof-of-work target, compact form
    pub pow_limit_bits: u32,
    pub pow_target_timespan: i64,
    pub pow_target_spacing: i64,
    pub pow_allow_min_difficulty_blocks: bool,
    pub pow_no_retargeting: bool,

    pub subsidy_halving_interval: u32,

    /// Initial block subsidy before halvings
    pub pow_reward: Amount,

    pub premine: Option<Premine>,

    /// Time from which pay-to-script-hash is enforced
    pub bip16_time: i64,

    /// Block at the BIP34 activation height, exempting descendants from BIP30
    pub bip34_hash: Option<BlockHash>,

    pub buried: BuriedDeployments,

    /// Signalling blocks needed in a window to lock a deployment in
    pub rule_change_activation_threshold: u32,

    /// Length of a signalling window in blocks
    pub miner_confirmation_window: u32,

    /// Fixed top bits of a signalling version
    pub version_bits_top_bits: u32,

    /// Mask selecting the fixed top bits
    pub version_bits_top_mask: u32,

    pub deployments: BTreeMap<DeploymentId, Deployment>,

    pub proof_of_stake: Option<ProofOfStakeParams>,
}

impl Network {
    /// Look up a preset by name
    pub fn from_name(name: &str) -> Option<Network> {
        match name {
            "regtest" => Some(Network::regtest()),
            "pos-testnet" => Some(Network::pos_testnet()),
            _ => None,
        }
    }

    pub fn genesis_hash(&self) -> BlockHash {
        self.genesis.hash()
    }

    pub fn is_proof_of_stake(&self) -> bool {
        self.proof_of_stake.is_some()
    }

    pub fn pow_limit(&self) -> UBig {
        from_compact(self.pow_limit_bits).value
    }

    pub fn difficulty_adjustment_interval(&self) -> u32 {
        (self.pow_target_timespan / self.pow_target_spacing) as u32
    }

    /// Proof-of-work regression test network
    pub fn regtest() -> Network {
        let mut deployments = BTreeMap::new();
        deployments.insert(
            DeploymentId::Csv,
            Deployment {
                bit: 0,
                start_time: 0,
                timeout: Deployment::NO_TIMEOUT,
            },
        );
        deployments.insert(
            DeploymentId::Segwit,
            Deployment {
                bit: 1,
                start_time: Deployment::ALWAYS_ACTIVE,
                timeout: Deployment::NO_TIMEOUT,
            },
        );

        Network {
            name: "regtest".to_string(),
            genesis: bitcoin_genesis(1296688602, 0x207fffff, 2),
            consensus: ConsensusOptions {
                max_block_base_size: 1_000_000,
                max_block_weight: 4_000_000,
                max_block_sigops_cost: 80_000,
                witness_scale_factor: 4,
                max_money: 21_000_000 * COIN,
                coinbase_maturity: 100,
                max_future_block_time: 2 * 60 * 60,
            },
            pow_limit_bits: 0x207fffff,
            pow_target_timespan: 14 * 24 * 60 * 60,
            pow_target_spacing: 10 * 60,
            pow_allow_min_difficulty_blocks: true,
            pow_no_retargeting: true,
            subsidy_halving_interval: 150,
            pow_reward: 50 * COIN,
            premine: None,
            bip16_time: 0,
            bip34_hash: None,
            buried: BuriedDeployments {
                bip34: 500,
                bip66: 1251,
                bip65: 1351,
            },
            rule_change_activation_threshold: 108,
            miner_confirmation_window: 144,
            version_bits_top_bits: 0x2000_0000,
            version_bits_top_mask: 0xe000_0000,
            deployments,
            proof_of_stake: None,
        }
    }

    /// Proof-of-stake test network
    pub fn pos_testnet() -> Network {
        let mut deployments = BTreeMap::new();
        deployments.insert(
            DeploymentId::Csv,
            Deployment {
                bit: 0,
                start_time: 1462060800,
                timeout: 1493596800,
            },
        );
        deployments.insert(
            DeploymentId::Segwit,
            Deployment {
                bit: 1,
                start_time: Deployment::ALWAYS_ACTIVE,
                timeout: Deployment::NO_TIMEOUT,
            },
        );

        let genesis_time = 1470467000;
        let coinbase = Transaction {
            version: 1,
            time: Some(genesis_time),
            inputs: vec![TxIn::new(
                OutPoint::null(),
                Script::new()
                    .push_int(0)
                    .push_data(&[42])
                    .push_data(b"bulwark proof-of-stake testnet"),
            )],
            outputs: vec![TxOut::new(0, Script::new().push_opcode(OP_RETURN))],
            lock_time: 0,
        };

        Network {
            name: "pos-testnet".to_string(),
            genesis: assemble_genesis(coinbase, genesis_time, 0x1f00ffff, 0),
            consensus: ConsensusOptions {
                max_block_base_size: 1_000_000,
                max_block_weight: 4_000_000,
                max_block_sigops_cost: 80_000,
                witness_scale_factor: 4,
                max_money: 100_000_000 * COIN,
                coinbase_maturity: 10,
                max_future_block_time: 2 * 60 * 60,
            },
            pow_limit_bits: 0x1f00ffff,
            pow_target_timespan: 14 * 24 * 60 * 60,
            pow_target_spacing: 10 * 60,
            pow_allow_min_difficulty_blocks: false,
            pow_no_retargeting: false,
            subsidy_halving_interval: 210_000,
            pow_reward: 4 * COIN,
            premine: Some(Premine {
                height: 2,
                reward: 98_000_000 * COIN,
            }),
            bip16_time: 0,
            bip34_hash: None,
            buried: BuriedDeployments {
                bip34: 0,
                bip66: 0,
                bip65: 0,
            },
            rule_change_activation_threshold: 1916,
            miner_confirmation_window: 2016,
            version_bits_top_bits: 0x2000_0000,
            version_bits_top_mask: 0xe000_0000,
            deployments,
            proof_of_stake: Some(ProofOfStakeParams {
                pos_limit_bits: 0x1f00ffff,
                target_spacing: 64,
                target_timespan: 16 * 60,
                stake_min_confirmations: 10,
                stake_min_age: 60,
                coinstake_maturity: 10,
                stake_reward: COIN,
                stake_timestamp_mask: 0x0000_000f,
                modifier_interval: 10 * 60,
                modifier_interval_ratio: 3,
                protocol_v2_height: 1,
                protocol_v3_time: 1470467000,
                retarget_fix_height: 1,
                last_pow_block: 12_500,
            }),
        }
    }
}

/// The well-known genesis block paying 50 coins to Satoshi's key
fn bitcoin_genesis(time: u32, bits: u32, nonce: u32) -> Block {
    const PUBKEY: &str = "04678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f61deb6\
                          49f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5f";
    let pubkey = hex::decode(PUBKEY).unwrap_or_default();

    let coinbase = Transaction {
        version: 1,
        time: None,
        inputs: vec![TxIn::new(
            OutPoint::null(),
            Script::new()
                .push_data(&[0xff, 0xff, 0x00, 0x1d])
                .push_data(&[0x04])
                .push_data(b"The Times 03/Jan/2009 Chancellor on brink of second bailout for banks"),
        )],
        outputs: vec![TxOut::new(
            50 * COIN,
            Script::new().push_data(&pubkey).push_opcode(OP_CHECKSIG),
        )],
        lock_time: 0,
    };
    assemble_genesis(coinbase, time, bits, nonce)
}

fn assemble_genesis(coinbase: Transaction, time: u32, bits: u32, nonce: u32) -> Block {
    let mut block = Block {
        header: BlockHeader {
            version: 1,
            prev_block: BlockHash::zero(),
            merkle_root: Default::default(),
            time,
            bits,
            nonce,
        },
        transactions: vec![coinbase],
        signature: Vec::new(),
    };
    block.header.merkle_root = block_merkle_root(&block).root;
    block
}

/// Compact target the block following `prev` must carry under proof-of-work
pub fn get_work_required(prev: &Arc<ChainedBlock>, header: &BlockHeader, network: &Network) -> u32 {
    let limit_bits = to_compact(&network.pow_limit());
    let interval = network.difficulty_adjustment_interval();

    if (prev.height + 1) % interval != 0 {
        if network.pow_allow_min_difficulty_blocks {
            // A block more than twice the spacing late may use the minimum
            if header.time as i64 > prev.time() + network.pow_target_spacing * 2 {
                return limit_bits;
            }

            // Otherwise the last block that was not a minimum-difficulty one
            let mut block = prev.clone();
            while let Some(previous) = block.previous.clone() {
                if block.height % interval == 0 || block.header.bits != limit_bits {
                    break;
                }
                block = previous;
            }
            return block.header.bits;
        }
        return prev.header.bits;
    }

    // First block of the window ending at `prev`
    let first_height = (prev.height + 1).saturating_sub(interval);
    let first_time = prev.ancestor(first_height).map(|b| b.time()).unwrap_or_else(|| prev.time());
    calculate_next_work_required(prev, first_time, network)
}

/// Bitcoin retarget: scale the last target by the actual window timespan,
/// clamped to a factor of four either way
pub fn calculate_next_work_required(prev: &ChainedBlock, first_time: i64, network: &Network) -> u32 {
    if network.pow_no_retargeting {
        return prev.header.bits;
    }

    let timespan = network.pow_target_timespan;
    let actual = (prev.time() - first_time).clamp(timespan / 4, timespan * 4);

    let limit = network.pow_limit();
    let mut target = from_compact(prev.header.bits).value;
    target *= UBig::from(actual as u64);
    target /= UBig::from(timespan as u64);
    if target > limit {
        target = limit;
    }
    to_compact(&target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regtest_genesis_hash() {
        let network = Network::regtest();
        assert_eq!(
            network.genesis.transactions[0].txid().to_string(),
            "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b"
        );
        assert_eq!(
            network.genesis_hash().to_string(),
            "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206"
        );
    }

    #[test]
    fn presets_by_name() {
        assert!(!Network::from_name("regtest").unwrap().is_proof_of_stake());
        assert!(Network::from_name("pos-testnet").unwrap().is_proof_of_stake());
        assert!(Network::from_name("mainnet").is_none());
    }

    #[test]
    fn pos_genesis_carries_timestamp() {
        let network = Network::pos_testnet();
        let coinbase = &network.genesis.transactions[0];
        assert_eq!(coinbase.time, Some(network.genesis.header.time));
        assert!(coinbase.is_coinbase());
    }

    fn chain_with_spacing(network: &Network, length: u32, spacing: u32, bits: u32) -> Arc<ChainedBlock> {
        let mut header = network.genesis.header.clone();
        header.bits = bits;
        let mut tip = ChainedBlock::genesis(header.clone());
        for _ in 1..length {
            header.prev_block = tip.hash;
            header.time += spacing;
            tip = ChainedBlock::extend(&tip, header.clone());
        }
        tip
    }

    #[test]
    fn no_retargeting_keeps_bits() {
        let network = Network::regtest();
        let tip = chain_with_spacing(&network, 10, 600, 0x207fffff);
        let mut next = tip.header.clone();
        next.time += 600;
        assert_eq!(get_work_required(&tip, &next, &network), 0x207fffff);
    }

    #[test]
    fn retarget_clamps_to_a_factor_of_four() {
        let mut network = Network::regtest();
        network.pow_no_retargeting = false;
        network.pow_allow_min_difficulty_blocks = false;
        network.pow_target_timespan = 10 * 600;
        network.pow_limit_bits = 0x1f00ffff;

        // Ten blocks mined instantly: the target shrinks by exactly four
        let tip = chain_with_spacing(&network, 10, 0, 0x1d00ffff);
        let mut next = tip.header.clone();
        next.prev_block = tip.hash;
        let bits = get_work_required(&tip, &next, &network);
        let expected = from_compact(0x1d00ffff).value / UBig::from(4u8);
        assert_eq!(bits, to_compact(&expected));

        // Between retargets the bits carry over
        let short = chain_with_spacing(&network, 5, 0, 0x1d00ffff);
        assert_eq!(get_work_required(&short, &next, &network), 0x1d00ffff);
    }

    #[test]
    fn retarget_is_capped_at_the_limit() {
        let mut network = Network::regtest();
        network.pow_no_retargeting = false;
        network.pow_allow_min_difficulty_blocks = false;
        network.pow_target_timespan = 10 * 600;

        // Very slow blocks on the easiest target stay at the limit
        let tip = chain_with_spacing(&network, 10, 10_000, 0x207fffff);
        let next = tip.header.clone();
        assert_eq!(get_work_required(&tip, &next, &network), to_compact(&network.pow_limit()));
    }
}
