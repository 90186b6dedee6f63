//! Proof-of-stake kernel protocol
//!
//! A stake block is valid when the hash of its kernel, built from the stake
//! modifier, the staked coin and the coinstake time, falls under the block
//! target scaled by the value staked. The stake modifier is recomputed at
//! fixed intervals from entropy bits of earlier blocks so that kernels can't
//! be precomputed far ahead.

use crate::flags::ScriptFlags;
use crate::interfaces::{ScriptVerifier, StakeStore};
use crate::stake::BlockStake;
use crate::utxo_set::{UnspentOutputSet, UnspentOutputs};
use anyhow::anyhow;
use bulwark_common::chain::ChainedBlock;
use bulwark_common::encoding::Encoder;
use bulwark_common::params::{Network, ProofOfStakeParams};
use bulwark_common::target::{from_compact, hash_to_ubig, to_compact};
use bulwark_common::{Block, BlockHash, ConsensusError, Hash, OutPoint, Transaction};
use dashu_int::UBig;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Number of selection rounds, one modifier bit each
const MODIFIER_BITS: usize = 64;

pub struct StakeValidator {
    network: Arc<Network>,
    params: ProofOfStakeParams,
    store: Arc<dyn StakeStore>,
}

impl StakeValidator {
    pub fn new(network: Arc<Network>, store: Arc<dyn StakeStore>) -> anyhow::Result<Self> {
        let params = network
            .proof_of_stake
            .clone()
            .ok_or_else(|| anyhow!("network {} has no proof-of-stake parameters", network.name))?;
        Ok(Self {
            network,
            params,
            store,
        })
    }

    pub fn params(&self) -> &ProofOfStakeParams {
        &self.params
    }

    fn stake_of(&self, block: &ChainedBlock) -> Result<BlockStake, ConsensusError> {
        self.store.get(&block.hash).ok_or(ConsensusError::PrevStakeNull)
    }

    // -- difficulty

    /// Compact target for the block after `prev` of the requested kind
    pub fn get_next_target_required(
        &self,
        prev: Option<&Arc<ChainedBlock>>,
        proof_of_stake: bool,
    ) -> Result<u32, ConsensusError> {
        let limit = if proof_of_stake {
            self.params.pos_limit()
        } else {
            self.network.pow_limit()
        };

        let Some(prev) = prev else {
            return Ok(to_compact(&limit));
        };

        // The two most recent blocks of the same kind
        let last = self.last_block_of_kind(prev, proof_of_stake)?;
        let Some(before_last) = last.previous.clone() else {
            return Ok(to_compact(&limit));
        };
        let last_prev = self.last_block_of_kind(&before_last, proof_of_stake)?;
        if last_prev.previous.is_none() {
            return Ok(to_compact(&limit));
        }

        Ok(self.calculate_retarget(&last, &last_prev, &limit))
    }

    fn last_block_of_kind(
        &self,
        from: &Arc<ChainedBlock>,
        proof_of_stake: bool,
    ) -> Result<Arc<ChainedBlock>, ConsensusError> {
        let mut block = from.clone();
        while let Some(previous) = block.previous.clone() {
            if self.stake_of(&block)?.is_proof_of_stake() == proof_of_stake {
                break;
            }
            block = previous;
        }
        Ok(block)
    }

    /// Exponential moving average towards the target spacing
    fn calculate_retarget(&self, last: &ChainedBlock, last_prev: &ChainedBlock, limit: &UBig) -> u32 {
        let spacing = self.params.target_spacing;
        let mut actual = last.time() - last_prev.time();

        if last.height >= self.params.retarget_fix_height && actual < 0 {
            actual = spacing;
        }
        if self.params.is_protocol_v3(last.time()) && actual > spacing * 10 {
            actual = spacing * 10;
        }

        let interval = self.params.target_timespan / spacing;
        let numerator = (interval - 1) * spacing + 2 * actual;
        let denominator = (interval + 1) * spacing;
        if numerator <= 0 || denominator <= 0 {
            return to_compact(limit);
        }

        let mut target = from_compact(last.header.bits).value;
        target *= UBig::from(numerator as u64);
        target /= UBig::from(denominator as u64);

        if target == UBig::ZERO || target > *limit {
            to_compact(limit)
        } else {
            to_compact(&target)
        }
    }

    // -- stake modifiers

    /// Legacy stake modifier for the block after `prev`, and whether it is
    /// newly generated
    pub fn compute_stake_modifier(
        &self,
        prev: Option<&Arc<ChainedBlock>>,
    ) -> Result<(u64, bool), ConsensusError> {
        let Some(prev) = prev else {
            return Ok((0, true));
        };

        let (modifier, modifier_time) = self.last_stake_modifier(prev)?;
        let interval = self.params.modifier_interval;
        if modifier_time / interval >= prev.time() / interval {
            return Ok((modifier, false));
        }

        // Candidates are the blocks of the selection interval, oldest first
        let selection_start = (prev.time() / interval) * interval - self.selection_interval();
        let mut candidates = Vec::new();
        let mut cursor = Some(prev.clone());
        while let Some(block) = cursor {
            if block.time() < selection_start {
                break;
            }
            cursor = block.previous.clone();
            candidates.push(block);
        }
        candidates.sort_by(|a, b| {
            a.time().cmp(&b.time()).then_with(|| hash_to_ubig(&a.hash).cmp(&hash_to_ubig(&b.hash)))
        });

        let mut new_modifier = 0u64;
        let mut selection_stop = selection_start;
        let mut selected = HashSet::new();
        for round in 0..candidates.len().min(MODIFIER_BITS) {
            selection_stop += self.selection_interval_section(round as i64);
            let block = self.select_block(&candidates, &selected, selection_stop, modifier)?;
            new_modifier |= self.stake_of(&block)?.entropy_bit() << round;
            selected.insert(block.hash);
        }

        debug!(height = prev.height + 1, modifier = new_modifier, "Stake modifier generated");
        Ok((new_modifier, true))
    }

    /// Most recent generated modifier at or before `block`, with the time of
    /// the block that generated it
    fn last_stake_modifier(&self, block: &Arc<ChainedBlock>) -> Result<(u64, i64), ConsensusError> {
        let mut block = block.clone();
        loop {
            let stake = self.stake_of(&block)?;
            if stake.generated_stake_modifier() {
                return Ok((stake.stake_modifier, block.time()));
            }
            block = block.previous.clone().ok_or(ConsensusError::ModifierNotFound)?;
        }
    }

    /// Length of one selection round; rounds get longer towards the end
    fn selection_interval_section(&self, section: i64) -> i64 {
        let interval = self.params.modifier_interval;
        let ratio = self.params.modifier_interval_ratio;
        interval * 63 / (63 + ((63 - section) * (ratio - 1)))
    }

    fn selection_interval(&self) -> i64 {
        (0..MODIFIER_BITS as i64).map(|section| self.selection_interval_section(section)).sum()
    }

    /// Lowest selection hash among unselected candidates up to `stop`
    fn select_block(
        &self,
        candidates: &[Arc<ChainedBlock>],
        selected: &HashSet<BlockHash>,
        stop: i64,
        previous_modifier: u64,
    ) -> Result<Arc<ChainedBlock>, ConsensusError> {
        let mut best: Option<(UBig, &Arc<ChainedBlock>)> = None;
        for block in candidates {
            if best.is_some() && block.time() > stop {
                break;
            }
            if selected.contains(&block.hash) {
                continue;
            }

            let stake = self.stake_of(block)?;
            let proof = if stake.is_proof_of_stake() {
                stake.hash_proof
            } else {
                block.hash
            };

            let mut e = Encoder::default();
            e.append(proof.as_ref());
            e.push_u64(previous_modifier);
            let mut selection = hash_to_ubig(&Hash::double_sha256(&e.to_vec()));

            // Favour stake blocks
            if stake.is_proof_of_stake() {
                selection >>= 32;
            }

            match &best {
                Some((best_selection, _)) if selection >= *best_selection => {}
                _ => best = Some((selection, block)),
            }
        }

        best.map(|(_, block)| block.clone()).ok_or(ConsensusError::FailedSelectBlock)
    }

    /// Fill in the derived stake fields of a validated block
    pub fn compute_block_stake(
        &self,
        block: &Block,
        chained: &Arc<ChainedBlock>,
        stake: &mut BlockStake,
    ) -> Result<(), ConsensusError> {
        let prev = chained.previous.as_ref().ok_or(ConsensusError::PrevStakeNull)?;
        let prev_stake = self.stake_of(prev)?;

        if stake.is_proof_of_work() {
            stake.hash_proof = chained.hash;
        }
        stake.flags.stake_entropy = BlockStake::entropy_bit_of(block) == 1;

        let (modifier, generated) = self.compute_stake_modifier(Some(prev))?;
        stake.stake_modifier = modifier;
        stake.flags.stake_modifier = generated;
        stake.stake_modifier_v2 = compute_stake_modifier_v2(Some(&prev_stake), &chained.hash);
        Ok(())
    }

    // -- kernel

    /// Check the coinstake of a stake block built on `prev`, returning the
    /// kernel hash
    #[allow(clippy::too_many_arguments)]
    pub fn check_proof_of_stake(
        &self,
        prev: &Arc<ChainedBlock>,
        prev_stake: &BlockStake,
        tx: &Transaction,
        set: &UnspentOutputSet,
        bits: u32,
        verifier: &dyn ScriptVerifier,
    ) -> Result<Hash<32>, ConsensusError> {
        if !tx.is_coinstake() {
            return Err(ConsensusError::NonCoinstake);
        }

        let input = &tx.inputs[0];
        let coins = set.access_coins(&input.prevout.hash).ok_or(ConsensusError::ReadTxPrevFailed)?;
        let output = coins.output(input.prevout.n).ok_or(ConsensusError::ReadTxPrevFailed)?;

        if !verifier.verify_input(tx, 0, output, ScriptFlags::default()) {
            return Err(ConsensusError::CoinstakeVerifySignatureFailed);
        }

        let tx_time = tx.time.unwrap_or(0);
        if self.params.is_protocol_v3(tx_time as i64) {
            let depth = prev.height as i64 - coins.height as i64;
            if depth < self.params.stake_min_confirmations as i64 - 1 {
                return Err(ConsensusError::InvalidStakeDepth);
            }
        }

        self.check_stake_kernel_hash(prev, bits, prev_stake, coins, output.value, &input.prevout, tx_time)
    }

    /// Kernel hash check against the value-weighted target
    #[allow(clippy::too_many_arguments)]
    pub fn check_stake_kernel_hash(
        &self,
        prev: &Arc<ChainedBlock>,
        bits: u32,
        prev_stake: &BlockStake,
        coins: &UnspentOutputs,
        value: i64,
        prevout: &OutPoint,
        tx_time: u32,
    ) -> Result<Hash<32>, ConsensusError> {
        if tx_time < coins.time {
            return Err(ConsensusError::StakeTimeViolation);
        }

        let block_from = prev.ancestor(coins.height).ok_or(ConsensusError::ReadTxPrevFailed)?;
        if !self.params.is_protocol_v3(tx_time as i64)
            && block_from.time() + self.params.stake_min_age > tx_time as i64
        {
            return Err(ConsensusError::MinAgeViolation);
        }

        let target = from_compact(bits);
        if !target.is_valid() {
            return Err(ConsensusError::StakeHashInvalidTarget);
        }
        let weighted_target = target.value * UBig::from(value.max(0) as u64);

        let hash = if self.params.is_protocol_v2(prev.height + 1) {
            kernel_hash_v2(&prev_stake.stake_modifier_v2, coins.time, prevout, tx_time)
        } else {
            kernel_hash_v1(prev_stake.stake_modifier, block_from.header.time, coins.time, prevout, tx_time)
        };

        verify_kernel_hash(&hash, &weighted_target)?;
        Ok(hash)
    }

    /// Coinstake time must match the block time, and from protocol V3 on
    /// also respect the timestamp mask
    pub fn check_coinstake_timestamp(&self, block_time: u32, tx_time: u32) -> bool {
        if self.params.is_protocol_v3(tx_time as i64) {
            block_time == tx_time && (tx_time & self.params.stake_timestamp_mask) == 0
        } else {
            block_time == tx_time
        }
    }
}

/// Modifier V2: hash of the block hash and the previous modifier V2
pub fn compute_stake_modifier_v2(prev_stake: Option<&BlockStake>, hash: &BlockHash) -> Hash<32> {
    let Some(prev_stake) = prev_stake else {
        return Hash::zero();
    };
    let mut e = Encoder::default();
    e.append(hash.as_ref());
    e.append(prev_stake.stake_modifier_v2.as_ref());
    Hash::double_sha256(&e.to_vec())
}

pub fn kernel_hash_v2(modifier_v2: &Hash<32>, coin_time: u32, prevout: &OutPoint, tx_time: u32) -> Hash<32> {
    let mut e = Encoder::default();
    e.append(modifier_v2.as_ref());
    e.push_u32(coin_time);
    e.append(prevout.hash.as_ref());
    e.push_u32(prevout.n);
    e.push_u32(tx_time);
    Hash::double_sha256(&e.to_vec())
}

pub fn kernel_hash_v1(
    modifier: u64,
    block_from_time: u32,
    coin_time: u32,
    prevout: &OutPoint,
    tx_time: u32,
) -> Hash<32> {
    let mut e = Encoder::default();
    e.push_u64(modifier);
    e.push_u32(block_from_time);
    e.push_u32(coin_time);
    e.append(prevout.hash.as_ref());
    e.push_u32(prevout.n);
    e.push_u32(tx_time);
    Hash::double_sha256(&e.to_vec())
}

/// The kernel hash, as a little-endian number, must not exceed the target
pub fn verify_kernel_hash(hash: &Hash<32>, weighted_target: &UBig) -> Result<(), ConsensusError> {
    if hash_to_ubig(hash) > *weighted_target {
        return Err(ConsensusError::StakeHashExceedsTarget);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory_stake_store::InMemoryStakeStore;
    use bulwark_common::script::Script;
    use bulwark_common::{Block, TxId, TxIn, TxOut, COIN};

    struct Verifier(bool);

    impl ScriptVerifier for Verifier {
        fn verify_input(&self, _: &Transaction, _: usize, _: &TxOut, _: ScriptFlags) -> bool {
            self.0
        }

        fn verify_block_signature(&self, _: &Block) -> bool {
            self.0
        }
    }

    struct Fixture {
        network: Arc<Network>,
        store: Arc<InMemoryStakeStore>,
        validator: StakeValidator,
        chain: Vec<Arc<ChainedBlock>>,
    }

    /// Chain of `length` blocks after genesis, `spacing` seconds apart,
    /// all of the given kind and with `bits`
    fn fixture(length: u32, spacing: u32, proof_of_stake: bool, bits: u32) -> Fixture {
        let network = Arc::new(Network::pos_testnet());
        let store = Arc::new(InMemoryStakeStore::new(&network.genesis));
        let validator = StakeValidator::new(network.clone(), store.clone()).unwrap();

        let mut chain = vec![ChainedBlock::genesis(network.genesis.header.clone())];
        for _ in 0..length {
            let prev = chain[chain.len() - 1].clone();
            let mut header = prev.header.clone();
            header.prev_block = prev.hash;
            header.time += spacing;
            header.bits = bits;
            let block = ChainedBlock::extend(&prev, header);

            let mut stake = BlockStake::default();
            stake.flags.proof_of_stake = proof_of_stake;
            stake.hash_proof = block.hash;
            stake.flags.stake_entropy = block.hash.low_u64() & 1 == 1;
            store.set(block.hash, stake);
            chain.push(block);
        }

        Fixture {
            network,
            store,
            validator,
            chain,
        }
    }

    #[test]
    fn first_blocks_use_the_limit() {
        let f = fixture(1, 64, true, 0x1e00ffff);
        let limit = f.network.proof_of_stake.as_ref().unwrap().pos_limit_bits;
        assert_eq!(f.validator.get_next_target_required(None, true).unwrap(), limit);
        assert_eq!(f.validator.get_next_target_required(f.chain.last(), true).unwrap(), limit);
    }

    #[test]
    fn on_schedule_spacing_keeps_target() {
        let f = fixture(5, 64, true, 0x1e00ffff);
        assert_eq!(f.validator.get_next_target_required(f.chain.last(), true).unwrap(), 0x1e00ffff);
    }

    #[test]
    fn fast_blocks_tighten_target() {
        let f = fixture(5, 0, true, 0x1e00ffff);
        let bits = f.validator.get_next_target_required(f.chain.last(), true).unwrap();
        // interval 15: target * 14 / 16
        let expected = from_compact(0x1e00ffff).value * UBig::from(14u8) / UBig::from(16u8);
        assert_eq!(bits, to_compact(&expected));
    }

    #[test]
    fn missing_stake_is_an_error() {
        let f = fixture(3, 64, true, 0x1e00ffff);
        let mut header = f.chain[3].header.clone();
        header.prev_block = f.chain[3].hash;
        let orphan = ChainedBlock::extend(&f.chain[3], header);
        assert_eq!(
            f.validator.get_next_target_required(Some(&orphan), true),
            Err(ConsensusError::PrevStakeNull)
        );
    }

    #[test]
    fn modifier_only_regenerates_across_an_interval() {
        // Genesis time is 200s into its modifier interval
        let f = fixture(8, 64, false, 0x1e00ffff);
        assert_eq!(f.validator.compute_stake_modifier(Some(&f.chain[1])).unwrap(), (0, false));

        let (modifier, generated) = f.validator.compute_stake_modifier(Some(&f.chain[7])).unwrap();
        assert!(generated);
        // Eight candidates give eight rounds
        assert!(modifier < 1 << 8);
        assert_eq!(f.validator.compute_stake_modifier(Some(&f.chain[7])).unwrap(), (modifier, true));
    }

    #[test]
    fn modifier_v2_chains_hashes() {
        assert!(compute_stake_modifier_v2(None, &BlockHash::new([1; 32])).is_zero());
        let prev = BlockStake::default();
        let first = compute_stake_modifier_v2(Some(&prev), &BlockHash::new([1; 32]));
        let second = compute_stake_modifier_v2(Some(&prev), &BlockHash::new([2; 32]));
        assert_ne!(first, second);
        assert!(!first.is_zero());
    }

    #[test]
    fn kernel_boundary() {
        let hash = kernel_hash_v2(&Hash::new([5; 32]), 100, &OutPoint::new(TxId::new([6; 32]), 1), 200);
        let value = hash_to_ubig(&hash);

        // A hash at or under the target passes
        assert_eq!(verify_kernel_hash(&hash, &value), Ok(()));
        assert_eq!(verify_kernel_hash(&hash, &(value.clone() + UBig::ONE)), Ok(()));
        assert_eq!(
            verify_kernel_hash(&hash, &(value - UBig::ONE)),
            Err(ConsensusError::StakeHashExceedsTarget)
        );
    }

    /// A coin created at `height` and a coinstake spending it at `tx_time`
    fn staking(height: u32, coin_time: u32, tx_time: u32) -> (UnspentOutputSet, Transaction) {
        let funding = Transaction {
            version: 1,
            time: Some(coin_time),
            inputs: vec![TxIn::new(OutPoint::new(TxId::new([8; 32]), 0), Script::default())],
            outputs: vec![TxOut::new(1000 * COIN, Script::from(vec![0x51]))],
            lock_time: 0,
        };
        let mut set = UnspentOutputSet::new();
        set.set_coins([UnspentOutputs::from_transaction(&funding, height)]);

        let coinstake = Transaction {
            version: 1,
            time: Some(tx_time),
            inputs: vec![TxIn::new(OutPoint::new(funding.txid(), 0), Script::default())],
            outputs: vec![TxOut::empty(), TxOut::new(1001 * COIN, Script::from(vec![0x51]))],
            lock_time: 0,
        };
        (set, coinstake)
    }

    #[test]
    fn coinstake_on_easy_target_passes() {
        let f = fixture(20, 64, false, 0x1e00ffff);
        let tip = f.chain.last().unwrap();
        let prev_stake = f.store.get(&tip.hash).unwrap();
        let (set, coinstake) = staking(2, f.chain[2].header.time, tip.header.time + 64);

        let proof = f
            .validator
            .check_proof_of_stake(tip, &prev_stake, &coinstake, &set, 0x207fffff, &Verifier(true))
            .unwrap();
        assert!(!proof.is_zero());

        // The same kernel can't meet a target of one
        assert_eq!(
            f.validator.check_proof_of_stake(tip, &prev_stake, &coinstake, &set, 0x03000001, &Verifier(true)),
            Err(ConsensusError::StakeHashExceedsTarget)
        );
    }

    #[test]
    fn coinstake_rules() {
        let f = fixture(20, 64, false, 0x1e00ffff);
        let tip = f.chain.last().unwrap();
        let prev_stake = f.store.get(&tip.hash).unwrap();
        let time = tip.header.time + 64;

        // Too shallow: 10 confirmations needed, coin at height 15 of 20
        let (set, coinstake) = staking(15, f.chain[15].header.time, time);
        assert_eq!(
            f.validator.check_proof_of_stake(tip, &prev_stake, &coinstake, &set, 0x207fffff, &Verifier(true)),
            Err(ConsensusError::InvalidStakeDepth)
        );

        // Coinstake earlier than its coin
        let (set, coinstake) = staking(2, time + 1, time);
        assert_eq!(
            f.validator.check_proof_of_stake(tip, &prev_stake, &coinstake, &set, 0x207fffff, &Verifier(true)),
            Err(ConsensusError::StakeTimeViolation)
        );

        // Signature rejected
        let (set, coinstake) = staking(2, f.chain[2].header.time, time);
        assert_eq!(
            f.validator.check_proof_of_stake(tip, &prev_stake, &coinstake, &set, 0x207fffff, &Verifier(false)),
            Err(ConsensusError::CoinstakeVerifySignatureFailed)
        );

        // Unknown coin
        assert_eq!(
            f.validator.check_proof_of_stake(
                tip,
                &prev_stake,
                &coinstake,
                &UnspentOutputSet::new(),
                0x207fffff,
                &Verifier(true)
            ),
            Err(ConsensusError::ReadTxPrevFailed)
        );

        // Not a coinstake at all
        let mut plain = coinstake.clone();
        plain.outputs.remove(0);
        assert_eq!(
            f.validator.check_proof_of_stake(tip, &prev_stake, &plain, &set, 0x207fffff, &Verifier(true)),
            Err(ConsensusError::NonCoinstake)
        );
    }

    #[test]
    fn coinstake_timestamp_mask() {
        let f = fixture(0, 64, false, 0x1e00ffff);
        let base = 1_470_467_200;
        assert!(f.validator.check_coinstake_timestamp(base, base));
        assert!(!f.validator.check_coinstake_timestamp(base + 1, base + 1));
        assert!(!f.validator.check_coinstake_timestamp(base + 16, base));
    }
}
