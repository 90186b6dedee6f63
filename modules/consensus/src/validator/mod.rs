//! Block validation rules
//!
//! Validation runs in stages, each one able to reject the block with a
//! [`ConsensusError`]:
//!
//! 1. `check_block_header` - context-free header rules
//! 2. `contextual_check_block_header` - rules needing the parent chain
//! 3. `contextual_check_block` - finality, coinbase height, witness
//! 4. `check_block` - context-free structure and transaction sanity
//! 5. `execute_block` - spend the block's inputs against the UTXO set
//!
//! The rules shared by every chain are free functions here; the validator
//! for each chain kind supplies its header rules, maturity rules and block
//! reward through the [`BlockValidator`] trait.

mod pos;
mod pow;

pub use pos::PosValidator;
pub use pow::PowValidator;

use crate::context::ContextInformation;
use crate::interfaces::ScriptVerifier;
use crate::script_checks::{ScriptCheck, ScriptCheckPool};
use crate::utxo_set::UnspentOutputs;
use bulwark_common::merkle::{block_merkle_root, block_witness_merkle_root};
use bulwark_common::params::Network;
use bulwark_common::script::{witness_sig_op_count, Script};
use bulwark_common::{Amount, Block, ConsensusError, Hash, Transaction};
use std::collections::HashSet;
use tracing::{debug, Level};

/// Coinbase script signature length bounds
const MIN_COINBASE_SCRIPT_SIZE: usize = 2;
const MAX_COINBASE_SCRIPT_SIZE: usize = 100;

/// Relative lock-time sequence fields (BIP68)
pub const SEQUENCE_LOCKTIME_DISABLE_FLAG: u32 = 1 << 31;
pub const SEQUENCE_LOCKTIME_TYPE_FLAG: u32 = 1 << 22;
pub const SEQUENCE_LOCKTIME_MASK: u32 = 0x0000_ffff;
pub const SEQUENCE_LOCKTIME_GRANULARITY: u32 = 9;

pub trait BlockValidator: Send + Sync {
    fn network(&self) -> &Network;

    fn verifier(&self) -> &dyn ScriptVerifier;

    fn script_pool(&self) -> &ScriptCheckPool;

    /// Context-free header checks; also fixes the target the header must carry
    fn check_block_header(&self, block: &Block, context: &mut ContextInformation) -> Result<(), ConsensusError>;

    fn contextual_check_block_header(
        &self,
        block: &Block,
        context: &mut ContextInformation,
    ) -> Result<(), ConsensusError>;

    fn contextual_check_block(&self, block: &Block, context: &mut ContextInformation) -> Result<(), ConsensusError> {
        contextual_check_block(self.network(), block, context)
    }

    fn check_block(&self, block: &Block, context: &mut ContextInformation) -> Result<(), ConsensusError> {
        check_block(self.network(), block, context)
    }

    fn execute_block(&self, block: &Block, context: &mut ContextInformation) -> Result<(), ConsensusError> {
        execute_block(self, block, context)
    }

    /// Spending rules for outputs of coinbase-like transactions
    fn check_maturity(
        &self,
        coins: &UnspentOutputs,
        tx: &Transaction,
        spend_height: u32,
    ) -> Result<(), ConsensusError>;

    /// Limit on what the block pays itself, given the fees it collected
    fn check_block_reward(
        &self,
        block: &Block,
        context: &ContextInformation,
        fees: Amount,
    ) -> Result<(), ConsensusError>;
}

/// Header rules shared by every chain kind
pub fn contextual_check_block_header(
    network: &Network,
    block: &Block,
    context: &ContextInformation,
) -> Result<(), ConsensusError> {
    let header = &block.header;

    if context.next_work_required != Some(header.bits) {
        return Err(ConsensusError::BadDiffBits);
    }

    if header.time as i64 <= context.best_block.median_time_past {
        return Err(ConsensusError::TimeTooOld);
    }

    if header.time as i64 > context.time.timestamp() + network.consensus.max_future_block_time {
        return Err(ConsensusError::TimeTooNew);
    }

    let height = context.height();
    if (header.version < 2 && height >= network.buried.bip34)
        || (header.version < 3 && height >= network.buried.bip66)
        || (header.version < 4 && height >= network.buried.bip65)
    {
        return Err(ConsensusError::BadVersion);
    }

    Ok(())
}

/// Finality, coinbase height, witness commitment and weight
pub fn contextual_check_block(
    network: &Network,
    block: &Block,
    context: &ContextInformation,
) -> Result<(), ConsensusError> {
    let height = context.height();
    let flags = &context.flags;

    let cutoff_time = if flags.lock_time_flags.median_time_past {
        context.best_block.median_time_past
    } else {
        block.header.time as i64
    };
    if !block.transactions.iter().all(|tx| tx.is_final(height, cutoff_time)) {
        return Err(ConsensusError::BadTransactionNonFinal);
    }

    if flags.enforce_bip34 {
        let expected = Script::new().push_int(height as i64);
        let coinbase_script = block
            .transactions
            .first()
            .and_then(|coinbase| coinbase.inputs.first())
            .map(|input| &input.script_sig);
        if !coinbase_script.is_some_and(|script| script.starts_with(&expected)) {
            return Err(ConsensusError::BadCoinbaseHeight);
        }
    }

    check_witness_commitment(block, flags.script_flags.witness)?;

    if block.weight() > network.consensus.max_block_weight {
        return Err(ConsensusError::BadBlockWeight);
    }

    Ok(())
}

/// The coinbase commits to the witness merkle root when witness data is
/// present; otherwise no transaction may carry witness data
fn check_witness_commitment(block: &Block, witness_active: bool) -> Result<(), ConsensusError> {
    let commitment = match (witness_active, block.transactions.first()) {
        (true, Some(coinbase)) => coinbase
            .outputs
            .iter()
            .rev()
            .find_map(|output| output.script_pubkey.witness_commitment()),
        _ => None,
    };

    match commitment {
        Some(commitment) => {
            let nonce = match block.transactions[0].inputs.first().map(|input| input.witness.as_slice()) {
                Some([nonce]) if nonce.len() == 32 => nonce,
                _ => return Err(ConsensusError::BadWitnessNonceSize),
            };

            let root = block_witness_merkle_root(block).root;
            let mut data = root.to_vec();
            data.extend_from_slice(nonce);
            if Hash::double_sha256(&data).into_inner() != commitment {
                return Err(ConsensusError::BadWitnessMerkleMatch);
            }
        }
        None => {
            if block.transactions.iter().any(|tx| tx.has_witness()) {
                return Err(ConsensusError::UnexpectedWitness);
            }
        }
    }

    Ok(())
}

/// Context-free block structure
pub fn check_block(network: &Network, block: &Block, context: &ContextInformation) -> Result<(), ConsensusError> {
    if context.check_merkle_root {
        let merkle = block_merkle_root(block);
        if merkle.root != block.header.merkle_root {
            return Err(ConsensusError::BadMerkleRoot);
        }
        if merkle.mutated {
            return Err(ConsensusError::BadTransactionDuplicate);
        }
    }

    let max_size = network.consensus.max_block_base_size;
    if block.transactions.is_empty()
        || block.transactions.len() > max_size
        || block.stripped_size() > max_size
    {
        return Err(ConsensusError::BadBlockLength);
    }

    if !block.transactions[0].is_coinbase() {
        return Err(ConsensusError::BadCoinbaseMissing);
    }
    if block.transactions[1..].iter().any(|tx| tx.is_coinbase()) {
        return Err(ConsensusError::BadMultipleCoinbase);
    }

    for tx in &block.transactions {
        check_transaction(network, tx)?;
    }

    let sig_ops: u32 = block.transactions.iter().map(legacy_sig_op_count).sum();
    if sig_ops * network.consensus.witness_scale_factor > network.consensus.max_block_sigops_cost {
        return Err(ConsensusError::BadBlockSigOps);
    }

    Ok(())
}

/// Context-free transaction sanity
pub fn check_transaction(network: &Network, tx: &Transaction) -> Result<(), ConsensusError> {
    let consensus = &network.consensus;

    if tx.inputs.is_empty() {
        return Err(ConsensusError::BadTransactionNoInput);
    }
    if tx.outputs.is_empty() {
        return Err(ConsensusError::BadTransactionNoOutput);
    }
    if tx.stripped_size() > consensus.max_block_base_size {
        return Err(ConsensusError::BadTransactionOversize);
    }

    let mut total: Amount = 0;
    for output in &tx.outputs {
        if output.value < 0 {
            return Err(ConsensusError::BadTransactionNegativeOutput);
        }
        if output.value > consensus.max_money {
            return Err(ConsensusError::BadTransactionTooLargeOutput);
        }
        total += output.value;
        if !consensus.money_range(total) {
            return Err(ConsensusError::BadTransactionTooLargeTotalOutput);
        }
    }

    let mut seen = HashSet::new();
    if !tx.inputs.iter().all(|input| seen.insert(input.prevout)) {
        return Err(ConsensusError::BadTransactionDuplicateInputs);
    }

    if tx.is_coinbase() {
        let size = tx.inputs[0].script_sig.len();
        if !(MIN_COINBASE_SCRIPT_SIZE..=MAX_COINBASE_SCRIPT_SIZE).contains(&size) {
            return Err(ConsensusError::BadCoinbaseSize);
        }
    } else if tx.inputs.iter().any(|input| input.prevout.is_null()) {
        return Err(ConsensusError::BadTransactionNullPrevout);
    }

    Ok(())
}

/// Sig-ops counted without looking at spent outputs
pub fn legacy_sig_op_count(tx: &Transaction) -> u32 {
    let inputs: u32 = tx.inputs.iter().map(|input| input.script_sig.sig_op_count(false)).sum();
    let outputs: u32 = tx.outputs.iter().map(|output| output.script_pubkey.sig_op_count(false)).sum();
    inputs + outputs
}

/// Full sig-op cost of a transaction whose inputs are all in the set
fn sig_op_cost(network: &Network, tx: &Transaction, context: &ContextInformation) -> u32 {
    let scale = network.consensus.witness_scale_factor;
    let mut cost = legacy_sig_op_count(tx) * scale;
    if tx.is_coinbase() {
        return cost;
    }

    let script_flags = &context.flags.script_flags;
    for input in &tx.inputs {
        let Some(spent) = context.set.get_output(&input.prevout) else {
            continue;
        };
        if script_flags.p2sh && spent.script_pubkey.is_pay_to_script_hash() {
            cost += spent.script_pubkey.p2sh_sig_op_count(&input.script_sig) * scale;
        }
        if script_flags.witness {
            cost += witness_sig_op_count(&input.script_sig, &spent.script_pubkey, &input.witness);
        }
    }
    cost
}

/// BIP68 relative lock-times, given the heights the inputs were created at
pub fn check_sequence_locks(tx: &Transaction, prev_heights: &[u32], context: &ContextInformation) -> bool {
    if tx.version < 2 || !context.flags.lock_time_flags.verify_sequence {
        return true;
    }

    let block = &context.chained_block;
    let mut min_height: i64 = -1;
    let mut min_time: i64 = -1;

    for (input, &coin_height) in tx.inputs.iter().zip(prev_heights) {
        if input.sequence & SEQUENCE_LOCKTIME_DISABLE_FLAG != 0 {
            continue;
        }

        let value = (input.sequence & SEQUENCE_LOCKTIME_MASK) as i64;
        if input.sequence & SEQUENCE_LOCKTIME_TYPE_FLAG != 0 {
            let base = coin_height.max(1) - 1;
            let base_time = block.ancestor(base).map(|b| b.median_time_past()).unwrap_or_default();
            min_time = min_time.max(base_time + (value << SEQUENCE_LOCKTIME_GRANULARITY) - 1);
        } else {
            min_height = min_height.max(coin_height as i64 + value - 1);
        }
    }

    min_height < block.height as i64 && min_time < context.best_block.median_time_past
}

/// Value-in checks for a spending transaction; returns the fee it pays
///
/// Coinstake rewards are checked against the block reward instead, so a
/// coinstake pays no fee.
pub fn check_inputs<V: BlockValidator + ?Sized>(
    validator: &V,
    tx: &Transaction,
    context: &ContextInformation,
    staking: bool,
) -> Result<Amount, ConsensusError> {
    let consensus = &validator.network().consensus;
    let set = &context.set;
    if !set.have_inputs(tx) {
        return Err(ConsensusError::BadTransactionMissingInput);
    }

    let mut value_in: Amount = 0;
    for input in &tx.inputs {
        let coins = set.access_coins(&input.prevout.hash).ok_or(ConsensusError::BadTransactionMissingInput)?;
        validator.check_maturity(coins, tx, context.height())?;

        let spent = coins.output(input.prevout.n).ok_or(ConsensusError::BadTransactionMissingInput)?;
        value_in = value_in.saturating_add(spent.value);
        if !consensus.money_range(spent.value) || !consensus.money_range(value_in) {
            return Err(ConsensusError::BadTransactionInputValueOutOfRange);
        }
    }

    if staking {
        return Ok(0);
    }

    let value_out = tx.total_out();
    if value_in < value_out {
        return Err(ConsensusError::BadTransactionInBelowOut);
    }

    let fee = value_in - value_out;
    if fee < 0 {
        return Err(ConsensusError::BadTransactionNegativeFee);
    }
    if !consensus.money_range(fee) {
        return Err(ConsensusError::BadTransactionFeeOutOfRange);
    }
    Ok(fee)
}

/// Coinbase maturity, shared by every chain kind
pub fn check_coinbase_maturity(
    network: &Network,
    coins: &UnspentOutputs,
    spend_height: u32,
) -> Result<(), ConsensusError> {
    if coins.coinbase && spend_height.saturating_sub(coins.height) < network.consensus.coinbase_maturity {
        return Err(ConsensusError::BadTransactionPrematureCoinbaseSpending);
    }
    Ok(())
}

/// Block subsidy of a proof-of-work block at `height`
pub fn pow_reward(network: &Network, height: u32) -> Amount {
    if let Some(premine) = &network.premine {
        if premine.height == height {
            return premine.reward;
        }
    }

    let halvings = height / network.subsidy_halving_interval.max(1);
    if halvings >= 64 {
        return 0;
    }
    network.pow_reward >> halvings
}

/// Coinbase of a proof-of-work block may claim at most the subsidy plus fees
pub fn check_pow_block_reward(
    network: &Network,
    block: &Block,
    height: u32,
    fees: Amount,
) -> Result<(), ConsensusError> {
    let claimed = block.transactions[0].total_out();
    if claimed > fees.saturating_add(pow_reward(network, height)) {
        return Err(ConsensusError::BadCoinbaseAmount);
    }
    Ok(())
}

/// Spend every transaction of the block against the working set
pub fn execute_block<V: BlockValidator + ?Sized>(
    validator: &V,
    block: &Block,
    context: &mut ContextInformation,
) -> Result<(), ConsensusError> {
    let network = validator.network();
    let height = context.height();
    let proof_of_stake = network.is_proof_of_stake();

    if context.flags.enforce_bip30 {
        for tx in &block.transactions {
            if let Some(existing) = context.set.access_coins(&tx.txid()) {
                if !existing.is_prunable() {
                    return Err(ConsensusError::BadTransactionBIP30);
                }
            }
        }
    }

    let mut fees: Amount = 0;
    let mut sig_ops_cost: u32 = 0;
    let mut checks = Vec::new();

    for tx in &block.transactions {
        let staking = proof_of_stake && tx.is_coinstake();

        if !tx.is_coinbase() && !staking {
            if !context.set.have_inputs(tx) {
                return Err(ConsensusError::BadTransactionMissingInput);
            }

            let prev_heights: Vec<u32> = tx
                .inputs
                .iter()
                .filter_map(|input| context.set.access_coins(&input.prevout.hash))
                .map(|coins| coins.height)
                .collect();
            if !check_sequence_locks(tx, &prev_heights, context) {
                return Err(ConsensusError::BadTransactionNonFinal);
            }
        }

        sig_ops_cost = sig_ops_cost.saturating_add(sig_op_cost(network, tx, context));
        if sig_ops_cost > network.consensus.max_block_sigops_cost {
            return Err(ConsensusError::BadBlockSigOps);
        }

        if !tx.is_coinbase() {
            let fee = check_inputs(validator, tx, context, staking)?;
            fees = fees.saturating_add(fee);
            if !network.consensus.money_range(fees) {
                return Err(ConsensusError::BadTransactionFeeOutOfRange);
            }

            if staking {
                let value_in = context.set.value_in(tx).ok_or(ConsensusError::BadTransactionMissingInput)?;
                context.stake_mut().total_coinstake_value_in = value_in;
            }

            for (index, input) in tx.inputs.iter().enumerate() {
                let spent = context
                    .set
                    .get_output(&input.prevout)
                    .cloned()
                    .ok_or(ConsensusError::BadTransactionMissingInput)?;
                checks.push(ScriptCheck {
                    tx,
                    index,
                    spent,
                    flags: context.flags.script_flags,
                });
            }
        }

        context.set.update(tx, height)?;

        if tracing::enabled!(Level::DEBUG) {
            debug!(height, txid = %tx.txid(), inputs = tx.inputs.len(), "Transaction executed");
        }
    }

    validator.check_block_reward(block, context, fees)?;

    if !validator.script_pool().verify_all(&checks, validator.verifier()) {
        return Err(ConsensusError::BadTransactionScriptError);
    }

    debug!(height, fees, sig_ops_cost, "Block executed");
    Ok(())
}
