//! Proof-of-stake chain rules
//!
//! A proof-of-stake chain mixes work blocks, allowed up to a last height,
//! with stake blocks whose second transaction is a coinstake. Stake blocks
//! leave the coinbase empty, are signed by the staking key and pay their
//! reward through the coinstake.

use super::{
    check_block, check_coinbase_maturity, check_pow_block_reward, contextual_check_block_header,
    execute_block, BlockValidator,
};
use crate::context::{ContextInformation, StakeContext};
use crate::interfaces::{ScriptVerifier, StakeStore};
use crate::script_checks::ScriptCheckPool;
use crate::stake::BlockStake;
use crate::stake_validator::StakeValidator;
use crate::utxo_set::UnspentOutputs;
use bulwark_common::params::Network;
use bulwark_common::target::check_proof_of_work;
use bulwark_common::{Amount, Block, ConsensusError, Transaction};
use std::sync::Arc;
use tracing::debug;

pub struct PosValidator {
    network: Arc<Network>,
    verifier: Arc<dyn ScriptVerifier>,
    script_pool: ScriptCheckPool,
    store: Arc<dyn StakeStore>,
    stake: StakeValidator,
}

impl PosValidator {
    pub fn new(
        network: Arc<Network>,
        verifier: Arc<dyn ScriptVerifier>,
        script_pool: ScriptCheckPool,
        store: Arc<dyn StakeStore>,
    ) -> anyhow::Result<Self> {
        let stake = StakeValidator::new(network.clone(), store.clone())?;
        Ok(Self {
            network,
            verifier,
            script_pool,
            store,
            stake,
        })
    }

    pub fn stake_validator(&self) -> &StakeValidator {
        &self.stake
    }
}

impl BlockValidator for PosValidator {
    fn network(&self) -> &Network {
        &self.network
    }

    fn verifier(&self) -> &dyn ScriptVerifier {
        self.verifier.as_ref()
    }

    fn script_pool(&self) -> &ScriptCheckPool {
        &self.script_pool
    }

    fn check_block_header(&self, block: &Block, context: &mut ContextInformation) -> Result<(), ConsensusError> {
        context.stake = Some(StakeContext {
            block_stake: BlockStake::new(block),
            total_coinstake_value_in: 0,
        });

        // Stake blocks prove themselves through the kernel instead
        if block.is_proof_of_work()
            && context.check_pow
            && !check_proof_of_work(&block.hash(), block.header.bits, &self.network.pow_limit())
        {
            return Err(ConsensusError::HighHash);
        }

        let required = self
            .stake
            .get_next_target_required(Some(&context.best_block.chained), block.is_proof_of_stake())?;
        context.next_work_required = Some(required);
        Ok(())
    }

    fn contextual_check_block_header(
        &self,
        block: &Block,
        context: &mut ContextInformation,
    ) -> Result<(), ConsensusError> {
        contextual_check_block_header(&self.network, block, context)?;

        if block.is_proof_of_work() && context.height() > self.stake.params().last_pow_block {
            return Err(ConsensusError::ProofOfWorkTooHigh);
        }

        if block.is_proof_of_stake() {
            let tx_time = block.transactions[1].time.unwrap_or(block.header.time);
            if !self.stake.check_coinstake_timestamp(block.header.time, tx_time) {
                return Err(ConsensusError::StakeTimeViolation);
            }
        }

        Ok(())
    }

    fn check_block(&self, block: &Block, context: &mut ContextInformation) -> Result<(), ConsensusError> {
        check_block(&self.network, block, context)?;

        if block.is_proof_of_stake() {
            let coinbase = &block.transactions[0];
            if coinbase.outputs.len() != 1 || !coinbase.outputs[0].is_empty() {
                return Err(ConsensusError::BadStakeBlock);
            }
        }

        if block.transactions.iter().skip(2).any(|tx| tx.is_coinstake()) {
            return Err(ConsensusError::BadMultipleCoinstake);
        }

        if block.is_proof_of_stake() && !self.verifier.verify_block_signature(block) {
            return Err(ConsensusError::BadBlockSignature);
        }

        for (index, tx) in block.transactions.iter().enumerate() {
            if tx.time.is_some_and(|time| time > block.header.time) {
                return Err(ConsensusError::BlockTimeBeforeTrx);
            }

            let rewarding = index == 0 || (index == 1 && tx.is_coinstake());
            if !rewarding && tx.outputs.iter().any(|output| output.is_empty()) {
                return Err(ConsensusError::BadTransactionEmptyOutput);
            }
        }

        Ok(())
    }

    fn execute_block(&self, block: &Block, context: &mut ContextInformation) -> Result<(), ConsensusError> {
        if block.is_proof_of_stake() {
            let prev = context.best_block.chained.clone();
            let prev_stake = self.store.get(&prev.hash).ok_or(ConsensusError::PrevStakeNull)?;
            let hash_proof = self.stake.check_proof_of_stake(
                &prev,
                &prev_stake,
                &block.transactions[1],
                &context.set,
                block.header.bits,
                self.verifier.as_ref(),
            )?;
            debug!(height = context.height(), %hash_proof, "Proof of stake accepted");
            context.stake_mut().block_stake.hash_proof = hash_proof;
        }

        execute_block(self, block, context)?;

        let chained = context.chained_block.clone();
        self.stake.compute_block_stake(block, &chained, &mut context.stake_mut().block_stake)
    }

    fn check_maturity(
        &self,
        coins: &UnspentOutputs,
        tx: &Transaction,
        spend_height: u32,
    ) -> Result<(), ConsensusError> {
        check_coinbase_maturity(&self.network, coins, spend_height)?;

        if coins.coinstake && spend_height.saturating_sub(coins.height) < self.stake.params().coinstake_maturity {
            return Err(ConsensusError::BadTransactionPrematureCoinstakeSpending);
        }

        if tx.time.is_some_and(|time| time < coins.time) {
            return Err(ConsensusError::BadTransactionEarlyTimestamp);
        }

        Ok(())
    }

    fn check_block_reward(
        &self,
        block: &Block,
        context: &ContextInformation,
        fees: Amount,
    ) -> Result<(), ConsensusError> {
        if block.is_proof_of_work() {
            return check_pow_block_reward(&self.network, block, context.height(), fees);
        }

        let value_in = context.stake.as_ref().map(|stake| stake.total_coinstake_value_in).unwrap_or(0);
        let reward = block.transactions[1].total_out() - value_in;
        if reward > fees.saturating_add(self.stake.params().stake_reward) {
            return Err(ConsensusError::BadCoinstakeAmount);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::ScriptFlags;
    use crate::in_memory_stake_store::InMemoryStakeStore;
    use crate::script_checks::AcceptAllScriptVerifier;
    use bulwark_common::chain::ChainedBlock;
    use bulwark_common::{OutPoint, TxId, TxOut, COIN};
    use bulwark_test_utils::{anyone_can_spend, assemble_block, coinbase, spend};
    use chrono::Utc;

    struct RejectSignatures;

    impl ScriptVerifier for RejectSignatures {
        fn verify_input(&self, _: &Transaction, _: usize, _: &TxOut, _: ScriptFlags) -> bool {
            true
        }

        fn verify_block_signature(&self, _: &Block) -> bool {
            false
        }
    }

    fn validator_on(network: Network, verifier: Arc<dyn ScriptVerifier>) -> PosValidator {
        let store = Arc::new(InMemoryStakeStore::new(&network.genesis));
        PosValidator::new(Arc::new(network), verifier, ScriptCheckPool::new(1).unwrap(), store).unwrap()
    }

    fn validator(verifier: Arc<dyn ScriptVerifier>) -> PosValidator {
        validator_on(Network::pos_testnet(), verifier)
    }

    fn headers(network: &Network, length: u32) -> Arc<ChainedBlock> {
        let mut tip = ChainedBlock::genesis(network.genesis.header.clone());
        for _ in 0..length {
            let mut header = tip.header.clone();
            header.prev_block = tip.hash;
            header.time += 64;
            tip = ChainedBlock::extend(&tip, header);
        }
        tip
    }

    fn context(tip: &Arc<ChainedBlock>, block: &Block) -> ContextInformation {
        ContextInformation::new(ChainedBlock::extend(tip, block.header.clone()), Utc::now()).unwrap()
    }

    fn coinstake(time: u32, value: Amount) -> Transaction {
        let mut tx = spend(&[OutPoint::new(TxId::new([4; 32]), 1)], value);
        tx.outputs.insert(0, TxOut::empty());
        tx.time = Some(time);
        tx
    }

    /// A stake block on `tip` with an empty coinbase, stamped on the mask
    fn stake_block(tip: &ChainedBlock, extra: Vec<Transaction>) -> Block {
        let time = (tip.header.time + 64) & !0xf;
        let mut base = coinbase(tip.height + 1, 0);
        base.outputs = vec![TxOut::empty()];
        base.time = Some(time);

        let mut transactions = vec![base, coinstake(time, 10 * COIN)];
        transactions.extend(extra);
        assemble_block(tip.hash, time, 0x1f00ffff, transactions)
    }

    #[test]
    fn stake_block_shape() {
        let validator = validator(Arc::new(AcceptAllScriptVerifier));
        let tip = headers(validator.network(), 5);

        let good = stake_block(&tip, vec![]);
        assert!(good.is_proof_of_stake());
        assert_eq!(validator.check_block(&good, &mut context(&tip, &good)), Ok(()));

        let mut paying = stake_block(&tip, vec![]);
        paying.transactions[0].outputs = vec![TxOut::new(COIN, anyone_can_spend())];
        bulwark_test_utils::refresh_merkle_root(&mut paying);
        assert_eq!(
            validator.check_block(&paying, &mut context(&tip, &paying)),
            Err(ConsensusError::BadStakeBlock)
        );

        let time = good.header.time;
        let second = stake_block(&tip, vec![coinstake(time, COIN)]);
        assert_eq!(
            validator.check_block(&second, &mut context(&tip, &second)),
            Err(ConsensusError::BadMultipleCoinstake)
        );

        let mut late = spend(&[OutPoint::new(TxId::new([5; 32]), 0)], COIN);
        late.time = Some(time + 1);
        let late = stake_block(&tip, vec![late]);
        assert_eq!(
            validator.check_block(&late, &mut context(&tip, &late)),
            Err(ConsensusError::BlockTimeBeforeTrx)
        );

        let mut empty = spend(&[OutPoint::new(TxId::new([5; 32]), 0)], COIN);
        empty.outputs.push(TxOut::empty());
        let empty = stake_block(&tip, vec![empty]);
        assert_eq!(
            validator.check_block(&empty, &mut context(&tip, &empty)),
            Err(ConsensusError::BadTransactionEmptyOutput)
        );
    }

    #[test]
    fn stake_block_must_be_signed() {
        let validator = validator(Arc::new(RejectSignatures));
        let tip = headers(validator.network(), 5);
        let block = stake_block(&tip, vec![]);
        assert_eq!(
            validator.check_block(&block, &mut context(&tip, &block)),
            Err(ConsensusError::BadBlockSignature)
        );
    }

    #[test]
    fn work_blocks_end_at_last_pow_block() {
        let mut network = Network::pos_testnet();
        if let Some(params) = network.proof_of_stake.as_mut() {
            params.last_pow_block = 3;
        }
        let validator = validator_on(network, Arc::new(AcceptAllScriptVerifier));

        for (length, expected) in [(2, Ok(())), (3, Err(ConsensusError::ProofOfWorkTooHigh))] {
            let tip = headers(validator.network(), length);
            let block = assemble_block(tip.hash, tip.header.time + 64, 0x1f00ffff, vec![coinbase(length + 1, 0)]);
            let mut context = context(&tip, &block);
            context.next_work_required = Some(0x1f00ffff);
            assert_eq!(validator.contextual_check_block_header(&block, &mut context), expected);
        }
    }

    #[test]
    fn coinstake_timestamp_is_checked() {
        let validator = validator(Arc::new(AcceptAllScriptVerifier));
        let tip = headers(validator.network(), 5);

        let mut block = stake_block(&tip, vec![]);
        block.header.time += 1;
        let mut context = context(&tip, &block);
        context.next_work_required = Some(block.header.bits);
        assert_eq!(
            validator.contextual_check_block_header(&block, &mut context),
            Err(ConsensusError::StakeTimeViolation)
        );
    }

    #[test]
    fn coinstake_reward_limit() {
        let validator = validator(Arc::new(AcceptAllScriptVerifier));
        let tip = headers(validator.network(), 5);
        let block = stake_block(&tip, vec![]);

        // The coinstake pays out 10 coins
        let mut context = context(&tip, &block);
        context.stake_mut().total_coinstake_value_in = 9 * COIN - 5;
        assert_eq!(validator.check_block_reward(&block, &context, 5), Ok(()));
        assert_eq!(
            validator.check_block_reward(&block, &context, 4),
            Err(ConsensusError::BadCoinstakeAmount)
        );
    }

    #[test]
    fn coinstake_outputs_mature() {
        let validator = validator(Arc::new(AcceptAllScriptVerifier));
        let staked = coinstake(1_470_467_200, 10 * COIN);
        let coins = UnspentOutputs::from_transaction(&staked, 20);
        assert!(coins.coinstake);

        let mut spending = spend(&[OutPoint::new(staked.txid(), 1)], COIN);
        spending.time = Some(1_470_467_300);
        assert_eq!(
            validator.check_maturity(&coins, &spending, 29),
            Err(ConsensusError::BadTransactionPrematureCoinstakeSpending)
        );
        assert_eq!(validator.check_maturity(&coins, &spending, 30), Ok(()));

        spending.time = Some(1_470_467_100);
        assert_eq!(
            validator.check_maturity(&coins, &spending, 30),
            Err(ConsensusError::BadTransactionEarlyTimestamp)
        );
    }
}
