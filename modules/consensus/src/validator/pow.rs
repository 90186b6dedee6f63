//! Proof-of-work chain rules

use super::{check_coinbase_maturity, check_pow_block_reward, contextual_check_block_header, BlockValidator};
use crate::context::ContextInformation;
use crate::interfaces::ScriptVerifier;
use crate::script_checks::ScriptCheckPool;
use crate::utxo_set::UnspentOutputs;
use bulwark_common::params::{get_work_required, Network};
use bulwark_common::target::check_proof_of_work;
use bulwark_common::{Amount, Block, ConsensusError, Transaction};
use std::sync::Arc;

pub struct PowValidator {
    network: Arc<Network>,
    verifier: Arc<dyn ScriptVerifier>,
    script_pool: ScriptCheckPool,
}

impl PowValidator {
    pub fn new(network: Arc<Network>, verifier: Arc<dyn ScriptVerifier>, script_pool: ScriptCheckPool) -> Self {
        Self {
            network,
            verifier,
            script_pool,
        }
    }
}

impl BlockValidator for PowValidator {
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
        if context.check_pow && !check_proof_of_work(&block.hash(), block.header.bits, &self.network.pow_limit()) {
            return Err(ConsensusError::HighHash);
        }

        context.next_work_required =
            Some(get_work_required(&context.best_block.chained, &block.header, &self.network));
        Ok(())
    }

    fn contextual_check_block_header(
        &self,
        block: &Block,
        context: &mut ContextInformation,
    ) -> Result<(), ConsensusError> {
        contextual_check_block_header(&self.network, block, context)
    }

    fn check_maturity(
        &self,
        coins: &UnspentOutputs,
        _tx: &Transaction,
        spend_height: u32,
    ) -> Result<(), ConsensusError> {
        check_coinbase_maturity(&self.network, coins, spend_height)
    }

    fn check_block_reward(
        &self,
        block: &Block,
        context: &ContextInformation,
        fees: Amount,
    ) -> Result<(), ConsensusError> {
        check_pow_block_reward(&self.network, block, context.height(), fees)
    }
}
