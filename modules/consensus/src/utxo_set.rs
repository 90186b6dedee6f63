//! Per-block working set of unspent outputs

use bulwark_common::{Amount, ConsensusError, OutPoint, Transaction, TxId, TxOut};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// All outputs of one transaction as currently known
///
/// The output array never changes length after construction: spending an
/// output only clears its slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnspentOutputs {
    pub txid: TxId,
    pub version: i32,

    /// Created by a coinbase
    pub coinbase: bool,

    /// Created by a coinstake
    pub coinstake: bool,

    /// Height of the block that created the outputs
    pub height: u32,

    /// Timestamp of the creating transaction (zero on chains without one)
    pub time: u32,

    outputs: Vec<Option<TxOut>>,
}

impl UnspentOutputs {
    pub fn new(
        txid: TxId,
        version: i32,
        coinbase: bool,
        coinstake: bool,
        height: u32,
        time: u32,
        outputs: Vec<Option<TxOut>>,
    ) -> Self {
        Self {
            txid,
            version,
            coinbase,
            coinstake,
            height,
            time,
            outputs,
        }
    }

    /// Outputs of a newly validated transaction
    pub fn from_transaction(tx: &Transaction, height: u32) -> Self {
        Self {
            txid: tx.txid(),
            version: tx.version,
            coinbase: tx.is_coinbase(),
            coinstake: tx.is_coinstake(),
            height,
            time: tx.time.unwrap_or(0),
            outputs: tx.outputs.iter().cloned().map(Some).collect(),
        }
    }

    pub fn outputs(&self) -> &[Option<TxOut>] {
        &self.outputs
    }

    /// The output at `n` if it exists and is unspent
    pub fn output(&self, n: u32) -> Option<&TxOut> {
        self.outputs.get(n as usize).and_then(|o| o.as_ref())
    }

    pub fn is_available(&self, n: u32) -> bool {
        self.output(n).is_some()
    }

    /// Spend an output, returning it if it was available
    pub fn spend(&mut self, n: u32) -> Option<TxOut> {
        self.outputs.get_mut(n as usize).and_then(|o| o.take())
    }

    /// True if no output has been spent yet
    pub fn is_full(&self) -> bool {
        self.outputs.iter().all(|o| o.is_some())
    }

    /// True once every remaining output is an unspendable marker
    pub fn is_prunable(&self) -> bool {
        self.outputs.iter().flatten().all(|o| o.script_pubkey.is_unspendable())
    }

    pub fn unspent_count(&self) -> usize {
        self.outputs.iter().flatten().count()
    }
}

/// The outputs referenced by the block being executed, keyed by txid
#[derive(Debug, Clone, Default)]
pub struct UnspentOutputSet {
    unspents: HashMap<TxId, UnspentOutputs>,
}

impl UnspentOutputSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load fetched records into the set
    pub fn set_coins(&mut self, coins: impl IntoIterator<Item = UnspentOutputs>) {
        for record in coins {
            self.unspents.insert(record.txid, record);
        }
    }

    pub fn access_coins(&self, txid: &TxId) -> Option<&UnspentOutputs> {
        self.unspents.get(txid)
    }

    /// The unspent output an outpoint refers to
    pub fn get_output(&self, outpoint: &OutPoint) -> Option<&TxOut> {
        self.unspents.get(&outpoint.hash).and_then(|coins| coins.output(outpoint.n))
    }

    /// True if every input of the transaction refers to an unspent output
    pub fn have_inputs(&self, tx: &Transaction) -> bool {
        tx.inputs.iter().all(|input| self.get_output(&input.prevout).is_some())
    }

    /// Sum of the values the transaction spends, `None` if an input is missing
    pub fn value_in(&self, tx: &Transaction) -> Option<Amount> {
        tx.inputs.iter().try_fold(0 as Amount, |acc, input| {
            self.get_output(&input.prevout).map(|out| acc.saturating_add(out.value))
        })
    }

    /// Spend one output
    pub fn spend(&mut self, outpoint: &OutPoint) -> Result<TxOut, ConsensusError> {
        self.unspents
            .get_mut(&outpoint.hash)
            .and_then(|coins| coins.spend(outpoint.n))
            .ok_or(ConsensusError::BadTransactionMissingInput)
    }

    /// Apply a transaction: spend its inputs and add its own outputs
    pub fn update(&mut self, tx: &Transaction, height: u32) -> Result<(), ConsensusError> {
        if !tx.is_coinbase() {
            for input in &tx.inputs {
                self.spend(&input.prevout)?;
            }
        }

        let record = UnspentOutputs::from_transaction(tx, height);
        self.unspents.insert(record.txid, record);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.unspents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.unspents.is_empty()
    }

    /// Every record the block touched, to persist as a changeset
    pub fn into_changes(self) -> Vec<UnspentOutputs> {
        self.unspents.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulwark_common::script::{Script, OP_RETURN};
    use bulwark_common::TxIn;

    fn tx_with_outputs(values: &[Amount]) -> Transaction {
        Transaction {
            version: 1,
            time: None,
            inputs: vec![TxIn::new(OutPoint::null(), Script::from(vec![1, 1]))],
            outputs: values.iter().map(|v| TxOut::new(*v, Script::from(vec![0x51]))).collect(),
            lock_time: 0,
        }
    }

    fn spending(prev: &Transaction, n: u32, value: Amount) -> Transaction {
        Transaction {
            version: 1,
            time: None,
            inputs: vec![TxIn::new(OutPoint::new(prev.txid(), n), Script::default())],
            outputs: vec![TxOut::new(value, Script::from(vec![0x51]))],
            lock_time: 0,
        }
    }

    #[test]
    fn spend_clears_slot_but_keeps_length() {
        let tx = tx_with_outputs(&[10, 20]);
        let mut coins = UnspentOutputs::from_transaction(&tx, 5);
        assert!(coins.is_full());
        assert_eq!(coins.spend(0).unwrap().value, 10);
        assert!(coins.spend(0).is_none());
        assert_eq!(coins.outputs().len(), 2);
        assert!(!coins.is_full());
        assert_eq!(coins.unspent_count(), 1);
        assert!(coins.spend(7).is_none());
    }

    #[test]
    fn prunable_once_only_markers_remain() {
        let mut tx = tx_with_outputs(&[10]);
        tx.outputs.push(TxOut::new(0, Script::new().push_opcode(OP_RETURN)));
        let mut coins = UnspentOutputs::from_transaction(&tx, 1);
        assert!(!coins.is_prunable());
        coins.spend(0);
        assert!(coins.is_prunable());
    }

    #[test]
    fn double_spend_within_block_is_missing_input() {
        let funding = tx_with_outputs(&[100]);
        let mut set = UnspentOutputSet::new();
        set.set_coins([UnspentOutputs::from_transaction(&funding, 1)]);

        let first = spending(&funding, 0, 90);
        assert!(set.have_inputs(&first));
        set.update(&first, 2).unwrap();

        let second = spending(&funding, 0, 80);
        assert!(!set.have_inputs(&second));
        assert_eq!(set.update(&second, 2), Err(ConsensusError::BadTransactionMissingInput));
    }

    #[test]
    fn value_in_sums_inputs() {
        let funding = tx_with_outputs(&[100, 50]);
        let mut set = UnspentOutputSet::new();
        set.set_coins([UnspentOutputs::from_transaction(&funding, 1)]);

        let mut tx = spending(&funding, 0, 10);
        tx.inputs.push(TxIn::new(OutPoint::new(funding.txid(), 1), Script::default()));
        assert_eq!(set.value_in(&tx), Some(150));

        tx.inputs.push(TxIn::new(OutPoint::new(funding.txid(), 9), Script::default()));
        assert_eq!(set.value_in(&tx), None);
    }

    #[test]
    fn changes_include_new_outputs() {
        let funding = tx_with_outputs(&[100]);
        let mut set = UnspentOutputSet::new();
        set.set_coins([UnspentOutputs::from_transaction(&funding, 1)]);
        let spend = spending(&funding, 0, 90);
        set.update(&spend, 2).unwrap();

        let changes = set.into_changes();
        assert_eq!(changes.len(), 2);
        let spent = changes.iter().find(|c| c.txid == funding.txid()).unwrap();
        assert!(spent.is_prunable());
        let created = changes.iter().find(|c| c.txid == spend.txid()).unwrap();
        assert_eq!(created.height, 2);
    }
}
