//! Parallel script verification
//!
//! Input scripts of a block are queued while the block is executed and only
//! evaluated once every other rule has passed. Evaluation runs on a
//! dedicated rayon pool so it never blocks the async runtime's workers.

use crate::flags::ScriptFlags;
use crate::interfaces::ScriptVerifier;
use bulwark_common::{Block, Transaction, TxOut};
use rayon::prelude::*;
use rayon::ThreadPool;
use tracing::debug;

/// Number of verification threads when not configured
pub fn default_thread_count() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

/// One input awaiting verification
#[derive(Debug, Clone)]
pub struct ScriptCheck<'a> {
    pub tx: &'a Transaction,
    pub index: usize,
    pub spent: TxOut,
    pub flags: ScriptFlags,
}

impl ScriptCheck<'_> {
    pub fn run(&self, verifier: &dyn ScriptVerifier) -> bool {
        verifier.verify_input(self.tx, self.index, &self.spent, self.flags)
    }
}

pub struct ScriptCheckPool {
    pool: ThreadPool,
}

impl ScriptCheckPool {
    pub fn new(threads: usize) -> anyhow::Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("script-check-{}", i))
            .build()?;
        Ok(Self { pool })
    }

    /// Run all checks, true only if every one passes
    pub fn verify_all(&self, checks: &[ScriptCheck<'_>], verifier: &dyn ScriptVerifier) -> bool {
        if checks.is_empty() {
            return true;
        }
        debug!(count = checks.len(), "Verifying scripts");
        self.pool.install(|| checks.par_iter().all(|check| check.run(verifier)))
    }
}

/// Verifier that accepts every script and signature
///
/// For chains replayed from a trusted source where script evaluation is
/// handled elsewhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAllScriptVerifier;

impl ScriptVerifier for AcceptAllScriptVerifier {
    fn verify_input(&self, _tx: &Transaction, _index: usize, _spent: &TxOut, _flags: ScriptFlags) -> bool {
        true
    }

    fn verify_block_signature(&self, _block: &Block) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulwark_common::script::Script;
    use bulwark_common::{OutPoint, TxId, TxIn};

    /// Rejects inputs spending outputs of exactly this value
    struct RejectValue(i64);

    impl ScriptVerifier for RejectValue {
        fn verify_input(&self, _: &Transaction, _: usize, spent: &TxOut, _: ScriptFlags) -> bool {
            spent.value != self.0
        }

        fn verify_block_signature(&self, _: &Block) -> bool {
            true
        }
    }

    fn tx() -> Transaction {
        Transaction {
            version: 1,
            time: None,
            inputs: vec![TxIn::new(OutPoint::new(TxId::new([1; 32]), 0), Script::new())],
            outputs: vec![TxOut::new(1, Script::new())],
            lock_time: 0,
        }
    }

    #[test]
    fn all_checks_must_pass() {
        let pool = ScriptCheckPool::new(2).unwrap();
        let tx = tx();
        let mut checks: Vec<_> = (1..=50)
            .map(|value| ScriptCheck {
                tx: &tx,
                index: 0,
                spent: TxOut::new(value, Script::new()),
                flags: ScriptFlags::default(),
            })
            .collect();

        assert!(pool.verify_all(&checks, &RejectValue(0)));
        assert!(!pool.verify_all(&checks, &RejectValue(37)));

        checks.clear();
        assert!(pool.verify_all(&checks, &RejectValue(1)));
    }

    #[test]
    fn zero_threads_still_builds() {
        let pool = ScriptCheckPool::new(0).unwrap();
        assert!(pool.verify_all(&[], &AcceptAllScriptVerifier));
    }
}
