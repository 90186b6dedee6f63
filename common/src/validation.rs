//! Consensus rule violations
//!
//! Every rule the engine enforces fails with exactly one of these. Each
//! carries a stable short code, shared with other implementations of the
//! same rules, and a human readable message.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Consensus rule violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Error)]
pub enum ConsensusError {
    // -- header
    #[error("block version too low")]
    BadVersion,

    #[error("proof of work failed")]
    HighHash,

    #[error("incorrect proof of work")]
    BadDiffBits,

    #[error("block's timestamp is too early")]
    TimeTooOld,

    #[error("block timestamp too far in the future")]
    TimeTooNew,

    #[error("proof of work block past the last proof of work height")]
    ProofOfWorkTooHigh,

    #[error("block was previously rejected")]
    BadBlockPreviouslyInvalid,

    // -- structure
    #[error("hashMerkleRoot mismatch")]
    BadMerkleRoot,

    #[error("duplicate transaction")]
    BadTransactionDuplicate,

    #[error("size limits failed")]
    BadBlockLength,

    #[error("first tx is not coinbase")]
    BadCoinbaseMissing,

    #[error("more than one coinbase")]
    BadMultipleCoinbase,

    #[error("out-of-bounds SigOpCount")]
    BadBlockSigOps,

    #[error("weight limit failed")]
    BadBlockWeight,

    // -- transaction sanity
    #[error("vin empty")]
    BadTransactionNoInput,

    #[error("vout empty")]
    BadTransactionNoOutput,

    #[error("size limits failed")]
    BadTransactionOversize,

    #[error("txout.nValue negative")]
    BadTransactionNegativeOutput,

    #[error("txout.nValue too large")]
    BadTransactionTooLargeOutput,

    #[error("txout total too large")]
    BadTransactionTooLargeTotalOutput,

    #[error("duplicate inputs")]
    BadTransactionDuplicateInputs,

    #[error("coinbase script size")]
    BadCoinbaseSize,

    #[error("prevout is null")]
    BadTransactionNullPrevout,

    #[error("non-final transaction")]
    BadTransactionNonFinal,

    #[error("block height mismatch in coinbase")]
    BadCoinbaseHeight,

    #[error("invalid witness nonce size")]
    BadWitnessNonceSize,

    #[error("witness merkle commitment mismatch")]
    BadWitnessMerkleMatch,

    #[error("unexpected witness data found")]
    UnexpectedWitness,

    // -- execution
    #[error("tried to overwrite transaction")]
    BadTransactionBIP30,

    #[error("input missing/spent")]
    BadTransactionMissingInput,

    #[error("tried to spend coinbase at depth less than maturity")]
    BadTransactionPrematureCoinbaseSpending,

    #[error("tried to spend coinstake at depth less than maturity")]
    BadTransactionPrematureCoinstakeSpending,

    #[error("input values out of range")]
    BadTransactionInputValueOutOfRange,

    #[error("value in < value out")]
    BadTransactionInBelowOut,

    #[error("fee is negative")]
    BadTransactionNegativeFee,

    #[error("fee out of range")]
    BadTransactionFeeOutOfRange,

    #[error("a script failed verification")]
    BadTransactionScriptError,

    #[error("coinbase pays too much")]
    BadCoinbaseAmount,

    #[error("coinstake pays too much")]
    BadCoinstakeAmount,

    // -- proof of stake
    #[error("bad proof of stake block shape")]
    BadStakeBlock,

    #[error("more than one coinstake")]
    BadMultipleCoinstake,

    #[error("transaction output empty")]
    BadTransactionEmptyOutput,

    #[error("block timestamp earlier than transaction timestamp")]
    BlockTimeBeforeTrx,

    #[error("transaction timestamp earlier than input transaction")]
    BadTransactionEarlyTimestamp,

    #[error("bad block signature")]
    BadBlockSignature,

    #[error("called on non-coinstake")]
    NonCoinstake,

    #[error("read previous transaction failed")]
    ReadTxPrevFailed,

    #[error("verify signature failed on coinstake")]
    CoinstakeVerifySignatureFailed,

    #[error("tried to stake at depth less than the minimum confirmations")]
    InvalidStakeDepth,

    #[error("minimum age violation")]
    MinAgeViolation,

    #[error("stake time violation")]
    StakeTimeViolation,

    #[error("proof-of-stake target is invalid")]
    StakeHashInvalidTarget,

    #[error("kernel hash exceeds the weighted target")]
    StakeHashExceedsTarget,

    #[error("previous stake is not found")]
    PrevStakeNull,

    #[error("unable to get the stake modifier")]
    ModifierNotFound,

    #[error("unable to select a block for the stake modifier")]
    FailedSelectBlock,
}

impl ConsensusError {
    /// Stable short identifier of the violated rule
    pub fn code(&self) -> &'static str {
        use ConsensusError::*;
        match self {
            BadVersion => "bad-version",
            HighHash => "high-hash",
            BadDiffBits => "bad-diffbits",
            TimeTooOld => "time-too-old",
            TimeTooNew => "time-too-new",
            ProofOfWorkTooHigh => "proof-of-work-too-high",
            BadBlockPreviouslyInvalid => "bad-blk-previously-invalid",
            BadMerkleRoot => "bad-txnmrklroot",
            BadTransactionDuplicate => "bad-txns-duplicate",
            BadBlockLength => "bad-blk-length",
            BadCoinbaseMissing => "bad-cb-missing",
            BadMultipleCoinbase => "bad-cb-multiple",
            BadBlockSigOps => "bad-blk-sigops",
            BadBlockWeight => "bad-blk-weight",
            BadTransactionNoInput => "bad-txns-vin-empty",
            BadTransactionNoOutput => "bad-txns-vout-empty",
            BadTransactionOversize => "bad-txns-oversize",
            BadTransactionNegativeOutput => "bad-txns-vout-negative",
            BadTransactionTooLargeOutput => "bad-txns-vout-toolarge",
            BadTransactionTooLargeTotalOutput => "bad-txns-txouttotal-toolarge",
            BadTransactionDuplicateInputs => "bad-txns-inputs-duplicate",
            BadCoinbaseSize => "bad-cb-length",
            BadTransactionNullPrevout => "bad-txns-prevout-null",
            BadTransactionNonFinal => "bad-txns-nonfinal",
            BadCoinbaseHeight => "bad-cb-height",
            BadWitnessNonceSize => "bad-witness-nonce-size",
            BadWitnessMerkleMatch => "bad-witness-merkle-match",
            UnexpectedWitness => "unexpected-witness",
            BadTransactionBIP30 => "bad-txns-BIP30",
            BadTransactionMissingInput => "bad-txns-inputs-missingorspent",
            BadTransactionPrematureCoinbaseSpending => "bad-txns-premature-spend-of-coinbase",
            BadTransactionPrematureCoinstakeSpending => "bad-txns-premature-spend-of-coinstake",
            BadTransactionInputValueOutOfRange => "bad-txns-inputvalues-outofrange",
            BadTransactionInBelowOut => "bad-txns-in-belowout",
            BadTransactionNegativeFee => "bad-txns-fee-negative",
            BadTransactionFeeOutOfRange => "bad-txns-fee-outofrange",
            BadTransactionScriptError => "mandatory-script-verify-flag-failed",
            BadCoinbaseAmount => "bad-cb-amount",
            BadCoinstakeAmount => "bad-cs-amount",
            BadStakeBlock => "bad-stake-block",
            BadMultipleCoinstake => "bad-cs-multiple",
            BadTransactionEmptyOutput => "user-txout-empty",
            BlockTimeBeforeTrx => "block-time-before-trx",
            BadTransactionEarlyTimestamp => "bad-txns-early-timestamp",
            BadBlockSignature => "bad-block-signature",
            NonCoinstake => "non-coinstake",
            ReadTxPrevFailed => "read-txPrev-failed",
            CoinstakeVerifySignatureFailed => "verify-signature-failed-on-coinstake",
            InvalidStakeDepth => "invalid-stake-depth",
            MinAgeViolation => "min-age-violation",
            StakeTimeViolation => "stake-time-violation",
            StakeHashInvalidTarget => "proof-of-stake-hash-invalid-target",
            StakeHashExceedsTarget => "check-kernel-failed",
            PrevStakeNull => "prev-stake-null",
            ModifierNotFound => "unable-to-get-modifier",
            FailedSelectBlock => "failed-select-block",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(ConsensusError::BadTransactionInBelowOut => "bad-txns-in-belowout")]
    #[test_case(ConsensusError::BadCoinbaseAmount => "bad-cb-amount")]
    #[test_case(ConsensusError::BadTransactionMissingInput => "bad-txns-inputs-missingorspent")]
    #[test_case(ConsensusError::StakeHashExceedsTarget => "check-kernel-failed")]
    fn stable_codes(error: ConsensusError) -> &'static str {
        error.code()
    }

    #[test]
    fn message_is_display() {
        assert_eq!(ConsensusError::BadTransactionInBelowOut.to_string(), "value in < value out");
    }

    #[test]
    fn serialises_by_name() {
        let json = serde_json::to_string(&ConsensusError::HighHash).unwrap();
        assert_eq!(json, "\"HighHash\"");
    }
}
