//! Rule-set variants in force for a block

use crate::threshold_cache::ThresholdState;
use bulwark_common::chain::ChainedBlock;
use bulwark_common::params::{DeploymentId, Network};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Script verification flags handed to the external verifier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptFlags {
    /// BIP16 pay-to-script-hash
    pub p2sh: bool,

    /// BIP66 strict DER signatures
    pub der_sig: bool,

    /// BIP65 CHECKLOCKTIMEVERIFY
    pub check_lock_time_verify: bool,

    /// BIP112 CHECKSEQUENCEVERIFY
    pub check_sequence_verify: bool,

    /// BIP141 witness programs
    pub witness: bool,

    /// BIP147 null multisig dummy
    pub null_dummy: bool,
}

/// Lock-time evaluation modes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockTimeFlags {
    /// BIP68 relative lock-times from input sequence numbers
    pub verify_sequence: bool,

    /// BIP113 median-time-past as the lock-time cutoff
    pub median_time_past: bool,
}

/// Everything that varies with height and activation state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusFlags {
    pub script_flags: ScriptFlags,
    pub lock_time_flags: LockTimeFlags,

    /// Reject transactions overwriting unspent ones (BIP30)
    pub enforce_bip30: bool,

    /// Require the height in the coinbase (BIP34)
    pub enforce_bip34: bool,
}

impl ConsensusFlags {
    /// Flags for `block`, given the deployment states as of its parent
    pub fn new(
        block: &ChainedBlock,
        states: &BTreeMap<DeploymentId, ThresholdState>,
        network: &Network,
    ) -> Self {
        let active = |id: DeploymentId| states.get(&id) == Some(&ThresholdState::Active);
        let height = block.height;

        let mut flags = ConsensusFlags::default();

        flags.script_flags.p2sh = block.time() >= network.bip16_time;
        flags.script_flags.der_sig = height >= network.buried.bip66;
        flags.script_flags.check_lock_time_verify = height >= network.buried.bip65;

        if active(DeploymentId::Csv) {
            flags.script_flags.check_sequence_verify = true;
            flags.lock_time_flags.verify_sequence = true;
            flags.lock_time_flags.median_time_past = true;
        }

        if active(DeploymentId::Segwit) {
            flags.script_flags.witness = true;
            flags.script_flags.null_dummy = true;
        }

        // BIP30 is implied by BIP34 once the activation block is the known one
        let bip34_block = block.previous.as_ref().and_then(|prev| prev.ancestor(network.buried.bip34));
        flags.enforce_bip30 = match (network.bip34_hash, bip34_block) {
            (Some(expected), Some(found)) => found.hash != expected,
            _ => true,
        };

        flags.enforce_bip34 = height >= network.buried.bip34;
        flags
    }
}
