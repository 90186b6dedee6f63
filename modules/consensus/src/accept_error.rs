//! Error types for block acceptance.

use bulwark_common::{BlockHash, ConsensusError};

/// Errors returned while accepting a block into the chain.
///
/// Rule violations reject the block and leave the loop running; anything
/// else means a collaborator failed and the loop must stop.
#[derive(Debug, thiserror::Error)]
pub enum BlockAcceptError {
    /// The block broke a consensus rule.
    #[error("block {hash} rejected: {error}")]
    Consensus { hash: BlockHash, error: ConsensusError },

    /// The coin view, stake store or block source failed.
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

impl BlockAcceptError {
    /// The rule violated, if this is a rejection
    pub fn consensus_error(&self) -> Option<ConsensusError> {
        match self {
            BlockAcceptError::Consensus { error, .. } => Some(*error),
            BlockAcceptError::Fatal(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_carries_rule() {
        let error = BlockAcceptError::Consensus {
            hash: BlockHash::new([1; 32]),
            error: ConsensusError::BadMerkleRoot,
        };
        assert_eq!(error.consensus_error(), Some(ConsensusError::BadMerkleRoot));
        assert!(error.to_string().contains("rejected"));

        let fatal = BlockAcceptError::from(anyhow::anyhow!("disk gone"));
        assert_eq!(fatal.consensus_error(), None);
        assert_eq!(fatal.to_string(), "disk gone");
    }
}
