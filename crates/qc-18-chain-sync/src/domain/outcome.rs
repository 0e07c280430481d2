//! Block classification and processing outcomes.

use super::block::{PublicKey, TransactionId};

/// Final result of processing one block. Produced exactly once per block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessOutcome {
    Accepted,
    DiscardedButCanBeBroadcasted,
    Rejected,
    Rollback,
}

impl ProcessOutcome {
    /// Outcomes after which the block may be relayed to other peers.
    pub fn is_broadcastable(&self) -> bool {
        matches!(
            self,
            ProcessOutcome::Accepted | ProcessOutcome::DiscardedButCanBeBroadcasted
        )
    }
}

/// Why a block does not extend the current tip.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UnchainedStatus {
    NotReadyToAcceptNewHeight,
    ExceededNotReadyToAcceptNewHeightMaxAttempts,
    AlreadyInBlockchain,
    EqualToLastBlock,
    InvalidTimestamp,
    /// A valid generator forged a competing block at the tip height.
    DoubleForging { generator_active: bool },
    GeneratorMismatch,
}

/// Tagged classification produced by the pipeline before side effects run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlockClassification {
    Exception { already_persisted: bool },
    VerificationFailed { errors: Vec<String> },
    IncompatibleVersions,
    InvalidNonce { sender: PublicKey, nonce: Option<u64> },
    Unchained(UnchainedStatus),
    InvalidGenerator,
    AlreadyForged(Vec<TransactionId>),
    Accept,
}

/// Whether the generator of a block was scheduled for its slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GeneratorCheck {
    Valid,
    Invalid { expected: PublicKey },
    /// No delegate list available for the round.
    Undetermined,
}

impl GeneratorCheck {
    pub fn is_valid(&self) -> bool {
        matches!(self, GeneratorCheck::Valid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcastable_outcomes() {
        assert!(ProcessOutcome::Accepted.is_broadcastable());
        assert!(ProcessOutcome::DiscardedButCanBeBroadcasted.is_broadcastable());
        assert!(!ProcessOutcome::Rejected.is_broadcastable());
        assert!(!ProcessOutcome::Rollback.is_broadcastable());
    }
}
