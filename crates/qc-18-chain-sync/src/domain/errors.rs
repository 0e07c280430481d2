//! Error types for the chain sync subsystem.

use super::block::BlockId;
use super::peer::PeerAddress;

/// Errors from a single peer request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeerError {
    #[error("Request to {0} timed out")]
    Timeout(PeerAddress),

    #[error("Connection to {0} refused")]
    ConnectionRefused(PeerAddress),

    #[error("Protocol error from {peer}: {reason}")]
    Protocol { peer: PeerAddress, reason: String },

    #[error("Peer {peer} rejected: {reason}")]
    Rejected { peer: PeerAddress, reason: String },
}

impl PeerError {
    /// Short label used to group errors in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            PeerError::Timeout(_) => "timeout",
            PeerError::ConnectionRefused(_) => "connection refused",
            PeerError::Protocol { .. } => "protocol",
            PeerError::Rejected { .. } => "rejected",
        }
    }
}

/// Errors from the ledger collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Block not found: {0}")]
    NotFound(BlockId),

    #[error("Ledger integrity violated: {0}")]
    Integrity(String),
}

/// Errors from the transaction pool collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Transaction pool error: {0}")]
pub struct PoolError(pub String);

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}

/// Chain sync error types.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Peer(#[from] PeerError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("No seed peers configured")]
    NoSeedPeers,

    #[error("Genesis payload hash mismatch: expected {expected}, got {actual}")]
    GenesisMismatch { expected: String, actual: String },

    #[error("Sync engine is stopped")]
    Stopped,
}

pub type SyncResult<T> = Result<T, SyncError>;
