//! Domain layer for chain synchronization.
//!
//! Pure data types and helpers. No I/O.

pub mod block;
pub mod errors;
pub mod outcome;
pub mod peer;
pub mod rounds;
pub mod state;

pub use block::{
    is_block_chained, Block, BlockHeader, BlockId, BlockVerification, PublicKey, Transaction,
    TransactionId,
};
pub use errors::{ConfigError, LedgerError, PeerError, PoolError, SyncError, SyncResult};
pub use outcome::{BlockClassification, GeneratorCheck, ProcessOutcome, UnchainedStatus};
pub use peer::{
    median_height, ForkStatus, NetworkSnapshot, Peer, PeerAddress, PeerState,
    PeerVerificationResult,
};
pub use rounds::{calculate_round, slot_number, slot_time, RoundInfo};
pub use state::RuntimeState;
