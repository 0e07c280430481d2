//! Driven ports (outbound dependencies).
//!
//! Chain sync depends on the ledger, the transaction pool, the peer transport,
//! the peer store and an event sink. All of them are injected.

use crate::domain::{
    Block, BlockId, LedgerError, Peer, PeerAddress, PeerError, PeerState, PoolError, PublicKey,
    RoundInfo, Transaction, TransactionId,
};
use async_trait::async_trait;
use std::time::Duration;

/// Ledger and persistence collaborator.
#[async_trait]
pub trait Database: Send + Sync {
    /// Current tip of the persisted chain.
    async fn get_last_block(&self) -> Result<Block, LedgerError>;

    async fn get_block(&self, id: &BlockId) -> Result<Option<Block>, LedgerError>;

    /// Blocks in ascending height order starting at `from_height`.
    async fn get_blocks(&self, from_height: u64, limit: usize) -> Result<Vec<Block>, LedgerError>;

    /// Apply a block to ledger and wallet state and persist it.
    async fn apply_block(&self, block: &Block) -> Result<(), LedgerError>;

    /// Undo the effects of the current tip and delete it.
    async fn revert_block(&self, block: &Block) -> Result<(), LedgerError>;

    /// Delete the `count` highest blocks without replaying wallet effects.
    async fn remove_top_blocks(&self, count: u64) -> Result<(), LedgerError>;

    /// Integrity check of the persisted chain.
    async fn verify_blockchain(&self) -> Result<bool, LedgerError>;

    /// Subset of `ids` that are already persisted.
    async fn get_forged_transaction_ids(
        &self,
        ids: &[TransactionId],
    ) -> Result<Vec<TransactionId>, LedgerError>;

    /// Delegates scheduled to forge in `round`, in slot order.
    async fn get_active_delegates(&self, round: &RoundInfo)
        -> Result<Vec<PublicKey>, LedgerError>;

    /// Last nonce applied for `sender`.
    async fn wallet_nonce(&self, sender: &PublicKey) -> Result<u64, LedgerError>;

    /// Verify a transaction against current wallet state.
    async fn verify_transaction(&self, transaction: &Transaction) -> Result<bool, LedgerError>;
}

/// Pending transaction pool collaborator.
#[async_trait]
pub trait TransactionPool: Send + Sync {
    async fn accept_chained_block(&self, block: &Block) -> Result<(), PoolError>;

    async fn get_all_transactions(&self) -> Vec<Transaction>;

    async fn flush(&self);

    /// Reset the pool's wallet view back to ledger state.
    async fn reset_wallets(&self);

    async fn add_transactions(&self, transactions: Vec<Transaction>);

    async fn remove_transactions_by_id(&self, ids: &[TransactionId]);
}

/// Wire transport to remote peers.
#[async_trait]
pub trait PeerCommunicator: Send + Sync {
    async fn ping(
        &self,
        peer: &PeerAddress,
        timeout: Duration,
        force: bool,
    ) -> Result<PeerState, PeerError>;

    async fn get_peers(&self, peer: &PeerAddress) -> Result<Vec<PeerAddress>, PeerError>;

    /// Blocks above `from_height`, at most `limit` of them.
    async fn get_peer_blocks(
        &self,
        peer: &PeerAddress,
        from_height: u64,
        limit: usize,
    ) -> Result<Vec<Block>, PeerError>;

    async fn post_block(&self, peer: &PeerAddress, block: &Block) -> Result<(), PeerError>;
}

/// Store of known peers.
pub trait PeerRepository: Send + Sync {
    fn get_peers(&self) -> Vec<Peer>;

    fn get_peer(&self, address: &PeerAddress) -> Option<Peer>;

    /// Insert or replace a peer.
    fn update_peer(&self, peer: Peer);

    fn forget_peer(&self, address: &PeerAddress);

    fn peer_count(&self) -> usize {
        self.get_peers().len()
    }

    fn has_peers(&self) -> bool {
        self.peer_count() > 0
    }

    fn has_peer(&self, address: &PeerAddress) -> bool {
        self.get_peer(address).is_some()
    }
}

/// Options for peer acceptance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AcceptOptions {
    pub seed: bool,
    pub less_verbose: bool,
}

/// External validation and registration of newly seen peers.
#[async_trait]
pub trait PeerAcceptance: Send + Sync {
    async fn validate_and_accept_peer(
        &self,
        address: &PeerAddress,
        options: AcceptOptions,
    ) -> Result<(), PeerError>;
}

/// Notifications published by the sync engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncNotification {
    PeerDisconnect(PeerAddress),
    PeerRemoved(PeerAddress),
    StateStarted,
    BlockReceived(BlockId),
    BlockDisregarded(BlockId),
    ForkDetected { height: u64 },
}

/// Sink for sync notifications.
pub trait EventDispatcher: Send + Sync {
    fn dispatch(&self, notification: SyncNotification);
}

/// Time source abstraction for testability.
pub trait TimeSource: Send + Sync {
    /// Seconds since the network epoch.
    fn now(&self) -> u64;
}
