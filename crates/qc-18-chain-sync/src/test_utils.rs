//! Test utilities for chain sync.
//!
//! In-memory implementations of the outbound ports for deterministic tests.
//! Enable with the `test-utils` feature flag.
//!
//! # Example
//!
//! ```rust
//! use qc_18_chain_sync::test_utils::{build_chain, test_delegates};
//!
//! let chain = build_chain(5, 8, &test_delegates(3));
//! assert_eq!(chain.len(), 5);
//! assert_eq!(chain[4].height(), 5);
//! ```

use crate::domain::{
    Block, BlockHeader, BlockId, LedgerError, PeerAddress, PeerError, PeerState, PoolError,
    PublicKey, RoundInfo, Transaction, TransactionId,
};
use crate::ports::{
    AcceptOptions, Database, EventDispatcher, PeerAcceptance, PeerCommunicator, PeerRepository,
    SyncNotification, TimeSource, TransactionPool,
};
use crate::adapters::InMemoryPeerRepository;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Delegate keys `delegate-0..n`.
pub fn test_delegates(count: usize) -> Vec<PublicKey> {
    (0..count)
        .map(|i| PublicKey::new(format!("delegate-{i}")))
        .collect()
}

/// Address `10.0.0.n:4002`.
pub fn peer_address(n: u8) -> PeerAddress {
    PeerAddress::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, n)), 4002)
}

/// Header at `height` on the canonical test chain: one block per slot,
/// generator picked from `delegates` by slot.
pub fn header_at(height: u64, block_time: u64, delegates: &[PublicKey]) -> BlockHeader {
    let slot = height.saturating_sub(1);
    let generator = if delegates.is_empty() {
        PublicKey::new("unknown")
    } else {
        delegates[(slot % delegates.len() as u64) as usize].clone()
    };

    BlockHeader {
        id: BlockId::new(format!("block-{height}")),
        version: 0,
        height,
        previous_block: BlockId::new(format!("block-{}", height.saturating_sub(1))),
        timestamp: slot * block_time,
        generator_public_key: generator,
        payload_hash: format!("payload-{height}"),
        number_of_transactions: 0,
    }
}

/// Chained blocks at heights `1..=length`.
pub fn build_chain(length: u64, block_time: u64, delegates: &[PublicKey]) -> Vec<Block> {
    (1..=length)
        .map(|height| Block::new(header_at(height, block_time, delegates), Vec::new()))
        .collect()
}

/// Block at `height` carrying `transactions`.
pub fn block_with_transactions(
    height: u64,
    block_time: u64,
    delegates: &[PublicKey],
    transactions: Vec<Transaction>,
) -> Block {
    let mut header = header_at(height, block_time, delegates);
    header.number_of_transactions = transactions.len();
    Block::new(header, transactions)
}

/// In-memory ledger.
pub struct InMemoryLedger {
    blocks: RwLock<Vec<Block>>,
    delegates: RwLock<Vec<PublicKey>>,
    nonces: RwLock<HashMap<PublicKey, u64>>,
    invalid_transactions: RwLock<HashSet<TransactionId>>,
    fail_apply: AtomicBool,
    /// Integrity check fails while any block is above this height.
    corrupt_above: RwLock<Option<u64>>,
    apply_delay: RwLock<Option<Duration>>,
    applying: AtomicBool,
    pub apply_calls: AtomicUsize,
    pub revert_calls: AtomicUsize,
    /// Reverts that ran while a block was being applied.
    pub overlapping_reverts: AtomicUsize,
}

impl InMemoryLedger {
    pub fn new(blocks: Vec<Block>, delegates: Vec<PublicKey>) -> Self {
        Self {
            blocks: RwLock::new(blocks),
            delegates: RwLock::new(delegates),
            nonces: RwLock::new(HashMap::new()),
            invalid_transactions: RwLock::new(HashSet::new()),
            fail_apply: AtomicBool::new(false),
            corrupt_above: RwLock::new(None),
            apply_delay: RwLock::new(None),
            applying: AtomicBool::new(false),
            apply_calls: AtomicUsize::new(0),
            revert_calls: AtomicUsize::new(0),
            overlapping_reverts: AtomicUsize::new(0),
        }
    }

    pub fn height(&self) -> u64 {
        self.blocks.read().last().map_or(0, Block::height)
    }

    pub fn blocks(&self) -> Vec<Block> {
        self.blocks.read().clone()
    }

    pub fn set_nonce(&self, sender: &PublicKey, nonce: u64) {
        self.nonces.write().insert(sender.clone(), nonce);
    }

    pub fn set_delegates(&self, delegates: Vec<PublicKey>) {
        *self.delegates.write() = delegates;
    }

    pub fn mark_invalid(&self, id: &TransactionId) {
        self.invalid_transactions.write().insert(id.clone());
    }

    pub fn set_fail_apply(&self, fail: bool) {
        self.fail_apply.store(fail, Ordering::SeqCst);
    }

    pub fn set_corrupt_above(&self, height: Option<u64>) {
        *self.corrupt_above.write() = height;
    }

    /// Make every `apply_block` take at least `delay`.
    pub fn set_apply_delay(&self, delay: Option<Duration>) {
        *self.apply_delay.write() = delay;
    }

    fn write_block(&self, block: &Block) -> Result<(), LedgerError> {
        if self.fail_apply.load(Ordering::SeqCst) {
            return Err(LedgerError::Storage("apply failed".into()));
        }

        let mut nonces = self.nonces.write();
        for tx in &block.transactions {
            if let Some(nonce) = tx.nonce {
                nonces.insert(tx.sender_public_key.clone(), nonce);
            }
        }
        self.blocks.write().push(block.clone());
        Ok(())
    }
}

#[async_trait]
impl Database for InMemoryLedger {
    async fn get_last_block(&self) -> Result<Block, LedgerError> {
        self.blocks
            .read()
            .last()
            .cloned()
            .ok_or_else(|| LedgerError::Storage("empty ledger".into()))
    }

    async fn get_block(&self, id: &BlockId) -> Result<Option<Block>, LedgerError> {
        Ok(self.blocks.read().iter().find(|b| b.id() == id).cloned())
    }

    async fn get_blocks(&self, from_height: u64, limit: usize) -> Result<Vec<Block>, LedgerError> {
        Ok(self
            .blocks
            .read()
            .iter()
            .filter(|b| b.height() >= from_height)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn apply_block(&self, block: &Block) -> Result<(), LedgerError> {
        self.apply_calls.fetch_add(1, Ordering::SeqCst);
        self.applying.store(true, Ordering::SeqCst);

        let delay = *self.apply_delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let result = self.write_block(block);
        self.applying.store(false, Ordering::SeqCst);
        result
    }

    async fn revert_block(&self, block: &Block) -> Result<(), LedgerError> {
        self.revert_calls.fetch_add(1, Ordering::SeqCst);
        if self.applying.load(Ordering::SeqCst) {
            self.overlapping_reverts.fetch_add(1, Ordering::SeqCst);
        }
        let mut blocks = self.blocks.write();
        match blocks.last() {
            Some(last) if last.id() == block.id() => {
                blocks.pop();
                Ok(())
            }
            _ => Err(LedgerError::NotFound(block.id().clone())),
        }
    }

    async fn remove_top_blocks(&self, count: u64) -> Result<(), LedgerError> {
        let mut blocks = self.blocks.write();
        let keep = blocks.len().saturating_sub(count as usize).max(1);
        blocks.truncate(keep);
        Ok(())
    }

    async fn verify_blockchain(&self) -> Result<bool, LedgerError> {
        let corrupt_above = *self.corrupt_above.read();
        Ok(match corrupt_above {
            Some(limit) => self.height() <= limit,
            None => true,
        })
    }

    async fn get_forged_transaction_ids(
        &self,
        ids: &[TransactionId],
    ) -> Result<Vec<TransactionId>, LedgerError> {
        let blocks = self.blocks.read();
        let forged: HashSet<&TransactionId> = blocks
            .iter()
            .flat_map(|b| b.transactions.iter().map(|tx| &tx.id))
            .collect();
        Ok(ids.iter().filter(|id| forged.contains(id)).cloned().collect())
    }

    async fn get_active_delegates(
        &self,
        _round: &RoundInfo,
    ) -> Result<Vec<PublicKey>, LedgerError> {
        Ok(self.delegates.read().clone())
    }

    async fn wallet_nonce(&self, sender: &PublicKey) -> Result<u64, LedgerError> {
        Ok(self.nonces.read().get(sender).copied().unwrap_or(0))
    }

    async fn verify_transaction(&self, transaction: &Transaction) -> Result<bool, LedgerError> {
        Ok(!self.invalid_transactions.read().contains(&transaction.id))
    }
}

/// Transaction pool that records calls.
#[derive(Default)]
pub struct MockTransactionPool {
    transactions: RwLock<Vec<Transaction>>,
    fail_accept: AtomicBool,
    pub flush_count: AtomicUsize,
    pub reset_count: AtomicUsize,
    pub accepted_blocks: AtomicUsize,
}

impl MockTransactionPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transactions(transactions: Vec<Transaction>) -> Self {
        let pool = Self::new();
        *pool.transactions.write() = transactions;
        pool
    }

    pub fn set_fail_accept(&self, fail: bool) {
        self.fail_accept.store(fail, Ordering::SeqCst);
    }

    pub fn transaction_ids(&self) -> Vec<TransactionId> {
        self.transactions.read().iter().map(|tx| tx.id.clone()).collect()
    }
}

#[async_trait]
impl TransactionPool for MockTransactionPool {
    async fn accept_chained_block(&self, _block: &Block) -> Result<(), PoolError> {
        if self.fail_accept.load(Ordering::SeqCst) {
            return Err(PoolError("wallet out of sync".into()));
        }
        self.accepted_blocks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_all_transactions(&self) -> Vec<Transaction> {
        self.transactions.read().clone()
    }

    async fn flush(&self) {
        self.flush_count.fetch_add(1, Ordering::SeqCst);
        self.transactions.write().clear();
    }

    async fn reset_wallets(&self) {
        self.reset_count.fetch_add(1, Ordering::SeqCst);
    }

    async fn add_transactions(&self, transactions: Vec<Transaction>) {
        self.transactions.write().extend(transactions);
    }

    async fn remove_transactions_by_id(&self, ids: &[TransactionId]) {
        self.transactions.write().retain(|tx| !ids.contains(&tx.id));
    }
}

/// Scripted behaviour of one remote peer.
#[derive(Clone, Debug, Default)]
pub struct MockPeer {
    pub state: PeerState,
    pub peers: Vec<PeerAddress>,
    /// Chain served by `get_peer_blocks`.
    pub blocks: Vec<Block>,
    pub unreachable: bool,
    /// Delay applied to every request.
    pub latency: Option<Duration>,
}

impl MockPeer {
    pub fn at_height(height: u64) -> Self {
        Self {
            state: PeerState {
                height: Some(height),
                current_slot: 0,
                forging_allowed: false,
            },
            ..Default::default()
        }
    }

    pub fn serving(blocks: Vec<Block>) -> Self {
        let height = blocks.last().map_or(0, Block::height);
        Self {
            blocks,
            ..Self::at_height(height)
        }
    }

    pub fn knowing(mut self, peers: Vec<PeerAddress>) -> Self {
        self.peers = peers;
        self
    }

    pub fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Default::default()
        }
    }
}

/// Scripted peer network implementing [`PeerCommunicator`].
#[derive(Default)]
pub struct MockPeerNetwork {
    peers: RwLock<HashMap<PeerAddress, MockPeer>>,
    /// Start heights for which block requests fail.
    failing_heights: RwLock<HashSet<u64>>,
    block_requests: Mutex<Vec<(PeerAddress, u64)>>,
    posted: Mutex<Vec<(PeerAddress, BlockId)>>,
    pub ping_count: AtomicUsize,
    pub get_peers_count: AtomicUsize,
}

impl MockPeerNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_peer(&self, address: PeerAddress, peer: MockPeer) {
        self.peers.write().insert(address, peer);
    }

    pub fn set_unreachable(&self, address: &PeerAddress, unreachable: bool) {
        if let Some(peer) = self.peers.write().get_mut(address) {
            peer.unreachable = unreachable;
        }
    }

    pub fn fail_blocks_from(&self, height: u64) {
        self.failing_heights.write().insert(height);
    }

    pub fn clear_failures(&self) {
        self.failing_heights.write().clear();
    }

    /// Every `(peer, from_height)` passed to `get_peer_blocks`.
    pub fn block_requests(&self) -> Vec<(PeerAddress, u64)> {
        self.block_requests.lock().clone()
    }

    pub fn requests_from(&self, height: u64) -> usize {
        self.block_requests
            .lock()
            .iter()
            .filter(|(_, from)| *from == height)
            .count()
    }

    pub fn posted(&self) -> Vec<(PeerAddress, BlockId)> {
        self.posted.lock().clone()
    }

    fn lookup(&self, address: &PeerAddress) -> Result<MockPeer, PeerError> {
        match self.peers.read().get(address) {
            Some(peer) if !peer.unreachable => Ok(peer.clone()),
            _ => Err(PeerError::ConnectionRefused(*address)),
        }
    }

    async fn simulate_latency(peer: &MockPeer) {
        if let Some(latency) = peer.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl PeerCommunicator for MockPeerNetwork {
    async fn ping(
        &self,
        peer: &PeerAddress,
        _timeout: Duration,
        _force: bool,
    ) -> Result<PeerState, PeerError> {
        self.ping_count.fetch_add(1, Ordering::SeqCst);
        let remote = self.lookup(peer)?;
        Self::simulate_latency(&remote).await;
        Ok(remote.state)
    }

    async fn get_peers(&self, peer: &PeerAddress) -> Result<Vec<PeerAddress>, PeerError> {
        self.get_peers_count.fetch_add(1, Ordering::SeqCst);
        let remote = self.lookup(peer)?;
        Self::simulate_latency(&remote).await;
        Ok(remote.peers)
    }

    async fn get_peer_blocks(
        &self,
        peer: &PeerAddress,
        from_height: u64,
        limit: usize,
    ) -> Result<Vec<Block>, PeerError> {
        self.block_requests.lock().push((*peer, from_height));
        let remote = self.lookup(peer)?;
        Self::simulate_latency(&remote).await;

        if self.failing_heights.read().contains(&from_height) {
            return Err(PeerError::Protocol {
                peer: *peer,
                reason: "socket hang up".into(),
            });
        }

        Ok(remote
            .blocks
            .into_iter()
            .filter(|b| b.height() > from_height)
            .take(limit)
            .collect())
    }

    async fn post_block(&self, peer: &PeerAddress, block: &Block) -> Result<(), PeerError> {
        self.lookup(peer)?;
        self.posted.lock().push((*peer, block.id().clone()));
        Ok(())
    }
}

/// Peer acceptance that registers every address it is handed.
pub struct RecordingPeerAcceptance {
    repository: Arc<InMemoryPeerRepository>,
    accepted: Mutex<Vec<(PeerAddress, AcceptOptions)>>,
}

impl RecordingPeerAcceptance {
    pub fn new(repository: Arc<InMemoryPeerRepository>) -> Self {
        Self {
            repository,
            accepted: Mutex::new(Vec::new()),
        }
    }

    pub fn accepted(&self) -> Vec<(PeerAddress, AcceptOptions)> {
        self.accepted.lock().clone()
    }
}

#[async_trait]
impl PeerAcceptance for RecordingPeerAcceptance {
    async fn validate_and_accept_peer(
        &self,
        address: &PeerAddress,
        options: AcceptOptions,
    ) -> Result<(), PeerError> {
        self.accepted.lock().push((*address, options));
        if !self.repository.has_peer(address) {
            self.repository.update_peer(crate::domain::Peer::new(*address));
        }
        Ok(())
    }
}

/// Event dispatcher that keeps every notification.
#[derive(Default)]
pub struct RecordingEventDispatcher {
    notifications: Mutex<Vec<SyncNotification>>,
}

impl RecordingEventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<SyncNotification> {
        self.notifications.lock().clone()
    }

    pub fn count(&self, predicate: impl Fn(&SyncNotification) -> bool) -> usize {
        self.notifications.lock().iter().filter(|n| predicate(n)).count()
    }
}

impl EventDispatcher for RecordingEventDispatcher {
    fn dispatch(&self, notification: SyncNotification) {
        self.notifications.lock().push(notification);
    }
}

/// Time source that only moves when told to.
#[derive(Debug, Default)]
pub struct ControllableTimeSource {
    time: AtomicU64,
}

impl ControllableTimeSource {
    pub fn new(initial: u64) -> Self {
        Self {
            time: AtomicU64::new(initial),
        }
    }

    pub fn set(&self, secs: u64) {
        self.time.store(secs, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: u64) {
        self.time.fetch_add(secs, Ordering::SeqCst);
    }
}

impl TimeSource for ControllableTimeSource {
    fn now(&self) -> u64 {
        self.time.load(Ordering::SeqCst)
    }
}
