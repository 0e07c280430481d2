//! # Block Acceptance Pipeline
//!
//! Two phases per block:
//!
//! 1. [`BlockProcessor::classify`] runs the checks in fixed order and returns
//!    a [`BlockClassification`]. It reads ledger state but mutates nothing
//!    except the not-ready counter.
//! 2. [`BlockProcessor::dispatch`] performs the side effects for that
//!    classification and yields exactly one [`ProcessOutcome`].
//!
//! Check order: exception list, verification, version homogeneity, nonce
//! order, chain linkage (with the unchained sub-cases), generator, already
//! forged transactions, accept.

mod not_ready;

pub use not_ready::NotReadyCounter;

use crate::config::BlockchainConfig;
use crate::domain::{
    calculate_round, is_block_chained, slot_number, Block, BlockClassification, GeneratorCheck,
    ProcessOutcome, PublicKey, RuntimeState, SyncResult, UnchainedStatus,
};
use crate::ports::{Database, TransactionPool};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What processing a block produced, plus follow-ups for the caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessReport {
    pub outcome: ProcessOutcome,
    pub classification: BlockClassification,
    /// The pending queue holds blocks built on a stale assumption.
    pub clear_queue: bool,
}

/// Classifies and applies blocks one at a time.
pub struct BlockProcessor {
    config: BlockchainConfig,
    database: Arc<dyn Database>,
    pool: Arc<dyn TransactionPool>,
    state: Arc<RwLock<RuntimeState>>,
    not_ready: NotReadyCounter,
}

impl BlockProcessor {
    pub fn new(
        config: BlockchainConfig,
        database: Arc<dyn Database>,
        pool: Arc<dyn TransactionPool>,
        state: Arc<RwLock<RuntimeState>>,
    ) -> Self {
        let not_ready = NotReadyCounter::new(config.max_not_ready_attempts);
        Self {
            config,
            database,
            pool,
            state,
            not_ready,
        }
    }

    /// Classify and apply `block`. Never fails: collaborator errors turn into
    /// a rejection.
    pub async fn process(&mut self, block: &Block) -> ProcessReport {
        let tip = self.state.read().last_block.clone();
        let Some(tip) = tip else {
            warn!(height = block.height(), "[qc-18] No tip available, refusing block");
            return self.reject(BlockClassification::Accept);
        };

        match self.classify(block, &tip).await {
            Ok(classification) => self.dispatch(block, classification).await,
            Err(e) => {
                error!(
                    height = block.height(),
                    id = %block.id(),
                    "[qc-18] Failed to classify block: {}",
                    e
                );
                self.reject(BlockClassification::Accept)
            }
        }
    }

    /// Run the checks in order and stop at the first match.
    pub async fn classify(&mut self, block: &Block, tip: &Block) -> SyncResult<BlockClassification> {
        if self.config.is_exception(block.id()) {
            let already_persisted = self.database.get_block(block.id()).await?.is_some();
            return Ok(BlockClassification::Exception { already_persisted });
        }

        if let Some(errors) = self.verification_errors(block).await? {
            return Ok(BlockClassification::VerificationFailed { errors });
        }

        if let Some(first) = block.transactions.first() {
            if block.transactions.iter().any(|tx| tx.version != first.version) {
                return Ok(BlockClassification::IncompatibleVersions);
            }
        }

        if let Some(violation) = self.nonce_violation(block).await? {
            return Ok(violation);
        }

        let generator = self.validate_generator(block).await?;
        let block_time = self.config.block_time_secs;

        if !is_block_chained(&tip.header, &block.header, block_time) {
            let status = self.unchained_status(block, tip, &generator).await?;
            return Ok(BlockClassification::Unchained(status));
        }

        if matches!(generator, GeneratorCheck::Invalid { .. }) {
            return Ok(BlockClassification::InvalidGenerator);
        }

        if !block.transactions.is_empty() {
            let forged = self
                .database
                .get_forged_transaction_ids(&block.transaction_ids())
                .await?;
            if !forged.is_empty() {
                return Ok(BlockClassification::AlreadyForged(forged));
            }
        }

        Ok(BlockClassification::Accept)
    }

    /// Perform the side effects of `classification`.
    pub async fn dispatch(
        &mut self,
        block: &Block,
        classification: BlockClassification,
    ) -> ProcessReport {
        match classification {
            BlockClassification::Exception {
                already_persisted: true,
            } => {
                debug!(id = %block.id(), "Exception block already persisted");
                self.discard(classification)
            }
            BlockClassification::Exception { .. } => {
                info!(id = %block.id(), height = block.height(), "Forcing exception block");
                self.accept(block, classification).await
            }
            BlockClassification::VerificationFailed { ref errors } => {
                warn!(
                    height = block.height(),
                    id = %block.id(),
                    "Block disregarded because verification failed: {:?}",
                    errors
                );
                self.reject(classification)
            }
            BlockClassification::IncompatibleVersions => {
                warn!(
                    height = block.height(),
                    id = %block.id(),
                    "Block disregarded because it contains transactions of different versions"
                );
                self.reject(classification)
            }
            BlockClassification::InvalidNonce { ref sender, nonce } => {
                warn!(
                    height = block.height(),
                    id = %block.id(),
                    sender = %sender,
                    nonce = ?nonce,
                    "Block disregarded because it contains an out of order nonce"
                );
                self.reject(classification)
            }
            BlockClassification::Unchained(ref status) => {
                let outcome = self.handle_unchained(block, status);
                self.state.write().reset_last_downloaded_block();
                ProcessReport {
                    outcome,
                    classification,
                    clear_queue: true,
                }
            }
            BlockClassification::InvalidGenerator => {
                warn!(
                    height = block.height(),
                    generator = %block.generator(),
                    "Block disregarded because the generator is not allowed to forge"
                );
                self.reject(classification)
            }
            BlockClassification::AlreadyForged(ref ids) => {
                warn!(
                    height = block.height(),
                    id = %block.id(),
                    count = ids.len(),
                    "Block disregarded because it contains already forged transactions"
                );
                self.pool.remove_transactions_by_id(ids).await;
                self.discard(classification)
            }
            BlockClassification::Accept => self.accept(block, classification).await,
        }
    }

    async fn verification_errors(&self, block: &Block) -> SyncResult<Option<Vec<String>>> {
        if block.verification.contains_multi_signatures {
            for tx in &block.transactions {
                if !self.database.verify_transaction(tx).await? {
                    return Ok(Some(vec![format!(
                        "Transaction {} failed verification",
                        tx.id
                    )]));
                }
            }
        }

        if !block.verification.verified {
            return Ok(Some(block.verification.errors.clone()));
        }

        Ok(None)
    }

    async fn nonce_violation(&self, block: &Block) -> SyncResult<Option<BlockClassification>> {
        let mut expected: HashMap<&PublicKey, u64> = HashMap::new();

        for tx in block.transactions.iter().filter(|tx| tx.version >= 2) {
            let sender = &tx.sender_public_key;
            let next = match expected.get(sender) {
                Some(previous) => previous + 1,
                None => self.database.wallet_nonce(sender).await? + 1,
            };

            if tx.nonce != Some(next) {
                return Ok(Some(BlockClassification::InvalidNonce {
                    sender: sender.clone(),
                    nonce: tx.nonce,
                }));
            }
            expected.insert(sender, next);
        }

        Ok(None)
    }

    /// Whether the block's generator owns the block's slot.
    pub async fn validate_generator(&self, block: &Block) -> SyncResult<GeneratorCheck> {
        let round = calculate_round(block.height(), self.config.active_delegates);
        let delegates = self.database.get_active_delegates(&round).await?;

        if delegates.is_empty() {
            warn!(
                height = block.height(),
                round = round.round,
                "Could not decide if delegate {} is allowed to forge block",
                block.generator()
            );
            return Ok(GeneratorCheck::Undetermined);
        }

        let slot = slot_number(block.timestamp(), self.config.block_time_secs);
        let forging = &delegates[(slot % delegates.len() as u64) as usize];

        if forging == block.generator() {
            Ok(GeneratorCheck::Valid)
        } else {
            debug!(
                height = block.height(),
                slot,
                expected = %forging,
                actual = %block.generator(),
                "Delegate not allowed to forge in this slot"
            );
            Ok(GeneratorCheck::Invalid {
                expected: forging.clone(),
            })
        }
    }

    async fn unchained_status(
        &mut self,
        block: &Block,
        tip: &Block,
        generator: &GeneratorCheck,
    ) -> SyncResult<UnchainedStatus> {
        if block.height() > tip.height() + 1 {
            return Ok(if self.not_ready.increment(block.id()) {
                UnchainedStatus::NotReadyToAcceptNewHeight
            } else {
                UnchainedStatus::ExceededNotReadyToAcceptNewHeightMaxAttempts
            });
        }

        if block.height() < tip.height() {
            return Ok(UnchainedStatus::AlreadyInBlockchain);
        }

        if block.height() == tip.height() && block.id() == tip.id() {
            return Ok(UnchainedStatus::EqualToLastBlock);
        }

        if block.timestamp() < tip.timestamp() {
            return Ok(UnchainedStatus::InvalidTimestamp);
        }

        if generator.is_valid() {
            let round = calculate_round(block.height(), self.config.active_delegates);
            let delegates = self.database.get_active_delegates(&round).await?;
            let generator_active = delegates.contains(block.generator());
            return Ok(UnchainedStatus::DoubleForging { generator_active });
        }

        Ok(UnchainedStatus::GeneratorMismatch)
    }

    fn handle_unchained(&mut self, block: &Block, status: &UnchainedStatus) -> ProcessOutcome {
        match status {
            UnchainedStatus::NotReadyToAcceptNewHeight => {
                info!(
                    height = block.height(),
                    "Blocks are not ready to be accepted at this height"
                );
                ProcessOutcome::DiscardedButCanBeBroadcasted
            }
            UnchainedStatus::ExceededNotReadyToAcceptNewHeightMaxAttempts => {
                warn!(
                    height = block.height(),
                    id = %block.id(),
                    "Block kept arriving ahead of the tip, rolling back"
                );
                self.state.write().number_of_blocks_to_rollback =
                    Some(self.config.not_ready_rollback_blocks);
                ProcessOutcome::Rollback
            }
            UnchainedStatus::AlreadyInBlockchain => {
                debug!(height = block.height(), "Block already in blockchain");
                ProcessOutcome::DiscardedButCanBeBroadcasted
            }
            UnchainedStatus::EqualToLastBlock => {
                debug!(height = block.height(), "Block equal to last block");
                ProcessOutcome::DiscardedButCanBeBroadcasted
            }
            UnchainedStatus::InvalidTimestamp => {
                info!(
                    height = block.height(),
                    id = %block.id(),
                    "Block disregarded because it is older than the last block"
                );
                ProcessOutcome::Rejected
            }
            UnchainedStatus::DoubleForging { generator_active } => {
                warn!(
                    height = block.height(),
                    id = %block.id(),
                    generator = %block.generator(),
                    "Detected double forging"
                );
                if *generator_active {
                    self.state.write().forked_block = Some(block.header.clone());
                    ProcessOutcome::Rollback
                } else {
                    ProcessOutcome::Rejected
                }
            }
            UnchainedStatus::GeneratorMismatch => {
                info!(
                    height = block.height(),
                    generator = %block.generator(),
                    "Forked block disregarded because it is not allowed to be forged"
                );
                ProcessOutcome::DiscardedButCanBeBroadcasted
            }
        }
    }

    async fn accept(&mut self, block: &Block, classification: BlockClassification) -> ProcessReport {
        if let Err(e) = self.pool.accept_chained_block(block).await {
            warn!("Issue applying block to transaction pool: {}", e);
            self.repair_pool().await;
        }

        if let Err(e) = self.database.apply_block(block).await {
            error!(
                height = block.height(),
                id = %block.id(),
                "Refused new block: {}",
                e
            );
            self.repair_pool().await;
            return self.reject(classification);
        }

        {
            let mut state = self.state.write();
            let resolves_fork = state
                .forked_block
                .as_ref()
                .is_some_and(|forked| forked.height == block.height());
            if resolves_fork {
                state.forked_block = None;
            }
            state.set_last_block(block.clone());
        }

        self.not_ready.reset();
        debug!(height = block.height(), id = %block.id(), "Block accepted");

        ProcessReport {
            outcome: ProcessOutcome::Accepted,
            classification,
            clear_queue: false,
        }
    }

    /// Flush the pool and re-add what it held, against fresh wallet state.
    async fn repair_pool(&self) {
        let transactions = self.pool.get_all_transactions().await;
        self.pool.flush().await;
        self.pool.reset_wallets().await;
        self.pool.add_transactions(transactions).await;
    }

    fn reject(&self, classification: BlockClassification) -> ProcessReport {
        self.state.write().reset_last_downloaded_block();
        ProcessReport {
            outcome: ProcessOutcome::Rejected,
            classification,
            clear_queue: false,
        }
    }

    fn discard(&self, classification: BlockClassification) -> ProcessReport {
        self.state.write().reset_last_downloaded_block();
        ProcessReport {
            outcome: ProcessOutcome::DiscardedButCanBeBroadcasted,
            classification,
            clear_queue: false,
        }
    }
}
