//! Entry actions run by the event loop.

use super::{Lifecycle, SyncCore};
use crate::domain::{is_block_chained, ForkStatus, SyncError};
use crate::machine::{EntryAction, SyncEvent};
use crate::ports::SyncNotification;
use rand::Rng;
use std::sync::atomic::Ordering;
use tracing::{debug, error, info, warn};

impl SyncCore {
    pub(super) async fn run_action(&self, action: EntryAction) {
        match action {
            EntryAction::Init => self.init().await,
            EntryAction::CheckLater => self.check_later(),
            EntryAction::BlockchainReady => self.blockchain_ready(),
            EntryAction::CheckLastDownloadedBlockSynced => {
                self.check_last_downloaded_block_synced().await
            }
            EntryAction::DownloadBlocks => self.download_blocks().await,
            EntryAction::DownloadFinished => self.download_finished(),
            EntryAction::DownloadPaused => {
                info!("Blockchain download paused");
                if self.queue.is_idle() {
                    self.dispatch(SyncEvent::ProcessFinished);
                }
            }
            EntryAction::CheckLastBlockSynced => self.check_last_block_synced(),
            EntryAction::SyncingComplete => {
                info!("[qc-18] Blockchain 100% in sync");
                self.dispatch(SyncEvent::SyncFinished);
            }
            EntryAction::StartForkRecovery => self.start_fork_recovery().await,
            EntryAction::RollbackDatabase => self.rollback_database().await,
            EntryAction::Stopped => {
                self.release();
                self.lifecycle.send_replace(Lifecycle::Stopped);
                info!("[qc-18] The blockchain has been stopped");
            }
            EntryAction::ExitApp => {
                self.release();
                let reason = "Failed to startup blockchain".to_string();
                error!("[qc-18] {}. Exiting", reason);
                self.lifecycle.send_replace(Lifecycle::Exited { reason });
            }
        }
    }

    async fn init(&self) {
        let restored = self.state.read().restored_database_integrity;
        if restored {
            info!("Skipping database integrity check after successful database recovery");
        } else {
            info!("Verifying database integrity");
            match self.database.verify_blockchain().await {
                Ok(true) => info!("Verified database integrity"),
                Ok(false) => {
                    warn!("[qc-18] Database integrity check failed");
                    self.dispatch(SyncEvent::Rollback);
                    return;
                }
                Err(e) => {
                    error!("[qc-18] Failed to verify database: {}", e);
                    self.dispatch(SyncEvent::Failure);
                    return;
                }
            }
        }

        let last_block = match self.database.get_last_block().await {
            Ok(block) => block,
            Err(e) => {
                error!("[qc-18] Failed to load last block: {}", e);
                self.dispatch(SyncEvent::Failure);
                return;
            }
        };

        if last_block.height() == 1 {
            if let Some(expected) = &self.config.blockchain.genesis_payload_hash {
                if *expected != last_block.header.payload_hash {
                    let e = SyncError::GenesisMismatch {
                        expected: expected.clone(),
                        actual: last_block.header.payload_hash.clone(),
                    };
                    error!("[qc-18] FATAL: {}", e);
                    self.dispatch(SyncEvent::Failure);
                    return;
                }
            }
        }

        info!("Last block in database: {}", last_block.height());
        self.state.write().rewind_to(last_block);

        self.monitor.start().await;

        let network_start = self.state.read().network_start;
        self.dispatch(if network_start {
            SyncEvent::NetworkStart
        } else {
            SyncEvent::Started
        });
    }

    fn check_later(&self) {
        if !self.is_stopped() && !self.wake_up_pending() {
            self.set_wake_up();
        }
    }

    fn blockchain_ready(&self) {
        let first = {
            let mut state = self.state.write();
            !std::mem::replace(&mut state.started, true)
        };

        if first {
            info!("[qc-18] Blockchain ready");
            self.events.dispatch(SyncNotification::StateStarted);
            self.lifecycle.send_replace(Lifecycle::Ready);
        }
    }

    async fn check_last_downloaded_block_synced(&self) {
        let config = &self.config.blockchain;
        let queued = self.queue.len();
        debug!("Queued blocks (process: {})", queued);

        let mut event = if queued > config.max_queue_length {
            SyncEvent::Paused
        } else {
            SyncEvent::NotSynced
        };

        let halted = {
            let state = self.state.read();
            state.no_block_counter > config.max_no_block_rounds
        } && self.queue.is_idle();

        if halted {
            info!(
                "Tried to sync {} times to different nodes, looks like the network is missing blocks",
                config.max_no_block_rounds
            );
            event = SyncEvent::NetworkHalted;

            let (check_health, our_height) = {
                let mut state = self.state.write();
                state.no_block_counter = 0;
                state.p2p_update_counter += 1;
                let check = state.p2p_update_counter > config.max_p2p_updates;
                if check {
                    state.p2p_update_counter = 0;
                }
                (check, state.last_height())
            };

            if check_health {
                info!("Network keeps missing blocks.");
                if let ForkStatus::Forked { blocks_to_rollback } =
                    self.monitor.check_network_health(our_height).await
                {
                    self.state.write().number_of_blocks_to_rollback = Some(blocks_to_rollback);
                    event = SyncEvent::Fork;
                }
            }
        } else {
            let last_downloaded = self.state.read().last_downloaded_block.clone();
            if last_downloaded.is_some_and(|header| self.is_block_synced(&header)) {
                self.state.write().reset_counters();
                event = SyncEvent::Synced;
            }
        }

        if self.state.read().network_start {
            event = SyncEvent::Synced;
        }

        self.dispatch(event);
    }

    async fn download_blocks(&self) {
        let last_downloaded = {
            let state = self.state.read();
            state
                .last_downloaded_block
                .clone()
                .or_else(|| state.last_block.as_ref().map(|block| block.header.clone()))
        };
        let Some(last_downloaded) = last_downloaded else {
            warn!("No block to download from");
            self.dispatch(SyncEvent::NoBlock);
            return;
        };

        let blocks = self
            .monitor
            .download_blocks_from_height(last_downloaded.height)
            .await;

        if self.is_stopped() {
            return;
        }

        // A rollback may have moved the pointer while we were downloading.
        let moved = self
            .state
            .read()
            .last_downloaded_block
            .as_ref()
            .is_some_and(|current| current.id != last_downloaded.id);
        if moved {
            debug!("Last downloaded block changed during download, dropping result");
            return;
        }

        let block_time = self.config.blockchain.block_time_secs;
        let chained = blocks.first().is_some_and(|first| {
            is_block_chained(&last_downloaded, &first.header, block_time)
                || self.config.blockchain.is_exception(first.id())
        });

        if chained {
            let transactions: usize = blocks
                .iter()
                .map(|block| block.header.number_of_transactions)
                .sum();
            info!(
                "Downloaded {} new blocks accounting for a total of {} transactions",
                blocks.len(),
                transactions
            );
            self.enqueue_blocks(blocks);
            self.dispatch(SyncEvent::Downloaded);
            return;
        }

        match blocks.first() {
            None => info!(
                "Could not download any blocks from any peer from height {}",
                last_downloaded.height + 1
            ),
            Some(first) => {
                warn!(
                    height = first.height(),
                    id = %first.id(),
                    previous = %first.header.previous_block,
                    "Downloaded block not accepted"
                );
                warn!(
                    height = last_downloaded.height,
                    id = %last_downloaded.id,
                    "Last downloaded block"
                );
                self.queue.clear();
            }
        }

        if self.queue.is_empty() {
            let mut state = self.state.write();
            state.no_block_counter += 1;
            state.reset_last_downloaded_block();
        }

        self.dispatch(SyncEvent::NoBlock);
    }

    fn download_finished(&self) {
        info!("Block download finished");

        let network_start = {
            let mut state = self.state.write();
            std::mem::replace(&mut state.network_start, false)
        };

        if network_start {
            self.dispatch(SyncEvent::SyncFinished);
        } else if self.queue.is_idle() {
            self.dispatch(SyncEvent::ProcessFinished);
        }
    }

    fn check_last_block_synced(&self) {
        let last = self
            .state
            .read()
            .last_block
            .as_ref()
            .map(|block| block.header.clone());
        let synced = last.map_or(true, |header| self.is_block_synced(&header));

        self.dispatch(if synced {
            SyncEvent::Synced
        } else {
            SyncEvent::NotSynced
        });
    }

    async fn start_fork_recovery(&self) {
        info!("[qc-18] Starting fork recovery");

        let (recorded, our_height) = {
            let mut state = self.state.write();
            if state.forked_block.is_none() {
                state.forked_block = state.last_block.as_ref().map(|block| block.header.clone());
            }
            state.reset_last_downloaded_block();
            (state.number_of_blocks_to_rollback, state.last_height())
        };
        self.queue.clear_and_pause();

        let config = &self.config.blockchain;
        let depth = match recorded {
            Some(depth) => depth,
            None => match self.monitor.fork_status(our_height) {
                ForkStatus::Forked { blocks_to_rollback } => blocks_to_rollback,
                ForkStatus::NotForked => {
                    rand::thread_rng().gen_range(config.fork_rollback_min..=config.fork_rollback_max)
                }
            },
        };

        if let Err(e) = self.remove_blocks(depth).await {
            error!("[qc-18] Fork recovery failed to remove blocks: {}", e);
            self.dispatch(SyncEvent::Failure);
            return;
        }

        self.state.write().number_of_blocks_to_rollback = None;
        info!("Removed {} blocks", depth);

        self.monitor.refresh_peers_after_fork().await;

        self.dispatch(SyncEvent::Success);
        self.queue.resume();
    }

    async fn rollback_database(&self) {
        info!("[qc-18] Trying to restore database integrity");

        let config = &self.config.blockchain;
        let attempts = config.max_block_rewind / config.rollback_steps + 1;

        match self.rewind_until_verified(attempts, config.rollback_steps).await {
            Ok(true) => {}
            Ok(false) => {
                error!("[qc-18] Database integrity could not be restored");
                self.dispatch(SyncEvent::Failure);
                return;
            }
            Err(e) => {
                error!("[qc-18] Database rollback failed: {}", e);
                self.dispatch(SyncEvent::Failure);
                return;
            }
        }

        self.state.write().restored_database_integrity = true;
        match self.database.get_last_block().await {
            Ok(block) => info!(
                "Database integrity verified again after rollback to height {}",
                block.height()
            ),
            Err(e) => warn!("Could not read last block after rollback: {}", e),
        }

        self.dispatch(SyncEvent::Success);
    }

    async fn rewind_until_verified(&self, attempts: u64, steps: u64) -> Result<bool, SyncError> {
        for _ in 0..attempts {
            info!("Removing {} blocks from the top of the database", steps);
            self.database.remove_top_blocks(steps).await?;
            if self.database.verify_blockchain().await? {
                return Ok(true);
            }
        }
        Ok(self.database.verify_blockchain().await?)
    }

    /// Shared teardown of `stopped` and `exit`.
    fn release(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.clear_wake_up();
        self.monitor.stop();
        self.queue.kill();
    }
}
