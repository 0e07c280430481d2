//! # Chain Sync Service
//!
//! The orchestrator. Owns the runtime state, the state machine cursor, the
//! block queue and the network monitor.
//!
//! ## Tasks
//!
//! - **Event loop**: consumes [`SyncEvent`]s in order, applies them to the
//!   state machine and runs the entry actions of each new state to
//!   completion before taking the next event.
//! - **Queue worker**: drains the block queue one block at a time through the
//!   [`BlockProcessor`], and dispatches `PROCESSFINISHED` whenever the queue
//!   drains.
//! - **Wake-up timer**: dispatches `WAKEUP` after the configured delay.
//!
//! Actions and the worker only communicate with the loop by dispatching
//! events, so no entry action ever re-enters the state machine.

mod actions;
mod queue;

#[cfg(test)]
mod tests;

pub use queue::BlockQueue;

use crate::config::ChainSyncConfig;
use crate::domain::{
    slot_number, slot_time, Block, BlockHeader, LedgerError, NetworkSnapshot, ProcessOutcome,
    RuntimeState, SyncError, SyncResult,
};
use crate::machine::{ChainState, StateMachine, SyncEvent};
use crate::network::{NetworkDependencies, NetworkMonitor};
use crate::ports::{
    ChainSyncApi, Database, EventDispatcher, SyncNotification, TimeSource, TransactionPool,
};
use crate::processor::BlockProcessor;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Collaborators of the sync service.
#[derive(Clone)]
pub struct ChainSyncDependencies {
    pub database: Arc<dyn Database>,
    pub pool: Arc<dyn TransactionPool>,
    pub network: NetworkDependencies,
    pub time: Arc<dyn TimeSource>,
}

/// Coarse lifecycle published on a watch channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    Booting,
    /// The chain reached `idle` at least once.
    Ready,
    Stopped,
    Exited { reason: String },
}

/// Chain synchronization engine.
///
/// Cheap to clone; clones share the same engine.
#[derive(Clone)]
pub struct ChainSyncService {
    core: Arc<SyncCore>,
}

struct SyncCore {
    config: ChainSyncConfig,
    database: Arc<dyn Database>,
    pool: Arc<dyn TransactionPool>,
    events: Arc<dyn EventDispatcher>,
    time: Arc<dyn TimeSource>,
    monitor: Arc<NetworkMonitor>,
    processor: tokio::sync::Mutex<BlockProcessor>,
    state: Arc<RwLock<RuntimeState>>,
    machine: Mutex<StateMachine>,
    queue: BlockQueue,
    event_tx: mpsc::UnboundedSender<SyncEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<SyncEvent>>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    wake_up: Mutex<Option<JoinHandle<()>>>,
    lifecycle: watch::Sender<Lifecycle>,
    stopped: AtomicBool,
}

impl ChainSyncService {
    pub fn new(config: ChainSyncConfig, deps: ChainSyncDependencies) -> SyncResult<Self> {
        config.validate()?;

        let network_start = config.blockchain.network_start;
        if network_start {
            warn!("[qc-18] Launched in genesis start mode. This is usually only right for the first node of a network.");
        }

        let state = Arc::new(RwLock::new(RuntimeState::new(network_start)));
        let processor = BlockProcessor::new(
            config.blockchain.clone(),
            deps.database.clone(),
            deps.pool.clone(),
            state.clone(),
        );
        let events = deps.network.events.clone();
        let monitor = Arc::new(NetworkMonitor::new(&config, deps.network));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (lifecycle, _) = watch::channel(Lifecycle::Booting);

        info!(
            block_time = config.blockchain.block_time_secs,
            chunk_size = config.download.chunk_size,
            "[qc-18] Chain sync service created"
        );

        Ok(Self {
            core: Arc::new(SyncCore {
                config,
                database: deps.database,
                pool: deps.pool,
                events,
                time: deps.time,
                monitor,
                processor: tokio::sync::Mutex::new(processor),
                state,
                machine: Mutex::new(StateMachine::new()),
                queue: BlockQueue::new(),
                event_tx,
                event_rx: Mutex::new(Some(event_rx)),
                event_loop: Mutex::new(None),
                worker: Mutex::new(None),
                wake_up: Mutex::new(None),
                lifecycle,
                stopped: AtomicBool::new(false),
            }),
        })
    }

    pub fn monitor(&self) -> &Arc<NetworkMonitor> {
        &self.core.monitor
    }

    pub fn runtime_state(&self) -> RuntimeState {
        self.core.state.read().clone()
    }

    pub fn queue_length(&self) -> usize {
        self.core.queue.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.core.is_stopped()
    }

    pub fn subscribe_lifecycle(&self) -> watch::Receiver<Lifecycle> {
        self.core.lifecycle.subscribe()
    }

    /// Wait until the chain is ready. Returns `false` if it stopped or exited
    /// first.
    pub async fn wait_until_ready(&self) -> bool {
        let mut rx = self.core.lifecycle.subscribe();
        let ready = match rx.wait_for(|status| *status != Lifecycle::Booting).await {
            Ok(status) => *status == Lifecycle::Ready,
            Err(_) => false,
        };
        ready
    }

    /// Queue an event for the state machine.
    pub fn dispatch(&self, event: SyncEvent) {
        self.core.dispatch(event);
    }

    /// Cancel the wake-up timer and sync with the network now.
    pub fn force_wake_up(&self) {
        self.core.clear_wake_up();
        self.core.dispatch(SyncEvent::WakeUp);
    }

    /// Revert the top `count` blocks, capped so the genesis block survives.
    pub async fn remove_blocks(&self, count: u64) -> SyncResult<()> {
        self.core.remove_blocks(count).await
    }

    /// Feed blocks from `source` through the pipeline up to `target_height`.
    /// Returns how many blocks were accepted.
    pub async fn replay(&self, source: &dyn Database, target_height: u64) -> SyncResult<u64> {
        self.core.replay(source, target_height).await
    }
}

#[async_trait]
impl ChainSyncApi for ChainSyncService {
    async fn start(&self) -> SyncResult<()> {
        self.core.start()
    }

    async fn stop(&self) {
        self.core.stop().await;
    }

    async fn handle_incoming_block(&self, block: Block) {
        self.core.handle_incoming_block(block);
    }

    fn network_status(&self) -> NetworkSnapshot {
        let own_height = self.core.state.read().last_height();
        self.core.monitor.network_snapshot(own_height)
    }

    fn state(&self) -> ChainState {
        self.core.machine.lock().state()
    }

    fn is_synced(&self) -> bool {
        let last = self
            .core
            .state
            .read()
            .last_block
            .as_ref()
            .map(|block| block.header.clone());
        last.map_or(true, |header| self.core.is_block_synced(&header))
    }
}

impl SyncCore {
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn dispatch(&self, event: SyncEvent) {
        if self.event_tx.send(event).is_err() {
            debug!(%event, "Event loop closed, dropping event");
        }
    }

    fn start(self: &Arc<Self>) -> SyncResult<()> {
        if self.is_stopped() {
            return Err(SyncError::Stopped);
        }

        let receiver = self.event_rx.lock().take();
        let Some(receiver) = receiver else {
            warn!("[qc-18] Chain sync already started");
            return Ok(());
        };

        info!("[qc-18] Starting chain sync");

        let event_loop = tokio::spawn(Arc::clone(self).run_event_loop(receiver));
        *self.event_loop.lock() = Some(event_loop);

        let worker = tokio::spawn(Arc::clone(self).run_queue_worker());
        *self.worker.lock() = Some(worker);

        self.dispatch(SyncEvent::Start);
        Ok(())
    }

    async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("[qc-18] Stopping chain sync");
        self.clear_wake_up();
        self.queue.kill();

        let event_loop = self.event_loop.lock().take();
        match event_loop {
            Some(handle) => {
                self.dispatch(SyncEvent::Stop);
                if let Err(e) = handle.await {
                    warn!("[qc-18] Event loop ended abnormally: {}", e);
                }
            }
            None => self.process_event(SyncEvent::Stop).await,
        }

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!("[qc-18] Queue worker ended abnormally: {}", e);
            }
        }
    }

    async fn run_event_loop(self: Arc<Self>, mut receiver: mpsc::UnboundedReceiver<SyncEvent>) {
        while let Some(event) = receiver.recv().await {
            self.process_event(event).await;

            let state = self.machine.lock().state();
            if state.is_terminal() {
                debug!(%state, "Event loop finished");
                break;
            }
        }
    }

    async fn process_event(&self, event: SyncEvent) {
        let transition = self.machine.lock().handle(event);
        let Some(transition) = transition else {
            return;
        };

        for action in transition.actions {
            self.run_action(*action).await;
        }
    }

    async fn run_queue_worker(self: Arc<Self>) {
        while let Some(block) = self.queue.next().await {
            self.process_queued_block(block).await;

            if self.queue.finish() {
                self.dispatch(SyncEvent::ProcessFinished);
            }
        }
        debug!("Queue worker finished");
    }

    async fn process_queued_block(&self, block: Block) {
        let report = self.processor.lock().await.process(&block).await;

        if report.clear_queue {
            let dropped = self.queue.clear();
            if dropped > 0 {
                debug!(dropped, "Cleared pending blocks");
            }
        }

        match report.outcome {
            ProcessOutcome::Accepted => {
                if !self.is_stopped() {
                    self.reset_wake_up();
                }
            }
            ProcessOutcome::Rollback => {
                self.queue.clear();
                self.dispatch(SyncEvent::Fork);
            }
            ProcessOutcome::DiscardedButCanBeBroadcasted | ProcessOutcome::Rejected => {}
        }

        if report.outcome.is_broadcastable() && self.should_broadcast(&block) {
            let monitor = self.monitor.clone();
            tokio::spawn(async move {
                monitor.broadcast_block(&block).await;
            });
        }
    }

    /// Only blocks of the current slot or later are relayed.
    fn should_broadcast(&self, block: &Block) -> bool {
        if !self.state.read().started {
            return false;
        }
        let block_time = self.config.blockchain.block_time_secs;
        let current_slot = slot_number(self.time.now(), block_time);
        slot_time(current_slot, block_time) <= block.timestamp()
    }

    /// Tip within three slots of wall-clock time. Trivially true without peers.
    fn is_block_synced(&self, header: &BlockHeader) -> bool {
        if !self.monitor.has_peers() {
            return true;
        }
        let block_time = self.config.blockchain.block_time_secs;
        self.time.now().saturating_sub(header.timestamp) < 3 * block_time
    }

    fn handle_incoming_block(&self, block: Block) {
        info!(
            height = block.height(),
            transactions = block.header.number_of_transactions,
            "Received new block"
        );

        let block_time = self.config.blockchain.block_time_secs;
        let current_slot = slot_number(self.time.now(), block_time);
        if block.header.slot(block_time) > current_slot {
            info!(
                height = block.height(),
                "Discarded block because it takes a future slot"
            );
            self.events
                .dispatch(SyncNotification::BlockDisregarded(block.id().clone()));
            return;
        }

        let started = self.state.read().started;
        if started {
            let id = block.id().clone();
            self.dispatch(SyncEvent::NewBlock);
            self.enqueue_blocks(vec![block]);
            self.events.dispatch(SyncNotification::BlockReceived(id));
        } else {
            info!("Block disregarded because blockchain is not ready");
            self.events
                .dispatch(SyncNotification::BlockDisregarded(block.id().clone()));
        }
    }

    /// Push blocks and move the downloaded pointer to the last of them.
    fn enqueue_blocks(&self, blocks: Vec<Block>) {
        let Some(last) = blocks.last().map(|block| block.header.clone()) else {
            return;
        };
        self.queue.push(blocks);
        self.state.write().advance_last_downloaded(last);
    }

    fn set_wake_up(&self) {
        let sender = self.event_tx.clone();
        let delay = self.config.blockchain.wake_up_interval();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sender.send(SyncEvent::WakeUp);
        });

        if let Some(previous) = self.wake_up.lock().replace(timer) {
            previous.abort();
        }
    }

    fn wake_up_pending(&self) -> bool {
        self.wake_up
            .lock()
            .as_ref()
            .is_some_and(|timer| !timer.is_finished())
    }

    fn reset_wake_up(&self) {
        self.clear_wake_up();
        self.set_wake_up();
    }

    fn clear_wake_up(&self) {
        if let Some(timer) = self.wake_up.lock().take() {
            timer.abort();
        }
    }

    async fn current_tip(&self) -> SyncResult<Block> {
        let tip = self.state.read().last_block.clone();
        match tip {
            Some(tip) => Ok(tip),
            None => Ok(self.database.get_last_block().await?),
        }
    }

    async fn remove_blocks(&self, count: u64) -> SyncResult<()> {
        self.queue.clear_and_pause();
        let result = {
            // Waits out a block that is already being applied.
            let _processor = self.processor.lock().await;
            self.revert_top_blocks(count).await
        };
        self.queue.resume();
        result
    }

    /// Caller holds the processor lock with the queue paused.
    async fn revert_top_blocks(&self, count: u64) -> SyncResult<()> {
        let tip = self.current_tip().await?;
        let count = count.min(tip.height().saturating_sub(1));
        let reset_height = tip.height() - count;
        info!("Removing {} blocks. Reset to height {}", count, reset_height);

        let mut previous = self
            .database
            .get_blocks(reset_height, count as usize)
            .await?;
        self.state.write().rewind_to(tip.clone());

        let mut current = tip;
        for _ in 0..count {
            info!("Undoing block {}", current.height());
            self.database.revert_block(&current).await?;
            self.pool
                .add_transactions(current.transactions.clone())
                .await;

            let Some(next_tip) = previous.pop() else {
                return Err(LedgerError::NotFound(current.header.previous_block.clone()).into());
            };
            self.state.write().rewind_to(next_tip.clone());
            current = next_tip;
        }

        Ok(())
    }

    async fn replay(&self, source: &dyn Database, target_height: u64) -> SyncResult<u64> {
        let tip = self.current_tip().await?;
        let tip_missing = self.state.read().last_block.is_none();
        if tip_missing {
            self.state.write().rewind_to(tip.clone());
        }

        let batch_size = self.config.blockchain.replay_batch_size;
        let mut next_height = tip.height() + 1;
        let mut replayed = 0u64;
        info!("Replaying blocks {} to {}", next_height, target_height);

        let mut processor = self.processor.lock().await;
        while next_height <= target_height {
            let remaining = (target_height - next_height + 1) as usize;
            let blocks = source
                .get_blocks(next_height, batch_size.min(remaining))
                .await?;
            if blocks.is_empty() {
                break;
            }

            for block in &blocks {
                let report = processor.process(block).await;
                if report.outcome != ProcessOutcome::Accepted {
                    warn!(
                        height = block.height(),
                        outcome = ?report.outcome,
                        "Replay stopped at block that was not accepted"
                    );
                    return Ok(replayed);
                }
                replayed += 1;
                next_height = block.height() + 1;
            }
        }

        info!("Replayed {} blocks", replayed);
        Ok(replayed)
    }
}
