//! Mutable runtime state owned by the sync service.

use super::block::{Block, BlockHeader};

/// Runtime bookkeeping of the sync engine.
///
/// Lives behind a lock in the service; the pipeline and entry actions mutate
/// it in short critical sections.
#[derive(Clone, Debug, Default)]
pub struct RuntimeState {
    /// Current tip of the local ledger.
    pub last_block: Option<Block>,
    /// Highest block handed to the processing queue.
    pub last_downloaded_block: Option<BlockHeader>,
    /// Set once the chain has reached `idle` for the first time.
    pub started: bool,
    /// Tip snapshot taken when fork recovery started.
    pub forked_block: Option<BlockHeader>,
    pub number_of_blocks_to_rollback: Option<u64>,
    /// Consecutive download rounds that produced nothing.
    pub no_block_counter: u32,
    /// Network halts observed since the last health check.
    pub p2p_update_counter: u32,
    pub restored_database_integrity: bool,
    pub network_start: bool,
}

impl RuntimeState {
    pub fn new(network_start: bool) -> Self {
        Self {
            network_start,
            ..Default::default()
        }
    }

    pub fn last_height(&self) -> u64 {
        self.last_block.as_ref().map_or(0, Block::height)
    }

    pub fn last_downloaded_height(&self) -> u64 {
        self.last_downloaded_block
            .as_ref()
            .map_or_else(|| self.last_height(), |header| header.height)
    }

    /// Move the tip; the downloaded pointer never trails it.
    pub fn set_last_block(&mut self, block: Block) {
        let behind = self
            .last_downloaded_block
            .as_ref()
            .map_or(true, |downloaded| downloaded.height < block.height());
        if behind {
            self.last_downloaded_block = Some(block.header.clone());
        }
        self.last_block = Some(block);
    }

    /// Advance the downloaded pointer. Lower heights are ignored.
    pub fn advance_last_downloaded(&mut self, header: BlockHeader) {
        if header.height >= self.last_downloaded_height() {
            self.last_downloaded_block = Some(header);
        }
    }

    /// Explicit reset of the downloaded pointer to the tip.
    pub fn reset_last_downloaded_block(&mut self) {
        self.last_downloaded_block = self.last_block.as_ref().map(|block| block.header.clone());
    }

    /// Explicit rollback of both pointers to `block`.
    pub fn rewind_to(&mut self, block: Block) {
        self.last_downloaded_block = Some(block.header.clone());
        self.last_block = Some(block);
    }

    pub fn reset_counters(&mut self) {
        self.no_block_counter = 0;
        self.p2p_update_counter = 0;
    }
}
