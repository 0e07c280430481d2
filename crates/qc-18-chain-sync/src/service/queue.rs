//! FIFO block queue drained by a single worker.

use crate::domain::Block;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct QueueInner {
    blocks: VecDeque<Block>,
    /// A block has been handed to the worker and is not finished yet.
    processing: bool,
    paused: bool,
    killed: bool,
}

/// Pending blocks awaiting the pipeline.
///
/// At most one block is out for processing at any time: [`BlockQueue::next`]
/// hands out a block and the worker reports back with
/// [`BlockQueue::finish`].
#[derive(Debug, Default)]
pub struct BlockQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl BlockQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, blocks: Vec<Block>) {
        {
            let mut inner = self.inner.lock();
            if inner.killed {
                return;
            }
            inner.blocks.extend(blocks);
        }
        self.notify.notify_one();
    }

    /// Drop every pending block. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let dropped = inner.blocks.len();
        inner.blocks.clear();
        dropped
    }

    pub fn clear_and_pause(&self) {
        let mut inner = self.inner.lock();
        inner.blocks.clear();
        inner.paused = true;
    }

    pub fn resume(&self) {
        self.inner.lock().paused = false;
        self.notify.notify_one();
    }

    /// Drop everything and release the worker for good.
    pub fn kill(&self) {
        {
            let mut inner = self.inner.lock();
            inner.blocks.clear();
            inner.killed = true;
        }
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }

    /// Nothing pending and nothing in flight.
    pub fn is_idle(&self) -> bool {
        let inner = self.inner.lock();
        inner.blocks.is_empty() && !inner.processing
    }

    /// Wait for the next block. `None` once the queue is killed.
    pub async fn next(&self) -> Option<Block> {
        loop {
            {
                let mut inner = self.inner.lock();
                if inner.killed {
                    return None;
                }
                if !inner.paused {
                    if let Some(block) = inner.blocks.pop_front() {
                        inner.processing = true;
                        return Some(block);
                    }
                }
            }
            self.notify.notified().await;
        }
    }

    /// Mark the in-flight block done. Returns whether the queue drained.
    pub fn finish(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.processing = false;
        inner.blocks.is_empty() && !inner.killed
    }
}
