//! Retry bookkeeping for blocks that arrive ahead of the tip.

use crate::domain::BlockId;

/// Counts consecutive not-ready attempts for a single block id.
///
/// Tracking a different id resets the count.
#[derive(Debug)]
pub struct NotReadyCounter {
    id: Option<BlockId>,
    attempts: u32,
    max_attempts: u32,
}

impl NotReadyCounter {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            id: None,
            attempts: 0,
            max_attempts,
        }
    }

    /// Record an attempt. Returns `false` once the attempts are exhausted, at
    /// which point the counter resets.
    pub fn increment(&mut self, id: &BlockId) -> bool {
        if self.id.as_ref() != Some(id) {
            self.reset();
            self.id = Some(id.clone());
        }

        self.attempts += 1;
        let attempts_left = self.attempts <= self.max_attempts;
        if !attempts_left {
            self.reset();
        }
        attempts_left
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.id = None;
        self.attempts = 0;
    }
}
