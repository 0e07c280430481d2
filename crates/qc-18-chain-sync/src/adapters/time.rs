//! Wall-clock time source.

use crate::ports::TimeSource;
use std::time::{SystemTime, UNIX_EPOCH};

/// [`TimeSource`] measuring seconds since a network epoch.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemTimeSource {
    /// Network epoch as seconds since the Unix epoch.
    epoch: u64,
}

impl SystemTimeSource {
    pub fn new(epoch: u64) -> Self {
        Self { epoch }
    }
}

impl TimeSource for SystemTimeSource {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
            .saturating_sub(self.epoch)
    }
}
