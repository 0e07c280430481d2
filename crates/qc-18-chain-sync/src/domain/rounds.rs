//! Forging rounds and slots.
//!
//! A round is `active_delegates` consecutive heights. Slots are fixed windows of
//! `block_time` seconds counted from the network epoch.

use serde::{Deserialize, Serialize};

/// Round a height belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundInfo {
    pub round: u64,
    /// First height of the round.
    pub round_height: u64,
    pub next_round: u64,
    pub max_delegates: u64,
}

/// Compute the round for `height`. Heights start at 1.
pub fn calculate_round(height: u64, active_delegates: u64) -> RoundInfo {
    let delegates = active_delegates.max(1);
    let round = height.saturating_sub(1) / delegates + 1;
    let round_height = (round - 1) * delegates + 1;
    let next_round = if height + 1 >= round_height + delegates {
        round + 1
    } else {
        round
    };

    RoundInfo {
        round,
        round_height,
        next_round,
        max_delegates: delegates,
    }
}

pub fn slot_number(timestamp: u64, block_time: u64) -> u64 {
    timestamp / block_time.max(1)
}

pub fn slot_time(slot: u64, block_time: u64) -> u64 {
    slot * block_time
}
