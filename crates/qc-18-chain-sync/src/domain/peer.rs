//! Peer entities and network statistics.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Network address of a peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    pub ip: IpAddr,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// State a peer advertises in response to a ping.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerState {
    pub height: Option<u64>,
    pub current_slot: u64,
    pub forging_allowed: bool,
}

/// Outcome of comparing a peer's chain with ours.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerVerificationResult {
    pub our_height: u64,
    pub their_height: u64,
    pub highest_common_height: u64,
}

impl PeerVerificationResult {
    pub fn new(our_height: u64, their_height: u64, highest_common_height: u64) -> Self {
        Self {
            our_height,
            their_height,
            highest_common_height,
        }
    }

    /// A peer is forked when the common height is neither tip.
    pub fn forked(&self) -> bool {
        self.highest_common_height != self.our_height
            && self.highest_common_height != self.their_height
    }
}

/// A known peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub address: PeerAddress,
    pub state: PeerState,
    /// Consecutive failed requests; reset on success.
    pub sequential_errors: u32,
    pub verification: Option<PeerVerificationResult>,
}

impl Peer {
    pub fn new(address: PeerAddress) -> Self {
        Self {
            address,
            state: PeerState::default(),
            sequential_errors: 0,
            verification: None,
        }
    }

    pub fn with_height(mut self, height: u64) -> Self {
        self.state.height = Some(height);
        self
    }

    pub fn with_verification(mut self, verification: PeerVerificationResult) -> Self {
        self.verification = Some(verification);
        self
    }

    pub fn is_forked(&self) -> bool {
        self.verification.is_some_and(|v| v.forked())
    }

    pub fn height(&self) -> Option<u64> {
        self.state.height
    }
}

/// Median of the given heights. Even-length input averages the two middle
/// values (rounded down). Empty input yields 0.
pub fn median_height(heights: &[u64]) -> u64 {
    if heights.is_empty() {
        return 0;
    }

    let mut sorted = heights.to_vec();
    sorted.sort_unstable();
    let mid = sorted.len() / 2;

    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2
    } else {
        sorted[mid]
    }
}

/// Point-in-time view of the network.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    pub peer_count: usize,
    pub median_height: u64,
    pub own_height: u64,
}

/// Verdict of a network health check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForkStatus {
    NotForked,
    Forked { blocks_to_rollback: u64 },
}

impl ForkStatus {
    pub fn is_forked(&self) -> bool {
        matches!(self, ForkStatus::Forked { .. })
    }
}
