//! # Fork Detector
//!
//! Turns the verification results of known peers into a fork verdict.
//!
//! A fork is declared only when a strict majority of verified peers report
//! being on a different chain. The rollback target is the most common highest
//! common height among those peers; equally common heights resolve to the
//! highest one.

use crate::domain::{ForkStatus, Peer};
use std::collections::BTreeMap;
use tracing::info;

pub fn detect_fork(peers: &[Peer], our_height: u64, max_blocks_to_rollback: u64) -> ForkStatus {
    if peers.is_empty() {
        info!("No peers available.");
        return ForkStatus::NotForked;
    }

    let verified: Vec<_> = peers.iter().filter_map(|peer| peer.verification).collect();
    if verified.is_empty() {
        info!("No verified peers available.");
        return ForkStatus::NotForked;
    }

    let forked: Vec<_> = verified.iter().filter(|result| result.forked()).collect();
    if forked.len() * 2 <= verified.len() {
        info!("The majority of peers is not forked. No need to rollback.");
        return ForkStatus::NotForked;
    }

    let mut groups: BTreeMap<u64, usize> = BTreeMap::new();
    for result in &forked {
        *groups.entry(result.highest_common_height).or_default() += 1;
    }

    // Ties resolve to the highest height: later keys win `max_by` on equal counts.
    let Some((&target, &count)) = groups.iter().max_by(|a, b| a.1.cmp(b.1)) else {
        return ForkStatus::NotForked;
    };

    let blocks_to_rollback = our_height.saturating_sub(target).min(max_blocks_to_rollback);
    info!(
        "Rolling back {} blocks to most common height {} ({} of {} forked peers)",
        blocks_to_rollback,
        target,
        count,
        forked.len()
    );

    ForkStatus::Forked { blocks_to_rollback }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PeerVerificationResult;
    use crate::test_utils::peer_address;
    use proptest::prelude::*;

    fn peers_with(results: &[(u64, u64, u64, usize)]) -> Vec<Peer> {
        let mut peers = Vec::new();
        let mut n = 1u8;
        for &(ours, theirs, common, count) in results {
            for _ in 0..count {
                peers.push(
                    Peer::new(peer_address(n))
                        .with_verification(PeerVerificationResult::new(ours, theirs, common)),
                );
                n += 1;
            }
        }
        peers
    }

    #[test]
    fn test_no_peers_not_forked() {
        assert_eq!(detect_fork(&[], 100, 5000), ForkStatus::NotForked);
    }

    #[test]
    fn test_unverified_peers_ignored() {
        let peers = vec![Peer::new(peer_address(1)), Peer::new(peer_address(2))];
        assert_eq!(detect_fork(&peers, 100, 5000), ForkStatus::NotForked);
    }

    #[test]
    fn test_minority_forked_not_forked() {
        // 4 of 10 forked
        let peers = peers_with(&[(43, 47, 35, 4), (43, 47, 43, 6)]);
        assert_eq!(detect_fork(&peers, 43, 5000), ForkStatus::NotForked);
    }

    #[test]
    fn test_exact_half_forked_not_forked() {
        let peers = peers_with(&[(43, 47, 35, 5), (43, 47, 43, 5)]);
        assert_eq!(detect_fork(&peers, 43, 5000), ForkStatus::NotForked);
    }

    #[test]
    fn test_majority_forked_rolls_back_to_mode() {
        // 7 of 10 forked; 3 share height 40
        let peers = peers_with(&[(43, 47, 40, 3), (43, 47, 31, 2), (43, 47, 12, 2), (43, 47, 43, 3)]);
        assert_eq!(
            detect_fork(&peers, 43, 5000),
            ForkStatus::Forked {
                blocks_to_rollback: 3
            }
        );
    }

    #[test]
    fn test_tie_resolves_to_highest_height() {
        let peers = peers_with(&[(43, 47, 12, 1), (43, 47, 31, 3), (43, 47, 35, 3), (43, 47, 43, 3)]);
        assert_eq!(
            detect_fork(&peers, 43, 5000),
            ForkStatus::Forked {
                blocks_to_rollback: 8
            }
        );
    }

    #[test]
    fn test_rollback_capped() {
        let peers = peers_with(&[(9000, 9100, 100, 3)]);
        assert_eq!(
            detect_fork(&peers, 9000, 5000),
            ForkStatus::Forked {
                blocks_to_rollback: 5000
            }
        );
    }

    proptest! {
        #[test]
        fn prop_rollback_never_exceeds_cap_or_height(
            commons in prop::collection::vec(0u64..500, 1..20),
            our_height in 500u64..2000,
            cap in 1u64..1000,
        ) {
            let peers: Vec<Peer> = commons
                .iter()
                .enumerate()
                .map(|(i, c)| {
                    Peer::new(peer_address(i as u8 + 1))
                        .with_verification(PeerVerificationResult::new(our_height, our_height + 10, *c))
                })
                .collect();

            if let ForkStatus::Forked { blocks_to_rollback } = detect_fork(&peers, our_height, cap) {
                prop_assert!(blocks_to_rollback <= cap);
                prop_assert!(blocks_to_rollback <= our_height);
            }
        }
    }
}
