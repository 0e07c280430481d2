//! In-memory peer repository.

use crate::domain::{Peer, PeerAddress};
use crate::ports::PeerRepository;
use parking_lot::RwLock;
use std::collections::HashMap;

/// [`PeerRepository`] backed by a map.
#[derive(Default)]
pub struct InMemoryPeerRepository {
    peers: RwLock<HashMap<PeerAddress, Peer>>,
}

impl InMemoryPeerRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_peers(peers: impl IntoIterator<Item = Peer>) -> Self {
        let repository = Self::new();
        {
            let mut map = repository.peers.write();
            for peer in peers {
                map.insert(peer.address, peer);
            }
        }
        repository
    }
}

impl PeerRepository for InMemoryPeerRepository {
    fn get_peers(&self) -> Vec<Peer> {
        self.peers.read().values().cloned().collect()
    }

    fn get_peer(&self, address: &PeerAddress) -> Option<Peer> {
        self.peers.read().get(address).cloned()
    }

    fn update_peer(&self, peer: Peer) {
        self.peers.write().insert(peer.address, peer);
    }

    fn forget_peer(&self, address: &PeerAddress) {
        self.peers.write().remove(address);
    }

    fn peer_count(&self) -> usize {
        self.peers.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::peer_address;

    #[test]
    fn test_update_and_forget() {
        let repository = InMemoryPeerRepository::new();
        repository.update_peer(Peer::new(peer_address(1)));
        repository.update_peer(Peer::new(peer_address(1)).with_height(7));

        assert_eq!(repository.peer_count(), 1);
        assert_eq!(
            repository.get_peer(&peer_address(1)).and_then(|p| p.height()),
            Some(7)
        );

        repository.forget_peer(&peer_address(1));
        assert!(!repository.has_peers());
    }
}
