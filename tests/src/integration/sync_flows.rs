//! # Chain Sync Flows
//!
//! Whole-engine scenarios: configuration loaded from TOML, seed bootstrap and
//! discovery, download and block processing, peer cleansing, replay between
//! two ledgers and the lifecycle signal.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use qc_18_chain_sync::network::CleanseOptions;
    use qc_18_chain_sync::test_utils::{
        build_chain, peer_address, test_delegates, ControllableTimeSource, InMemoryLedger,
        MockPeer, MockPeerNetwork, MockTransactionPool, RecordingEventDispatcher,
        RecordingPeerAcceptance,
    };
    use qc_18_chain_sync::{
        Block, ChainState, ChainSyncApi, ChainSyncConfig, ChainSyncDependencies,
        ChainSyncService, InMemoryPeerRepository, Lifecycle, NetworkDependencies, Peer,
        PeerRepository, SyncNotification,
    };

    use crate::init_test_logging;

    const BLOCK_TIME: u64 = 8;

    // =============================================================================
    // TEST FIXTURES
    // =============================================================================

    struct Node {
        service: ChainSyncService,
        ledger: Arc<InMemoryLedger>,
        repository: Arc<InMemoryPeerRepository>,
        acceptance: Arc<RecordingPeerAcceptance>,
        events: Arc<RecordingEventDispatcher>,
    }

    fn timestamp_of(height: u64) -> u64 {
        height.saturating_sub(1) * BLOCK_TIME
    }

    fn chain(height: u64) -> Vec<Block> {
        build_chain(height, BLOCK_TIME, &test_delegates(3))
    }

    /// A node whose ledger holds `local` blocks and whose clock sits at the
    /// slot of `clock_height`.
    fn node(
        config: ChainSyncConfig,
        local: Vec<Block>,
        network: Arc<MockPeerNetwork>,
        repository: Arc<InMemoryPeerRepository>,
        clock_height: u64,
    ) -> Node {
        let ledger = Arc::new(InMemoryLedger::new(local, test_delegates(3)));
        let acceptance = Arc::new(RecordingPeerAcceptance::new(repository.clone()));
        let events = Arc::new(RecordingEventDispatcher::new());

        let service = ChainSyncService::new(
            config,
            ChainSyncDependencies {
                database: ledger.clone(),
                pool: Arc::new(MockTransactionPool::new()),
                network: NetworkDependencies {
                    communicator: network,
                    repository: repository.clone(),
                    acceptance: acceptance.clone(),
                    events: events.clone(),
                },
                time: Arc::new(ControllableTimeSource::new(timestamp_of(clock_height))),
            },
        )
        .expect("valid config");

        Node {
            service,
            ledger,
            repository,
            acceptance,
            events,
        }
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    const SEEDED_CONFIG: &str = r#"
        [blockchain]
        block_time_secs = 8
        wake_up_secs = 1

        [network]
        seed_peers = [{ ip = "10.0.0.1", port = 4002 }]
        minimum_network_reach = 1
        verify_timeout_ms = 500
        fast_ping_timeout_ms = 100
        get_peers_timeout_ms = 500
        post_block_timeout_ms = 500
        update_interval_secs = 5
        seed_retry_secs = 1

        [download]
        chunk_size = 4
        max_parallel_downloads = 3
        get_blocks_timeout_ms = 500
    "#;

    // =============================================================================
    // BOOTSTRAP
    // =============================================================================

    /// A fresh node knows only its seed. Discovery finds the rest of the
    /// network and the chain is downloaded from all of them.
    #[tokio::test]
    async fn test_seeded_node_discovers_peers_and_syncs_from_genesis() {
        init_test_logging();
        let config = ChainSyncConfig::from_toml_str(SEEDED_CONFIG).unwrap();
        assert_eq!(config.network.seed_peers, vec![peer_address(1)]);

        let remote = chain(40);
        let network = Arc::new(MockPeerNetwork::new());
        network.add_peer(
            peer_address(1),
            MockPeer::serving(remote.clone()).knowing(vec![peer_address(2), peer_address(3)]),
        );
        network.add_peer(peer_address(2), MockPeer::serving(remote.clone()));
        network.add_peer(peer_address(3), MockPeer::serving(remote.clone()));

        let node = node(
            config,
            remote[..1].to_vec(),
            network.clone(),
            Arc::new(InMemoryPeerRepository::new()),
            40,
        );

        node.service.start().await.unwrap();
        assert!(node.service.wait_until_ready().await);

        assert_eq!(node.ledger.height(), 40);
        assert_eq!(node.repository.peer_count(), 3);
        assert!(node.service.is_synced());

        let accepted = node.acceptance.accepted();
        assert_eq!(accepted[0].0, peer_address(1));
        assert!(accepted[0].1.seed);
        assert!(accepted[1..].iter().all(|(_, options)| !options.seed));

        let status = node.service.network_status();
        assert_eq!(status.peer_count, 3);
        assert_eq!(status.median_height, 40);
        assert_eq!(status.own_height, 40);

        node.service.stop().await;
        assert_eq!(node.service.state(), ChainState::Stopped);
    }

    // =============================================================================
    // UNREACHABLE PEERS
    // =============================================================================

    /// One known peer never answers. Download still completes from the
    /// others, and a cleanse evicts the dead peer.
    #[tokio::test]
    async fn test_sync_completes_around_unreachable_peer() {
        init_test_logging();
        let remote = chain(40);
        let network = Arc::new(MockPeerNetwork::new());
        let repository = Arc::new(InMemoryPeerRepository::new());
        for n in 1..=3 {
            repository.update_peer(Peer::new(peer_address(n)).with_height(40));
        }
        network.add_peer(peer_address(1), MockPeer::serving(remote.clone()));
        network.add_peer(peer_address(2), MockPeer::serving(remote.clone()));
        network.add_peer(peer_address(3), MockPeer::unreachable());

        let node = node(
            ChainSyncConfig::for_testing(),
            remote[..10].to_vec(),
            network,
            repository,
            40,
        );

        node.service.start().await.unwrap();
        eventually(|| node.ledger.height() == 40).await;

        let report = node
            .service
            .monitor()
            .cleanse_peers(CleanseOptions::default())
            .await;
        assert!(report.responsive <= report.checked);
        assert!(!node.repository.has_peer(&peer_address(3)));
        assert!(node.repository.has_peer(&peer_address(1)));
        assert!(node.repository.has_peer(&peer_address(2)));
        assert!(
            node.events
                .count(|n| matches!(n, SyncNotification::PeerRemoved(a) if *a == peer_address(3)))
                >= 1
        );

        node.service.stop().await;
    }

    // =============================================================================
    // REPLAY
    // =============================================================================

    /// A node synced from the network serves as the snapshot another node
    /// replays from.
    #[tokio::test]
    async fn test_replay_rebuilds_ledger_from_synced_node() {
        init_test_logging();
        let remote = chain(40);
        let network = Arc::new(MockPeerNetwork::new());
        let repository = Arc::new(InMemoryPeerRepository::new());
        repository.update_peer(Peer::new(peer_address(1)).with_height(40));
        network.add_peer(peer_address(1), MockPeer::serving(remote.clone()));

        let synced = node(
            ChainSyncConfig::for_testing(),
            remote[..1].to_vec(),
            network,
            repository,
            40,
        );
        synced.service.start().await.unwrap();
        assert!(synced.service.wait_until_ready().await);
        synced.service.stop().await;
        assert_eq!(synced.ledger.height(), 40);

        let mut config = ChainSyncConfig::for_testing();
        config.blockchain.replay_batch_size = 7;
        let fresh = node(
            config,
            remote[..1].to_vec(),
            Arc::new(MockPeerNetwork::new()),
            Arc::new(InMemoryPeerRepository::new()),
            40,
        );

        let replayed = fresh
            .service
            .replay(synced.ledger.as_ref(), 40)
            .await
            .unwrap();

        assert_eq!(replayed, 39);
        assert_eq!(fresh.ledger.height(), 40);
        assert_eq!(fresh.ledger.blocks(), synced.ledger.blocks());
    }

    // =============================================================================
    // LIFECYCLE
    // =============================================================================

    #[tokio::test]
    async fn test_lifecycle_moves_from_booting_to_ready_to_stopped() {
        init_test_logging();
        let node = node(
            ChainSyncConfig::for_testing(),
            chain(5),
            Arc::new(MockPeerNetwork::new()),
            Arc::new(InMemoryPeerRepository::new()),
            5,
        );
        let mut lifecycle = node.service.subscribe_lifecycle();
        assert_eq!(*lifecycle.borrow(), Lifecycle::Booting);

        node.service.start().await.unwrap();
        lifecycle
            .wait_for(|status| *status == Lifecycle::Ready)
            .await
            .unwrap();
        assert_eq!(node.service.state(), ChainState::Idle);
        assert_eq!(
            node.events
                .count(|n| matches!(n, SyncNotification::StateStarted)),
            1
        );

        node.service.stop().await;
        assert_eq!(*lifecycle.borrow_and_update(), Lifecycle::Stopped);
        assert!(node.service.is_stopped());
    }
}
