//! Tests for ChainSyncService

use super::*;
use crate::adapters::InMemoryPeerRepository;
use crate::domain::{BlockVerification, Peer, PeerVerificationResult, PublicKey, Transaction};
use crate::machine::EntryAction;
use crate::network::NetworkDependencies;
use crate::ports::PeerRepository;
use crate::test_utils::{
    block_with_transactions, build_chain, header_at, peer_address, test_delegates,
    ControllableTimeSource, InMemoryLedger, MockPeer, MockPeerNetwork, MockTransactionPool,
    RecordingEventDispatcher, RecordingPeerAcceptance,
};
use std::sync::atomic::Ordering;
use std::time::Duration;

const BLOCK_TIME: u64 = 8;

struct Harness {
    service: ChainSyncService,
    ledger: Arc<InMemoryLedger>,
    pool: Arc<MockTransactionPool>,
    network: Arc<MockPeerNetwork>,
    repository: Arc<InMemoryPeerRepository>,
    events: Arc<RecordingEventDispatcher>,
    clock: Arc<ControllableTimeSource>,
    delegates: Vec<PublicKey>,
}

fn timestamp_of(height: u64) -> u64 {
    height.saturating_sub(1) * BLOCK_TIME
}

/// Local ledger at `local_height`, `peers` peers serving a chain of
/// `network_height`, clock at the newest block's slot.
fn harness_with(
    config: ChainSyncConfig,
    local_height: u64,
    network_height: u64,
    peers: u8,
) -> Harness {
    let delegates = test_delegates(3);
    let chain = build_chain(local_height.max(network_height), BLOCK_TIME, &delegates);

    let ledger = Arc::new(InMemoryLedger::new(
        chain[..local_height as usize].to_vec(),
        delegates.clone(),
    ));
    let pool = Arc::new(MockTransactionPool::new());
    let network = Arc::new(MockPeerNetwork::new());
    let repository = Arc::new(InMemoryPeerRepository::new());

    for n in 1..=peers {
        repository.update_peer(Peer::new(peer_address(n)).with_height(network_height));
        network.add_peer(
            peer_address(n),
            MockPeer::serving(chain[..network_height as usize].to_vec()),
        );
    }

    let acceptance = Arc::new(RecordingPeerAcceptance::new(repository.clone()));
    let events = Arc::new(RecordingEventDispatcher::new());
    let clock = Arc::new(ControllableTimeSource::new(timestamp_of(
        local_height.max(network_height),
    )));

    let service = ChainSyncService::new(
        config,
        ChainSyncDependencies {
            database: ledger.clone(),
            pool: pool.clone(),
            network: NetworkDependencies {
                communicator: network.clone(),
                repository: repository.clone(),
                acceptance,
                events: events.clone(),
            },
            time: clock.clone(),
        },
    )
    .unwrap();

    Harness {
        service,
        ledger,
        pool,
        network,
        repository,
        events,
        clock,
        delegates,
    }
}

fn harness(local_height: u64, network_height: u64, peers: u8) -> Harness {
    harness_with(ChainSyncConfig::for_testing(), local_height, network_height, peers)
}

/// Load the ledger tip into runtime state, as `init` would.
fn load_tip(h: &Harness) {
    let tip = h.ledger.blocks().last().cloned().unwrap();
    h.service.core.state.write().rewind_to(tip);
}

/// Next event dispatched while the event loop is not running.
fn next_event(h: &Harness) -> Option<SyncEvent> {
    h.service
        .core
        .event_rx
        .lock()
        .as_mut()
        .and_then(|rx| rx.try_recv().ok())
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

fn serve_chain(h: &Harness, height: u64, peers: u8) {
    let chain = build_chain(height, BLOCK_TIME, &h.delegates);
    for n in 1..=peers {
        h.repository
            .update_peer(Peer::new(peer_address(n)).with_height(height));
        h.network
            .add_peer(peer_address(n), MockPeer::serving(chain.clone()));
    }
    h.clock.set(timestamp_of(height));
}

// =============================================================================
// End-to-end flows
// =============================================================================

#[tokio::test]
async fn test_start_syncs_to_network_height() {
    let h = harness(10, 30, 2);

    h.service.start().await.unwrap();
    assert!(h.service.wait_until_ready().await);

    assert_eq!(h.ledger.height(), 30);
    assert_eq!(h.service.state(), ChainState::Idle);
    assert!(h.service.is_synced());
    assert_eq!(
        h.events
            .count(|n| matches!(n, SyncNotification::StateStarted)),
        1
    );

    let status = h.service.network_status();
    assert_eq!(status.peer_count, 2);
    assert_eq!(status.median_height, 30);
    assert_eq!(status.own_height, 30);

    h.service.stop().await;
    assert_eq!(h.service.state(), ChainState::Stopped);
}

#[tokio::test]
async fn test_start_without_peers_is_ready_at_local_tip() {
    let h = harness(5, 5, 0);

    h.service.start().await.unwrap();
    assert!(h.service.wait_until_ready().await);

    assert_eq!(h.ledger.height(), 5);
    assert!(h.service.is_synced());
    h.service.stop().await;
}

#[tokio::test]
async fn test_incoming_block_processed_and_broadcast_when_idle() {
    let h = harness(30, 30, 2);
    h.service.start().await.unwrap();
    assert!(h.service.wait_until_ready().await);

    let next = build_chain(31, BLOCK_TIME, &h.delegates).remove(30);
    h.clock.set(timestamp_of(31));
    h.service.handle_incoming_block(next).await;

    eventually(|| h.ledger.height() == 31).await;
    eventually(|| h.network.posted().len() == 2).await;
    assert_eq!(
        h.events
            .count(|n| matches!(n, SyncNotification::BlockReceived(id) if id.0 == "block-31")),
        1
    );

    h.service.stop().await;
}

#[tokio::test]
async fn test_wake_up_syncs_new_network_blocks() {
    let h = harness(30, 30, 2);
    h.service.start().await.unwrap();
    assert!(h.service.wait_until_ready().await);

    serve_chain(&h, 35, 2);

    // The idle wake-up timer is one second under the test config.
    eventually(|| h.ledger.height() == 35).await;
    h.service.stop().await;
}

#[tokio::test]
async fn test_force_wake_up_syncs_immediately() {
    let mut config = ChainSyncConfig::for_testing();
    config.blockchain.wake_up_secs = 3600;
    let h = harness_with(config, 30, 30, 2);
    h.service.start().await.unwrap();
    assert!(h.service.wait_until_ready().await);

    serve_chain(&h, 35, 2);
    h.service.force_wake_up();

    eventually(|| h.ledger.height() == 35).await;
    h.service.stop().await;
}

#[tokio::test]
async fn test_double_forged_block_triggers_fork_recovery() {
    let mut config = ChainSyncConfig::for_testing();
    config.blockchain.fork_rollback_min = 4;
    config.blockchain.fork_rollback_max = 6;
    let h = harness_with(config, 30, 30, 2);
    h.service.start().await.unwrap();
    assert!(h.service.wait_until_ready().await);

    // Same height as the tip, later slot, forged by the delegate owning it.
    let mut header = header_at(30, BLOCK_TIME, &h.delegates);
    header.id = crate::domain::BlockId::new("fork-30");
    header.timestamp = timestamp_of(31);
    header.generator_public_key = h.delegates[0].clone();
    h.clock.set(timestamp_of(31));

    h.service
        .handle_incoming_block(Block::new(header, Vec::new()))
        .await;

    eventually(|| h.ledger.revert_calls.load(Ordering::SeqCst) >= 4).await;
    eventually(|| {
        h.ledger.height() == 30 && h.service.runtime_state().forked_block.is_none()
    })
    .await;
    assert_eq!(h.ledger.blocks().last().unwrap().id().0, "block-30");

    h.service.stop().await;
}

#[tokio::test]
async fn test_corrupt_database_is_rolled_back() {
    let mut config = ChainSyncConfig::for_testing();
    config.blockchain.rollback_steps = 2;
    config.blockchain.max_block_rewind = 10;
    let h = harness_with(config, 30, 30, 0);
    h.ledger.set_corrupt_above(Some(25));

    h.service.start().await.unwrap();
    assert!(h.service.wait_until_ready().await);

    assert_eq!(h.ledger.height(), 24);
    assert!(h.service.runtime_state().restored_database_integrity);
    h.service.stop().await;
}

#[tokio::test]
async fn test_unrecoverable_database_exits() {
    let h = harness(10, 10, 0);
    h.ledger.set_corrupt_above(Some(0));

    h.service.start().await.unwrap();
    assert!(!h.service.wait_until_ready().await);

    assert_eq!(h.service.state(), ChainState::Exit);
    assert!(matches!(
        *h.service.subscribe_lifecycle().borrow(),
        Lifecycle::Exited { .. }
    ));
    assert!(h.service.is_stopped());
}

#[tokio::test]
async fn test_genesis_mismatch_exits() {
    let mut config = ChainSyncConfig::for_testing();
    config.blockchain.genesis_payload_hash = Some("another-network".into());
    let h = harness_with(config, 1, 1, 0);

    h.service.start().await.unwrap();
    assert!(!h.service.wait_until_ready().await);
    assert_eq!(h.service.state(), ChainState::Exit);
}

#[tokio::test]
async fn test_network_start_goes_idle_in_cold_start() {
    let mut config = ChainSyncConfig::for_testing();
    config.blockchain.network_start = true;
    config.blockchain.genesis_payload_hash = Some("payload-1".into());
    let h = harness_with(config, 1, 1, 0);

    h.service.start().await.unwrap();
    assert!(h.service.wait_until_ready().await);

    assert_eq!(h.service.state(), ChainState::Idle);
    assert!(h.service.monitor().is_cold_start());
    h.service.stop().await;
}

#[tokio::test]
async fn test_stop_before_start() {
    let h = harness(5, 5, 0);

    h.service.stop().await;

    assert_eq!(h.service.state(), ChainState::Stopped);
    assert_eq!(*h.service.subscribe_lifecycle().borrow(), Lifecycle::Stopped);
    assert!(matches!(h.service.start().await, Err(SyncError::Stopped)));
}

#[tokio::test]
async fn test_second_start_is_ignored() {
    let h = harness(5, 5, 0);
    h.service.start().await.unwrap();
    h.service.start().await.unwrap();
    assert!(h.service.wait_until_ready().await);
    h.service.stop().await;
}

// =============================================================================
// Incoming blocks
// =============================================================================

#[tokio::test]
async fn test_incoming_block_disregarded_before_ready() {
    let h = harness(10, 10, 1);
    let next = build_chain(11, BLOCK_TIME, &h.delegates).remove(10);
    h.clock.set(timestamp_of(11));

    h.service.handle_incoming_block(next).await;

    assert_eq!(
        h.events
            .count(|n| matches!(n, SyncNotification::BlockDisregarded(_))),
        1
    );
    assert_eq!(h.service.queue_length(), 0);
}

#[tokio::test]
async fn test_future_slot_block_disregarded() {
    let h = harness(10, 10, 1);
    h.service.core.state.write().started = true;
    let future = build_chain(12, BLOCK_TIME, &h.delegates).remove(11);

    h.service.handle_incoming_block(future).await;

    assert_eq!(
        h.events
            .count(|n| matches!(n, SyncNotification::BlockDisregarded(_))),
        1
    );
    assert_eq!(h.service.queue_length(), 0);
    assert_eq!(next_event(&h), None);
}

#[tokio::test]
async fn test_incoming_block_enqueued_when_started() {
    let h = harness(10, 10, 1);
    load_tip(&h);
    h.service.core.state.write().started = true;
    let next = build_chain(11, BLOCK_TIME, &h.delegates).remove(10);
    h.clock.set(timestamp_of(11));

    h.service.handle_incoming_block(next).await;

    assert_eq!(next_event(&h), Some(SyncEvent::NewBlock));
    assert_eq!(h.service.queue_length(), 1);
    assert_eq!(h.service.runtime_state().last_downloaded_height(), 11);
}

// =============================================================================
// Entry actions
// =============================================================================

#[tokio::test]
async fn test_check_synced_pauses_on_long_queue() {
    let mut config = ChainSyncConfig::for_testing();
    config.blockchain.max_queue_length = 2;
    let h = harness_with(config, 5, 5, 1);
    h.service
        .core
        .queue
        .push(build_chain(3, BLOCK_TIME, &h.delegates));

    h.service
        .core
        .run_action(EntryAction::CheckLastDownloadedBlockSynced)
        .await;

    assert_eq!(next_event(&h), Some(SyncEvent::Paused));
}

#[tokio::test]
async fn test_check_synced_detects_halted_network() {
    let h = harness(10, 10, 1);
    load_tip(&h);
    h.service.core.state.write().no_block_counter = 6;

    h.service
        .core
        .run_action(EntryAction::CheckLastDownloadedBlockSynced)
        .await;

    assert_eq!(next_event(&h), Some(SyncEvent::NetworkHalted));
    let state = h.service.runtime_state();
    assert_eq!(state.no_block_counter, 0);
    assert_eq!(state.p2p_update_counter, 1);
}

#[tokio::test]
async fn test_check_synced_health_check_finds_fork() {
    let h = harness(43, 43, 0);
    load_tip(&h);
    for n in 1..=3 {
        h.repository.update_peer(
            Peer::new(peer_address(n)).with_verification(PeerVerificationResult::new(43, 47, 35)),
        );
        h.network.add_peer(peer_address(n), MockPeer::at_height(47));
    }
    {
        let mut state = h.service.core.state.write();
        state.no_block_counter = 6;
        state.p2p_update_counter = 3;
    }

    h.service
        .core
        .run_action(EntryAction::CheckLastDownloadedBlockSynced)
        .await;

    assert_eq!(next_event(&h), Some(SyncEvent::Fork));
    let state = h.service.runtime_state();
    assert_eq!(state.number_of_blocks_to_rollback, Some(8));
    assert_eq!(state.p2p_update_counter, 0);
}

#[tokio::test]
async fn test_check_synced_when_tip_is_recent() {
    let h = harness(30, 30, 1);
    load_tip(&h);
    h.service.core.state.write().p2p_update_counter = 2;

    h.service
        .core
        .run_action(EntryAction::CheckLastDownloadedBlockSynced)
        .await;

    assert_eq!(next_event(&h), Some(SyncEvent::Synced));
    assert_eq!(h.service.runtime_state().p2p_update_counter, 0);
}

#[tokio::test]
async fn test_check_not_synced_when_behind() {
    let h = harness(10, 30, 1);
    load_tip(&h);

    h.service
        .core
        .run_action(EntryAction::CheckLastDownloadedBlockSynced)
        .await;

    assert_eq!(next_event(&h), Some(SyncEvent::NotSynced));
}

#[tokio::test]
async fn test_download_blocks_enqueues_chained_blocks() {
    let h = harness(10, 30, 2);
    load_tip(&h);

    h.service.core.run_action(EntryAction::DownloadBlocks).await;

    assert_eq!(next_event(&h), Some(SyncEvent::Downloaded));
    assert_eq!(h.service.queue_length(), 8);
    assert_eq!(h.service.runtime_state().last_downloaded_height(), 18);
}

#[tokio::test]
async fn test_download_blocks_without_new_blocks() {
    let h = harness(30, 30, 1);
    load_tip(&h);

    h.service.core.run_action(EntryAction::DownloadBlocks).await;

    assert_eq!(next_event(&h), Some(SyncEvent::NoBlock));
    assert_eq!(h.service.runtime_state().no_block_counter, 1);
}

#[tokio::test]
async fn test_download_blocks_unchained_result_clears_queue() {
    let h = harness(10, 30, 1);
    load_tip(&h);
    // Downloaded pointer claims a block the peers do not build on.
    {
        let mut state = h.service.core.state.write();
        let mut header = header_at(12, BLOCK_TIME, &h.delegates);
        header.id = crate::domain::BlockId::new("orphan-12");
        state.advance_last_downloaded(header);
    }
    h.service
        .core
        .queue
        .push(build_chain(2, BLOCK_TIME, &h.delegates));

    h.service.core.run_action(EntryAction::DownloadBlocks).await;

    assert_eq!(next_event(&h), Some(SyncEvent::NoBlock));
    assert_eq!(h.service.queue_length(), 0);
    let state = h.service.runtime_state();
    assert_eq!(state.no_block_counter, 1);
    assert_eq!(state.last_downloaded_height(), 10);
}

#[tokio::test]
async fn test_download_finished_with_idle_queue() {
    let h = harness(5, 5, 0);
    h.service.core.run_action(EntryAction::DownloadFinished).await;
    assert_eq!(next_event(&h), Some(SyncEvent::ProcessFinished));
}

#[tokio::test]
async fn test_download_finished_waits_for_queue() {
    let h = harness(5, 5, 0);
    h.service
        .core
        .queue
        .push(build_chain(1, BLOCK_TIME, &h.delegates));

    h.service.core.run_action(EntryAction::DownloadFinished).await;
    assert_eq!(next_event(&h), None);
}

#[tokio::test]
async fn test_blockchain_ready_announces_once() {
    let h = harness(5, 5, 0);

    h.service.core.run_action(EntryAction::BlockchainReady).await;
    h.service.core.run_action(EntryAction::BlockchainReady).await;

    assert!(h.service.runtime_state().started);
    assert_eq!(
        h.events
            .count(|n| matches!(n, SyncNotification::StateStarted)),
        1
    );
    assert!(h.service.wait_until_ready().await);
}

#[tokio::test]
async fn test_fork_recovery_uses_recorded_depth() {
    let h = harness(20, 20, 0);
    load_tip(&h);
    h.service.core.state.write().number_of_blocks_to_rollback = Some(5);

    h.service.core.run_action(EntryAction::StartForkRecovery).await;

    assert_eq!(next_event(&h), Some(SyncEvent::Success));
    assert_eq!(h.ledger.height(), 15);
    let state = h.service.runtime_state();
    assert_eq!(state.number_of_blocks_to_rollback, None);
    assert_eq!(state.forked_block.as_ref().map(|header| header.height), Some(20));
    assert_eq!(state.last_downloaded_height(), 15);
    assert!(!h.service.core.queue.is_paused());
}

#[tokio::test]
async fn test_fork_recovery_waits_for_block_being_applied() {
    let h = harness(20, 20, 0);
    load_tip(&h);
    h.ledger.set_apply_delay(Some(Duration::from_millis(200)));

    let next = build_chain(21, BLOCK_TIME, &h.delegates).remove(20);
    let applying = {
        let core = h.service.core.clone();
        tokio::spawn(async move { core.process_queued_block(next).await })
    };
    eventually(|| h.ledger.apply_calls.load(Ordering::SeqCst) == 1).await;

    h.service.core.state.write().number_of_blocks_to_rollback = Some(3);
    h.service.core.run_action(EntryAction::StartForkRecovery).await;
    applying.await.unwrap();

    assert_eq!(h.ledger.overlapping_reverts.load(Ordering::SeqCst), 0);
    assert_eq!(h.ledger.revert_calls.load(Ordering::SeqCst), 3);
    assert_eq!(h.ledger.height(), 18);
    assert_eq!(h.service.runtime_state().last_height(), 18);
    assert_eq!(next_event(&h), Some(SyncEvent::Success));
}

#[tokio::test]
async fn test_fork_recovery_random_depth_within_bounds() {
    let h = harness(200, 200, 0);
    load_tip(&h);

    h.service.core.run_action(EntryAction::StartForkRecovery).await;

    assert_eq!(next_event(&h), Some(SyncEvent::Success));
    let height = h.ledger.height();
    assert!((98..=196).contains(&height), "height {height}");
}

#[tokio::test]
async fn test_rollback_database_fails_when_unrecoverable() {
    let h = harness(5, 5, 0);
    h.ledger.set_corrupt_above(Some(0));

    h.service.core.run_action(EntryAction::RollbackDatabase).await;

    assert_eq!(next_event(&h), Some(SyncEvent::Failure));
    assert!(!h.service.runtime_state().restored_database_integrity);
}

// =============================================================================
// Block removal and replay
// =============================================================================

#[tokio::test]
async fn test_remove_blocks_reverts_and_restores_pool() {
    let delegates = test_delegates(3);
    let mut chain = build_chain(8, BLOCK_TIME, &delegates);
    let mut previous = chain.last().unwrap().header.clone();
    for height in 9..=10 {
        let mut block = block_with_transactions(
            height,
            BLOCK_TIME,
            &delegates,
            vec![Transaction::new(format!("tx-{height}"), "alice")],
        );
        block.header.previous_block = previous.id.clone();
        previous = block.header.clone();
        chain.push(block);
    }

    let h = harness(1, 1, 0);
    let ledger = Arc::new(InMemoryLedger::new(chain, delegates));
    let service = ChainSyncService::new(
        ChainSyncConfig::for_testing(),
        ChainSyncDependencies {
            database: ledger.clone(),
            pool: h.pool.clone(),
            network: NetworkDependencies {
                communicator: h.network.clone(),
                repository: h.repository.clone(),
                acceptance: Arc::new(RecordingPeerAcceptance::new(h.repository.clone())),
                events: h.events.clone(),
            },
            time: h.clock.clone(),
        },
    )
    .unwrap();

    service.remove_blocks(3).await.unwrap();

    assert_eq!(ledger.height(), 7);
    let mut restored: Vec<String> = h.pool.transaction_ids().into_iter().map(|id| id.0).collect();
    restored.sort();
    assert_eq!(restored, vec!["tx-10".to_string(), "tx-9".to_string()]);

    let state = service.runtime_state();
    assert_eq!(state.last_height(), 7);
    assert_eq!(state.last_downloaded_height(), 7);
}

#[tokio::test]
async fn test_remove_blocks_keeps_genesis() {
    let h = harness(3, 3, 0);

    h.service.remove_blocks(10).await.unwrap();

    assert_eq!(h.ledger.height(), 1);
    assert_eq!(h.ledger.revert_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_replay_from_source_ledger() {
    let h = harness(5, 5, 0);
    let source = InMemoryLedger::new(build_chain(20, BLOCK_TIME, &h.delegates), h.delegates.clone());

    let replayed = h.service.replay(&source, 15).await.unwrap();

    assert_eq!(replayed, 10);
    assert_eq!(h.ledger.height(), 15);
}

#[tokio::test]
async fn test_replay_stops_at_first_refused_block() {
    let h = harness(5, 5, 0);
    let mut chain = build_chain(20, BLOCK_TIME, &h.delegates);
    chain[7] = chain[7].clone().with_verification(BlockVerification {
        verified: false,
        contains_multi_signatures: false,
        errors: vec!["bad signature".into()],
    });
    let source = InMemoryLedger::new(chain, h.delegates.clone());

    let replayed = h.service.replay(&source, 20).await.unwrap();

    assert_eq!(replayed, 2);
    assert_eq!(h.ledger.height(), 7);
}

#[tokio::test]
async fn test_replay_in_small_batches() {
    let mut config = ChainSyncConfig::for_testing();
    config.blockchain.replay_batch_size = 3;
    let h = harness_with(config, 1, 1, 0);
    let source = InMemoryLedger::new(build_chain(10, BLOCK_TIME, &h.delegates), h.delegates.clone());

    assert_eq!(h.service.replay(&source, 10).await.unwrap(), 9);
    assert_eq!(h.ledger.height(), 10);
}
