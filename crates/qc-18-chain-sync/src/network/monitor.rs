//! # Network Monitor
//!
//! Owns the view of the peer network: discovery, health cleansing, fork
//! health checks, block downloads and block broadcast.
//!
//! The periodic status update is self-deduplicating: at most one scheduled
//! run is pending at any time.

use super::downloader::ChunkedBlockDownloader;
use super::fork::detect_fork;
use crate::config::ChainSyncConfig;
use crate::config::NetworkConfig;
use crate::domain::{
    median_height, Block, ForkStatus, NetworkSnapshot, PeerAddress, PeerError, SyncError,
    SyncResult,
};
use crate::ports::{
    AcceptOptions, EventDispatcher, PeerAcceptance, PeerCommunicator, PeerRepository,
    SyncNotification,
};
use futures::future::join_all;
use rand::seq::SliceRandom;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Collaborators of the network monitor.
#[derive(Clone)]
pub struct NetworkDependencies {
    pub communicator: Arc<dyn PeerCommunicator>,
    pub repository: Arc<dyn PeerRepository>,
    pub acceptance: Arc<dyn PeerAcceptance>,
    pub events: Arc<dyn EventDispatcher>,
}

/// Options for a cleanse round.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CleanseOptions {
    /// Use the short ping timeout.
    pub fast: bool,
    pub force_ping: bool,
    /// Check only this many randomly chosen peers.
    pub peer_count: Option<usize>,
}

/// Summary of a cleanse round.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CleanseReport {
    pub checked: usize,
    pub responsive: usize,
    pub median_height: u64,
}

pub struct NetworkMonitor {
    config: NetworkConfig,
    communicator: Arc<dyn PeerCommunicator>,
    repository: Arc<dyn PeerRepository>,
    acceptance: Arc<dyn PeerAcceptance>,
    events: Arc<dyn EventDispatcher>,
    downloader: ChunkedBlockDownloader,
    max_parallel_downloads: usize,
    network_start: bool,
    cold_start: AtomicBool,
    next_update_scheduled: AtomicBool,
    stopped: AtomicBool,
}

impl NetworkMonitor {
    pub fn new(config: &ChainSyncConfig, deps: NetworkDependencies) -> Self {
        let downloader =
            ChunkedBlockDownloader::new(config.download.clone(), deps.communicator.clone());
        Self {
            config: config.network.clone(),
            communicator: deps.communicator,
            repository: deps.repository,
            acceptance: deps.acceptance,
            events: deps.events,
            downloader,
            max_parallel_downloads: config.download.max_parallel_downloads,
            network_start: config.blockchain.network_start,
            cold_start: AtomicBool::new(false),
            next_update_scheduled: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// Seed the peer set and run the first status update.
    pub async fn start(self: &Arc<Self>) {
        self.stopped.store(false, Ordering::SeqCst);

        if self.config.seed_peers.is_empty() {
            warn!("[qc-18] No seed peers configured");
        } else if let Err(e) = self.populate_seed_peers().await {
            error!("[qc-18] Failed to populate seed peers: {}", e);
        }

        if self.config.skip_discovery {
            warn!("Skipped peer discovery because the relay is in skip-discovery mode.");
        } else {
            self.update_network_status(true).await;
        }

        info!(
            peers = self.repository.peer_count(),
            "[qc-18] Network monitor started"
        );
    }

    /// Stop scheduling further work. In-flight requests run to completion.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn is_cold_start(&self) -> bool {
        self.cold_start.load(Ordering::SeqCst)
    }

    pub fn complete_cold_start(&self) {
        self.cold_start.store(false, Ordering::SeqCst);
    }

    pub fn has_minimum_peers(&self) -> bool {
        self.config.ignore_minimum_network_reach
            || self.repository.peer_count() >= self.config.minimum_network_reach
    }

    pub fn has_peers(&self) -> bool {
        self.repository.has_peers()
    }

    /// Median of the heights reported by known peers.
    pub fn network_height(&self) -> u64 {
        let heights: Vec<u64> = self
            .repository
            .get_peers()
            .iter()
            .filter_map(|peer| peer.height())
            .collect();
        median_height(&heights)
    }

    pub fn network_snapshot(&self, own_height: u64) -> NetworkSnapshot {
        NetworkSnapshot {
            peer_count: self.repository.peer_count(),
            median_height: self.network_height(),
            own_height,
        }
    }

    /// Run a status update now and schedule the next one.
    pub async fn update_network_status(self: &Arc<Self>, initial_run: bool) {
        if let Some(delay) = self.refresh_network_status(initial_run).await {
            self.schedule_update_network_status(delay);
        }
    }

    /// Schedule a status update after `delay`. Returns `false` when one is
    /// already pending.
    pub fn schedule_update_network_status(self: &Arc<Self>, delay: Duration) -> bool {
        if !self.claim_schedule() {
            debug!("Network status update already scheduled");
            return false;
        }

        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut delay = delay;
            loop {
                tokio::time::sleep(delay).await;
                monitor.next_update_scheduled.store(false, Ordering::SeqCst);

                if monitor.is_stopped() {
                    break;
                }
                let Some(next) = monitor.refresh_network_status(false).await else {
                    break;
                };
                if !monitor.claim_schedule() {
                    break;
                }
                delay = next;
            }
        });

        true
    }

    fn claim_schedule(&self) -> bool {
        self.next_update_scheduled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// One status update. Returns the delay until the next one, or `None`
    /// when periodic updates do not apply.
    async fn refresh_network_status(&self, initial_run: bool) -> Option<Duration> {
        if self.network_start {
            self.cold_start.store(true, Ordering::SeqCst);
            warn!("Entering cold start because the relay is in genesis-start mode.");
            return None;
        }

        if self.config.disable_discovery {
            warn!("Skipped peer discovery because the relay is in non-discovery mode.");
            return None;
        }

        if self.discover_peers(initial_run).await {
            self.cleanse_peers(CleanseOptions::default()).await;
        }

        if self.has_minimum_peers() {
            return Some(self.config.update_interval());
        }

        warn!("Couldn't find enough peers. Falling back to seed peers.");
        if let Err(e) = self.populate_seed_peers().await {
            error!("Failed to populate seed peers: {}", e);
        }
        Some(self.config.seed_retry_interval())
    }

    /// Forget and re-accept every configured seed peer.
    pub async fn populate_seed_peers(&self) -> SyncResult<()> {
        if self.config.seed_peers.is_empty() {
            return Err(SyncError::NoSeedPeers);
        }

        let options = AcceptOptions {
            seed: true,
            less_verbose: true,
        };
        for seed in &self.config.seed_peers {
            self.repository.forget_peer(seed);
            if let Err(e) = self.acceptance.validate_and_accept_peer(seed, options).await {
                debug!(%seed, "Seed peer not accepted: {}", e);
            }
        }
        Ok(())
    }

    /// Ask a sample of peers for their peer lists and register new addresses.
    /// Returns whether any address was submitted for acceptance.
    pub async fn discover_peers(&self, initial_run: bool) -> bool {
        let mut sample = self.repository.get_peers();
        sample.shuffle(&mut rand::thread_rng());
        sample.truncate(self.config.discovery_fanout);

        if sample.is_empty() {
            debug!("No peers to discover from");
            return false;
        }

        let timeout = self.config.get_peers_timeout();
        let responses = join_all(sample.iter().map(|peer| async move {
            let request = self.communicator.get_peers(&peer.address);
            let result = match tokio::time::timeout(timeout, request).await {
                Ok(result) => result,
                Err(_) => Err(PeerError::Timeout(peer.address)),
            };
            (peer.address, result)
        }))
        .await;

        let mut responded = 0usize;
        let mut seen_ips = HashSet::new();
        let mut discovered = Vec::new();

        for (address, response) in responses {
            match response {
                Ok(addresses) => {
                    responded += 1;
                    for candidate in addresses.into_iter().take(self.config.max_peers_per_response) {
                        if self.config.blacklist.contains(&candidate.ip)
                            || self.repository.has_peer(&candidate)
                            || !seen_ips.insert(candidate.ip)
                        {
                            continue;
                        }
                        discovered.push(candidate);
                    }
                }
                Err(e) => {
                    debug!(peer = %address, "Failed to get peers: {}", e);
                    self.record_peer_failure(&address);
                }
            }
        }

        let response_ratio = responded as f64 / sample.len() as f64;
        if !initial_run
            && self.has_minimum_peers()
            && response_ratio > self.config.discovery_response_ratio
        {
            debug!(
                responded,
                sampled = sample.len(),
                "Enough peers reachable, not adding discovered peers"
            );
            return false;
        }

        if discovered.is_empty() {
            return false;
        }

        debug!("Discovered {} new peer(s)", discovered.len());
        let options = AcceptOptions {
            seed: false,
            less_verbose: true,
        };
        for address in &discovered {
            if let Err(e) = self.acceptance.validate_and_accept_peer(address, options).await {
                debug!(peer = %address, "Discovered peer not accepted: {}", e);
            }
        }
        true
    }

    /// Ping peers, evict the unresponsive ones and refresh the rest.
    pub async fn cleanse_peers(&self, options: CleanseOptions) -> CleanseReport {
        let (blacklisted, mut peers): (Vec<_>, Vec<_>) = self
            .repository
            .get_peers()
            .into_iter()
            .partition(|peer| self.config.blacklist.contains(&peer.address.ip));

        for peer in &blacklisted {
            info!(peer = %peer.address, "Removing blacklisted peer");
            self.evict(&peer.address);
        }

        let max = peers.len();
        peers.shuffle(&mut rand::thread_rng());
        if let Some(count) = options.peer_count {
            peers.truncate(count);
        }

        let timeout = if options.fast {
            self.config.fast_ping_timeout()
        } else {
            self.config.verify_timeout()
        };

        debug!("Checking {} peers", peers.len());
        let results = join_all(peers.iter().map(|peer| async move {
            let request = self.communicator.ping(&peer.address, timeout, options.force_ping);
            let result = match tokio::time::timeout(timeout, request).await {
                Ok(result) => result,
                Err(_) => Err(PeerError::Timeout(peer.address)),
            };
            (peer, result)
        }))
        .await;

        let mut unresponsive = 0usize;
        let mut heights = Vec::new();
        let mut errors: BTreeMap<&'static str, Vec<PeerAddress>> = BTreeMap::new();

        for (peer, result) in results {
            match result {
                Ok(state) => {
                    heights.extend(state.height);
                    let mut updated = peer.clone();
                    updated.state = state;
                    updated.sequential_errors = 0;
                    self.repository.update_peer(updated);
                }
                Err(e) => {
                    unresponsive += 1;
                    errors.entry(e.kind()).or_default().push(peer.address);
                    self.evict(&peer.address);
                }
            }
        }

        for (kind, addresses) in &errors {
            debug!("Removed {} peers because of \"{}\"", addresses.len(), kind);
        }

        let checked = peers.len();
        let responsive = checked - unresponsive;
        // Only the peers that answered this round count.
        let median = median_height(&heights);
        info!(
            "{} of {} peers on the network are responsive",
            max - unresponsive,
            max
        );
        info!("Median Network Height: {}", median);

        CleanseReport {
            checked,
            responsive,
            median_height: median,
        }
    }

    /// Cleanse with forced pings, then ask the fork detector.
    pub async fn check_network_health(&self, our_height: u64) -> ForkStatus {
        self.cleanse_peers(CleanseOptions {
            force_ping: true,
            ..Default::default()
        })
        .await;

        let status = self.fork_status(our_height);
        if let ForkStatus::Forked { blocks_to_rollback } = status {
            self.events.dispatch(SyncNotification::ForkDetected {
                height: our_height.saturating_sub(blocks_to_rollback),
            });
        }
        status
    }

    /// Fork verdict over the peers as currently known, without pinging.
    pub fn fork_status(&self, our_height: u64) -> ForkStatus {
        detect_fork(
            &self.repository.get_peers(),
            our_height,
            self.config.max_blocks_to_rollback,
        )
    }

    pub async fn refresh_peers_after_fork(&self) {
        info!("Refreshing {} peers after fork.", self.repository.peer_count());
        self.cleanse_peers(CleanseOptions {
            force_ping: true,
            ..Default::default()
        })
        .await;
    }

    /// Download blocks above `from_height`. Empty on any total failure.
    pub async fn download_blocks_from_height(&self, from_height: u64) -> Vec<Block> {
        let peers = self.repository.get_peers();
        let download = self
            .downloader
            .download(&peers, from_height, self.max_parallel_downloads)
            .await;

        for address in &download.failed_peers {
            self.record_peer_failure(address);
        }
        download.blocks
    }

    /// Post `block` to every known peer. Failures are logged and ignored.
    pub async fn broadcast_block(&self, block: &Block) -> usize {
        let peers = self.repository.get_peers();
        if peers.is_empty() {
            return 0;
        }

        debug!(
            height = block.height(),
            id = %block.id(),
            "Broadcasting block to {} peers",
            peers.len()
        );

        let timeout = self.config.post_block_timeout();
        let results = join_all(peers.iter().map(|peer| async move {
            let request = self.communicator.post_block(&peer.address, block);
            match tokio::time::timeout(timeout, request).await {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    debug!(peer = %peer.address, "Failed to post block: {}", e);
                    false
                }
                Err(_) => {
                    debug!(peer = %peer.address, "Timed out posting block");
                    false
                }
            }
        }))
        .await;

        results.into_iter().filter(|posted| *posted).count()
    }

    /// Count a failed request against a peer; evict it at the threshold.
    pub fn record_peer_failure(&self, address: &PeerAddress) {
        let Some(mut peer) = self.repository.get_peer(address) else {
            return;
        };

        peer.sequential_errors += 1;
        if peer.sequential_errors >= self.config.max_sequential_errors {
            warn!(
                peer = %address,
                errors = peer.sequential_errors,
                "Disconnecting peer after repeated errors"
            );
            self.evict(address);
        } else {
            self.repository.update_peer(peer);
        }
    }

    fn evict(&self, address: &PeerAddress) {
        self.repository.forget_peer(address);
        self.events.dispatch(SyncNotification::PeerDisconnect(*address));
        self.events.dispatch(SyncNotification::PeerRemoved(*address));
    }
}
