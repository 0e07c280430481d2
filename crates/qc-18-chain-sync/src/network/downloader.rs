//! # Chunked Block Downloader
//!
//! Splits a height range into fixed-size chunks and fetches one chunk per
//! eligible peer concurrently.
//!
//! - A chunk is complete when it holds `chunk_size` blocks, or any blocks at
//!   all when it is the last chunk of the round.
//! - A failed chunk is retried on spare peers only, never on the same peer.
//! - Results are concatenated in height order up to the first missing chunk.
//!   Complete chunks beyond the gap are cached by start height and served on
//!   a later call without touching the network.

use crate::config::DownloadConfig;
use crate::domain::{median_height, Block, Peer, PeerAddress};
use crate::ports::PeerCommunicator;
use futures::future::join_all;
use lru::LruCache;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Contiguous run of blocks fetched from one peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadChunk {
    pub start_height: u64,
    pub size: usize,
    pub source_peer: PeerAddress,
    pub blocks: Vec<Block>,
}

impl DownloadChunk {
    /// Holds exactly `chunk_size` blocks. Only full chunks are cached.
    pub fn is_full(&self, chunk_size: usize) -> bool {
        self.size == chunk_size && self.blocks.len() == chunk_size
    }

    /// Starts at `height` and runs contiguously from there.
    fn follows(&self, height: u64) -> bool {
        self.blocks
            .iter()
            .zip(height..)
            .all(|(block, expected)| block.height() == expected)
            && !self.blocks.is_empty()
    }

    fn next_height(&self) -> u64 {
        self.blocks.last().map_or(self.start_height + 1, |b| b.height() + 1)
    }
}

/// Outcome of one download round.
#[derive(Debug, Default)]
pub struct ChunkDownload {
    /// Contiguous blocks starting right above the requested height.
    pub blocks: Vec<Block>,
    /// Peers whose requests failed or timed out.
    pub failed_peers: Vec<PeerAddress>,
}

struct ChunkAttempt {
    chunk: Option<DownloadChunk>,
    failed_peers: Vec<PeerAddress>,
}

pub struct ChunkedBlockDownloader {
    config: DownloadConfig,
    communicator: Arc<dyn PeerCommunicator>,
    cache: Mutex<LruCache<u64, DownloadChunk>>,
    /// Current chunk size; shrinks after rounds that fetched nothing.
    chunk_size: AtomicUsize,
}

impl ChunkedBlockDownloader {
    pub fn new(config: DownloadConfig, communicator: Arc<dyn PeerCommunicator>) -> Self {
        let capacity = NonZeroUsize::new(config.chunk_cache_size).unwrap_or(NonZeroUsize::MIN);
        let chunk_size = AtomicUsize::new(config.chunk_size.max(1));
        Self {
            config,
            communicator,
            cache: Mutex::new(LruCache::new(capacity)),
            chunk_size,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size.load(Ordering::Relaxed)
    }

    pub fn cached_chunks(&self) -> usize {
        self.cache.lock().len()
    }

    /// Download blocks above `from_height` from `peers`.
    pub async fn download(
        &self,
        peers: &[Peer],
        from_height: u64,
        max_parallel: usize,
    ) -> ChunkDownload {
        if peers.is_empty() {
            error!("Could not download blocks: we have 0 peers");
            return ChunkDownload::default();
        }

        let mut eligible: Vec<PeerAddress> = peers
            .iter()
            .filter(|peer| !peer.is_forked() && peer.height().is_some_and(|h| h >= from_height))
            .map(|peer| peer.address)
            .collect();

        if eligible.is_empty() {
            error!(
                "Could not download blocks: We have {} peer(s) but all of them are on a different chain than us",
                peers.len()
            );
            return ChunkDownload::default();
        }

        eligible.shuffle(&mut rand::thread_rng());

        let heights: Vec<u64> = peers.iter().filter_map(Peer::height).collect();
        let network_height = median_height(&heights);
        let chunk_size = self.chunk_size();

        let chunks_missing = if network_height <= from_height {
            1
        } else {
            (network_height - from_height).div_ceil(chunk_size as u64) as usize
        };
        let chunks_to_download = chunks_missing
            .min(eligible.len())
            .min(max_parallel.max(1));

        debug!(
            from_height,
            network_height,
            chunk_size,
            chunks_to_download,
            "Downloading blocks in chunks"
        );

        let spare = &eligible[chunks_to_download..];
        let job_failed = AtomicBool::new(false);

        let jobs = (0..chunks_to_download).map(|i| {
            let start = from_height + (chunk_size * i) as u64;
            let is_last = i + 1 == chunks_to_download;
            self.download_chunk(start, chunk_size, is_last, eligible[i], spare, &job_failed)
        });
        let attempts = join_all(jobs).await;

        let mut result = ChunkDownload::default();
        let mut gap = false;
        let mut completed_chunks = 0;
        let mut next_height = from_height + 1;

        for attempt in attempts {
            result.failed_peers.extend(attempt.failed_peers);
            let Some(chunk) = attempt.chunk else {
                gap = true;
                continue;
            };
            completed_chunks += 1;

            if !gap && chunk.follows(next_height) {
                next_height = chunk.next_height();
                result.blocks.extend(chunk.blocks);
                continue;
            }

            gap = true;
            if chunk.is_full(chunk_size) {
                self.cache.lock().put(chunk.start_height, chunk);
            }
        }

        if result.blocks.is_empty() && completed_chunks == 0 {
            let reduced = chunk_size.div_ceil(10).max(1);
            if reduced != chunk_size {
                info!(
                    "Could not download any blocks, reducing chunk size from {} to {}",
                    chunk_size, reduced
                );
            }
            self.chunk_size.store(reduced, Ordering::Relaxed);
        } else {
            self.chunk_size
                .store(self.config.chunk_size.max(1), Ordering::Relaxed);
        }

        if let (Some(first), Some(last)) = (result.blocks.first(), result.blocks.last()) {
            debug!(
                from = first.height(),
                to = last.height(),
                "Downloaded {} blocks",
                result.blocks.len()
            );
        }

        result
    }

    async fn download_chunk(
        &self,
        start: u64,
        chunk_size: usize,
        is_last: bool,
        assigned: PeerAddress,
        spare: &[PeerAddress],
        job_failed: &AtomicBool,
    ) -> ChunkAttempt {
        let cached = self.cache.lock().pop(&start);
        if let Some(chunk) = cached {
            if chunk.is_full(chunk_size) {
                debug!(start, "Using cached chunk");
                return ChunkAttempt {
                    chunk: Some(chunk),
                    failed_peers: Vec::new(),
                };
            }
        }

        let mut fallbacks = spare.to_vec();
        fallbacks.shuffle(&mut rand::thread_rng());
        let candidates = std::iter::once(assigned).chain(fallbacks);

        let mut failed_peers = Vec::new();
        for peer in candidates {
            let request = self.communicator.get_peer_blocks(&peer, start, chunk_size);
            match tokio::time::timeout(self.config.get_blocks_timeout(), request).await {
                Ok(Ok(blocks)) if blocks.len() == chunk_size || (is_last && !blocks.is_empty()) => {
                    return ChunkAttempt {
                        chunk: Some(DownloadChunk {
                            start_height: start,
                            size: blocks.len(),
                            source_peer: peer,
                            blocks,
                        }),
                        failed_peers,
                    };
                }
                Ok(Ok(blocks)) => {
                    debug!(
                        %peer,
                        start,
                        "Peer returned {} blocks, expected {}",
                        blocks.len(),
                        chunk_size
                    );
                }
                Ok(Err(e)) => {
                    debug!(%peer, start, "Failed to download blocks: {}", e);
                    failed_peers.push(peer);
                }
                Err(_) => {
                    debug!(%peer, start, "Timed out downloading blocks");
                    failed_peers.push(peer);
                }
            }

            if job_failed.load(Ordering::SeqCst) {
                debug!(
                    start,
                    "Giving up on trying to download blocks because another download job failed"
                );
                break;
            }
        }

        job_failed.store(true, Ordering::SeqCst);
        ChunkAttempt {
            chunk: None,
            failed_peers,
        }
    }
}
