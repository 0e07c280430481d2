//! # Chain Sync Configuration
//!
//! Every section deserializes with defaults, so a partial TOML document is a
//! valid configuration.

use crate::domain::{BlockId, ConfigError, PeerAddress};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

/// Top-level configuration for the chain sync subsystem.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainSyncConfig {
    pub blockchain: BlockchainConfig,
    pub network: NetworkConfig,
    pub download: DownloadConfig,
}

impl ChainSyncConfig {
    /// Create a config for testing (short timers, no reach requirement).
    pub fn for_testing() -> Self {
        Self {
            blockchain: BlockchainConfig {
                wake_up_secs: 1,
                ..Default::default()
            },
            network: NetworkConfig {
                minimum_network_reach: 1,
                verify_timeout_ms: 500,
                fast_ping_timeout_ms: 100,
                get_peers_timeout_ms: 500,
                post_block_timeout_ms: 500,
                update_interval_secs: 5,
                seed_retry_secs: 1,
                ..Default::default()
            },
            download: DownloadConfig {
                chunk_size: 4,
                max_parallel_downloads: 3,
                chunk_cache_size: 8,
                get_blocks_timeout_ms: 500,
            },
        }
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn positive(field: &'static str, value: u64) -> Result<(), ConfigError> {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: "must be greater than zero".into(),
                });
            }
            Ok(())
        }

        positive("blockchain.block_time_secs", self.blockchain.block_time_secs)?;
        positive("blockchain.active_delegates", self.blockchain.active_delegates)?;
        positive("blockchain.rollback_steps", self.blockchain.rollback_steps)?;
        positive("blockchain.replay_batch_size", self.blockchain.replay_batch_size as u64)?;
        positive("download.chunk_size", self.download.chunk_size as u64)?;
        positive(
            "download.max_parallel_downloads",
            self.download.max_parallel_downloads as u64,
        )?;
        positive("download.chunk_cache_size", self.download.chunk_cache_size as u64)?;
        positive("network.discovery_fanout", self.network.discovery_fanout as u64)?;

        if !(0.0..=1.0).contains(&self.network.discovery_response_ratio) {
            return Err(ConfigError::InvalidValue {
                field: "network.discovery_response_ratio",
                reason: format!("{} is outside 0..=1", self.network.discovery_response_ratio),
            });
        }

        if self.blockchain.fork_rollback_min > self.blockchain.fork_rollback_max {
            return Err(ConfigError::InvalidValue {
                field: "blockchain.fork_rollback_min",
                reason: "must not exceed fork_rollback_max".into(),
            });
        }

        Ok(())
    }
}

/// Chain parameters and sync pacing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockchainConfig {
    /// Slot length in seconds.
    pub block_time_secs: u64,
    /// Delegates per forging round.
    pub active_delegates: u64,
    /// Blocks accepted without verification.
    pub exception_blocks: Vec<BlockId>,
    /// Expected payload hash of the genesis block, if pinned.
    pub genesis_payload_hash: Option<String>,
    /// Genesis bootstrap mode.
    pub network_start: bool,
    /// Idle time before re-checking the network.
    pub wake_up_secs: u64,
    /// Queue length above which downloading pauses.
    pub max_queue_length: usize,
    /// Empty download rounds tolerated before the network counts as halted.
    pub max_no_block_rounds: u32,
    /// Network halts tolerated before a fork health check.
    pub max_p2p_updates: u32,
    /// Attempts on a too-high block before escalating to rollback.
    pub max_not_ready_attempts: u32,
    /// Rollback depth used when a too-high block keeps arriving.
    pub not_ready_rollback_blocks: u64,
    /// Upper bound on blocks removed while restoring integrity.
    pub max_block_rewind: u64,
    pub rollback_steps: u64,
    /// Random fork rollback depth bounds when no better estimate exists.
    pub fork_rollback_min: u64,
    pub fork_rollback_max: u64,
    pub replay_batch_size: usize,
}

impl Default for BlockchainConfig {
    fn default() -> Self {
        Self {
            block_time_secs: 8,
            active_delegates: 51,
            exception_blocks: Vec::new(),
            genesis_payload_hash: None,
            network_start: false,
            wake_up_secs: 60,
            max_queue_length: 100,
            max_no_block_rounds: 5,
            max_p2p_updates: 3,
            max_not_ready_attempts: 5,
            not_ready_rollback_blocks: 5000,
            max_block_rewind: 10_000,
            rollback_steps: 1000,
            fork_rollback_min: 4,
            fork_rollback_max: 102,
            replay_batch_size: 1000,
        }
    }
}

impl BlockchainConfig {
    pub fn wake_up_interval(&self) -> Duration {
        Duration::from_secs(self.wake_up_secs)
    }

    pub fn is_exception(&self, id: &BlockId) -> bool {
        self.exception_blocks.contains(id)
    }
}

/// Peer monitor settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub seed_peers: Vec<PeerAddress>,
    pub blacklist: Vec<IpAddr>,
    pub minimum_network_reach: usize,
    pub ignore_minimum_network_reach: bool,
    /// Disable periodic discovery entirely.
    pub disable_discovery: bool,
    /// Skip the discovery run at startup.
    pub skip_discovery: bool,
    /// Peers sampled per discovery round.
    pub discovery_fanout: usize,
    pub max_peers_per_response: usize,
    /// Responding fraction above which discovered peers are not added.
    pub discovery_response_ratio: f64,
    pub verify_timeout_ms: u64,
    pub fast_ping_timeout_ms: u64,
    pub get_peers_timeout_ms: u64,
    pub post_block_timeout_ms: u64,
    /// Consecutive failures before a peer is evicted.
    pub max_sequential_errors: u32,
    pub update_interval_secs: u64,
    /// Retry interval while below minimum reach.
    pub seed_retry_secs: u64,
    pub max_blocks_to_rollback: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            seed_peers: Vec::new(),
            blacklist: Vec::new(),
            minimum_network_reach: 20,
            ignore_minimum_network_reach: false,
            disable_discovery: false,
            skip_discovery: false,
            discovery_fanout: 8,
            max_peers_per_response: 50,
            discovery_response_ratio: 0.75,
            verify_timeout_ms: 60_000,
            fast_ping_timeout_ms: 1500,
            get_peers_timeout_ms: 5000,
            post_block_timeout_ms: 2000,
            max_sequential_errors: 3,
            update_interval_secs: 600,
            seed_retry_secs: 60,
            max_blocks_to_rollback: 5000,
        }
    }
}

impl NetworkConfig {
    pub fn verify_timeout(&self) -> Duration {
        Duration::from_millis(self.verify_timeout_ms)
    }

    pub fn fast_ping_timeout(&self) -> Duration {
        Duration::from_millis(self.fast_ping_timeout_ms)
    }

    pub fn get_peers_timeout(&self) -> Duration {
        Duration::from_millis(self.get_peers_timeout_ms)
    }

    pub fn post_block_timeout(&self) -> Duration {
        Duration::from_millis(self.post_block_timeout_ms)
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }

    pub fn seed_retry_interval(&self) -> Duration {
        Duration::from_secs(self.seed_retry_secs)
    }
}

/// Chunked download settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub chunk_size: usize,
    pub max_parallel_downloads: usize,
    pub chunk_cache_size: usize,
    pub get_blocks_timeout_ms: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            chunk_size: 400,
            max_parallel_downloads: 10,
            chunk_cache_size: 100,
            get_blocks_timeout_ms: 30_000,
        }
    }
}

impl DownloadConfig {
    pub fn get_blocks_timeout(&self) -> Duration {
        Duration::from_millis(self.get_blocks_timeout_ms)
    }
}
