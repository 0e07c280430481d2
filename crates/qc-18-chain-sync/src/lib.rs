//! # QC-18 Chain Sync
//!
//! Keeps the local ledger consistent with the peer network: discovers and
//! cleanses peers, downloads candidate blocks in parallel chunks, classifies
//! and applies them one at a time, and detects and recovers from forks.
//!
//! **Subsystem ID:** 18
//! **Architecture:** Hexagonal (DDD + Ports/Adapters)
//!
//! ## Components
//!
//! | Component | Module | Role |
//! |-----------|--------|------|
//! | State machine | [`machine`] | Lifecycle as transition tables with entry actions |
//! | Block pipeline | [`processor`] | Classify one block, then apply exactly one outcome |
//! | Network monitor | [`network::monitor`] | Discovery, cleansing, status updates, broadcast |
//! | Fork detector | [`network::fork`] | Majority verdict over peer verification results |
//! | Chunk downloader | [`network::downloader`] | Bounded parallel fetches with an LRU chunk cache |
//! | Orchestrator | [`service`] | Event loop, block queue, entry actions |
//!
//! ## Lifecycle
//!
//! ```text
//! uninitialised ─START→ init ─STARTED→ syncWithNetwork ─SYNCFINISHED→ idle ─WAKEUP→ syncWithNetwork
//!                        ├─ROLLBACK→ rollback ─SUCCESS→ init
//!                        └─FAILURE→ exit
//! idle ─NEWBLOCK→ processingBlocks ─PROCESSFINISHED→ idle
//! {syncWithNetwork, idle, processingBlocks} ─FORK→ fork ─SUCCESS→ syncWithNetwork
//! ```
//!
//! ## Module Structure
//!
//! ```text
//! qc-18-chain-sync/
//! ├── domain/          # Blocks, peers, outcomes, runtime state, errors
//! ├── machine/         # SyncEvent, ChainState, transition tables
//! ├── processor/       # BlockProcessor (classify + dispatch)
//! ├── network/         # NetworkMonitor, detect_fork, ChunkedBlockDownloader
//! ├── service/         # ChainSyncService, BlockQueue, entry actions
//! ├── ports/           # API traits (inbound) + dependency traits (outbound)
//! ├── adapters/        # Event bus, in-memory peer store, system clock
//! └── config.rs        # ChainSyncConfig
//! ```

#![warn(clippy::all)]

pub mod adapters;
pub mod config;
pub mod domain;
pub mod machine;
pub mod network;
pub mod ports;
pub mod processor;
pub mod service;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

// Re-exports
pub use adapters::{BroadcastEventDispatcher, InMemoryPeerRepository, SystemTimeSource};
pub use config::{BlockchainConfig, ChainSyncConfig, DownloadConfig, NetworkConfig};
pub use domain::{
    Block, BlockClassification, BlockHeader, BlockId, ForkStatus, NetworkSnapshot, Peer,
    PeerAddress, ProcessOutcome, SyncError, SyncResult, Transaction,
};
pub use machine::{ChainState, StateMachine, SyncEvent};
pub use network::{NetworkDependencies, NetworkMonitor};
pub use ports::{
    ChainSyncApi, Database, EventDispatcher, PeerAcceptance, PeerCommunicator, PeerRepository,
    SyncNotification, TimeSource, TransactionPool,
};
pub use processor::{BlockProcessor, ProcessReport};
pub use service::{ChainSyncDependencies, ChainSyncService, Lifecycle};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
