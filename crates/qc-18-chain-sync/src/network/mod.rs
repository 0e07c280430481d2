//! Peer network: health, discovery, fork detection and block download.

pub mod downloader;
pub mod fork;
pub mod monitor;


pub use downloader::{ChunkDownload, ChunkedBlockDownloader, DownloadChunk};
pub use fork::detect_fork;
pub use monitor::{CleanseOptions, CleanseReport, NetworkDependencies, NetworkMonitor};
