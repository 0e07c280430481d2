//! Adapters for chain sync ports.

pub mod event_bus;
pub mod peer_repository;
pub mod time;

pub use event_bus::BroadcastEventDispatcher;
pub use peer_repository::InMemoryPeerRepository;
pub use time::SystemTimeSource;
