//! Ports for chain sync (hexagonal architecture).

pub mod inbound;
pub mod outbound;

pub use inbound::ChainSyncApi;
pub use outbound::{
    AcceptOptions, Database, EventDispatcher, PeerAcceptance, PeerCommunicator, PeerRepository,
    SyncNotification, TimeSource, TransactionPool,
};
