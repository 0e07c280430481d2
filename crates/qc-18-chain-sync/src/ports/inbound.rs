//! Driving ports (inbound API).

use crate::domain::{Block, NetworkSnapshot, SyncResult};
use crate::machine::ChainState;
use async_trait::async_trait;

/// Primary chain sync API.
#[async_trait]
pub trait ChainSyncApi: Send + Sync {
    /// Dispatch START and begin driving the state machine.
    async fn start(&self) -> SyncResult<()>;

    /// Dispatch STOP. Terminal.
    async fn stop(&self);

    /// A block announced by a peer outside of a download round.
    async fn handle_incoming_block(&self, block: Block);

    /// Best-effort network view. Never fails on zero peers.
    fn network_status(&self) -> NetworkSnapshot;

    fn state(&self) -> ChainState;

    /// Whether the current tip is close enough to wall-clock time.
    fn is_synced(&self) -> bool;
}
