//! Transition and entry-action tables.

use super::{ChainState, EntryAction, StateKind, SyncEvent, SyncState};

use super::StateKind as K;
use super::SyncEvent as E;
use super::SyncState as S;

/// (state, event) → next state, for top-level states.
pub const TOP_LEVEL_TRANSITIONS: &[(StateKind, SyncEvent, StateKind)] = &[
    (K::Uninitialised, E::Start, K::Init),
    (K::Uninitialised, E::Stop, K::Stopped),
    (K::Init, E::NetworkStart, K::Idle),
    (K::Init, E::Started, K::SyncWithNetwork),
    (K::Init, E::Rollback, K::Rollback),
    (K::Init, E::Failure, K::Exit),
    (K::Init, E::Stop, K::Stopped),
    (K::Rollback, E::Success, K::Init),
    (K::Rollback, E::Failure, K::Exit),
    (K::Rollback, E::Stop, K::Stopped),
    (K::SyncWithNetwork, E::Test, K::Idle),
    (K::SyncWithNetwork, E::SyncFinished, K::Idle),
    (K::SyncWithNetwork, E::Fork, K::Fork),
    (K::SyncWithNetwork, E::Stop, K::Stopped),
    (K::Idle, E::WakeUp, K::SyncWithNetwork),
    (K::Idle, E::NewBlock, K::ProcessingBlocks),
    (K::Idle, E::Fork, K::Fork),
    (K::Idle, E::Stop, K::Stopped),
    (K::ProcessingBlocks, E::ProcessFinished, K::Idle),
    (K::ProcessingBlocks, E::Fork, K::Fork),
    (K::ProcessingBlocks, E::Stop, K::Stopped),
    (K::Fork, E::Success, K::SyncWithNetwork),
    (K::Fork, E::Failure, K::Exit),
    (K::Fork, E::Stop, K::Stopped),
];

/// (substate, event) → next substate, scoped to `syncWithNetwork`.
pub const NESTED_TRANSITIONS: &[(SyncState, SyncEvent, SyncState)] = &[
    (S::Syncing, E::Synced, S::DownloadFinished),
    (S::Syncing, E::NotSynced, S::DownloadBlocks),
    (S::Syncing, E::Paused, S::DownloadPaused),
    (S::Syncing, E::NetworkHalted, S::End),
    (S::Idle, E::Downloaded, S::DownloadBlocks),
    (S::DownloadBlocks, E::Downloaded, S::Syncing),
    (S::DownloadBlocks, E::NoBlock, S::Syncing),
    (S::DownloadFinished, E::ProcessFinished, S::ProcessFinished),
    (S::DownloadPaused, E::ProcessFinished, S::ProcessFinished),
    (S::ProcessFinished, E::Synced, S::End),
    (S::ProcessFinished, E::NotSynced, S::DownloadBlocks),
];

/// Next state for `event` in `state`, nested table first.
pub fn next_state(state: ChainState, event: SyncEvent) -> Option<ChainState> {
    if let ChainState::SyncWithNetwork(sub) = state {
        let nested = NESTED_TRANSITIONS
            .iter()
            .find(|(from, on, _)| *from == sub && *on == event);
        if let Some((_, _, to)) = nested {
            return Some(ChainState::SyncWithNetwork(*to));
        }
    }

    TOP_LEVEL_TRANSITIONS
        .iter()
        .find(|(from, on, _)| *from == state.kind() && *on == event)
        .map(|(_, _, to)| ChainState::enter(*to))
}

/// Actions run on entering `state`.
pub fn entry_actions(state: ChainState) -> &'static [EntryAction] {
    match state {
        ChainState::Init => &[EntryAction::Init],
        ChainState::Idle => &[EntryAction::CheckLater, EntryAction::BlockchainReady],
        ChainState::Fork => &[EntryAction::StartForkRecovery],
        ChainState::Rollback => &[EntryAction::RollbackDatabase],
        ChainState::Stopped => &[EntryAction::Stopped],
        ChainState::Exit => &[EntryAction::ExitApp],
        ChainState::SyncWithNetwork(sub) => match sub {
            S::Syncing => &[EntryAction::CheckLastDownloadedBlockSynced],
            S::DownloadBlocks => &[EntryAction::DownloadBlocks],
            S::DownloadFinished => &[EntryAction::DownloadFinished],
            S::DownloadPaused => &[EntryAction::DownloadPaused],
            S::ProcessFinished => &[EntryAction::CheckLastBlockSynced],
            S::End => &[EntryAction::SyncingComplete],
            S::Idle => &[],
        },
        ChainState::Uninitialised | ChainState::ProcessingBlocks => &[],
    }
}
