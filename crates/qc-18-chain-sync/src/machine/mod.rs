//! # Sync State Machine
//!
//! Node lifecycle as two data tables: a top-level table and a nested table
//! scoped to `syncWithNetwork`. An event is looked up in the nested table
//! first (when inside `syncWithNetwork`), then in the top-level table. Pairs
//! absent from both are no-ops.
//!
//! ```text
//! uninitialised ─START─→ init ─STARTED─→ syncWithNetwork ─SYNCFINISHED─→ idle
//!                         │  └NETWORKSTART──────────────────────────────→ idle
//!                         ├ROLLBACK→ rollback ─SUCCESS→ init
//!                         └FAILURE─→ exit
//! idle ─WAKEUP→ syncWithNetwork    idle/syncWithNetwork ─FORK→ fork ─SUCCESS→ syncWithNetwork
//! any non-terminal ─STOP→ stopped
//! ```

mod table;

pub use table::{entry_actions, next_state, NESTED_TRANSITIONS, TOP_LEVEL_TRANSITIONS};

use std::fmt;
use tracing::debug;

/// Events driving the sync state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SyncEvent {
    Start,
    Stop,
    NetworkStart,
    Started,
    Rollback,
    Failure,
    Test,
    SyncFinished,
    Fork,
    WakeUp,
    NewBlock,
    Success,
    Synced,
    NotSynced,
    Paused,
    NetworkHalted,
    Downloaded,
    NoBlock,
    ProcessFinished,
}

impl SyncEvent {
    pub const ALL: [SyncEvent; 19] = [
        SyncEvent::Start,
        SyncEvent::Stop,
        SyncEvent::NetworkStart,
        SyncEvent::Started,
        SyncEvent::Rollback,
        SyncEvent::Failure,
        SyncEvent::Test,
        SyncEvent::SyncFinished,
        SyncEvent::Fork,
        SyncEvent::WakeUp,
        SyncEvent::NewBlock,
        SyncEvent::Success,
        SyncEvent::Synced,
        SyncEvent::NotSynced,
        SyncEvent::Paused,
        SyncEvent::NetworkHalted,
        SyncEvent::Downloaded,
        SyncEvent::NoBlock,
        SyncEvent::ProcessFinished,
    ];
}

impl fmt::Display for SyncEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncEvent::Start => "START",
            SyncEvent::Stop => "STOP",
            SyncEvent::NetworkStart => "NETWORKSTART",
            SyncEvent::Started => "STARTED",
            SyncEvent::Rollback => "ROLLBACK",
            SyncEvent::Failure => "FAILURE",
            SyncEvent::Test => "TEST",
            SyncEvent::SyncFinished => "SYNCFINISHED",
            SyncEvent::Fork => "FORK",
            SyncEvent::WakeUp => "WAKEUP",
            SyncEvent::NewBlock => "NEWBLOCK",
            SyncEvent::Success => "SUCCESS",
            SyncEvent::Synced => "SYNCED",
            SyncEvent::NotSynced => "NOTSYNCED",
            SyncEvent::Paused => "PAUSED",
            SyncEvent::NetworkHalted => "NETWORKHALTED",
            SyncEvent::Downloaded => "DOWNLOADED",
            SyncEvent::NoBlock => "NOBLOCK",
            SyncEvent::ProcessFinished => "PROCESSFINISHED",
        };
        f.write_str(name)
    }
}

/// Substates of `syncWithNetwork`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SyncState {
    Syncing,
    Idle,
    DownloadBlocks,
    DownloadFinished,
    DownloadPaused,
    ProcessFinished,
    End,
}

impl SyncState {
    pub const ALL: [SyncState; 7] = [
        SyncState::Syncing,
        SyncState::Idle,
        SyncState::DownloadBlocks,
        SyncState::DownloadFinished,
        SyncState::DownloadPaused,
        SyncState::ProcessFinished,
        SyncState::End,
    ];

    fn name(&self) -> &'static str {
        match self {
            SyncState::Syncing => "syncing",
            SyncState::Idle => "idle",
            SyncState::DownloadBlocks => "downloadBlocks",
            SyncState::DownloadFinished => "downloadFinished",
            SyncState::DownloadPaused => "downloadPaused",
            SyncState::ProcessFinished => "processFinished",
            SyncState::End => "end",
        }
    }
}

/// Table key for top-level states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StateKind {
    Uninitialised,
    Init,
    Idle,
    ProcessingBlocks,
    SyncWithNetwork,
    Fork,
    Rollback,
    Exit,
    Stopped,
}

impl StateKind {
    pub const ALL: [StateKind; 9] = [
        StateKind::Uninitialised,
        StateKind::Init,
        StateKind::Idle,
        StateKind::ProcessingBlocks,
        StateKind::SyncWithNetwork,
        StateKind::Fork,
        StateKind::Rollback,
        StateKind::Exit,
        StateKind::Stopped,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, StateKind::Exit | StateKind::Stopped)
    }

    fn name(&self) -> &'static str {
        match self {
            StateKind::Uninitialised => "uninitialised",
            StateKind::Init => "init",
            StateKind::Idle => "idle",
            StateKind::ProcessingBlocks => "processingBlocks",
            StateKind::SyncWithNetwork => "syncWithNetwork",
            StateKind::Fork => "fork",
            StateKind::Rollback => "rollback",
            StateKind::Exit => "exit",
            StateKind::Stopped => "stopped",
        }
    }
}

/// Full machine state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ChainState {
    #[default]
    Uninitialised,
    Init,
    Idle,
    ProcessingBlocks,
    SyncWithNetwork(SyncState),
    Fork,
    Rollback,
    Exit,
    Stopped,
}

impl ChainState {
    pub fn kind(&self) -> StateKind {
        match self {
            ChainState::Uninitialised => StateKind::Uninitialised,
            ChainState::Init => StateKind::Init,
            ChainState::Idle => StateKind::Idle,
            ChainState::ProcessingBlocks => StateKind::ProcessingBlocks,
            ChainState::SyncWithNetwork(_) => StateKind::SyncWithNetwork,
            ChainState::Fork => StateKind::Fork,
            ChainState::Rollback => StateKind::Rollback,
            ChainState::Exit => StateKind::Exit,
            ChainState::Stopped => StateKind::Stopped,
        }
    }

    /// State reached when entering `kind` from outside.
    pub fn enter(kind: StateKind) -> Self {
        match kind {
            StateKind::Uninitialised => ChainState::Uninitialised,
            StateKind::Init => ChainState::Init,
            StateKind::Idle => ChainState::Idle,
            StateKind::ProcessingBlocks => ChainState::ProcessingBlocks,
            StateKind::SyncWithNetwork => ChainState::SyncWithNetwork(SyncState::Syncing),
            StateKind::Fork => ChainState::Fork,
            StateKind::Rollback => ChainState::Rollback,
            StateKind::Exit => ChainState::Exit,
            StateKind::Stopped => ChainState::Stopped,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind().is_terminal()
    }

    pub fn is_syncing(&self) -> bool {
        matches!(self, ChainState::SyncWithNetwork(_))
    }
}

impl fmt::Display for ChainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainState::SyncWithNetwork(sub) => write!(f, "syncWithNetwork.{}", sub.name()),
            other => f.write_str(other.kind().name()),
        }
    }
}

/// Side effects run on state entry, in table order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntryAction {
    Init,
    CheckLater,
    BlockchainReady,
    CheckLastDownloadedBlockSynced,
    DownloadBlocks,
    DownloadFinished,
    DownloadPaused,
    CheckLastBlockSynced,
    SyncingComplete,
    StartForkRecovery,
    RollbackDatabase,
    Stopped,
    ExitApp,
}

/// A taken transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transition {
    pub from: ChainState,
    pub to: ChainState,
    pub event: SyncEvent,
    pub actions: &'static [EntryAction],
}

/// Cursor over the transition tables.
#[derive(Debug, Default)]
pub struct StateMachine {
    state: ChainState,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ChainState {
        self.state
    }

    /// Apply `event`. Returns the transition, or `None` when the table has no
    /// entry for the current state.
    pub fn handle(&mut self, event: SyncEvent) -> Option<Transition> {
        let from = self.state;
        let Some(to) = next_state(from, event) else {
            debug!(state = %from, %event, "No state transition occurs");
            return None;
        };

        self.state = to;
        debug!(%from, %to, %event, "State transition");

        Some(Transition {
            from,
            to,
            event,
            actions: entry_actions(to),
        })
    }
}
