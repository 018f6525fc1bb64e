/// Sync orchestrator state machine.
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    /// Not started yet.
    #[default]
    Idle,

    /// Caught up with the finality tip and waiting for the next tip event.
    AwaitingTip,

    /// Fetching a block range from peers. Batches returned by the downloader
    /// have already passed checkpoint, milestone and block verification, so
    /// initial sync commits them directly.
    Downloading,

    /// Attaching verified blocks to the canonical chain builder.
    Verifying,

    /// Applying finality boundaries and re-evaluating the canonical head.
    Reconciling,

    /// Waiting for the store to acknowledge a canonical segment.
    Committing,

    /// The last attempt failed. Recovers to `AwaitingTip` after a backoff.
    Faulted,

    /// Cancelled. Terminal.
    Stopped,
}

impl SyncState {
    /// Check if a transition to the target state is valid.
    ///
    /// Every live state may fault or stop; `Stopped` accepts nothing.
    pub fn can_transition_to(&self, target: SyncState) -> bool {
        use SyncState::*;

        if *self == Stopped {
            return false;
        }
        if matches!(target, Stopped) {
            return true;
        }
        if matches!(target, Faulted) {
            return *self != Faulted;
        }

        match self {
            Idle => matches!(target, AwaitingTip | Downloading),
            AwaitingTip => matches!(target, Downloading | Verifying | Reconciling),
            Downloading => matches!(target, Verifying | Committing | AwaitingTip),
            Verifying => matches!(target, Downloading | Reconciling | Committing | AwaitingTip),
            Reconciling => matches!(target, Downloading | Committing | AwaitingTip),
            Committing => matches!(target, AwaitingTip | Downloading | Reconciling),
            Faulted => matches!(target, AwaitingTip),
            Stopped => false,
        }
    }

    /// Numeric code exported as a metric.
    pub fn code(&self) -> i64 {
        match self {
            SyncState::Idle => 0,
            SyncState::AwaitingTip => 1,
            SyncState::Downloading => 2,
            SyncState::Verifying => 3,
            SyncState::Reconciling => 4,
            SyncState::Committing => 5,
            SyncState::Faulted => 6,
            SyncState::Stopped => 7,
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncState::Idle => "IDLE",
            SyncState::AwaitingTip => "AWAITING_TIP",
            SyncState::Downloading => "DOWNLOADING",
            SyncState::Verifying => "VERIFYING",
            SyncState::Reconciling => "RECONCILING",
            SyncState::Committing => "COMMITTING",
            SyncState::Faulted => "FAULTED",
            SyncState::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}
