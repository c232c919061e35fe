use log::debug;
use shared::{
    ChangeEvent, GameStatePatch, LockKind, Patch, PuzzleFlags, Record, RecordKey, GAME_STATE_ID,
};

/// Merged view of the shared puzzle locks.
///
/// Local flags only move through [`FlagReconciler::apply_remote`]; a local
/// unlock request goes out as a patch and takes effect when the store
/// notifies us back.
#[derive(Debug, Default)]
pub struct FlagReconciler {
    flags: PuzzleFlags,
}

impl FlagReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flags(&self) -> PuzzleFlags {
        self.flags
    }

    pub fn is_unlocked(&self, kind: LockKind) -> bool {
        self.flags.get(kind)
    }

    /// OR-merges `remote` and returns the locks that opened just now.
    pub fn apply_remote(&mut self, remote: &PuzzleFlags) -> Vec<LockKind> {
        let opened = self.flags.merge(remote);
        for kind in &opened {
            debug!("Lock {} opened", kind);
        }
        opened
    }

    /// Applies a `game_state` change notification.
    pub fn apply_event(&mut self, event: &ChangeEvent) -> Vec<LockKind> {
        match &event.new {
            Some(Record::GameState(row)) => self.apply_remote(&row.flags()),
            _ => Vec::new(),
        }
    }

    /// Builds the partial update that sets exactly `kind` in the store.
    pub fn request_unlock(&self, kind: LockKind) -> (Patch, RecordKey) {
        (
            Patch::GameState(GameStatePatch::unlock(kind)),
            RecordKey::GameState(GAME_STATE_ID),
        )
    }

    pub fn reset(&mut self) {
        self.flags = PuzzleFlags::default();
    }
}
