//! Typed messages between the gameplay layer and the sync layer

use shared::{ChatEntry, LockKind, ParticipantId, ParticipantPresence, Pose, Vec3};

/// Inputs from gameplay into a running session.
#[derive(Debug, Clone, PartialEq)]
pub enum GameplaySignal {
    /// Local pose for this frame; published subject to the throttle
    Pose(Pose),
    UnlockRequested(LockKind),
    ChatSubmitted(String),
    /// A noise in the world. Consumed by AI outside the sync layer.
    SoundEmitted { position: Vec3, radius: f32 },
    Leave,
}

/// Outputs from a session for whatever draws the world.
#[derive(Debug, Clone, PartialEq)]
pub enum SceneEvent {
    AvatarSpawned(ParticipantPresence),
    AvatarMoved(ParticipantPresence),
    /// The avatar and every resource attached to it (bubble, label) go away
    AvatarRemoved(ParticipantId),
    BubbleShown {
        author_id: ParticipantId,
        text: String,
    },
    BubbleCleared(ParticipantId),
    ChatAppended(ChatEntry),
    /// Immediate feedback for the participant who used the lock
    LockEngaged(LockKind),
    /// The merged flag became true
    LockOpened(LockKind),
    ExitReached,
    SoundHeard { position: Vec3, radius: f32 },
}
