use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub const SPAWN_POSITION: Vec3 = Vec3 {
    x: 0.0,
    y: 5.0,
    z: 0.0,
};
pub const SPAWN_ROOM: &str = "start";

/// Opaque participant token, generated once per play session.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParticipantId(Uuid);

impl ParticipantId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

/// Local pose sampled from the first-person controller each frame.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Default)]
pub struct Pose {
    pub position: Vec3,
    /// Radians around the vertical axis.
    pub facing_yaw: f32,
}

impl Pose {
    pub fn new(position: Vec3, facing_yaw: f32) -> Self {
        Self {
            position,
            facing_yaw,
        }
    }

    pub fn spawn() -> Self {
        Self::new(SPAWN_POSITION, 0.0)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ParticipantPresence {
    pub id: ParticipantId,
    pub display_name: String,
    pub pose: Pose,
    pub room: String,
    /// Milliseconds since the Unix epoch.
    pub last_updated: u64,
}

/// A line in the chat log.
///
/// `id` and `created_at` are assigned by the store; an entry appended
/// optimistically by its own author carries neither.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatEntry {
    pub id: Option<u64>,
    pub author_id: ParticipantId,
    pub author_name: String,
    pub text: String,
    pub created_at: Option<u64>,
}

impl ChatEntry {
    pub fn is_confirmed(&self) -> bool {
        self.id.is_some()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKind {
    Key,
    Tool,
    Code,
}

impl LockKind {
    pub const ALL: [LockKind; 3] = [LockKind::Key, LockKind::Tool, LockKind::Code];

    pub fn name(&self) -> &'static str {
        match self {
            LockKind::Key => "key",
            LockKind::Tool => "tool",
            LockKind::Code => "code",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "key" => Some(LockKind::Key),
            "tool" => Some(LockKind::Tool),
            "code" => Some(LockKind::Code),
            _ => None,
        }
    }
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Shared puzzle progress. Each flag is write-once-true.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub struct PuzzleFlags {
    pub key_unlocked: bool,
    pub tool_unlocked: bool,
    pub code_unlocked: bool,
}

impl PuzzleFlags {
    pub fn get(&self, kind: LockKind) -> bool {
        match kind {
            LockKind::Key => self.key_unlocked,
            LockKind::Tool => self.tool_unlocked,
            LockKind::Code => self.code_unlocked,
        }
    }

    fn raise(&mut self, kind: LockKind) {
        match kind {
            LockKind::Key => self.key_unlocked = true,
            LockKind::Tool => self.tool_unlocked = true,
            LockKind::Code => self.code_unlocked = true,
        }
    }

    pub fn all_unlocked(&self) -> bool {
        self.key_unlocked && self.tool_unlocked && self.code_unlocked
    }

    /// OR-merges `remote` into `self` and returns the flags that flipped to true.
    ///
    /// A true flag is never lowered, so the result is the same under any
    /// replay, duplication or reordering of remote states.
    pub fn merge(&mut self, remote: &PuzzleFlags) -> Vec<LockKind> {
        let mut opened = Vec::new();
        for kind in LockKind::ALL {
            if remote.get(kind) && !self.get(kind) {
                self.raise(kind);
                opened.push(kind);
            }
        }
        opened
    }
}
