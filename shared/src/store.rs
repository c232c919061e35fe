//! Record layout and mutation rules of the backend store
//!
//! The store holds three logical tables:
//! - `players`: one presence row per connected participant
//! - `chat_messages`: append-only chat history, ids and timestamps assigned here
//! - `game_state`: a singleton row carrying the three puzzle locks
//!
//! Every successful mutation produces [`ChangeEvent`]s which the hosting
//! process fans out to subscribers. Both the UDP store server and the
//! in-process backend run this same state machine.

use crate::model::{
    ChatEntry, LockKind, ParticipantId, ParticipantPresence, Pose, PuzzleFlags, Vec3,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

pub const GAME_STATE_ID: u32 = 1;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Players,
    ChatMessages,
    GameState,
}

impl Table {
    pub const ALL: [Table; 3] = [Table::Players, Table::ChatMessages, Table::GameState];

    pub fn name(&self) -> &'static str {
        match self {
            Table::Players => "players",
            Table::ChatMessages => "chat_messages",
            Table::GameState => "game_state",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PlayerRow {
    pub id: ParticipantId,
    pub name: String,
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub rotation_y: f32,
    pub room: String,
    pub last_updated: u64,
}

impl PlayerRow {
    pub fn from_presence(presence: &ParticipantPresence) -> Self {
        Self {
            id: presence.id,
            name: presence.display_name.clone(),
            x: presence.pose.position.x,
            y: presence.pose.position.y,
            z: presence.pose.position.z,
            rotation_y: presence.pose.facing_yaw,
            room: presence.room.clone(),
            last_updated: presence.last_updated,
        }
    }

    pub fn to_presence(&self) -> ParticipantPresence {
        ParticipantPresence {
            id: self.id,
            display_name: self.name.clone(),
            pose: Pose::new(Vec3::new(self.x, self.y, self.z), self.rotation_y),
            room: self.room.clone(),
            last_updated: self.last_updated,
        }
    }

    fn apply(&mut self, patch: &PlayerPatch) {
        if let Some(x) = patch.x {
            self.x = x;
        }
        if let Some(y) = patch.y {
            self.y = y;
        }
        if let Some(z) = patch.z {
            self.z = z;
        }
        if let Some(rotation_y) = patch.rotation_y {
            self.rotation_y = rotation_y;
        }
        if let Some(room) = &patch.room {
            self.room = room.clone();
        }
        if let Some(last_updated) = patch.last_updated {
            self.last_updated = last_updated;
        }
    }
}

/// Partial player update; `None` leaves the column untouched.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct PlayerPatch {
    pub x: Option<f32>,
    pub y: Option<f32>,
    pub z: Option<f32>,
    pub rotation_y: Option<f32>,
    pub room: Option<String>,
    pub last_updated: Option<u64>,
}

impl PlayerPatch {
    pub fn pose(pose: &Pose, timestamp: u64) -> Self {
        Self {
            x: Some(pose.position.x),
            y: Some(pose.position.y),
            z: Some(pose.position.z),
            rotation_y: Some(pose.facing_yaw),
            room: None,
            last_updated: Some(timestamp),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatMessageRow {
    pub id: u64,
    pub player_id: ParticipantId,
    pub player_name: String,
    pub message: String,
    pub created_at: u64,
}

impl ChatMessageRow {
    /// Row for an insert; the store overwrites `id` and `created_at`.
    pub fn draft(player_id: ParticipantId, player_name: &str, message: &str) -> Self {
        Self {
            id: 0,
            player_id,
            player_name: player_name.to_string(),
            message: message.to_string(),
            created_at: 0,
        }
    }

    pub fn to_entry(&self) -> ChatEntry {
        ChatEntry {
            id: Some(self.id),
            author_id: self.player_id,
            author_name: self.player_name.clone(),
            text: self.message.clone(),
            created_at: Some(self.created_at),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct GameStateRow {
    pub id: u32,
    pub lock_key: bool,
    pub lock_tool: bool,
    pub lock_code: bool,
}

impl GameStateRow {
    pub fn provisioned() -> Self {
        Self {
            id: GAME_STATE_ID,
            lock_key: false,
            lock_tool: false,
            lock_code: false,
        }
    }

    pub fn flags(&self) -> PuzzleFlags {
        PuzzleFlags {
            key_unlocked: self.lock_key,
            tool_unlocked: self.lock_tool,
            code_unlocked: self.lock_code,
        }
    }

    fn apply(&mut self, patch: &GameStatePatch) {
        if let Some(lock_key) = patch.lock_key {
            self.lock_key = lock_key;
        }
        if let Some(lock_tool) = patch.lock_tool {
            self.lock_tool = lock_tool;
        }
        if let Some(lock_code) = patch.lock_code {
            self.lock_code = lock_code;
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub struct GameStatePatch {
    pub lock_key: Option<bool>,
    pub lock_tool: Option<bool>,
    pub lock_code: Option<bool>,
}

impl GameStatePatch {
    /// Partial update touching exactly one lock.
    pub fn unlock(kind: LockKind) -> Self {
        let mut patch = Self::default();
        match kind {
            LockKind::Key => patch.lock_key = Some(true),
            LockKind::Tool => patch.lock_tool = Some(true),
            LockKind::Code => patch.lock_code = Some(true),
        }
        patch
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Record {
    Player(PlayerRow),
    ChatMessage(ChatMessageRow),
    GameState(GameStateRow),
}

impl Record {
    pub fn table(&self) -> Table {
        match self {
            Record::Player(_) => Table::Players,
            Record::ChatMessage(_) => Table::ChatMessages,
            Record::GameState(_) => Table::GameState,
        }
    }

    pub fn key(&self) -> RecordKey {
        match self {
            Record::Player(row) => RecordKey::Player(row.id),
            Record::ChatMessage(row) => RecordKey::ChatMessage(row.id),
            Record::GameState(row) => RecordKey::GameState(row.id),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKey {
    Player(ParticipantId),
    ChatMessage(u64),
    GameState(u32),
}

impl RecordKey {
    pub fn table(&self) -> Table {
        match self {
            RecordKey::Player(_) => Table::Players,
            RecordKey::ChatMessage(_) => Table::ChatMessages,
            RecordKey::GameState(_) => Table::GameState,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Patch {
    Player(PlayerPatch),
    GameState(GameStatePatch),
}

impl Patch {
    pub fn table(&self) -> Table {
        match self {
            Patch::Player(_) => Table::Players,
            Patch::GameState(_) => Table::GameState,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum StoreOp {
    Upsert(Record),
    Insert(Record),
    Update { patch: Patch, key: RecordKey },
    Select { table: Table, key: Option<RecordKey> },
    Delete { key: RecordKey },
}

impl StoreOp {
    pub fn table(&self) -> Table {
        match self {
            StoreOp::Upsert(record) | StoreOp::Insert(record) => record.table(),
            StoreOp::Update { key, .. } => key.table(),
            StoreOp::Select { table, .. } => *table,
            StoreOp::Delete { key } => key.table(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StoreOp::Upsert(_) => "upsert",
            StoreOp::Insert(_) => "insert",
            StoreOp::Update { .. } => "update",
            StoreOp::Select { .. } => "select",
            StoreOp::Delete { .. } => "delete",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventFilter {
    Insert,
    Update,
    Delete,
    All,
}

impl EventFilter {
    pub fn matches(&self, event_type: EventType) -> bool {
        matches!(
            (self, event_type),
            (EventFilter::All, _)
                | (EventFilter::Insert, EventType::Insert)
                | (EventFilter::Update, EventType::Update)
                | (EventFilter::Delete, EventType::Delete)
        )
    }

    /// Smallest filter accepting everything either side accepts.
    pub fn widen(self, other: EventFilter) -> EventFilter {
        if self == other {
            self
        } else {
            EventFilter::All
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChangeEvent {
    pub table: Table,
    pub event_type: EventType,
    pub new: Option<Record>,
    pub old: Option<Record>,
}

impl ChangeEvent {
    fn inserted(record: Record) -> Self {
        Self {
            table: record.table(),
            event_type: EventType::Insert,
            new: Some(record),
            old: None,
        }
    }

    fn updated(old: Record, new: Record) -> Self {
        Self {
            table: new.table(),
            event_type: EventType::Update,
            new: Some(new),
            old: Some(old),
        }
    }

    fn deleted(old: Record) -> Self {
        Self {
            table: old.table(),
            event_type: EventType::Delete,
            new: None,
            old: Some(old),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("duplicate key in {table}")]
    DuplicateKey { table: Table },
    #[error("{op} is not supported on {table}")]
    Unsupported { table: Table, op: &'static str },
    #[error("patch for {patch} cannot target a {key} key")]
    TableMismatch { patch: Table, key: Table },
}

/// Outcome of a successful store operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Applied {
    /// Rows touched or matched by the operation.
    pub rows: Vec<Record>,
    /// Notifications to deliver to subscribers of the affected table.
    pub events: Vec<ChangeEvent>,
}

impl Applied {
    fn rows(rows: Vec<Record>) -> Self {
        Self {
            rows,
            events: Vec::new(),
        }
    }

    fn changed(row: Record, event: ChangeEvent) -> Self {
        Self {
            rows: vec![row],
            events: vec![event],
        }
    }
}

#[derive(Debug, Clone)]
pub struct Store {
    players: BTreeMap<ParticipantId, PlayerRow>,
    chat_messages: Vec<ChatMessageRow>,
    next_chat_id: u64,
    game_state: GameStateRow,
}

impl Store {
    /// Creates a store with the `game_state` singleton already provisioned.
    pub fn new() -> Self {
        Self {
            players: BTreeMap::new(),
            chat_messages: Vec::new(),
            next_chat_id: 1,
            game_state: GameStateRow::provisioned(),
        }
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn chat_len(&self) -> usize {
        self.chat_messages.len()
    }

    pub fn game_state(&self) -> &GameStateRow {
        &self.game_state
    }

    /// Applies one operation at wall-clock time `now` (milliseconds).
    pub fn execute(&mut self, op: StoreOp, now: u64) -> Result<Applied, StoreError> {
        match op {
            StoreOp::Upsert(record) => self.upsert(record),
            StoreOp::Insert(record) => self.insert(record, now),
            StoreOp::Update { patch, key } => self.update(patch, key),
            StoreOp::Select { table, key } => Ok(self.select(table, key)),
            StoreOp::Delete { key } => self.delete(key),
        }
    }

    fn upsert(&mut self, record: Record) -> Result<Applied, StoreError> {
        match record {
            Record::Player(row) => {
                let new = Record::Player(row.clone());
                let event = match self.players.insert(row.id, row) {
                    Some(old) => ChangeEvent::updated(Record::Player(old), new.clone()),
                    None => ChangeEvent::inserted(new.clone()),
                };
                Ok(Applied::changed(new, event))
            }
            Record::GameState(row) if row.id == GAME_STATE_ID => {
                let old = Record::GameState(self.game_state);
                self.game_state = row;
                let new = Record::GameState(row);
                Ok(Applied::changed(new.clone(), ChangeEvent::updated(old, new)))
            }
            other => Err(StoreError::Unsupported {
                table: other.table(),
                op: "upsert",
            }),
        }
    }

    fn insert(&mut self, record: Record, now: u64) -> Result<Applied, StoreError> {
        match record {
            Record::Player(row) => {
                if self.players.contains_key(&row.id) {
                    return Err(StoreError::DuplicateKey {
                        table: Table::Players,
                    });
                }
                self.players.insert(row.id, row.clone());
                let new = Record::Player(row);
                Ok(Applied::changed(new.clone(), ChangeEvent::inserted(new)))
            }
            Record::ChatMessage(mut row) => {
                row.id = self.next_chat_id;
                row.created_at = now;
                self.next_chat_id += 1;
                self.chat_messages.push(row.clone());
                let new = Record::ChatMessage(row);
                Ok(Applied::changed(new.clone(), ChangeEvent::inserted(new)))
            }
            Record::GameState(_) => Err(StoreError::DuplicateKey {
                table: Table::GameState,
            }),
        }
    }

    fn update(&mut self, patch: Patch, key: RecordKey) -> Result<Applied, StoreError> {
        match (patch, key) {
            (Patch::Player(patch), RecordKey::Player(id)) => match self.players.get_mut(&id) {
                Some(row) => {
                    let old = Record::Player(row.clone());
                    row.apply(&patch);
                    let new = Record::Player(row.clone());
                    Ok(Applied::changed(new.clone(), ChangeEvent::updated(old, new)))
                }
                None => Ok(Applied::default()),
            },
            (Patch::GameState(patch), RecordKey::GameState(id)) => {
                if id != self.game_state.id {
                    return Ok(Applied::default());
                }
                let old = Record::GameState(self.game_state);
                self.game_state.apply(&patch);
                let new = Record::GameState(self.game_state);
                Ok(Applied::changed(new.clone(), ChangeEvent::updated(old, new)))
            }
            (_, RecordKey::ChatMessage(_)) => Err(StoreError::Unsupported {
                table: Table::ChatMessages,
                op: "update",
            }),
            (patch, key) => Err(StoreError::TableMismatch {
                patch: patch.table(),
                key: key.table(),
            }),
        }
    }

    fn select(&self, table: Table, key: Option<RecordKey>) -> Applied {
        let rows = match table {
            Table::Players => self
                .players
                .values()
                .filter(|row| key.map_or(true, |k| k == RecordKey::Player(row.id)))
                .cloned()
                .map(Record::Player)
                .collect(),
            Table::ChatMessages => self
                .chat_messages
                .iter()
                .filter(|row| key.map_or(true, |k| k == RecordKey::ChatMessage(row.id)))
                .cloned()
                .map(Record::ChatMessage)
                .collect(),
            Table::GameState => {
                if key.map_or(true, |k| k == RecordKey::GameState(self.game_state.id)) {
                    vec![Record::GameState(self.game_state)]
                } else {
                    Vec::new()
                }
            }
        };
        Applied::rows(rows)
    }

    fn delete(&mut self, key: RecordKey) -> Result<Applied, StoreError> {
        match key {
            RecordKey::Player(id) => match self.players.remove(&id) {
                Some(old) => {
                    let old = Record::Player(old);
                    Ok(Applied::changed(old.clone(), ChangeEvent::deleted(old)))
                }
                None => Ok(Applied::default()),
            },
            other => Err(StoreError::Unsupported {
                table: other.table(),
                op: "delete",
            }),
        }
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn player(name: &str) -> PlayerRow {
        let presence = ParticipantPresence {
            id: ParticipantId::random(),
            display_name: name.to_string(),
            pose: Pose::spawn(),
            room: "start".to_string(),
            last_updated: 0,
        };
        PlayerRow::from_presence(&presence)
    }

    #[test]
    fn test_store_provisions_game_state() {
        let store = Store::new();
        assert_eq!(store.game_state().id, GAME_STATE_ID);
        assert_eq!(store.game_state().flags(), PuzzleFlags::default());
    }

    #[test]
    fn test_upsert_inserts_then_updates() {
        let mut store = Store::new();
        let row = player("ada");

        let first = store.execute(StoreOp::Upsert(Record::Player(row.clone())), 1).unwrap();
        assert_eq!(first.events.len(), 1);
        assert_eq!(first.events[0].event_type, EventType::Insert);
        assert!(first.events[0].old.is_none());

        let mut moved = row.clone();
        moved.x = 12.0;
        let second = store.execute(StoreOp::Upsert(Record::Player(moved)), 2).unwrap();
        assert_eq!(second.events[0].event_type, EventType::Update);
        assert_eq!(second.events[0].old, Some(Record::Player(row)));
        assert_eq!(store.player_count(), 1);
    }

    #[test]
    fn test_update_missing_player_matches_nothing() {
        let mut store = Store::new();
        let applied = store
            .execute(
                StoreOp::Update {
                    patch: Patch::Player(PlayerPatch::default()),
                    key: RecordKey::Player(ParticipantId::random()),
                },
                1,
            )
            .unwrap();
        assert!(applied.rows.is_empty());
        assert!(applied.events.is_empty());
    }

    #[test]
    fn test_player_patch_touches_only_given_columns() {
        let mut store = Store::new();
        let row = player("ada");
        store.execute(StoreOp::Upsert(Record::Player(row.clone())), 1).unwrap();

        let pose = Pose::new(Vec3::new(1.0, 5.0, -3.0), 0.5);
        let applied = store
            .execute(
                StoreOp::Update {
                    patch: Patch::Player(PlayerPatch::pose(&pose, 99)),
                    key: RecordKey::Player(row.id),
                },
                2,
            )
            .unwrap();

        match &applied.rows[0] {
            Record::Player(updated) => {
                assert_eq!(updated.name, "ada");
                assert_eq!(updated.room, "start");
                assert_eq!(updated.x, 1.0);
                assert_eq!(updated.z, -3.0);
                assert_eq!(updated.rotation_y, 0.5);
                assert_eq!(updated.last_updated, 99);
            }
            other => panic!("unexpected row {:?}", other),
        }
    }

    #[test]
    fn test_chat_insert_assigns_id_and_timestamp() {
        let mut store = Store::new();
        let author = ParticipantId::random();

        let first = store
            .execute(
                StoreOp::Insert(Record::ChatMessage(ChatMessageRow::draft(author, "ada", "hi"))),
                500,
            )
            .unwrap();
        let second = store
            .execute(
                StoreOp::Insert(Record::ChatMessage(ChatMessageRow::draft(author, "ada", "yo"))),
                600,
            )
            .unwrap();

        match (&first.rows[0], &second.rows[0]) {
            (Record::ChatMessage(a), Record::ChatMessage(b)) => {
                assert_eq!(a.id, 1);
                assert_eq!(a.created_at, 500);
                assert_eq!(b.id, 2);
                assert_eq!(b.created_at, 600);
            }
            _ => panic!("expected chat rows"),
        }
        assert_eq!(store.chat_len(), 2);
    }

    #[test]
    fn test_chat_rows_are_append_only() {
        let mut store = Store::new();
        let result = store.execute(
            StoreOp::Delete {
                key: RecordKey::ChatMessage(1),
            },
            1,
        );
        assert_eq!(
            result,
            Err(StoreError::Unsupported {
                table: Table::ChatMessages,
                op: "delete",
            })
        );
    }

    #[test]
    fn test_game_state_partial_update() {
        let mut store = Store::new();
        let applied = store
            .execute(
                StoreOp::Update {
                    patch: Patch::GameState(GameStatePatch::unlock(LockKind::Tool)),
                    key: RecordKey::GameState(GAME_STATE_ID),
                },
                1,
            )
            .unwrap();

        assert_eq!(applied.events[0].event_type, EventType::Update);
        let flags = store.game_state().flags();
        assert!(!flags.key_unlocked);
        assert!(flags.tool_unlocked);
        assert!(!flags.code_unlocked);
    }

    #[test]
    fn test_game_state_cannot_be_deleted() {
        let mut store = Store::new();
        assert!(store
            .execute(
                StoreOp::Delete {
                    key: RecordKey::GameState(GAME_STATE_ID),
                },
                1,
            )
            .is_err());
    }

    #[test]
    fn test_patch_key_mismatch_is_rejected() {
        let mut store = Store::new();
        let result = store.execute(
            StoreOp::Update {
                patch: Patch::GameState(GameStatePatch::unlock(LockKind::Key)),
                key: RecordKey::Player(ParticipantId::random()),
            },
            1,
        );
        assert_eq!(
            result,
            Err(StoreError::TableMismatch {
                patch: Table::GameState,
                key: Table::Players,
            })
        );
    }

    #[test]
    fn test_delete_twice_emits_once() {
        let mut store = Store::new();
        let row = player("ada");
        store.execute(StoreOp::Upsert(Record::Player(row.clone())), 1).unwrap();

        let key = RecordKey::Player(row.id);
        let first = store.execute(StoreOp::Delete { key }, 2).unwrap();
        let second = store.execute(StoreOp::Delete { key }, 3).unwrap();

        assert_eq!(first.events.len(), 1);
        assert_eq!(first.events[0].event_type, EventType::Delete);
        assert!(second.events.is_empty());
    }

    #[test]
    fn test_select_by_key_and_all() {
        let mut store = Store::new();
        let a = player("ada");
        let b = player("bob");
        store.execute(StoreOp::Upsert(Record::Player(a.clone())), 1).unwrap();
        store.execute(StoreOp::Upsert(Record::Player(b)), 1).unwrap();

        let all = store
            .execute(
                StoreOp::Select {
                    table: Table::Players,
                    key: None,
                },
                2,
            )
            .unwrap();
        assert_eq!(all.rows.len(), 2);

        let one = store
            .execute(
                StoreOp::Select {
                    table: Table::Players,
                    key: Some(RecordKey::Player(a.id)),
                },
                2,
            )
            .unwrap();
        assert_eq!(one.rows, vec![Record::Player(a)]);
    }

    #[test]
    fn test_event_filter_matching() {
        assert!(EventFilter::All.matches(EventType::Delete));
        assert!(EventFilter::Insert.matches(EventType::Insert));
        assert!(!EventFilter::Insert.matches(EventType::Update));
        assert!(!EventFilter::Update.matches(EventType::Delete));
        assert_eq!(EventFilter::Insert.widen(EventFilter::Insert), EventFilter::Insert);
        assert_eq!(EventFilter::Insert.widen(EventFilter::Update), EventFilter::All);
    }
}
