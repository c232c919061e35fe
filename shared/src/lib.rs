pub mod model;
pub mod protocol;
pub mod store;
pub mod world;

pub use model::{
    ChatEntry, LockKind, ParticipantId, ParticipantPresence, Pose, PuzzleFlags, Vec3,
    SPAWN_POSITION, SPAWN_ROOM,
};
pub use protocol::{
    Packet, MAX_DATAGRAM, PROTOCOL_VERSION, REJECT_NOT_CONNECTED, REJECT_SERVER_FULL,
    REJECT_VERSION_MISMATCH,
};
pub use store::{
    Applied, ChangeEvent, ChatMessageRow, EventFilter, EventType, GameStatePatch, GameStateRow,
    Patch, PlayerPatch, PlayerRow, Record, RecordKey, Store, StoreError, StoreOp, Table,
    GAME_STATE_ID,
};
pub use world::{
    exit_reachable, ExitVolume, EXIT_DOOR_CENTER, EXIT_DOOR_SIZE, EXIT_MARGIN, GROUND_FLOOR_BAND,
};

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_player() -> PlayerRow {
        PlayerRow {
            id: ParticipantId::random(),
            name: "ada".to_string(),
            x: 1.5,
            y: 5.0,
            z: -2.0,
            rotation_y: 3.1,
            room: SPAWN_ROOM.to_string(),
            last_updated: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_puzzle_flags_merge_reports_new_flags() {
        let mut local = PuzzleFlags::default();
        let remote = PuzzleFlags {
            key_unlocked: true,
            tool_unlocked: false,
            code_unlocked: true,
        };

        let opened = local.merge(&remote);
        assert_eq!(opened, vec![LockKind::Key, LockKind::Code]);
        assert_eq!(local, remote);

        assert!(local.merge(&remote).is_empty());
    }

    #[test]
    fn test_puzzle_flags_never_regress() {
        let mut local = PuzzleFlags {
            key_unlocked: true,
            tool_unlocked: true,
            code_unlocked: false,
        };

        let opened = local.merge(&PuzzleFlags::default());
        assert!(opened.is_empty());
        assert!(local.key_unlocked);
        assert!(local.tool_unlocked);
        assert!(!local.all_unlocked());
    }

    #[test]
    fn test_lock_kind_names() {
        for kind in LockKind::ALL {
            assert_eq!(LockKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(LockKind::from_name(" TOOL "), Some(LockKind::Tool));
        assert_eq!(LockKind::from_name("crowbar"), None);
    }

    #[test]
    fn test_player_row_presence_conversion() {
        let row = sample_player();
        let presence = row.to_presence();

        assert_eq!(presence.id, row.id);
        assert_eq!(presence.display_name, "ada");
        assert_eq!(presence.pose.position, Vec3::new(1.5, 5.0, -2.0));
        assert_eq!(presence.pose.facing_yaw, 3.1);
        assert_eq!(PlayerRow::from_presence(&presence), row);
    }

    #[test]
    fn test_packet_serialization_request() {
        let row = sample_player();
        let packet = Packet::Request {
            request_id: 7,
            op: StoreOp::Upsert(Record::Player(row.clone())),
        };

        let decoded = Packet::decode(&packet.encode().unwrap()).unwrap();
        match decoded {
            Packet::Request { request_id, op } => {
                assert_eq!(request_id, 7);
                assert_eq!(op, StoreOp::Upsert(Record::Player(row)));
            }
            _ => panic!("Wrong packet type after deserialization"),
        }
    }

    #[test]
    fn test_packet_serialization_reply_error() {
        let packet = Packet::Reply {
            request_id: 3,
            result: Err("duplicate key in players".to_string()),
        };

        let decoded = Packet::decode(&packet.encode().unwrap()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_packet_serialization_change_event() {
        let mut store = Store::new();
        let applied = store
            .execute(StoreOp::Upsert(Record::Player(sample_player())), 1)
            .unwrap();
        let packet = Packet::Change {
            event: applied.events[0].clone(),
        };

        let decoded = Packet::decode(&packet.encode().unwrap()).unwrap();
        match decoded {
            Packet::Change { event } => {
                assert_eq!(event.table, Table::Players);
                assert_eq!(event.event_type, EventType::Insert);
                assert!(event.new.is_some());
            }
            _ => panic!("Wrong packet type after deserialization"),
        }
    }

    #[test]
    fn test_full_players_select_fits_datagram() {
        let rows: Vec<Record> = (0..64).map(|_| Record::Player(sample_player())).collect();
        let packet = Packet::Reply {
            request_id: 1,
            result: Ok(rows),
        };
        assert!(packet.encode().unwrap().len() < MAX_DATAGRAM);
    }

    #[test]
    fn test_malformed_packet_rejected() {
        let data = Packet::Hello {
            client_version: PROTOCOL_VERSION,
        }
        .encode()
        .unwrap();

        assert!(Packet::decode(&data[..data.len() / 2]).is_err());
        assert!(Packet::decode(&[]).is_err());
    }

    #[test]
    fn test_timestamp_advances() {
        let first = timestamp_ms();
        std::thread::sleep(Duration::from_millis(2));
        assert!(timestamp_ms() > first);
    }
}
