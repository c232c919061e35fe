use crate::store::{ChangeEvent, EventFilter, Record, StoreOp, Table};
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;

/// Receive buffer size; one datagram must hold a full `players` select.
pub const MAX_DATAGRAM: usize = 65_507;

/// Sent for any packet from an address the server does not know. The client
/// may register again with a new `Hello`.
pub const REJECT_NOT_CONNECTED: &str = "Not connected";
/// Answers to a `Hello` itself; re-sending the `Hello` will not help.
pub const REJECT_SERVER_FULL: &str = "Server full";
pub const REJECT_VERSION_MISMATCH: &str = "Protocol version mismatch";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Packet {
    Hello {
        client_version: u32,
    },
    Request {
        request_id: u32,
        op: StoreOp,
    },
    Subscribe {
        request_id: u32,
        table: Table,
        filter: EventFilter,
    },
    Heartbeat,
    Goodbye,

    Welcome {
        connection_id: u32,
    },
    Reply {
        request_id: u32,
        result: Result<Vec<Record>, String>,
    },
    Change {
        event: ChangeEvent,
    },
    Rejected {
        reason: String,
    },
}

impl Packet {
    pub fn encode(&self) -> bincode::Result<Vec<u8>> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> bincode::Result<Packet> {
        bincode::deserialize(bytes)
    }
}
