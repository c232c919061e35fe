//! Connection bookkeeping for the store server
//!
//! This module tracks every socket address talking to the store:
//! - Connection lifecycle (hello, goodbye, idle timeout)
//! - Per-table change-feed subscriptions and their event filters
//! - Which presence rows each connection has written, so they can be
//!   reaped when the connection goes quiet without saying goodbye
//!
//! The manager never touches the store itself; it only answers who should
//! hear about a change and whose rows are orphaned.

use log::info;
use shared::{ChangeEvent, EventFilter, ParticipantId, Record, RecordKey, StoreOp, Table};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// A connected store client and its subscriptions
#[derive(Debug)]
pub struct Client {
    /// Identifier assigned on first contact
    pub id: u32,
    /// Address replies and change events are sent to
    pub addr: SocketAddr,
    /// Last time any packet arrived from this client
    pub last_seen: Instant,
    /// Active change feeds keyed by table
    pub subscriptions: HashMap<Table, EventFilter>,
    /// Presence rows this client created and has not deleted
    pub owned_players: HashSet<ParticipantId>,
}

impl Client {
    pub fn new(id: u32, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            last_seen: Instant::now(),
            subscriptions: HashMap::new(),
            owned_players: HashSet::new(),
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Registers a feed; a second subscription to the same table widens the
    /// existing filter rather than replacing it.
    pub fn subscribe(&mut self, table: Table, filter: EventFilter) {
        self.touch();
        let merged = match self.subscriptions.get(&table) {
            Some(existing) => existing.widen(filter),
            None => filter,
        };
        self.subscriptions.insert(table, merged);
    }

    pub fn wants(&self, event: &ChangeEvent) -> bool {
        self.subscriptions
            .get(&event.table)
            .map_or(false, |filter| filter.matches(event.event_type))
    }

    /// Tracks presence rows written or removed by a successful operation.
    pub fn record_ownership(&mut self, op: &StoreOp) {
        match op {
            StoreOp::Upsert(Record::Player(row)) | StoreOp::Insert(Record::Player(row)) => {
                self.owned_players.insert(row.id);
            }
            StoreOp::Delete {
                key: RecordKey::Player(id),
            } => {
                self.owned_players.remove(id);
            }
            _ => {}
        }
    }

    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// A client dropped for inactivity, with the rows it left behind
#[derive(Debug, Clone, PartialEq)]
pub struct ReapedClient {
    pub id: u32,
    pub owned_players: Vec<ParticipantId>,
}

/// Manages all store connections
pub struct ClientManager {
    clients: HashMap<u32, Client>,
    next_client_id: u32,
    max_clients: usize,
    idle_timeout: Duration,
}

impl ClientManager {
    /// Creates a manager; client ids start at 1.
    pub fn new(max_clients: usize, idle_timeout: Duration) -> Self {
        Self {
            clients: HashMap::new(),
            next_client_id: 1,
            max_clients,
            idle_timeout,
        }
    }

    /// Returns `None` when the server is at capacity.
    pub fn add_client(&mut self, addr: SocketAddr) -> Option<u32> {
        if self.clients.len() >= self.max_clients {
            return None;
        }

        let client_id = self.next_client_id;
        self.next_client_id += 1;

        self.clients.insert(client_id, Client::new(client_id, addr));
        info!("Client {} connected from {}", client_id, addr);

        Some(client_id)
    }

    pub fn remove_client(&mut self, client_id: &u32) -> Option<Client> {
        let removed = self.clients.remove(client_id);
        if let Some(client) = &removed {
            info!(
                "Client {} disconnected ({} subscriptions)",
                client.id,
                client.subscriptions.len()
            );
        }
        removed
    }

    pub fn find_client_by_addr(&self, addr: SocketAddr) -> Option<u32> {
        self.clients
            .iter()
            .find(|(_, client)| client.addr == addr)
            .map(|(id, _)| *id)
    }

    pub fn get_mut(&mut self, client_id: u32) -> Option<&mut Client> {
        self.clients.get_mut(&client_id)
    }

    /// Refreshes the activity timestamp; false if the id is unknown.
    pub fn touch(&mut self, client_id: u32) -> bool {
        match self.clients.get_mut(&client_id) {
            Some(client) => {
                client.touch();
                true
            }
            None => false,
        }
    }

    pub fn subscribe(&mut self, client_id: u32, table: Table, filter: EventFilter) -> bool {
        match self.clients.get_mut(&client_id) {
            Some(client) => {
                client.subscribe(table, filter);
                info!("Client {} subscribed to {} ({:?})", client_id, table, filter);
                true
            }
            None => false,
        }
    }

    /// Addresses of every client whose feed accepts `event`.
    pub fn subscribers_for(&self, event: &ChangeEvent) -> Vec<(u32, SocketAddr)> {
        self.clients
            .values()
            .filter(|client| client.wants(event))
            .map(|client| (client.id, client.addr))
            .collect()
    }

    /// Removes clients idle past the timeout and returns what they owned.
    pub fn check_timeouts(&mut self) -> Vec<ReapedClient> {
        let timed_out: Vec<u32> = self
            .clients
            .iter()
            .filter(|(_, client)| client.is_timed_out(self.idle_timeout))
            .map(|(id, _)| *id)
            .collect();

        timed_out
            .into_iter()
            .filter_map(|client_id| self.remove_client(&client_id))
            .map(|client| ReapedClient {
                id: client.id,
                owned_players: client.owned_players.into_iter().collect(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
