use log::debug;
use shared::{ChangeEvent, EventType, ParticipantId, ParticipantPresence, Record};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Fixed minimum spacing between two outbound writes of the same kind.
#[derive(Debug, Clone)]
pub struct Throttle {
    interval: Duration,
    last: Option<Instant>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// Returns true and starts a new window if the previous one has elapsed.
    pub fn ready(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// What happened to the replica cache after applying a notification.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicaChange {
    Spawned(ParticipantPresence),
    Moved(ParticipantPresence),
    Removed(ParticipantId),
}

/// Local mirror of every remote participant's presence.
///
/// Replicas jump straight to the latest observed pose. There is no timestamp
/// guard, so a stale update that arrives late wins over a newer one.
#[derive(Debug)]
pub struct PresenceReplicator {
    local_id: ParticipantId,
    replicas: HashMap<ParticipantId, ParticipantPresence>,
    throttle: Throttle,
}

impl PresenceReplicator {
    pub fn new(local_id: ParticipantId, publish_interval: Duration) -> Self {
        Self {
            local_id,
            replicas: HashMap::new(),
            throttle: Throttle::new(publish_interval),
        }
    }

    /// Whether a local pose may be published now.
    pub fn publish_due(&mut self, now: Instant) -> bool {
        self.throttle.ready(now)
    }

    /// Applies one change notification from the `players` feed.
    pub fn apply(&mut self, event: &ChangeEvent) -> Option<ReplicaChange> {
        match event.event_type {
            EventType::Insert | EventType::Update => match &event.new {
                Some(Record::Player(row)) => self.upsert(row.to_presence()),
                _ => None,
            },
            EventType::Delete => match &event.old {
                Some(Record::Player(row)) => self.remove(&row.id),
                _ => None,
            },
        }
    }

    /// Replaces the cache contents with a fresh snapshot, reporting every
    /// difference against what was cached before.
    pub fn seed(&mut self, snapshot: Vec<ParticipantPresence>) -> Vec<ReplicaChange> {
        let mut changes = Vec::new();
        let incoming: Vec<ParticipantId> = snapshot.iter().map(|p| p.id).collect();

        let gone: Vec<ParticipantId> = self
            .replicas
            .keys()
            .filter(|id| !incoming.contains(id))
            .copied()
            .collect();
        for id in gone {
            changes.extend(self.remove(&id));
        }
        for presence in snapshot {
            changes.extend(self.upsert(presence));
        }
        changes
    }

    pub fn get(&self, id: &ParticipantId) -> Option<&ParticipantPresence> {
        self.replicas.get(id)
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.replicas.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    pub fn replicas(&self) -> impl Iterator<Item = &ParticipantPresence> {
        self.replicas.values()
    }

    /// Drops every replica, returning the ids that were removed.
    pub fn clear(&mut self) -> Vec<ParticipantId> {
        self.throttle.reset();
        self.replicas.drain().map(|(id, _)| id).collect()
    }

    fn upsert(&mut self, presence: ParticipantPresence) -> Option<ReplicaChange> {
        if presence.id == self.local_id {
            return None;
        }

        match self.replicas.insert(presence.id, presence.clone()) {
            None => {
                debug!("Replica {} spawned", presence.id);
                Some(ReplicaChange::Spawned(presence))
            }
            Some(_) => Some(ReplicaChange::Moved(presence)),
        }
    }

    fn remove(&mut self, id: &ParticipantId) -> Option<ReplicaChange> {
        self.replicas.remove(id).map(|_| {
            debug!("Replica {} removed", id);
            ReplicaChange::Removed(*id)
        })
    }
}
