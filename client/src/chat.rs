use crate::error::SyncError;
use crate::identity::SessionIdentity;
use log::debug;
use shared::{ChatEntry, ChatMessageRow, ParticipantId};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Local chat log in arrival order.
#[derive(Debug)]
pub struct ChatRelay {
    identity: SessionIdentity,
    log: Vec<ChatEntry>,
}

impl ChatRelay {
    pub fn new(identity: SessionIdentity) -> Self {
        Self {
            identity,
            log: Vec::new(),
        }
    }

    /// Appends `text` optimistically and returns the row to insert.
    ///
    /// Blank text is rejected before anything is appended.
    pub fn send_local(&mut self, text: &str) -> Result<ChatMessageRow, SyncError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SyncError::EmptyMessage);
        }

        self.log.push(ChatEntry {
            id: None,
            author_id: self.identity.id(),
            author_name: self.identity.display_name().to_string(),
            text: text.to_string(),
            created_at: None,
        });
        Ok(ChatMessageRow::draft(
            self.identity.id(),
            self.identity.display_name(),
            text,
        ))
    }

    /// Appends a remote message. Our own messages are already in the log and
    /// are dropped here.
    pub fn on_chat_notification(&mut self, row: &ChatMessageRow) -> Option<ChatEntry> {
        if self.identity.is_self(&row.player_id) {
            debug!("Dropping echo of own chat message {}", row.id);
            return None;
        }

        let entry = row.to_entry();
        self.log.push(entry.clone());
        Some(entry)
    }

    pub fn entries(&self) -> &[ChatEntry] {
        &self.log
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Bubble {
    pub author_id: ParticipantId,
    pub text: String,
    /// Bumped every time the bubble for this author is replaced
    pub generation: u64,
    pub expires_at: Instant,
}

/// Speech bubbles over avatars, at most one per participant.
#[derive(Debug)]
pub struct BubbleBoard {
    lifetime: Duration,
    bubbles: HashMap<ParticipantId, Bubble>,
    next_generation: u64,
}

impl BubbleBoard {
    pub fn new(lifetime: Duration) -> Self {
        Self {
            lifetime,
            bubbles: HashMap::new(),
            next_generation: 1,
        }
    }

    /// Shows `text` over `author_id`, replacing any bubble already there.
    pub fn show(&mut self, author_id: ParticipantId, text: &str, now: Instant) -> Bubble {
        let bubble = Bubble {
            author_id,
            text: text.to_string(),
            generation: self.next_generation,
            expires_at: now + self.lifetime,
        };
        self.next_generation += 1;
        self.bubbles.insert(author_id, bubble.clone());
        bubble
    }

    /// Removes bubbles whose lifetime has run out.
    pub fn expire(&mut self, now: Instant) -> Vec<ParticipantId> {
        let expired: Vec<ParticipantId> = self
            .bubbles
            .values()
            .filter(|bubble| bubble.expires_at <= now)
            .map(|bubble| bubble.author_id)
            .collect();
        for id in &expired {
            self.bubbles.remove(id);
        }
        expired
    }

    pub fn clear(&mut self, author_id: &ParticipantId) -> bool {
        self.bubbles.remove(author_id).is_some()
    }

    pub fn get(&self, author_id: &ParticipantId) -> Option<&Bubble> {
        self.bubbles.get(author_id)
    }

    pub fn len(&self) -> usize {
        self.bubbles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bubbles.is_empty()
    }
}
