use crate::backend::{fan_out, Backend, Feed, FeedSender};
use crate::error::SyncError;
use async_trait::async_trait;
use log::debug;
use shared::{timestamp_ms, EventFilter, Record, Store, StoreOp, Table};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

struct Inner {
    store: Store,
    feeds: Vec<FeedSender>,
    next_feed_id: u64,
    operations: usize,
    offline: bool,
}

/// In-process store shared by every clone of the handle.
///
/// Change events are delivered before `execute` returns. The offline switch
/// makes every call fail with a transport error, standing in for a dropped
/// connection.
#[derive(Clone)]
pub struct LocalBackend {
    inner: Arc<Mutex<Inner>>,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                store: Store::new(),
                feeds: Vec::new(),
                next_feed_id: 1,
                operations: 0,
                offline: false,
            })),
        }
    }

    /// Number of `execute` and `subscribe` calls seen so far, including failed ones.
    pub async fn operation_count(&self) -> usize {
        self.inner.lock().await.operations
    }

    pub async fn set_offline(&self, offline: bool) {
        self.inner.lock().await.offline = offline;
    }

    /// Ends every open feed, as if the backend dropped all subscriptions.
    pub async fn close_feeds(&self) {
        self.inner.lock().await.feeds.clear();
    }

    pub async fn open_feed_count(&self) -> usize {
        let mut inner = self.inner.lock().await;
        inner.feeds.retain(|feed| !feed.tx.is_closed());
        inner.feeds.len()
    }

    /// Runs `op` directly against the store, bypassing counters and the
    /// offline switch. Used to play the part of another client.
    pub async fn inject(&self, op: StoreOp) -> Result<Vec<Record>, SyncError> {
        let mut inner = self.inner.lock().await;
        let applied = inner.store.execute(op, timestamp_ms())?;
        for event in &applied.events {
            fan_out(&mut inner.feeds, event);
        }
        Ok(applied.rows)
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn execute(&self, op: StoreOp) -> Result<Vec<Record>, SyncError> {
        let mut inner = self.inner.lock().await;
        inner.operations += 1;
        if inner.offline {
            return Err(SyncError::Transport("backend offline".to_string()));
        }

        debug!("local {} on {}", op.name(), op.table());
        let applied = inner.store.execute(op, timestamp_ms())?;
        for event in &applied.events {
            fan_out(&mut inner.feeds, event);
        }
        Ok(applied.rows)
    }

    async fn subscribe(&self, table: Table, filter: EventFilter) -> Result<Feed, SyncError> {
        let mut inner = self.inner.lock().await;
        inner.operations += 1;
        if inner.offline {
            return Err(SyncError::Transport("backend offline".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let id = inner.next_feed_id;
        inner.next_feed_id += 1;
        inner.feeds.push(FeedSender {
            id,
            table,
            filter,
            tx,
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{
        ChatMessageRow, EventType, GameStatePatch, LockKind, ParticipantId, Patch, RecordKey,
        GAME_STATE_ID,
    };

    #[tokio::test]
    async fn test_feed_receives_matching_events_only() {
        let backend = LocalBackend::new();
        let mut chat = backend
            .subscribe(Table::ChatMessages, EventFilter::Insert)
            .await
            .unwrap();
        let mut flags = backend
            .subscribe(Table::GameState, EventFilter::Update)
            .await
            .unwrap();

        backend
            .insert(Record::ChatMessage(ChatMessageRow::draft(
                ParticipantId::random(),
                "ada",
                "hi",
            )))
            .await
            .unwrap();

        let event = chat.try_recv().unwrap();
        assert_eq!(event.event_type, EventType::Insert);
        assert!(flags.try_recv().is_err());

        backend
            .update(
                Patch::GameState(GameStatePatch::unlock(LockKind::Key)),
                RecordKey::GameState(GAME_STATE_ID),
            )
            .await
            .unwrap();
        assert!(flags.try_recv().is_ok());
        assert!(chat.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_offline_backend_fails_and_counts() {
        let backend = LocalBackend::new();
        backend.set_offline(true).await;

        let result = backend.select(Table::Players, None).await;
        assert!(matches!(result, Err(SyncError::Transport(_))));
        assert_eq!(backend.operation_count().await, 1);

        backend.set_offline(false).await;
        tokio_test::assert_ok!(backend.select(Table::Players, None).await);
        assert_eq!(backend.operation_count().await, 2);
    }

    #[tokio::test]
    async fn test_close_feeds_ends_streams() {
        let backend = LocalBackend::new();
        let mut feed = backend
            .subscribe(Table::Players, EventFilter::All)
            .await
            .unwrap();
        assert_eq!(backend.open_feed_count().await, 1);

        backend.close_feeds().await;
        assert!(feed.recv().await.is_none());
        assert_eq!(backend.open_feed_count().await, 0);
    }

    #[tokio::test]
    async fn test_dropped_feed_is_forgotten() {
        let backend = LocalBackend::new();
        let feed = backend
            .subscribe(Table::Players, EventFilter::All)
            .await
            .unwrap();
        drop(feed);
        assert_eq!(backend.open_feed_count().await, 0);
    }
}
