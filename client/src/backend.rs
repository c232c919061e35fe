//! The store surface the sync layer talks to
//!
//! Every component receives an explicit `Arc<dyn Backend>` handle instead of
//! reaching for a process-wide client. Two implementations ship with the
//! crate: [`crate::network::UdpBackend`] talks to a store server, and
//! [`crate::local_backend::LocalBackend`] runs the store in-process.

use crate::error::SyncError;
use async_trait::async_trait;
use shared::{ChangeEvent, EventFilter, Patch, Record, RecordKey, StoreOp, Table};
use tokio::sync::mpsc;

/// Stream of change notifications for one table.
///
/// The feed ends (`recv` yields `None`) when the backend loses the
/// subscription; the owner is expected to subscribe again.
pub type Feed = mpsc::UnboundedReceiver<ChangeEvent>;

#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Runs one operation and returns the rows it touched or matched.
    async fn execute(&self, op: StoreOp) -> Result<Vec<Record>, SyncError>;

    /// Opens a change feed for `table`, delivering only events `filter` accepts.
    async fn subscribe(&self, table: Table, filter: EventFilter) -> Result<Feed, SyncError>;

    /// Releases server-side resources. Best effort.
    async fn close(&self) {}

    async fn upsert(&self, record: Record) -> Result<Vec<Record>, SyncError> {
        self.execute(StoreOp::Upsert(record)).await
    }

    async fn insert(&self, record: Record) -> Result<Vec<Record>, SyncError> {
        self.execute(StoreOp::Insert(record)).await
    }

    async fn update(&self, patch: Patch, key: RecordKey) -> Result<Vec<Record>, SyncError> {
        self.execute(StoreOp::Update { patch, key }).await
    }

    async fn select(
        &self,
        table: Table,
        key: Option<RecordKey>,
    ) -> Result<Vec<Record>, SyncError> {
        self.execute(StoreOp::Select { table, key }).await
    }

    async fn delete(&self, key: RecordKey) -> Result<Vec<Record>, SyncError> {
        self.execute(StoreOp::Delete { key }).await
    }
}

/// Sending half of a feed, kept by backends for fan-out.
#[derive(Debug)]
pub(crate) struct FeedSender {
    pub(crate) id: u64,
    pub(crate) table: Table,
    pub(crate) filter: EventFilter,
    pub(crate) tx: mpsc::UnboundedSender<ChangeEvent>,
}

impl FeedSender {
    pub(crate) fn accepts(&self, event: &ChangeEvent) -> bool {
        self.table == event.table && self.filter.matches(event.event_type)
    }
}

/// Delivers `event` to every matching feed and forgets feeds whose receiver
/// has been dropped.
pub(crate) fn fan_out(feeds: &mut Vec<FeedSender>, event: &ChangeEvent) {
    feeds.retain(|feed| !feed.tx.is_closed());
    for feed in feeds.iter().filter(|feed| feed.accepts(event)) {
        let _ = feed.tx.send(event.clone());
    }
}
