//! Join/leave lifecycle and the single task that owns every cache
//!
//! A [`Session`] starts `Disconnected`. [`Session::join`] validates the name,
//! writes the local presence, opens the three change feeds and fetches the
//! initial snapshots; only then is the session `Joined`. From there the host
//! either drives it frame by frame with [`Session::poll`] or hands it to
//! [`Session::run`], which selects over gameplay signals and feeds until the
//! participant leaves.

use crate::backend::{Backend, Feed};
use crate::chat::{BubbleBoard, ChatRelay};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::flags::FlagReconciler;
use crate::identity::SessionIdentity;
use crate::presence::{PresenceReplicator, ReplicaChange};
use crate::signals::{GameplaySignal, SceneEvent};
use log::{debug, info, warn};
use shared::{
    exit_reachable, timestamp_ms, ChangeEvent, ChatEntry, EventFilter, EventType, ExitVolume,
    LockKind, ParticipantPresence, Patch, PlayerPatch, PlayerRow, Pose, PuzzleFlags, Record, RecordKey,
    Table, GAME_STATE_ID, SPAWN_ROOM,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Handle to a write that runs in the background.
pub type Pending = JoinHandle<Result<(), SyncError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Joining,
    Joined,
}

/// Everything that only exists while joined.
struct Joined {
    identity: SessionIdentity,
    presence: PresenceReplicator,
    flags: FlagReconciler,
    chat: ChatRelay,
    bubbles: BubbleBoard,
    local_pose: Pose,
    exit_reached: bool,
}

impl Joined {
    /// Full presence row for the local participant at its last known pose.
    fn local_row(&self) -> PlayerRow {
        PlayerRow::from_presence(&ParticipantPresence {
            id: self.identity.id(),
            display_name: self.identity.display_name().to_string(),
            pose: self.local_pose,
            room: SPAWN_ROOM.to_string(),
            last_updated: timestamp_ms(),
        })
    }
}

#[derive(Default)]
struct Feeds {
    players: Option<Feed>,
    chat: Option<Feed>,
    game_state: Option<Feed>,
}

impl Feeds {
    fn all_open(&self) -> bool {
        self.players.is_some() && self.chat.is_some() && self.game_state.is_some()
    }
}

pub struct Session {
    backend: Arc<dyn Backend>,
    config: SyncConfig,
    exit: ExitVolume,
    state: SessionState,
    joined: Option<Joined>,
    feeds: Feeds,
}

impl Session {
    pub fn new(backend: Arc<dyn Backend>, config: SyncConfig) -> Self {
        Self {
            backend,
            config,
            exit: ExitVolume::default(),
            state: SessionState::Disconnected,
            joined: None,
            feeds: Feeds::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn identity(&self) -> Option<&SessionIdentity> {
        self.joined.as_ref().map(|joined| &joined.identity)
    }

    pub fn replicas(&self) -> Vec<ParticipantPresence> {
        self.joined
            .as_ref()
            .map(|joined| joined.presence.replicas().cloned().collect())
            .unwrap_or_default()
    }

    pub fn flags(&self) -> PuzzleFlags {
        self.joined
            .as_ref()
            .map(|joined| joined.flags.flags())
            .unwrap_or_default()
    }

    pub fn chat_log(&self) -> &[ChatEntry] {
        self.joined
            .as_ref()
            .map(|joined| joined.chat.entries())
            .unwrap_or(&[])
    }

    pub fn bubble_count(&self) -> usize {
        self.joined
            .as_ref()
            .map(|joined| joined.bubbles.len())
            .unwrap_or(0)
    }

    pub fn feeds_open(&self) -> bool {
        self.feeds.all_open()
    }

    /// Joins the shared world as `display_name`.
    ///
    /// A blank name is rejected before anything touches the backend and the
    /// state stays `Disconnected`. Any backend failure during the join
    /// returns [`SyncError::JoinFailed`] and also leaves the session
    /// `Disconnected`, so the call can simply be retried. A presence row
    /// written before the failure is deleted, best effort.
    ///
    /// Returns the scene events for everything already present in the world.
    pub async fn join(&mut self, display_name: &str) -> Result<Vec<SceneEvent>, SyncError> {
        let identity = SessionIdentity::new(display_name)?;
        if let Some(joined) = &self.joined {
            return Err(SyncError::AlreadyJoined(
                joined.identity.display_name().to_string(),
            ));
        }

        info!(
            "Joining as {} ({})",
            identity.display_name(),
            identity.id()
        );
        self.state = SessionState::Joining;
        let local_key = RecordKey::Player(identity.id());

        match self.establish(identity).await {
            Ok(events) => {
                self.state = SessionState::Joined;
                info!("Joined with {} other participant(s)", self.replicas().len());
                Ok(events)
            }
            Err(e) => {
                warn!("Join failed: {}", e);
                self.joined = None;
                self.feeds = Feeds::default();
                if let Err(cleanup) = self.backend.delete(local_key).await {
                    debug!("Could not remove presence of failed join: {}", cleanup);
                }
                self.state = SessionState::Disconnected;
                Err(SyncError::JoinFailed(Box::new(e)))
            }
        }
    }

    async fn establish(&mut self, identity: SessionIdentity) -> Result<Vec<SceneEvent>, SyncError> {
        let pose = Pose::spawn();
        let presence = ParticipantPresence {
            id: identity.id(),
            display_name: identity.display_name().to_string(),
            pose,
            room: SPAWN_ROOM.to_string(),
            last_updated: timestamp_ms(),
        };
        self.backend
            .upsert(Record::Player(PlayerRow::from_presence(&presence)))
            .await?;

        self.feeds.players = Some(self.backend.subscribe(Table::Players, EventFilter::All).await?);
        self.feeds.chat = Some(
            self.backend
                .subscribe(Table::ChatMessages, EventFilter::Insert)
                .await?,
        );
        self.feeds.game_state = Some(
            self.backend
                .subscribe(Table::GameState, EventFilter::Update)
                .await?,
        );

        self.joined = Some(Joined {
            presence: PresenceReplicator::new(identity.id(), self.config.publish_interval),
            flags: FlagReconciler::new(),
            chat: ChatRelay::new(identity.clone()),
            bubbles: BubbleBoard::new(self.config.bubble_lifetime),
            identity,
            local_pose: pose,
            exit_reached: false,
        });

        self.refresh_snapshot().await
    }

    /// Fetches every participant and the lock state, reconciling the caches.
    ///
    /// If our own row is gone (the server reaped a quiet connection) it is
    /// written again from the last known pose.
    async fn refresh_snapshot(&mut self) -> Result<Vec<SceneEvent>, SyncError> {
        let players = self.backend.select(Table::Players, None).await?;
        let game_state = self
            .backend
            .select(Table::GameState, Some(RecordKey::GameState(GAME_STATE_ID)))
            .await?;

        let local = self.joined.as_ref().ok_or(SyncError::NotJoined)?;
        let local_id = local.identity.id();
        let present = players
            .iter()
            .any(|record| matches!(record, Record::Player(row) if row.id == local_id));
        if !present {
            info!("Own presence missing from the store, writing it again");
            self.backend.upsert(Record::Player(local.local_row())).await?;
        }

        let joined = self.joined.as_mut().ok_or(SyncError::NotJoined)?;
        let snapshot: Vec<ParticipantPresence> = players
            .iter()
            .filter_map(|record| match record {
                Record::Player(row) => Some(row.to_presence()),
                _ => None,
            })
            .collect();

        let mut events = Vec::new();
        for change in joined.presence.seed(snapshot) {
            events.extend(Self::replica_events(&mut joined.bubbles, change));
        }
        for record in &game_state {
            if let Record::GameState(row) = record {
                events.extend(
                    joined
                        .flags
                        .apply_remote(&row.flags())
                        .into_iter()
                        .map(SceneEvent::LockOpened),
                );
            }
        }
        events.extend(self.check_exit());
        Ok(events)
    }

    /// Records the local pose and publishes it if the throttle allows.
    ///
    /// Returns `Ok(None)` when the publish was skipped for this window. The
    /// write runs in the background; a failure is logged and otherwise
    /// forgotten since the next window publishes again. An update that
    /// matches no row falls back to writing the full row.
    pub fn publish_local_pose(
        &mut self,
        pose: Pose,
        now: Instant,
    ) -> Result<Option<Pending>, SyncError> {
        let joined = self.joined.as_mut().ok_or(SyncError::NotJoined)?;
        joined.local_pose = pose;
        if !joined.presence.publish_due(now) {
            return Ok(None);
        }

        let patch = PlayerPatch::pose(&pose, timestamp_ms());
        let key = RecordKey::Player(joined.identity.id());
        let row = joined.local_row();
        let backend = Arc::clone(&self.backend);
        Ok(Some(tokio::spawn(async move {
            let result = match backend.update(Patch::Player(patch), key).await {
                Ok(rows) if rows.is_empty() => {
                    info!("Own presence missing from the store, writing it again");
                    backend.upsert(Record::Player(row)).await.map(|_| ())
                }
                other => other.map(|_| ()),
            };
            if let Err(e) = &result {
                warn!("Pose publish dropped: {}", e);
            }
            result
        })))
    }

    /// Fires [`SceneEvent::ExitReached`] the first time every lock is open
    /// while the local participant stands in the exit.
    pub fn check_exit(&mut self) -> Option<SceneEvent> {
        let joined = self.joined.as_mut()?;
        if joined.exit_reached {
            return None;
        }
        if exit_reachable(
            &joined.flags.flags(),
            &joined.local_pose.position,
            &self.exit,
        ) {
            info!("Exit reached");
            joined.exit_reached = true;
            return Some(SceneEvent::ExitReached);
        }
        None
    }

    /// Appends `text` to the local log right away, then inserts it.
    pub fn send_chat(&mut self, text: &str) -> Result<(ChatEntry, Pending), SyncError> {
        let joined = self.joined.as_mut().ok_or(SyncError::NotJoined)?;
        let row = joined.chat.send_local(text)?;
        let entry = joined
            .chat
            .entries()
            .last()
            .cloned()
            .ok_or(SyncError::EmptyMessage)?;

        let backend = Arc::clone(&self.backend);
        let handle = tokio::spawn(async move {
            let result = backend.insert(Record::ChatMessage(row)).await.map(|_| ());
            if let Err(e) = &result {
                warn!("Chat message dropped: {}", e);
            }
            result
        });
        Ok((entry, handle))
    }

    /// Sends the partial update for one lock. The merged flag only changes
    /// once the store notifies us back.
    pub fn request_unlock(&mut self, kind: LockKind) -> Result<Pending, SyncError> {
        let joined = self.joined.as_ref().ok_or(SyncError::NotJoined)?;
        let (patch, key) = joined.flags.request_unlock(kind);
        info!("Requesting unlock of {}", kind);

        let backend = Arc::clone(&self.backend);
        Ok(tokio::spawn(async move {
            let result = backend.update(patch, key).await.map(|_| ());
            if let Err(e) = &result {
                warn!("Unlock of {} dropped: {}", kind, e);
            }
            result
        }))
    }

    /// Applies one change notification to whichever cache owns its table.
    pub fn handle_change(&mut self, event: &ChangeEvent, now: Instant) -> Vec<SceneEvent> {
        let Some(joined) = self.joined.as_mut() else {
            return Vec::new();
        };

        let mut events = Vec::new();
        match event.table {
            Table::Players => {
                if let Some(change) = joined.presence.apply(event) {
                    events.extend(Self::replica_events(&mut joined.bubbles, change));
                }
            }
            Table::ChatMessages => {
                if event.event_type != EventType::Insert {
                    return events;
                }
                if let Some(Record::ChatMessage(row)) = &event.new {
                    if let Some(entry) = joined.chat.on_chat_notification(row) {
                        // Bubbles hang over an avatar; no avatar, log only
                        if joined.presence.contains(&entry.author_id) {
                            joined.bubbles.show(entry.author_id, &entry.text, now);
                            events.push(SceneEvent::BubbleShown {
                                author_id: entry.author_id,
                                text: entry.text.clone(),
                            });
                        }
                        events.push(SceneEvent::ChatAppended(entry));
                    }
                }
            }
            Table::GameState => {
                events.extend(
                    joined
                        .flags
                        .apply_event(event)
                        .into_iter()
                        .map(SceneEvent::LockOpened),
                );
                events.extend(self.check_exit());
            }
        }
        events
    }

    fn replica_events(bubbles: &mut BubbleBoard, change: ReplicaChange) -> Vec<SceneEvent> {
        match change {
            ReplicaChange::Spawned(presence) => vec![SceneEvent::AvatarSpawned(presence)],
            ReplicaChange::Moved(presence) => vec![SceneEvent::AvatarMoved(presence)],
            ReplicaChange::Removed(id) => {
                let mut events = Vec::new();
                if bubbles.clear(&id) {
                    events.push(SceneEvent::BubbleCleared(id));
                }
                events.push(SceneEvent::AvatarRemoved(id));
                events
            }
        }
    }

    /// Removes bubbles that have outlived their lifetime.
    pub fn expire_bubbles(&mut self, now: Instant) -> Vec<SceneEvent> {
        match self.joined.as_mut() {
            Some(joined) => joined
                .bubbles
                .expire(now)
                .into_iter()
                .map(SceneEvent::BubbleCleared)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Drains every notification already delivered, without waiting.
    ///
    /// Meant to be called once per frame by hosts that own their loop. Feeds
    /// found closed are dropped and picked up by [`Session::resubscribe`].
    pub fn poll(&mut self, now: Instant) -> Vec<SceneEvent> {
        let mut pending = Vec::new();
        for (table, slot) in [
            (Table::Players, &mut self.feeds.players),
            (Table::ChatMessages, &mut self.feeds.chat),
            (Table::GameState, &mut self.feeds.game_state),
        ] {
            let Some(feed) = slot.as_mut() else {
                continue;
            };
            let ended = loop {
                match feed.try_recv() {
                    Ok(event) => pending.push(event),
                    Err(TryRecvError::Empty) => break false,
                    Err(TryRecvError::Disconnected) => break true,
                }
            };
            if ended {
                warn!("Change feed for {} ended", table);
                *slot = None;
            }
        }

        let mut events = Vec::new();
        for event in &pending {
            events.extend(self.handle_change(event, now));
        }
        events.extend(self.expire_bubbles(now));
        events
    }

    /// Reopens every feed that has ended and refreshes the snapshot so that
    /// events missed in between are not lost.
    pub async fn resubscribe(&mut self) -> Result<Vec<SceneEvent>, SyncError> {
        if self.joined.is_none() {
            return Err(SyncError::NotJoined);
        }
        if self.feeds.all_open() {
            return Ok(Vec::new());
        }

        if self.feeds.players.is_none() {
            self.feeds.players = Some(self.backend.subscribe(Table::Players, EventFilter::All).await?);
            info!("Resubscribed to {}", Table::Players);
        }
        if self.feeds.chat.is_none() {
            self.feeds.chat = Some(
                self.backend
                    .subscribe(Table::ChatMessages, EventFilter::Insert)
                    .await?,
            );
            info!("Resubscribed to {}", Table::ChatMessages);
        }
        if self.feeds.game_state.is_none() {
            self.feeds.game_state = Some(
                self.backend
                    .subscribe(Table::GameState, EventFilter::Update)
                    .await?,
            );
            info!("Resubscribed to {}", Table::GameState);
        }

        self.refresh_snapshot().await
    }

    /// Deletes the local presence record once, best effort, and drops all
    /// local state. Publishes still in flight are left to finish on their own.
    pub async fn leave(&mut self) -> Result<Vec<SceneEvent>, SyncError> {
        let joined = self.joined.take().ok_or(SyncError::NotJoined)?;
        self.feeds = Feeds::default();
        self.state = SessionState::Disconnected;

        let id = joined.identity.id();
        if let Err(e) = self.backend.delete(RecordKey::Player(id)).await {
            warn!("Could not delete presence on leave: {}", e);
        }
        info!("Left as {}", joined.identity.display_name());

        let mut presence = joined.presence;
        Ok(presence
            .clear()
            .into_iter()
            .map(SceneEvent::AvatarRemoved)
            .collect())
    }

    /// Drives a joined session until a `Leave` signal arrives or the signal
    /// channel closes; either way the session leaves before returning.
    ///
    /// Scene events are sent to `scene`; a closed scene channel is ignored.
    pub async fn run(
        &mut self,
        signals: &mut mpsc::UnboundedReceiver<GameplaySignal>,
        scene: &mpsc::UnboundedSender<SceneEvent>,
    ) -> Result<(), SyncError> {
        if self.state != SessionState::Joined {
            return Err(SyncError::NotJoined);
        }

        let emit = |events: Vec<SceneEvent>| {
            for event in events {
                let _ = scene.send(event);
            }
        };

        let mut sweep = interval(self.config.bubble_sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut retry = interval(self.config.resubscribe_interval);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                signal = signals.recv() => {
                    let signal = match signal {
                        Some(GameplaySignal::Leave) | None => break,
                        Some(signal) => signal,
                    };
                    emit(self.handle_signal(signal));
                }

                event = next_event(&mut self.feeds.players) => {
                    match event {
                        Some(event) => emit(self.handle_change(&event, Instant::now())),
                        None => {
                            warn!("Change feed for {} ended", Table::Players);
                            self.feeds.players = None;
                        }
                    }
                }

                event = next_event(&mut self.feeds.chat) => {
                    match event {
                        Some(event) => emit(self.handle_change(&event, Instant::now())),
                        None => {
                            warn!("Change feed for {} ended", Table::ChatMessages);
                            self.feeds.chat = None;
                        }
                    }
                }

                event = next_event(&mut self.feeds.game_state) => {
                    match event {
                        Some(event) => emit(self.handle_change(&event, Instant::now())),
                        None => {
                            warn!("Change feed for {} ended", Table::GameState);
                            self.feeds.game_state = None;
                        }
                    }
                }

                _ = sweep.tick() => {
                    emit(self.expire_bubbles(Instant::now()));
                }

                _ = retry.tick() => {
                    if !self.feeds.all_open() {
                        match self.resubscribe().await {
                            Ok(events) => emit(events),
                            Err(e) => warn!("Resubscribe failed, retrying: {}", e),
                        }
                    }
                }
            }
        }

        emit(self.leave().await?);
        Ok(())
    }

    fn handle_signal(&mut self, signal: GameplaySignal) -> Vec<SceneEvent> {
        let mut events = Vec::new();
        match signal {
            GameplaySignal::Pose(pose) => {
                if let Err(e) = self.publish_local_pose(pose, Instant::now()) {
                    warn!("Pose not published: {}", e);
                }
                events.extend(self.check_exit());
            }
            GameplaySignal::UnlockRequested(kind) => match self.request_unlock(kind) {
                Ok(_) => events.push(SceneEvent::LockEngaged(kind)),
                Err(e) => warn!("Unlock of {} not sent: {}", kind, e),
            },
            GameplaySignal::ChatSubmitted(text) => match self.send_chat(&text) {
                Ok((entry, _)) => events.push(SceneEvent::ChatAppended(entry)),
                Err(e) if e.is_validation() => debug!("Chat not sent: {}", e),
                Err(e) => warn!("Chat not sent: {}", e),
            },
            GameplaySignal::SoundEmitted { position, radius } => {
                debug!("Sound at {:?} radius {}", position, radius);
                events.push(SceneEvent::SoundHeard { position, radius });
            }
            GameplaySignal::Leave => {}
        }
        events
    }
}

/// Next event from a feed slot; never resolves while the slot is empty.
async fn next_event(feed: &mut Option<Feed>) -> Option<ChangeEvent> {
    match feed {
        Some(feed) => feed.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_backend::LocalBackend;
    use shared::{ChatMessageRow, Vec3, EXIT_DOOR_CENTER};
    use std::time::Duration;

    fn session(backend: &LocalBackend) -> Session {
        Session::new(Arc::new(backend.clone()), SyncConfig::default())
    }

    fn remote_row(name: &str) -> PlayerRow {
        PlayerRow::from_presence(&ParticipantPresence {
            id: shared::ParticipantId::random(),
            display_name: name.to_string(),
            pose: Pose::spawn(),
            room: SPAWN_ROOM.to_string(),
            last_updated: 0,
        })
    }

    #[tokio::test]
    async fn test_blank_name_makes_no_backend_call() {
        let backend = LocalBackend::new();
        let mut session = session(&backend);

        assert_eq!(session.join("   ").await, Err(SyncError::EmptyDisplayName));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(backend.operation_count().await, 0);
    }

    #[tokio::test]
    async fn test_join_seeds_existing_participants() {
        let backend = LocalBackend::new();
        let other = remote_row("bob");
        backend
            .inject(shared::StoreOp::Upsert(Record::Player(other.clone())))
            .await
            .unwrap();

        let mut session = session(&backend);
        let events = session.join("ada").await.unwrap();

        assert_eq!(session.state(), SessionState::Joined);
        assert!(session.feeds_open());
        assert_eq!(session.replicas().len(), 1);
        assert!(events
            .iter()
            .any(|e| matches!(e, SceneEvent::AvatarSpawned(p) if p.id == other.id)));
        // upsert, three subscriptions, two snapshot selects
        assert_eq!(backend.operation_count().await, 6);
    }

    #[tokio::test]
    async fn test_failed_join_returns_to_disconnected() {
        let backend = LocalBackend::new();
        backend.set_offline(true).await;
        let mut session = session(&backend);

        let result = session.join("ada").await;
        assert!(matches!(result, Err(SyncError::JoinFailed(_))));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.identity().is_none());

        backend.set_offline(false).await;
        tokio_test::assert_ok!(session.join("ada").await);
        assert_eq!(session.state(), SessionState::Joined);
    }

    /// Store whose subscriptions always fail.
    struct NoFeeds(LocalBackend);

    #[async_trait::async_trait]
    impl Backend for NoFeeds {
        async fn execute(&self, op: shared::StoreOp) -> Result<Vec<Record>, SyncError> {
            self.0.execute(op).await
        }

        async fn subscribe(
            &self,
            _table: Table,
            _filter: EventFilter,
        ) -> Result<Feed, SyncError> {
            Err(SyncError::Timeout)
        }
    }

    #[tokio::test]
    async fn test_failed_join_removes_written_presence() {
        let store = LocalBackend::new();
        let mut session = Session::new(Arc::new(NoFeeds(store.clone())), SyncConfig::default());

        let result = session.join("ada").await;
        assert_eq!(
            result,
            Err(SyncError::JoinFailed(Box::new(SyncError::Timeout)))
        );
        assert_eq!(session.state(), SessionState::Disconnected);

        let players = store.select(Table::Players, None).await.unwrap();
        assert!(players.is_empty());
    }

    #[tokio::test]
    async fn test_second_join_is_refused() {
        let backend = LocalBackend::new();
        let mut session = session(&backend);
        session.join("ada").await.unwrap();

        assert_eq!(
            session.join("bob").await,
            Err(SyncError::AlreadyJoined("ada".to_string()))
        );
    }

    #[tokio::test]
    async fn test_publish_is_throttled() {
        let backend = LocalBackend::new();
        let mut session = session(&backend);
        session.join("ada").await.unwrap();
        let before = backend.operation_count().await;

        let start = Instant::now();
        let mut handles = Vec::new();
        for frame in 0..63u64 {
            let pose = Pose::new(Vec3::new(frame as f32, 5.0, 0.0), 0.0);
            let now = start + Duration::from_millis(frame * 16);
            if let Some(handle) = session.publish_local_pose(pose, now).unwrap() {
                handles.push(handle);
            }
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let published = backend.operation_count().await - before;
        assert!(published <= 10, "{} publishes in one second", published);
        assert!(published >= 1);
    }

    #[tokio::test]
    async fn test_publish_failure_is_reported_not_fatal() {
        let backend = LocalBackend::new();
        let mut session = session(&backend);
        session.join("ada").await.unwrap();
        backend.set_offline(true).await;

        let handle = session
            .publish_local_pose(Pose::spawn(), Instant::now())
            .unwrap()
            .unwrap();
        assert!(matches!(handle.await.unwrap(), Err(SyncError::Transport(_))));
        assert_eq!(session.state(), SessionState::Joined);
    }

    #[tokio::test]
    async fn test_publish_rewrites_removed_presence() {
        let backend = LocalBackend::new();
        let mut ada = session(&backend);
        let mut bob = session(&backend);
        ada.join("ada").await.unwrap();
        bob.join("bob").await.unwrap();
        let ada_id = ada.identity().unwrap().id();

        // The row vanishes behind ada's back, as when a server reaps her
        backend
            .inject(shared::StoreOp::Delete {
                key: RecordKey::Player(ada_id),
            })
            .await
            .unwrap();
        assert!(bob
            .poll(Instant::now())
            .contains(&SceneEvent::AvatarRemoved(ada_id)));

        let pose = Pose::new(Vec3::new(3.0, 5.0, 1.0), 0.5);
        ada.publish_local_pose(pose, Instant::now())
            .unwrap()
            .unwrap()
            .await
            .unwrap()
            .unwrap();

        let events = bob.poll(Instant::now());
        assert!(events.iter().any(|e| matches!(
            e,
            SceneEvent::AvatarSpawned(p) if p.id == ada_id && p.pose == pose && p.display_name == "ada"
        )));
        assert_eq!(ada.state(), SessionState::Joined);
    }

    #[tokio::test]
    async fn test_resubscribe_rewrites_removed_presence() {
        let backend = LocalBackend::new();
        let mut ada = session(&backend);
        let mut bob = session(&backend);
        ada.join("ada").await.unwrap();
        bob.join("bob").await.unwrap();
        let ada_id = ada.identity().unwrap().id();

        backend.close_feeds().await;
        backend
            .inject(shared::StoreOp::Delete {
                key: RecordKey::Player(ada_id),
            })
            .await
            .unwrap();
        ada.poll(Instant::now());
        bob.poll(Instant::now());

        tokio_test::assert_ok!(ada.resubscribe().await);
        tokio_test::assert_ok!(bob.resubscribe().await);
        assert!(bob.replicas().iter().any(|p| p.id == ada_id));

        let rows = backend
            .select(Table::Players, Some(RecordKey::Player(ada_id)))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_own_chat_appears_once() {
        let backend = LocalBackend::new();
        let mut session = session(&backend);
        session.join("ada").await.unwrap();

        let (entry, handle) = session.send_chat("hello").unwrap();
        assert!(!entry.is_confirmed());
        assert_eq!(session.chat_log().len(), 1);

        handle.await.unwrap().unwrap();
        let events = session.poll(Instant::now());

        assert!(events.is_empty());
        assert_eq!(session.chat_log().len(), 1);
        assert_eq!(session.bubble_count(), 0);
    }

    #[tokio::test]
    async fn test_blank_chat_is_rejected() {
        let backend = LocalBackend::new();
        let mut session = session(&backend);
        session.join("ada").await.unwrap();
        let before = backend.operation_count().await;

        assert!(matches!(session.send_chat("  "), Err(SyncError::EmptyMessage)));
        assert_eq!(backend.operation_count().await, before);
    }

    #[tokio::test]
    async fn test_remote_chat_replaces_bubble() {
        let backend = LocalBackend::new();
        let mut session = session(&backend);
        session.join("ada").await.unwrap();
        let bob = remote_row("bob");
        let author = bob.id;
        backend
            .inject(shared::StoreOp::Upsert(Record::Player(bob)))
            .await
            .unwrap();
        session.poll(Instant::now());

        for text in ["first", "second"] {
            backend
                .inject(shared::StoreOp::Insert(Record::ChatMessage(
                    ChatMessageRow::draft(author, "bob", text),
                )))
                .await
                .unwrap();
        }
        let now = Instant::now();
        let events = session.poll(now);

        let shown = events
            .iter()
            .filter(|e| matches!(e, SceneEvent::BubbleShown { .. }))
            .count();
        assert_eq!(shown, 2);
        assert_eq!(session.bubble_count(), 1);
        assert_eq!(session.chat_log().len(), 2);

        let expired = session.poll(now + Duration::from_secs(5));
        assert_eq!(expired, vec![SceneEvent::BubbleCleared(author)]);
    }

    #[tokio::test]
    async fn test_chat_without_avatar_is_logged_without_bubble() {
        let backend = LocalBackend::new();
        let mut session = session(&backend);
        session.join("ada").await.unwrap();

        backend
            .inject(shared::StoreOp::Insert(Record::ChatMessage(
                ChatMessageRow::draft(shared::ParticipantId::random(), "ghost", "boo"),
            )))
            .await
            .unwrap();
        let events = session.poll(Instant::now());

        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], SceneEvent::ChatAppended(entry) if entry.text == "boo"));
        assert_eq!(session.chat_log().len(), 1);
        assert_eq!(session.bubble_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_delete_removes_avatar_once() {
        let backend = LocalBackend::new();
        let mut session = session(&backend);
        session.join("ada").await.unwrap();

        let other = remote_row("bob");
        backend
            .inject(shared::StoreOp::Upsert(Record::Player(other.clone())))
            .await
            .unwrap();
        backend
            .inject(shared::StoreOp::Insert(Record::ChatMessage(
                ChatMessageRow::draft(other.id, "bob", "bye"),
            )))
            .await
            .unwrap();
        session.poll(Instant::now());
        assert_eq!(session.bubble_count(), 1);

        let delete = ChangeEvent {
            table: Table::Players,
            event_type: EventType::Delete,
            new: None,
            old: Some(Record::Player(other.clone())),
        };
        let first = session.handle_change(&delete, Instant::now());
        let second = session.handle_change(&delete, Instant::now());

        assert_eq!(
            first,
            vec![
                SceneEvent::BubbleCleared(other.id),
                SceneEvent::AvatarRemoved(other.id)
            ]
        );
        assert!(second.is_empty());
        assert!(session.replicas().is_empty());
    }

    #[tokio::test]
    async fn test_unlock_waits_for_round_trip() {
        let backend = LocalBackend::new();
        let mut ada = session(&backend);
        let mut bob = session(&backend);
        ada.join("ada").await.unwrap();
        bob.join("bob").await.unwrap();
        ada.poll(Instant::now());

        let handle = ada.request_unlock(LockKind::Key).unwrap();
        assert!(!ada.flags().key_unlocked);
        handle.await.unwrap().unwrap();

        assert_eq!(
            ada.poll(Instant::now()),
            vec![SceneEvent::LockOpened(LockKind::Key)]
        );
        assert!(bob
            .poll(Instant::now())
            .contains(&SceneEvent::LockOpened(LockKind::Key)));
        assert!(ada.flags().key_unlocked);
        assert!(bob.flags().key_unlocked);
    }

    #[tokio::test]
    async fn test_exit_needs_every_lock() {
        let backend = LocalBackend::new();
        let mut session = session(&backend);
        session.join("ada").await.unwrap();

        let at_door = Pose::new(Vec3::new(0.0, 1.6, EXIT_DOOR_CENTER.z), 0.0);
        session
            .publish_local_pose(at_door, Instant::now())
            .unwrap();

        for kind in [LockKind::Key, LockKind::Tool] {
            session.request_unlock(kind).unwrap().await.unwrap().unwrap();
        }
        let events = session.poll(Instant::now());
        assert!(!events.contains(&SceneEvent::ExitReached));
        assert_eq!(session.check_exit(), None);

        session
            .request_unlock(LockKind::Code)
            .unwrap()
            .await
            .unwrap()
            .unwrap();
        let events = session.poll(Instant::now());
        assert!(events.contains(&SceneEvent::ExitReached));
        assert_eq!(session.check_exit(), None);
    }

    #[tokio::test]
    async fn test_lost_feeds_are_resubscribed() {
        let backend = LocalBackend::new();
        let mut session = session(&backend);
        session.join("ada").await.unwrap();

        backend.close_feeds().await;
        session.poll(Instant::now());
        assert!(!session.feeds_open());

        // Someone joins while we are deaf
        let other = remote_row("bob");
        backend
            .inject(shared::StoreOp::Upsert(Record::Player(other.clone())))
            .await
            .unwrap();

        let events = session.resubscribe().await.unwrap();
        assert!(session.feeds_open());
        assert_eq!(backend.open_feed_count().await, 3);
        assert!(events
            .iter()
            .any(|e| matches!(e, SceneEvent::AvatarSpawned(p) if p.id == other.id)));
    }

    #[tokio::test]
    async fn test_leave_deletes_presence() {
        let backend = LocalBackend::new();
        let mut ada = session(&backend);
        let mut bob = session(&backend);
        ada.join("ada").await.unwrap();
        bob.join("bob").await.unwrap();
        ada.poll(Instant::now());
        let bob_id = bob.identity().unwrap().id();

        let removed = bob.leave().await.unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(bob.state(), SessionState::Disconnected);
        assert_eq!(bob.leave().await, Err(SyncError::NotJoined));

        let events = ada.poll(Instant::now());
        assert!(events.contains(&SceneEvent::AvatarRemoved(bob_id)));
        assert!(ada.replicas().is_empty());
    }

    #[tokio::test]
    async fn test_run_loop_until_leave() {
        let backend = LocalBackend::new();
        let mut session = session(&backend);
        session.join("ada").await.unwrap();

        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
        let (scene_tx, mut scene_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            let result = session.run(&mut signal_rx, &scene_tx).await;
            (session, result)
        });

        signal_tx
            .send(GameplaySignal::UnlockRequested(LockKind::Code))
            .unwrap();
        signal_tx
            .send(GameplaySignal::ChatSubmitted("hi".to_string()))
            .unwrap();

        assert_eq!(
            scene_rx.recv().await,
            Some(SceneEvent::LockEngaged(LockKind::Code))
        );
        let mut saw_open = false;
        let mut saw_chat = false;
        while !(saw_open && saw_chat) {
            match scene_rx.recv().await {
                Some(SceneEvent::LockOpened(LockKind::Code)) => saw_open = true,
                Some(SceneEvent::ChatAppended(entry)) => {
                    assert_eq!(entry.text, "hi");
                    saw_chat = true;
                }
                Some(_) => {}
                None => panic!("scene channel closed early"),
            }
        }

        signal_tx.send(GameplaySignal::Leave).unwrap();
        let (session, result) = task.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(session.state(), SessionState::Disconnected);
    }
}
