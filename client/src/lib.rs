//! # Co-op Sync Client Library
//!
//! This library keeps a small group of players in one shared world: where
//! everyone stands, what they said, and which locks on the exit door have been
//! opened. It sits between the gameplay layer (movement, items, locks) and a
//! store server that persists rows and pushes change notifications.
//!
//! ## Architecture Overview
//!
//! All shared state lives in three store tables. Every client writes its own
//! rows and mirrors everyone else's from change feeds. Nothing is polled; the
//! only periodic traffic is the local pose, throttled to one write per
//! publish interval.
//!
//! ### Local First
//! Local actions show up locally before the store confirms them. A chat line
//! is appended as soon as it is sent, and a lock the player just used reports
//! [`signals::SceneEvent::LockEngaged`] right away. The matching notifications
//! that come back are recognised by participant id and not applied twice.
//!
//! ### Monotonic Locks
//! Lock flags only ever go from closed to open. Flag updates are OR-merged,
//! so duplicated, reordered or replayed notifications all converge to the
//! same state.
//!
//! ### Single Owner
//! One [`session::Session`] owns the replica cache, the chat log, the bubbles
//! and the merged flags. Network notifications and gameplay signals both reach
//! it as messages, so nothing is mutated from two places at once.
//!
//! ## Module Organization
//!
//! ### Session (`session`)
//! Join and leave, the initial snapshot, and the event loop that ties
//! everything below together.
//!
//! ### Replication (`presence`, `flags`, `chat`)
//! - Throttled pose publishing and the remote replica cache
//! - OR-merge of the shared lock flags
//! - Chat log with echo suppression and expiring speech bubbles
//!
//! ### Store Access (`backend`, `network`, `local_backend`)
//! The [`backend::Backend`] trait and its two implementations: UDP to a
//! store server, and an in-process store for tests and single-machine play.
//!
//! ### Gameplay Seams (`signals`, `entities`)
//! Typed messages in and out of a session, plus the item and lock registry
//! with the player's inventory.
//!
//! ## Usage Example
//!
//! ```no_run
//! use client::{Session, SyncConfig, UdpBackend};
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//!
//! # async fn demo() -> Result<(), client::SyncError> {
//! let config = SyncConfig::default();
//! let backend = UdpBackend::connect("127.0.0.1:8080", &config, 0).await?;
//! let mut session = Session::new(Arc::new(backend), config);
//! session.join("ada").await?;
//!
//! let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
//! let (scene_tx, mut scene_rx) = mpsc::unbounded_channel();
//! tokio::spawn(async move { session.run(&mut signal_rx, &scene_tx).await });
//!
//! signal_tx.send(client::GameplaySignal::ChatSubmitted("hello".into())).ok();
//! while let Some(event) = scene_rx.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod chat;
pub mod config;
pub mod entities;
pub mod error;
pub mod flags;
pub mod identity;
pub mod local_backend;
pub mod network;
pub mod presence;
pub mod session;
pub mod signals;

pub use backend::{Backend, Feed};
pub use config::SyncConfig;
pub use error::SyncError;
pub use identity::SessionIdentity;
pub use local_backend::LocalBackend;
pub use network::UdpBackend;
pub use session::{Session, SessionState};
pub use signals::{GameplaySignal, SceneEvent};
