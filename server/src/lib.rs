//! # Store Server Library
//!
//! This library provides the backend store that co-op clients synchronize
//! through. It holds the shared tables, applies client operations, and pushes
//! change notifications to every subscribed client.
//!
//! ## Core Responsibilities
//!
//! ### Table Storage
//! The server owns the `players`, `chat_messages` and `game_state` tables.
//! All mutation rules live in [`shared::Store`]; the server only decides who
//! may call it and who hears about the result.
//!
//! ### Change Feeds
//! Clients subscribe per table with an event filter (insert, update, delete
//! or all). Every successful mutation is turned into change events and sent
//! to each matching subscriber. Delivery is best effort: a lost datagram is
//! not retransmitted, and clients are expected to tolerate gaps.
//!
//! ### Connection Health
//! Clients heartbeat while connected. A client that goes quiet past the idle
//! timeout is dropped, and the presence rows it wrote are deleted so that
//! other participants stop seeing a frozen avatar.
//!
//! ## Architecture Design
//!
//! ### Single Owner for the Tables
//! The main loop is the only task that touches the store. Network receive,
//! network send and timeout checking run as separate tasks and talk to the
//! main loop over channels, so table mutation is serialized without locks.
//!
//! ### UDP-Based Communication
//! Requests and replies are correlated by a client-chosen request id. Change
//! events are pushed unsolicited. Everything is bincode-encoded
//! [`shared::Packet`] datagrams.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::network::{Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut server = Server::new(ServerConfig {
//!         bind_addr: "127.0.0.1:8080".to_string(),
//!         ..ServerConfig::default()
//!     })
//!     .await?;
//!
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod client_manager;
pub mod network;
