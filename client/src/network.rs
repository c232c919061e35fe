//! UDP transport to a store server
//!
//! Requests carry a client-chosen id and are completed when the matching
//! `Reply` arrives. `Change` packets are routed to whichever local feeds
//! accept them. A background task keeps the connection alive with
//! heartbeats; if the server forgets us (idle reap, restart) it answers with
//! `Rejected`, every feed is ended so owners resubscribe, and a fresh
//! `Hello` is sent, at most once per heartbeat period. Any other rejection
//! refuses the registration itself and closes the backend for good.

use crate::backend::{fan_out, Backend, Feed, FeedSender};
use crate::config::SyncConfig;
use crate::error::SyncError;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use shared::{
    EventFilter, Packet, Record, StoreOp, Table, MAX_DATAGRAM, PROTOCOL_VERSION,
    REJECT_NOT_CONNECTED,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout};

type ReplySender = oneshot::Sender<Result<Vec<Record>, String>>;

pub struct UdpBackend {
    socket: Arc<UdpSocket>,
    server_addr: SocketAddr,
    connection_id: Arc<AtomicU32>,
    closed: Arc<AtomicBool>,
    next_request_id: AtomicU32,
    next_feed_id: AtomicU64,
    pending: Arc<Mutex<HashMap<u32, ReplySender>>>,
    feeds: Arc<Mutex<Vec<FeedSender>>>,
    request_timeout: Duration,
    fake_ping_ms: u64,
    tasks: Vec<JoinHandle<()>>,
}

impl UdpBackend {
    /// Binds a local socket and completes the Hello/Welcome handshake.
    pub async fn connect(
        server_addr: &str,
        config: &SyncConfig,
        fake_ping_ms: u64,
    ) -> Result<Self, SyncError> {
        let server_addr: SocketAddr = server_addr
            .parse()
            .map_err(|e| SyncError::Transport(format!("bad server address: {}", e)))?;
        let bind_addr = if server_addr.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);

        info!("Connecting to store at {}...", server_addr);
        let connection_id =
            timeout(config.request_timeout, Self::handshake(&socket, server_addr))
                .await
                .map_err(|_| SyncError::Timeout)??;
        info!("Connected! Connection ID: {}", connection_id);

        let mut backend = UdpBackend {
            socket,
            server_addr,
            connection_id: Arc::new(AtomicU32::new(connection_id)),
            closed: Arc::new(AtomicBool::new(false)),
            next_request_id: AtomicU32::new(1),
            next_feed_id: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
            feeds: Arc::new(Mutex::new(Vec::new())),
            request_timeout: config.request_timeout,
            fake_ping_ms,
            tasks: Vec::new(),
        };

        let receiver = backend.spawn_receiver(config.heartbeat_interval);
        let heartbeat = backend.spawn_heartbeat(config.heartbeat_interval);
        backend.tasks = vec![receiver, heartbeat];

        Ok(backend)
    }

    pub fn connection_id(&self) -> u32 {
        self.connection_id.load(Ordering::SeqCst)
    }

    /// True once the store has refused to register us.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn handshake(socket: &UdpSocket, server_addr: SocketAddr) -> Result<u32, SyncError> {
        let hello = Packet::Hello {
            client_version: PROTOCOL_VERSION,
        };
        socket.send_to(&hello.encode()?, server_addr).await?;

        let mut buffer = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, from) = socket.recv_from(&mut buffer).await?;
            if from != server_addr {
                continue;
            }
            match Packet::decode(&buffer[..len]) {
                Ok(Packet::Welcome { connection_id }) => return Ok(connection_id),
                Ok(Packet::Rejected { reason }) => return Err(SyncError::Store(reason)),
                Ok(other) => debug!("Ignoring {:?} during handshake", other),
                Err(e) => warn!("Failed to deserialize packet: {}", e),
            }
        }
    }

    async fn send_packet(&self, packet: &Packet) -> Result<(), SyncError> {
        if self.fake_ping_ms > 0 {
            sleep(Duration::from_millis(self.fake_ping_ms / 2)).await;
        }

        let data = packet.encode()?;
        self.socket.send_to(&data, self.server_addr).await?;
        Ok(())
    }

    /// Sends a packet carrying `request_id` and waits for its reply.
    async fn round_trip(&self, request_id: u32, packet: Packet) -> Result<Vec<Record>, SyncError> {
        if self.is_closed() {
            return Err(SyncError::Closed);
        }
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id, tx);
        // The receiver may have closed us between the check and the insert.
        if self.is_closed() {
            self.pending.lock().await.remove(&request_id);
            return Err(SyncError::Closed);
        }

        if let Err(e) = self.send_packet(&packet).await {
            self.pending.lock().await.remove(&request_id);
            return Err(e);
        }

        match timeout(self.request_timeout, rx).await {
            Ok(Ok(Ok(rows))) => Ok(rows),
            Ok(Ok(Err(reason))) => Err(SyncError::Store(reason)),
            Ok(Err(_)) => Err(SyncError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                Err(SyncError::Timeout)
            }
        }
    }

    fn next_request_id(&self) -> u32 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Spawns task that routes replies and change events
    fn spawn_receiver(&self, rehello_interval: Duration) -> JoinHandle<()> {
        let socket = Arc::clone(&self.socket);
        let pending = Arc::clone(&self.pending);
        let feeds = Arc::clone(&self.feeds);
        let connection_id = Arc::clone(&self.connection_id);
        let closed = Arc::clone(&self.closed);
        let server_addr = self.server_addr;
        let fake_ping_ms = self.fake_ping_ms;

        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_DATAGRAM];
            let mut last_hello: Option<Instant> = None;

            loop {
                let (len, from) = match socket.recv_from(&mut buffer).await {
                    Ok(received) => received,
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        sleep(Duration::from_millis(10)).await;
                        continue;
                    }
                };
                if from != server_addr {
                    continue;
                }

                let packet = match Packet::decode(&buffer[..len]) {
                    Ok(packet) => packet,
                    Err(e) => {
                        warn!("Failed to deserialize packet from store: {}", e);
                        continue;
                    }
                };

                if fake_ping_ms > 0 {
                    sleep(Duration::from_millis(fake_ping_ms / 2)).await;
                }

                match packet {
                    Packet::Reply { request_id, result } => {
                        if let Some(tx) = pending.lock().await.remove(&request_id) {
                            let _ = tx.send(result);
                        }
                    }
                    Packet::Change { event } => {
                        let mut feeds = feeds.lock().await;
                        fan_out(&mut feeds, &event);
                    }
                    Packet::Rejected { reason } if reason == REJECT_NOT_CONNECTED => {
                        warn!("Store rejected us: {}", reason);
                        feeds.lock().await.clear();
                        for (_, tx) in pending.lock().await.drain() {
                            let _ = tx.send(Err(reason.clone()));
                        }

                        // Every request in flight earns a rejection; one Hello answers them all.
                        if last_hello.is_some_and(|sent| sent.elapsed() < rehello_interval) {
                            debug!("Hello already sent, not re-registering yet");
                            continue;
                        }
                        last_hello = Some(Instant::now());

                        let hello = Packet::Hello {
                            client_version: PROTOCOL_VERSION,
                        };
                        match hello.encode() {
                            Ok(data) => {
                                if let Err(e) = socket.send_to(&data, server_addr).await {
                                    error!("Failed to re-register with store: {}", e);
                                }
                            }
                            Err(e) => error!("Failed to encode hello: {}", e),
                        }
                    }
                    Packet::Rejected { reason } => {
                        error!("Store refused registration: {}", reason);
                        closed.store(true, Ordering::SeqCst);
                        feeds.lock().await.clear();
                        // Dropped senders fail every waiting request with `Closed`.
                        pending.lock().await.clear();
                        break;
                    }
                    Packet::Welcome { connection_id: id } => {
                        info!("Re-registered with store as connection {}", id);
                        connection_id.store(id, Ordering::SeqCst);
                    }
                    _ => {
                        warn!("Unexpected packet type from store");
                    }
                }
            }
        })
    }

    /// Spawns task that keeps the connection from being reaped
    fn spawn_heartbeat(&self, period: Duration) -> JoinHandle<()> {
        let socket = Arc::clone(&self.socket);
        let closed = Arc::clone(&self.closed);
        let server_addr = self.server_addr;

        tokio::spawn(async move {
            let mut ticker = interval(period);
            let data = match Packet::Heartbeat.encode() {
                Ok(data) => data,
                Err(e) => {
                    error!("Failed to encode heartbeat: {}", e);
                    return;
                }
            };

            loop {
                ticker.tick().await;
                if closed.load(Ordering::SeqCst) {
                    debug!("Backend closed, stopping heartbeat");
                    return;
                }
                if let Err(e) = socket.send_to(&data, server_addr).await {
                    warn!("Heartbeat failed: {}", e);
                }
            }
        })
    }
}

#[async_trait]
impl Backend for UdpBackend {
    async fn execute(&self, op: StoreOp) -> Result<Vec<Record>, SyncError> {
        let request_id = self.next_request_id();
        self.round_trip(request_id, Packet::Request { request_id, op })
            .await
    }

    async fn subscribe(&self, table: Table, filter: EventFilter) -> Result<Feed, SyncError> {
        // Register first so events racing the reply are not lost.
        let (tx, rx) = mpsc::unbounded_channel();
        let feed_id = self.next_feed_id.fetch_add(1, Ordering::Relaxed);
        self.feeds.lock().await.push(FeedSender {
            id: feed_id,
            table,
            filter,
            tx,
        });

        let request_id = self.next_request_id();
        let packet = Packet::Subscribe {
            request_id,
            table,
            filter,
        };
        match self.round_trip(request_id, packet).await {
            Ok(_) => {
                debug!("Subscribed to {} ({:?})", table, filter);
                Ok(rx)
            }
            Err(e) => {
                self.feeds.lock().await.retain(|feed| feed.id != feed_id);
                Err(e)
            }
        }
    }

    async fn close(&self) {
        if let Err(e) = self.send_packet(&Packet::Goodbye).await {
            warn!("Failed to say goodbye to store: {}", e);
        }
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for UdpBackend {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
