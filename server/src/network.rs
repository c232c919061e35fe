//! Server network layer handling UDP communications and store access

use crate::client_manager::{ClientManager, ReapedClient};
use log::{debug, error, info, warn};
use shared::{
    timestamp_ms, ChangeEvent, EventFilter, Packet, Record, RecordKey, Store, StoreOp, Table,
    MAX_DATAGRAM, PROTOCOL_VERSION, REJECT_NOT_CONNECTED, REJECT_SERVER_FULL,
    REJECT_VERSION_MISMATCH,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};

/// Tunables for a store server instance
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub max_clients: usize,
    /// Silence after which a client is dropped and its presence rows deleted
    pub idle_timeout: Duration,
    pub timeout_check_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            max_clients: 32,
            idle_timeout: Duration::from_secs(10),
            timeout_check_interval: Duration::from_secs(1),
        }
    }
}

/// Messages sent from network tasks to main server loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived { packet: Packet, addr: SocketAddr },
    ClientTimeout { reaped: ReapedClient },
    Shutdown,
}

/// Messages sent from the main loop to the sender task
#[derive(Debug)]
pub enum OutboundMessage {
    SendPacket { packet: Packet, addr: SocketAddr },
    Publish { event: ChangeEvent },
}

/// Store server: owns the tables and fans changes out to subscribers
pub struct Server {
    socket: Arc<UdpSocket>,
    clients: Arc<RwLock<ClientManager>>,
    store: Store,
    config: ServerConfig,

    // Communication channels
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    outbound_tx: mpsc::UnboundedSender<OutboundMessage>,
    outbound_rx: Option<mpsc::UnboundedReceiver<OutboundMessage>>,
}

impl Server {
    pub async fn new(config: ServerConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = Arc::new(UdpSocket::bind(&config.bind_addr).await?);
        info!("Store server listening on {}", socket.local_addr()?);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        Ok(Server {
            socket,
            clients: Arc::new(RwLock::new(ClientManager::new(
                config.max_clients,
                config.idle_timeout,
            ))),
            store: Store::new(),
            config,
            server_tx,
            server_rx,
            outbound_tx,
            outbound_rx: Some(outbound_rx),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Handle for stopping a running server from another task.
    pub fn shutdown_handle(&self) -> mpsc::UnboundedSender<ServerMessage> {
        self.server_tx.clone()
    }

    /// Spawns task that continuously listens for incoming packets
    fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_DATAGRAM];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => match Packet::decode(&buffer[..len]) {
                        Ok(packet) => {
                            if let Err(e) =
                                server_tx.send(ServerMessage::PacketReceived { packet, addr })
                            {
                                error!("Failed to send packet to main loop: {}", e);
                                break;
                            }
                        }
                        Err(e) => warn!("Failed to deserialize packet from {}: {}", addr, e),
                    },
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that processes the outgoing packet queue
    fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let clients = Arc::clone(&self.clients);
        let Some(mut outbound_rx) = self.outbound_rx.take() else {
            return;
        };

        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                match message {
                    OutboundMessage::SendPacket { packet, addr } => {
                        if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                            error!("Failed to send packet to {}: {}", addr, e);
                        }
                    }
                    OutboundMessage::Publish { event } => {
                        let subscribers = {
                            let clients_guard = clients.read().await;
                            clients_guard.subscribers_for(&event)
                        };

                        let packet = Packet::Change { event };
                        for (client_id, addr) in subscribers {
                            if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                                error!("Failed to send change to client {}: {}", client_id, e);
                            }
                        }
                    }
                }
            }
        });
    }

    /// Spawns task that reaps idle clients
    fn spawn_timeout_checker(&self) {
        let clients = Arc::clone(&self.clients);
        let server_tx = self.server_tx.clone();
        let check_interval = self.config.timeout_check_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(check_interval);

            loop {
                interval.tick().await;

                let reaped = {
                    let mut clients_guard = clients.write().await;
                    clients_guard.check_timeouts()
                };

                for reaped in reaped {
                    if let Err(e) = server_tx.send(ServerMessage::ClientTimeout { reaped }) {
                        error!("Failed to send timeout message: {}", e);
                        return;
                    }
                }
            }
        });
    }

    async fn send_packet_impl(
        socket: &UdpSocket,
        packet: &Packet,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let data = packet.encode()?;
        socket.send_to(&data, addr).await?;
        Ok(())
    }

    fn send_packet(&self, packet: Packet, addr: SocketAddr) {
        if let Err(e) = self
            .outbound_tx
            .send(OutboundMessage::SendPacket { packet, addr })
        {
            error!("Failed to queue packet for sending: {}", e);
        }
    }

    fn publish(&self, events: Vec<ChangeEvent>) {
        for event in events {
            debug!("{} {:?}", event.table, event.event_type);
            if let Err(e) = self.outbound_tx.send(OutboundMessage::Publish { event }) {
                error!("Failed to queue change event: {}", e);
            }
        }
    }

    async fn connected_client(&self, addr: SocketAddr) -> Option<u32> {
        let mut clients = self.clients.write().await;
        let client_id = clients.find_client_by_addr(addr)?;
        clients.touch(client_id);
        Some(client_id)
    }

    /// Processes incoming packets and applies store operations
    async fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        match packet {
            Packet::Hello { client_version } => {
                info!(
                    "Client connecting from {} (version: {})",
                    addr, client_version
                );

                if client_version != PROTOCOL_VERSION {
                    self.send_packet(
                        Packet::Rejected {
                            reason: REJECT_VERSION_MISMATCH.to_string(),
                        },
                        addr,
                    );
                    return;
                }

                let client_id = match self.connected_client(addr).await {
                    Some(existing) => Some(existing),
                    None => {
                        let mut clients = self.clients.write().await;
                        clients.add_client(addr)
                    }
                };

                match client_id {
                    Some(connection_id) => {
                        self.send_packet(Packet::Welcome { connection_id }, addr)
                    }
                    None => self.send_packet(
                        Packet::Rejected {
                            reason: REJECT_SERVER_FULL.to_string(),
                        },
                        addr,
                    ),
                }
            }

            Packet::Request { request_id, op } => {
                let Some(client_id) = self.connected_client(addr).await else {
                    self.reject_unknown(addr);
                    return;
                };

                let result = self.execute(client_id, op).await;
                self.send_packet(Packet::Reply { request_id, result }, addr);
            }

            Packet::Subscribe {
                request_id,
                table,
                filter,
            } => {
                let Some(client_id) = self.connected_client(addr).await else {
                    self.reject_unknown(addr);
                    return;
                };

                self.subscribe(client_id, table, filter).await;
                self.send_packet(
                    Packet::Reply {
                        request_id,
                        result: Ok(Vec::new()),
                    },
                    addr,
                );
            }

            Packet::Heartbeat => {
                if self.connected_client(addr).await.is_none() {
                    self.reject_unknown(addr);
                }
            }

            Packet::Goodbye => {
                let client_id = {
                    let clients = self.clients.read().await;
                    clients.find_client_by_addr(addr)
                };

                if let Some(client_id) = client_id {
                    let mut clients = self.clients.write().await;
                    clients.remove_client(&client_id);
                }
            }

            _ => {
                warn!("Unexpected packet type from client at {}", addr);
            }
        }
    }

    fn reject_unknown(&self, addr: SocketAddr) {
        debug!("Rejecting packet from unknown client {}", addr);
        self.send_packet(
            Packet::Rejected {
                reason: REJECT_NOT_CONNECTED.to_string(),
            },
            addr,
        );
    }

    async fn subscribe(&self, client_id: u32, table: Table, filter: EventFilter) {
        let mut clients = self.clients.write().await;
        clients.subscribe(client_id, table, filter);
    }

    /// Runs one store operation on behalf of a client.
    async fn execute(&mut self, client_id: u32, op: StoreOp) -> Result<Vec<Record>, String> {
        let op_name = op.name();
        let table = op.table();

        match self.store.execute(op.clone(), timestamp_ms()) {
            Ok(applied) => {
                {
                    let mut clients = self.clients.write().await;
                    if let Some(client) = clients.get_mut(client_id) {
                        client.record_ownership(&op);
                    }
                }
                self.publish(applied.events);
                Ok(applied.rows)
            }
            Err(e) => {
                warn!(
                    "Client {} {} on {} failed: {}",
                    client_id, op_name, table, e
                );
                Err(e.to_string())
            }
        }
    }

    /// Deletes presence rows left behind by a client that went silent.
    fn reap(&mut self, reaped: ReapedClient) {
        info!(
            "Client {} timed out, removing {} presence rows",
            reaped.id,
            reaped.owned_players.len()
        );

        for id in reaped.owned_players {
            let op = StoreOp::Delete {
                key: RecordKey::Player(id),
            };
            match self.store.execute(op, timestamp_ms()) {
                Ok(applied) => self.publish(applied.events),
                Err(e) => warn!("Failed to remove presence {}: {}", id, e),
            }
        }
    }

    /// Main server loop coordinating all operations
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        // Initialize concurrent tasks
        self.spawn_network_receiver();
        self.spawn_network_sender();
        self.spawn_timeout_checker();

        info!("Store server started successfully");

        while let Some(message) = self.server_rx.recv().await {
            match message {
                ServerMessage::PacketReceived { packet, addr } => {
                    self.handle_packet(packet, addr).await;
                }
                ServerMessage::ClientTimeout { reaped } => {
                    self.reap(reaped);
                }
                ServerMessage::Shutdown => {
                    info!("Store server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}
