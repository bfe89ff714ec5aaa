//! WebSocket signaling relay with room-scoped fan-out.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌──► Client A (filtered: own frames)
//!             ├── Room (room_id) ── BroadcastGroup
//! Client B ──┘        │             └──► Client B
//!                     │
//!              RoomMembership (capacity 2)
//!                     │
//!         third Join ─┴─► RoomFull, connection closed
//! ```
//!
//! The relay holds no document state. It admits participants, forwards
//! every room message to the other occupants unchanged, answers pings, and
//! announces `ParticipantDisconnected` when a socket drops or goes silent
//! past the liveness timeout.
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapter 8

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio::time::{Duration, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::{Admission, BroadcastGroup, ConnectionId, FeedError, Frame, RoomRegistry};
use crate::protocol::{ParticipantId, ProtocolError, RoomId, RoomMessage, SyncMessage};
use crate::room::{RoomError, DEFAULT_ROOM_CAPACITY};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum participants per room
    pub room_capacity: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// WebSocket ping interval in seconds
    pub heartbeat_interval_secs: u64,
    /// A connection silent for this long is dropped
    pub liveness_timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            room_capacity: DEFAULT_ROOM_CAPACITY,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
            liveness_timeout_secs: 90,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub rejected_joins: u64,
}

type WsReader = SplitStream<WebSocketStream<TcpStream>>;

/// Where a relayed connection belongs.
struct Link<'a> {
    group: &'a BroadcastGroup,
    room_id: &'a RoomId,
    pid: ParticipantId,
    connection: ConnectionId,
}
type ConnectionResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// The signaling relay.
pub struct SyncServer {
    config: RelayConfig,
    registry: Arc<RoomRegistry>,
    stats: Arc<RwLock<RelayStats>>,
}

impl SyncServer {
    pub fn new(config: RelayConfig) -> Self {
        let registry = Arc::new(RoomRegistry::new(config.room_capacity, config.broadcast_capacity));
        Self {
            config,
            registry,
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the relay event loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!(
            "Relay listening on {} (rooms of {})",
            self.config.bind_addr,
            self.config.room_capacity
        );

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, registry, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<RoomRegistry>,
        stats: Arc<RwLock<RelayStats>>,
        config: RelayConfig,
    ) -> ConnectionResult {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let liveness = Duration::from_secs(config.liveness_timeout_secs.max(1));
        let first = tokio::time::timeout(liveness, Self::read_join(&mut ws_receiver)).await;
        let result = match first {
            Ok(Some((join, bytes))) => {
                Self::serve(&mut ws_sender, &mut ws_receiver, join, bytes, addr, &registry, &stats, &config).await
            }
            Ok(None) => {
                log::debug!("Connection from {addr} closed before joining");
                Ok(())
            }
            Err(_) => {
                log::info!("Connection from {addr} sent no join within {liveness:?}");
                Ok(())
            }
        };

        let _ = ws_sender.close().await;
        {
            let mut s = stats.write().await;
            s.active_connections -= 1;
            s.active_rooms = registry.room_count().await;
        }
        result
    }

    /// Wait for the first message, which must be a join.
    async fn read_join(receiver: &mut WsReader) -> Option<(SyncMessage, Vec<u8>)> {
        while let Some(frame) = receiver.next().await {
            match frame {
                Ok(Message::Binary(data)) => {
                    let bytes: Vec<u8> = data.into();
                    return match SyncMessage::decode(&bytes) {
                        Ok(msg) if matches!(msg.payload, RoomMessage::Join(_)) => Some((msg, bytes)),
                        Ok(msg) => {
                            log::warn!("Expected Join as first message, got {:?}", msg.kind());
                            None
                        }
                        Err(e) => {
                            log::warn!("Failed to decode first message: {e}");
                            None
                        }
                    };
                }
                Ok(Message::Close(_)) | Err(_) => return None,
                _ => {}
            }
        }
        None
    }

    /// Admit the participant and relay its traffic until it leaves.
    #[allow(clippy::too_many_arguments)]
    async fn serve(
        ws_sender: &mut futures_util::stream::SplitSink<WebSocketStream<TcpStream>, Message>,
        ws_receiver: &mut WsReader,
        join: SyncMessage,
        join_bytes: Vec<u8>,
        addr: SocketAddr,
        registry: &RoomRegistry,
        stats: &RwLock<RelayStats>,
        config: &RelayConfig,
    ) -> ConnectionResult {
        let RoomMessage::Join(info) = join.payload else {
            return Ok(());
        };
        let room_id = join.room_id;
        let pid = info.participant_id;
        let name = info.name.clone();

        let group = registry.get_or_create(&room_id).await;
        let Admission {
            connection,
            receiver: mut rx,
            others,
        } = match group.join(info).await {
            Ok(admission) => admission,
            Err(RoomError::RoomFull { capacity, .. }) => {
                stats.write().await.rejected_joins += 1;
                log::info!("Rejected {name} ({pid}) from full room {room_id}");
                let reply = SyncMessage::from_relay(room_id.clone(), RoomMessage::RoomFull { capacity });
                ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                registry.remove_if_empty(&room_id).await;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let reply = SyncMessage::from_relay(room_id.clone(), RoomMessage::Members(others));
        let admitted = match reply.encode() {
            Ok(bytes) => ws_sender.send(Message::Binary(bytes.into())).await.is_ok(),
            Err(e) => {
                log::error!("Failed to encode member list: {e}");
                false
            }
        };
        if admitted {
            group.broadcast_raw(pid, join_bytes);
            log::info!("Participant {name} ({pid}) joined room {room_id} from {addr}");
        }

        let graceful = if admitted {
            let link = Link {
                group: &group,
                room_id: &room_id,
                pid,
                connection,
            };
            Self::relay(ws_sender, ws_receiver, &mut rx, link, stats, config).await
        } else {
            false
        };

        // Cleanup: remove participant from room, unless a newer connection
        // has taken its place.
        let removed = group.leave(&pid, connection).await.is_some();
        if removed && !graceful {
            let notice = SyncMessage::from_relay(room_id.clone(), RoomMessage::ParticipantDisconnected(pid));
            if let Err(e) = group.broadcast(&notice) {
                log::error!("Failed to announce disconnect of {pid}: {e}");
            }
        }
        if registry.remove_if_empty(&room_id).await {
            log::info!("Room {room_id} removed (empty)");
        }
        log::info!("Participant {name} ({pid}) left room {room_id}");
        Ok(())
    }

    /// Forward frames both ways. Returns whether the participant sent `Leave`.
    async fn relay(
        ws_sender: &mut futures_util::stream::SplitSink<WebSocketStream<TcpStream>, Message>,
        ws_receiver: &mut WsReader,
        rx: &mut broadcast::Receiver<Arc<Frame>>,
        link: Link<'_>,
        stats: &RwLock<RelayStats>,
        config: &RelayConfig,
    ) -> bool {
        let Link {
            group,
            room_id,
            pid,
            connection,
        } = link;
        let liveness = Duration::from_secs(config.liveness_timeout_secs.max(1));
        let heartbeat = Duration::from_secs(config.heartbeat_interval_secs.max(1));
        let mut heartbeat_timer = tokio::time::interval_at(Instant::now() + heartbeat, heartbeat);
        let deadline = tokio::time::sleep(liveness);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                // Incoming WebSocket message
                frame = ws_receiver.next() => {
                    match frame {
                        Some(Ok(Message::Binary(data))) => {
                            deadline.as_mut().reset(Instant::now() + liveness);
                            let bytes: Vec<u8> = data.into();
                            let msg = match SyncMessage::decode(&bytes) {
                                Ok(msg) => msg,
                                Err(e) => {
                                    log::warn!("Failed to decode message from {pid}: {e}");
                                    continue;
                                }
                            };
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }
                            if msg.sender != pid || msg.room_id != *room_id {
                                log::warn!("Dropping message from {pid} claiming {} in {}", msg.sender, msg.room_id);
                                continue;
                            }
                            if !group.is_current(&pid, connection).await {
                                log::info!("Closing superseded connection of {pid}");
                                return false;
                            }

                            match msg.payload {
                                RoomMessage::Ping => {
                                    if Self::send_msg(ws_sender, &SyncMessage::from_relay(room_id.clone(), RoomMessage::Pong))
                                        .await
                                        .is_err()
                                    {
                                        return false;
                                    }
                                }
                                RoomMessage::Leave => {
                                    group.broadcast_raw(pid, bytes);
                                    return true;
                                }
                                RoomMessage::Join(_) => {
                                    // Repeated join on a live connection: resend the member list.
                                    let others = group
                                        .members()
                                        .await
                                        .into_iter()
                                        .filter(|m| m.participant_id != pid)
                                        .collect();
                                    let reply = SyncMessage::from_relay(room_id.clone(), RoomMessage::Members(others));
                                    if Self::send_msg(ws_sender, &reply).await.is_err() {
                                        return false;
                                    }
                                }
                                RoomMessage::Members(_)
                                | RoomMessage::RoomFull { .. }
                                | RoomMessage::ParticipantDisconnected(_)
                                | RoomMessage::Pong => {
                                    log::debug!("Ignoring {:?} from {pid}", msg.kind());
                                }
                                _ => {
                                    group.broadcast_raw(pid, bytes);
                                }
                            }
                        }

                        Some(Ok(Message::Ping(data))) => {
                            deadline.as_mut().reset(Instant::now() + liveness);
                            if ws_sender.send(Message::Pong(data)).await.is_err() {
                                return false;
                            }
                        }

                        Some(Ok(Message::Pong(_))) => {
                            deadline.as_mut().reset(Instant::now() + liveness);
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed by {pid}");
                            return false;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {pid}: {e}");
                            return false;
                        }

                        _ => {}
                    }
                }

                // Outgoing broadcast frame
                frame = group.recv(rx) => {
                    match frame {
                        Ok(frame) => {
                            // Don't echo back to sender
                            if frame.sender == pid {
                                continue;
                            }
                            if ws_sender.send(Message::Binary(frame.bytes.clone().into())).await.is_err() {
                                return false;
                            }
                        }
                        // The client rejoins and is sent the room state again.
                        Err(FeedError::Lagged(n)) => {
                            log::warn!("Participant {pid} lagged by {n} messages, dropping");
                            return false;
                        }
                        Err(FeedError::Closed) => return false,
                    }
                }

                _ = heartbeat_timer.tick() => {
                    if !group.is_current(&pid, connection).await {
                        log::info!("Closing superseded connection of {pid}");
                        return false;
                    }
                    if ws_sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        return false;
                    }
                }

                _ = &mut deadline => {
                    log::info!("Participant {pid} silent for {liveness:?}, dropping");
                    return false;
                }
            }
        }
    }

    async fn send_msg(
        ws_sender: &mut futures_util::stream::SplitSink<WebSocketStream<TcpStream>, Message>,
        msg: &SyncMessage,
    ) -> Result<(), ProtocolError> {
        let encoded = msg.encode()?;
        ws_sender
            .send(Message::Binary(encoded.into()))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Get relay statistics.
    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }
}
