//! WebSocket signaling client for connecting a session to the relay.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect)
//! - A [`Transport`] implementation that never blocks the session
//! - Inbound frames decoded and fed to the session's event channel
//!
//! The client carries no room semantics of its own: the session sends its
//! `Join` as the first frame after [`SyncClient::connect`] returns, and
//! again after every reconnect.
//!
//! Reference: Kleppmann, Chapter 5: Replication

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ParticipantId, RoomId, SyncMessage};
use crate::session::SessionEvent;
use crate::transport::{Transport, TransportError};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

struct Shared {
    state: ConnectionState,
    /// Bumped on every connect so a stale reader cannot tear down a newer
    /// connection.
    epoch: u64,
    outgoing: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

/// The signaling client.
///
/// Messages sent while disconnected are rejected with
/// [`TransportError::Closed`]; a rejoining session resynchronises from the
/// room's state instead of replaying them.
pub struct SyncClient {
    participant_id: ParticipantId,
    room_id: RoomId,
    server_url: String,
    shared: Arc<Mutex<Shared>>,
    /// Session inbox that inbound traffic is delivered to
    inbox: mpsc::Sender<SessionEvent>,
}

impl SyncClient {
    pub fn new(
        participant_id: ParticipantId,
        room_id: RoomId,
        server_url: impl Into<String>,
        inbox: mpsc::Sender<SessionEvent>,
    ) -> Self {
        Self {
            participant_id,
            room_id,
            server_url: server_url.into(),
            shared: Arc::new(Mutex::new(Shared {
                state: ConnectionState::Disconnected,
                epoch: 0,
                outgoing: None,
            })),
            inbox,
        }
    }

    /// Connect to the relay.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&self) -> Result<(), TransportError> {
        self.set_state(ConnectionState::Connecting);

        let url = format!("{}/{}", self.server_url, self.room_id);
        let ws_stream = match tokio_tungstenite::connect_async(&url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                warn!("connect to {url} failed: {e}");
                self.set_state(ConnectionState::Disconnected);
                return Err(TransportError::Closed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let epoch = {
            let mut shared = self.shared.lock().map_err(|_| TransportError::Closed)?;
            shared.epoch += 1;
            shared.state = ConnectionState::Connected;
            shared.outgoing = Some(out_tx);
            shared.epoch
        };
        info!("connected to {url}");

        // Reader task: decode frames and hand them to the session
        let inbox = self.inbox.clone();
        let shared = self.shared.clone();
        let own_id = self.participant_id;
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match SyncMessage::decode(&data) {
                        Ok(sync_msg) => {
                            // Skip our own messages
                            if sync_msg.sender == own_id {
                                continue;
                            }
                            if inbox.send(SessionEvent::Inbound(sync_msg)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("dropping undecodable frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            let current = match shared.lock() {
                Ok(mut shared) if shared.epoch == epoch => {
                    shared.state = ConnectionState::Disconnected;
                    shared.outgoing = None;
                    true
                }
                _ => false,
            };
            if current {
                debug!("connection epoch {epoch} closed");
                let _ = inbox.send(SessionEvent::TransportClosed).await;
            }
        });

        Ok(())
    }

    /// Close the connection. The session sees a `TransportClosed` event.
    pub fn disconnect(&self) {
        if let Ok(mut shared) = self.shared.lock() {
            // Dropping the sender ends the writer task, which closes the socket.
            shared.outgoing = None;
        }
    }

    /// Send a protocol-level ping; the relay answers with a `Pong`.
    pub fn ping(&self) -> Result<(), TransportError> {
        self.send(SyncMessage::ping(self.room_id.clone(), self.participant_id))
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared
            .lock()
            .map(|shared| shared.state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn participant_id(&self) -> ParticipantId {
        self.participant_id
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    fn set_state(&self, state: ConnectionState) {
        if let Ok(mut shared) = self.shared.lock() {
            shared.state = state;
        }
    }
}

impl Transport for SyncClient {
    fn send(&self, msg: SyncMessage) -> Result<(), TransportError> {
        let encoded = msg.encode()?;
        let shared = self.shared.lock().map_err(|_| TransportError::Closed)?;
        match &shared.outgoing {
            Some(tx) => tx.send(encoded).map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn client() -> (SyncClient, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(16);
        let client = SyncClient::new(Uuid::new_v4(), RoomId::new("room"), "ws://127.0.0.1:9", tx);
        (client, rx)
    }

    #[test]
    fn test_client_creation() {
        let (client, _rx) = client();
        assert_eq!(client.room_id().as_str(), "room");
        assert_eq!(client.server_url(), "ws://127.0.0.1:9");
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_send_while_disconnected_fails() {
        let (client, _rx) = client();
        let msg = SyncMessage::ping(RoomId::new("room"), client.participant_id());
        assert_eq!(client.send(msg), Err(TransportError::Closed));
        assert_eq!(client.ping(), Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let (client, _rx) = client();
        assert_eq!(client.connect().await, Err(TransportError::Closed));
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    }
}
