//! Relay-side fan-out to the other occupants of a room.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each connection gets an independent receiver that buffers up to
//! `channel_capacity` frames; frames carry their sender so connections can
//! skip their own echoes without decoding.
//!
//! Admission goes through [`RoomMembership`], so the relay enforces the same
//! capacity rule as the sessions. Each admission is tagged with a
//! [`ConnectionId`]; a participant that joins again from a new socket takes
//! over its membership, and the old socket can no longer remove it.
//!
//! A receiver that falls behind has lost frames for good, so
//! [`BroadcastGroup::recv`] ends its feed instead of skipping ahead.
//!
//! Reference: Patterson & Hennessy, Section 6.4: Interconnection Networks

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};

use crate::protocol::{ParticipantId, ParticipantInfo, ProtocolError, RoomId, SyncMessage};
use crate::room::{JoinOutcome, RoomError, RoomMembership};

/// An encoded message plus the participant it came from.
#[derive(Debug)]
pub struct Frame {
    pub sender: ParticipantId,
    pub bytes: Vec<u8>,
}

/// Identifies one admitted connection within a group.
pub type ConnectionId = u64;

/// A successful join.
pub struct Admission {
    pub connection: ConnectionId,
    pub receiver: broadcast::Receiver<Arc<Frame>>,
    /// Participants that were already present.
    pub others: Vec<ParticipantInfo>,
}

/// Why a connection's feed of room frames ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FeedError {
    /// The receiver fell behind and `0` frames were skipped.
    #[error("lagged by {0} frames")]
    Lagged(u64),
    #[error("room closed")]
    Closed,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Lock-free counters; read via [`BroadcastGroup::stats`].
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

struct Occupants {
    membership: RoomMembership,
    connections: HashMap<ParticipantId, ConnectionId>,
}

/// The broadcast group of a single room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Frame>>,
    occupants: RwLock<Occupants>,
    next_connection: AtomicU64,
    channel_capacity: usize,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    pub fn new(room_id: RoomId, room_capacity: usize, channel_capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(channel_capacity);
        Self {
            sender,
            occupants: RwLock::new(Occupants {
                membership: RoomMembership::new(room_id, room_capacity),
                connections: HashMap::new(),
            }),
            next_connection: AtomicU64::new(1),
            channel_capacity,
            atomic_stats: AtomicBroadcastStats::new(),
        }
    }

    /// Admit a participant on a new connection.
    ///
    /// A participant already present is re-admitted, and the new connection
    /// replaces the one it joined from before.
    pub async fn join(&self, info: ParticipantInfo) -> Result<Admission, RoomError> {
        let mut occupants = self.occupants.write().await;
        let id = info.participant_id;
        if occupants.membership.join(info)? == JoinOutcome::AlreadyMember {
            log::info!("{id} rejoined {} from a new connection", occupants.membership.room_id());
        }
        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
        occupants.connections.insert(id, connection);
        let others = occupants.membership.others(&id).cloned().collect();
        Ok(Admission {
            connection,
            receiver: self.sender.subscribe(),
            others,
        })
    }

    /// Remove a participant, unless it has since joined from another
    /// connection.
    pub async fn leave(&self, id: &ParticipantId, connection: ConnectionId) -> Option<ParticipantInfo> {
        let mut occupants = self.occupants.write().await;
        if occupants.connections.get(id) != Some(&connection) {
            return None;
        }
        occupants.connections.remove(id);
        occupants.membership.leave(id).ok()
    }

    /// Whether `connection` is still the one `id` is admitted through.
    pub async fn is_current(&self, id: &ParticipantId, connection: ConnectionId) -> bool {
        self.occupants.read().await.connections.get(id) == Some(&connection)
    }

    /// Next frame for a connection.
    ///
    /// Skipped frames are counted and end the feed: the connection has a gap
    /// it cannot fill and must start over.
    pub async fn recv(&self, rx: &mut broadcast::Receiver<Arc<Frame>>) -> Result<Arc<Frame>, FeedError> {
        match rx.recv().await {
            Ok(frame) => Ok(frame),
            Err(RecvError::Lagged(n)) => {
                self.record_dropped(n);
                Err(FeedError::Lagged(n))
            }
            Err(RecvError::Closed) => Err(FeedError::Closed),
        }
    }

    /// Encode and fan out a message to every subscriber.
    ///
    /// Returns the number of receivers; filtering the sender is the
    /// receiving connection's job.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let bytes = msg.encode()?;
        Ok(self.broadcast_raw(msg.sender, bytes))
    }

    /// Fan out an already-encoded message.
    pub fn broadcast_raw(&self, sender: ParticipantId, bytes: Vec<u8>) -> usize {
        let count = self.sender.send(Arc::new(Frame { sender, bytes })).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a lagging receiver skipped.
    pub fn record_dropped(&self, n: u64) {
        self.atomic_stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub async fn member_count(&self) -> usize {
        self.occupants.read().await.membership.len()
    }

    pub async fn members(&self) -> Vec<ParticipantInfo> {
        self.occupants.read().await.membership.members().to_vec()
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.member_count().await,
        }
    }

    pub fn channel_capacity(&self) -> usize {
        self.channel_capacity
    }
}

/// Maps room ids to broadcast groups.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<RoomId, Arc<BroadcastGroup>>>,
    room_capacity: usize,
    channel_capacity: usize,
}

impl RoomRegistry {
    pub fn new(room_capacity: usize, channel_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            room_capacity,
            channel_capacity,
        }
    }

    /// Get or create the group for `room_id`.
    pub async fn get_or_create(&self, room_id: &RoomId) -> Arc<BroadcastGroup> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(room_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(room_id) {
            return room.clone();
        }

        let room = Arc::new(BroadcastGroup::new(
            room_id.clone(),
            self.room_capacity,
            self.channel_capacity,
        ));
        rooms.insert(room_id.clone(), room.clone());
        room
    }

    /// Remove a room once its last participant is gone.
    pub async fn remove_if_empty(&self, room_id: &RoomId) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(room_id) {
            if room.member_count().await == 0 {
                rooms.remove(room_id);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<RoomId> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
