//! The seam between a [`RoomSession`](crate::session::RoomSession) and the
//! signaling channel.
//!
//! A transport only has to deliver outgoing [`SyncMessage`]s. Incoming
//! traffic reaches the session as [`SessionEvent::Inbound`] on the session's
//! own event channel, so every input is handled by one task in arrival order.
//!
//! Two implementations ship with the crate:
//! - [`SyncClient`](crate::client::SyncClient): WebSocket connection to a relay
//! - [`LocalRelay`]: in-process relay, for embedding and tests

use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::protocol::{
    MessageType, ParticipantId, ParticipantInfo, ProtocolError, RoomId, RoomMessage, SyncMessage,
};
use crate::room::{RoomError, RoomMembership};
use crate::session::SessionEvent;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("outgoing queue full")]
    QueueFull,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Outgoing half of a signaling connection.
///
/// `send` never blocks; implementations queue or drop rather than wait.
pub trait Transport: Send + Sync {
    fn send(&self, msg: SyncMessage) -> Result<(), TransportError>;
}

// ───────────────────────────────────────────────────────────────────
// In-process relay
// ───────────────────────────────────────────────────────────────────

struct LocalRoom {
    membership: RoomMembership,
    inboxes: HashMap<ParticipantId, mpsc::Sender<SessionEvent>>,
}

/// Relay that routes messages between sessions in the same process.
///
/// Applies the same admission rule as the network relay: a join beyond the
/// room capacity is answered with `RoomFull` and nothing else changes.
/// A member whose inbox is too full to take anything but a presence update
/// is disconnected, as the network relay does with a lagging socket.
#[derive(Clone)]
pub struct LocalRelay {
    rooms: Arc<Mutex<HashMap<RoomId, LocalRoom>>>,
    room_capacity: usize,
}

impl LocalRelay {
    pub fn new(room_capacity: usize) -> Self {
        Self {
            rooms: Arc::new(Mutex::new(HashMap::new())),
            room_capacity,
        }
    }

    /// A transport for `participant` whose inbound traffic goes to `inbox`.
    pub fn connect(&self, participant: ParticipantId, inbox: mpsc::Sender<SessionEvent>) -> LocalTransport {
        LocalTransport {
            relay: self.clone(),
            participant,
            inbox,
        }
    }

    /// Drop a participant's connection without a `Leave`, as a network
    /// failure would. The others are told it disconnected.
    pub fn disconnect(&self, room_id: &RoomId, participant: &ParticipantId) {
        let Ok(mut rooms) = self.rooms.lock() else {
            return;
        };
        let Some(room) = rooms.get_mut(room_id) else {
            return;
        };
        Self::drop_members(room_id, room, vec![*participant]);
        if room.membership.is_empty() {
            rooms.remove(room_id);
        }
    }

    pub fn member_count(&self, room_id: &RoomId) -> usize {
        self.rooms
            .lock()
            .map(|rooms| rooms.get(room_id).map_or(0, |r| r.membership.len()))
            .unwrap_or(0)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.lock().map(|rooms| rooms.len()).unwrap_or(0)
    }

    fn route(&self, from: ParticipantId, inbox: &mpsc::Sender<SessionEvent>, msg: SyncMessage) -> Result<(), TransportError> {
        let mut rooms = self.rooms.lock().map_err(|_| TransportError::Closed)?;
        let room_id = msg.room_id.clone();

        match msg.payload {
            RoomMessage::Join(ref info) => {
                let room = rooms.entry(room_id.clone()).or_insert_with(|| LocalRoom {
                    membership: RoomMembership::new(room_id.clone(), self.room_capacity),
                    inboxes: HashMap::new(),
                });
                let reply = match room.membership.join(info.clone()) {
                    Ok(_) => {
                        room.inboxes.insert(from, inbox.clone());
                        let others: Vec<ParticipantInfo> = room.membership.others(&from).cloned().collect();
                        Self::publish(&room_id, room, &msg);
                        RoomMessage::Members(others)
                    }
                    Err(RoomError::RoomFull { capacity, .. }) => {
                        if room.membership.is_empty() {
                            rooms.remove(&room_id);
                        }
                        RoomMessage::RoomFull { capacity }
                    }
                    Err(RoomError::NotAMember(_)) => return Ok(()),
                };
                Self::deliver(inbox, SyncMessage::from_relay(room_id, reply))
            }
            RoomMessage::Leave => {
                if let Some(room) = rooms.get_mut(&room_id) {
                    if room.membership.leave(&from).is_ok() {
                        room.inboxes.remove(&from);
                        Self::publish(&room_id, room, &msg);
                    }
                    if room.membership.is_empty() {
                        rooms.remove(&room_id);
                    }
                }
                Ok(())
            }
            RoomMessage::Ping => Self::deliver(inbox, SyncMessage::from_relay(room_id, RoomMessage::Pong)),
            _ => {
                match rooms.get_mut(&room_id) {
                    Some(room) if room.membership.contains(&from) => {
                        Self::publish(&room_id, room, &msg);
                        if room.membership.is_empty() {
                            rooms.remove(&room_id);
                        }
                    }
                    _ => debug!("local relay: dropping {:?} from non-member {from}", msg.kind()),
                }
                Ok(())
            }
        }
    }

    /// Fan out `msg`, then disconnect every member that could not take it.
    fn publish(room_id: &RoomId, room: &mut LocalRoom, msg: &SyncMessage) {
        let severed = Self::fan_out(room, msg);
        Self::drop_members(room_id, room, severed);
    }

    /// Remove members and tell the rest they disconnected.
    fn drop_members(room_id: &RoomId, room: &mut LocalRoom, mut ids: Vec<ParticipantId>) {
        while let Some(id) = ids.pop() {
            if room.membership.leave(&id).is_err() {
                continue;
            }
            if let Some(inbox) = room.inboxes.remove(&id) {
                Self::close(inbox);
            }
            let notice = SyncMessage::from_relay(room_id.clone(), RoomMessage::ParticipantDisconnected(id));
            ids.extend(Self::fan_out(room, &notice));
        }
    }

    /// Deliver to every member except the sender.
    ///
    /// Returns the members that missed a message other than a presence
    /// update; they have a gap they cannot recover from.
    fn fan_out(room: &LocalRoom, msg: &SyncMessage) -> Vec<ParticipantId> {
        let mut severed = Vec::new();
        for (id, inbox) in &room.inboxes {
            if *id == msg.sender {
                continue;
            }
            match inbox.try_send(SessionEvent::Inbound(msg.clone())) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) if msg.kind() == MessageType::Awareness => {
                    debug!("local relay: skipped awareness for {id}, inbox full");
                }
                Err(e) => {
                    warn!("local relay: disconnecting {id}, could not deliver {:?}: {e}", msg.kind());
                    severed.push(*id);
                }
            }
        }
        severed
    }

    /// Report the closed connection to a dropped member, waiting for room
    /// in its inbox when running inside a runtime.
    fn close(inbox: mpsc::Sender<SessionEvent>) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _ = inbox.send(SessionEvent::TransportClosed).await;
                });
            }
            Err(_) => {
                let _ = inbox.try_send(SessionEvent::TransportClosed);
            }
        }
    }

    fn deliver(inbox: &mpsc::Sender<SessionEvent>, msg: SyncMessage) -> Result<(), TransportError> {
        inbox.try_send(SessionEvent::Inbound(msg)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }
}

/// One participant's connection to a [`LocalRelay`].
pub struct LocalTransport {
    relay: LocalRelay,
    participant: ParticipantId,
    inbox: mpsc::Sender<SessionEvent>,
}

impl LocalTransport {
    pub fn participant(&self) -> ParticipantId {
        self.participant
    }
}

impl Transport for LocalTransport {
    fn send(&self, msg: SyncMessage) -> Result<(), TransportError> {
        self.relay.route(self.participant, &self.inbox, msg)
    }
}
