//! Binary protocol for room-scoped synchronization.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────────────────────────┐
//! │ room_id  │ sender    │ payload (RoomMessage)        │
//! │ string   │ 16 bytes  │ tag + variant fields         │
//! └──────────┴───────────┴──────────────────────────────┘
//! ```
//!
//! One envelope carries every message kind: document operations,
//! acknowledgements, awareness, question/language changes, call signaling
//! and relay control. Receivers dispatch on the payload variant in a single
//! handler loop.
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapter 4

use serde::{Deserialize, Serialize};
use synccode_core::{
    DocumentState, Generation, Language, Operation, QuestionTemplate, VersionVector,
};
use uuid::Uuid;

use crate::awareness::{AwarenessState, CursorColor};

/// Identity of a participant. Also used as the participant's replica id.
pub type ParticipantId = Uuid;

/// Sender id used by the relay for control messages it originates.
pub const RELAY_ID: ParticipantId = Uuid::nil();

/// Room identity, as chosen by whoever opened the room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoomId(pub String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Participant identity with display metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParticipantInfo {
    pub participant_id: ParticipantId,
    pub name: String,
    /// Stable cursor color derived from the participant id.
    pub color: CursorColor,
}

impl ParticipantInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    /// Create with explicit participant_id (for testing)
    pub fn with_id(participant_id: ParticipantId, name: impl Into<String>) -> Self {
        Self {
            participant_id,
            name: name.into(),
            color: CursorColor::from_uuid(participant_id),
        }
    }
}

/// Orders question assignments and language changes.
///
/// Compared by generation, then a Lamport clock, then author, so every
/// participant picks the same winner when two changes cross.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct LanguageStamp {
    /// Document generation the change was made in.
    pub generation: Generation,
    pub clock: u64,
    pub author: ParticipantId,
}

impl LanguageStamp {
    /// The stamp `author` issues for its next change in `generation`.
    pub fn successor(&self, generation: Generation, author: ParticipantId) -> Self {
        Self {
            generation,
            clock: self.clock + 1,
            author,
        }
    }
}

/// Opaque media session description exchanged during call setup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription(pub String);

/// Call signaling, keyed by participant pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallSignal {
    Offer {
        to: ParticipantId,
        description: SessionDescription,
    },
    Answer {
        to: ParticipantId,
        description: SessionDescription,
    },
    /// Sender has left the call and released its resources.
    Hangup,
}

/// Message kinds, for logging and stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    Join = 1,
    Members = 2,
    Leave = 3,
    RoomFull = 4,
    ParticipantDisconnected = 5,
    DocumentOp = 6,
    Ack = 7,
    Awareness = 8,
    QuestionAssigned = 9,
    LanguageChanged = 10,
    SyncState = 11,
    Call = 12,
    Ping = 13,
    Pong = 14,
}

/// Payload of a room message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RoomMessage {
    /// Sender asks to join the room (first message on a connection).
    Join(ParticipantInfo),
    /// Relay reply to an accepted join: everyone already in the room.
    Members(Vec<ParticipantInfo>),
    /// Sender is leaving the room.
    Leave,
    /// Relay reply to a rejected join.
    RoomFull { capacity: usize },
    /// Relay notice that a participant's connection dropped.
    ParticipantDisconnected(ParticipantId),
    DocumentOp(Operation),
    /// Version of the document the sender has applied.
    Ack {
        generation: Generation,
        version: VersionVector,
    },
    Awareness(AwarenessState),
    QuestionAssigned {
        template: QuestionTemplate,
        language: Language,
        reset: Operation,
        stamp: LanguageStamp,
    },
    LanguageChanged {
        language: Language,
        /// Present when the buffer was reseeded with the new starter code.
        reset: Option<Operation>,
        stamp: LanguageStamp,
    },
    /// Full room state, for a participant that just joined or came back.
    SyncState {
        question: Option<QuestionTemplate>,
        language: Language,
        stamp: LanguageStamp,
        document: DocumentState,
    },
    Call(CallSignal),
    Ping,
    Pong,
}

impl RoomMessage {
    pub fn kind(&self) -> MessageType {
        match self {
            RoomMessage::Join(_) => MessageType::Join,
            RoomMessage::Members(_) => MessageType::Members,
            RoomMessage::Leave => MessageType::Leave,
            RoomMessage::RoomFull { .. } => MessageType::RoomFull,
            RoomMessage::ParticipantDisconnected(_) => MessageType::ParticipantDisconnected,
            RoomMessage::DocumentOp(_) => MessageType::DocumentOp,
            RoomMessage::Ack { .. } => MessageType::Ack,
            RoomMessage::Awareness(_) => MessageType::Awareness,
            RoomMessage::QuestionAssigned { .. } => MessageType::QuestionAssigned,
            RoomMessage::LanguageChanged { .. } => MessageType::LanguageChanged,
            RoomMessage::SyncState { .. } => MessageType::SyncState,
            RoomMessage::Call(_) => MessageType::Call,
            RoomMessage::Ping => MessageType::Ping,
            RoomMessage::Pong => MessageType::Pong,
        }
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub room_id: RoomId,
    pub sender: ParticipantId,
    pub payload: RoomMessage,
}

impl SyncMessage {
    pub fn new(room_id: RoomId, sender: ParticipantId, payload: RoomMessage) -> Self {
        Self {
            room_id,
            sender,
            payload,
        }
    }

    /// Create a join request for `info`.
    pub fn join(room_id: RoomId, info: ParticipantInfo) -> Self {
        Self::new(room_id, info.participant_id, RoomMessage::Join(info))
    }

    /// Create a relay control message.
    pub fn from_relay(room_id: RoomId, payload: RoomMessage) -> Self {
        Self::new(room_id, RELAY_ID, payload)
    }

    pub fn ping(room_id: RoomId, sender: ParticipantId) -> Self {
        Self::new(room_id, sender, RoomMessage::Ping)
    }

    pub fn pong(room_id: RoomId, sender: ParticipantId) -> Self {
        Self::new(room_id, sender, RoomMessage::Pong)
    }

    pub fn kind(&self) -> MessageType {
        self.payload.kind()
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Connection closed")]
    ConnectionClosed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use synccode_core::Document;

    fn room() -> RoomId {
        RoomId::new("room-1")
    }

    #[test]
    fn test_document_op_roundtrip() {
        let peer = Uuid::new_v4();
        let mut doc = Document::new(peer);
        let op = doc.insert(0, "def f():").unwrap();

        let msg = SyncMessage::new(room(), peer, RoomMessage::DocumentOp(op.clone()));
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.kind(), MessageType::DocumentOp);
        assert_eq!(decoded.sender, peer);
        assert_eq!(decoded.room_id, room());
        assert_eq!(decoded.payload, RoomMessage::DocumentOp(op));
    }

    #[test]
    fn test_sync_state_roundtrip_preserves_tombstones() {
        let peer = Uuid::new_v4();
        let mut doc = Document::with_text(peer, "hello");
        doc.delete(0..2).unwrap();
        let template = QuestionTemplate::new("q1", "Echo").with_starter(Language::Java, "class A {}", "");

        let msg = SyncMessage::new(
            room(),
            peer,
            RoomMessage::SyncState {
                question: Some(template.clone()),
                language: Language::Java,
                stamp: LanguageStamp::default(),
                document: doc.state(),
            },
        );
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        match decoded.payload {
            RoomMessage::SyncState {
                question,
                language,
                document,
                ..
            } => {
                assert_eq!(question, Some(template));
                assert_eq!(language, Language::Java);
                assert_eq!(document.elements.len(), 5);
                assert_eq!(document, doc.state());
            }
            other => panic!("Expected SyncState, got {other:?}"),
        }
    }

    #[test]
    fn test_join_carries_participant_info() {
        let info = ParticipantInfo::new("Alice");
        let msg = SyncMessage::join(room(), info.clone());
        assert_eq!(msg.sender, info.participant_id);

        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.payload, RoomMessage::Join(info));
    }

    #[test]
    fn test_relay_messages_use_nil_sender() {
        let msg = SyncMessage::from_relay(room(), RoomMessage::RoomFull { capacity: 2 });
        assert_eq!(msg.sender, RELAY_ID);
        assert_eq!(msg.kind(), MessageType::RoomFull);
    }

    #[test]
    fn test_call_signal_roundtrip() {
        let to = Uuid::new_v4();
        let msg = SyncMessage::new(
            room(),
            Uuid::new_v4(),
            RoomMessage::Call(CallSignal::Offer {
                to,
                description: SessionDescription("v=0".into()),
            }),
        );
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.payload, msg.payload);
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(matches!(
            SyncMessage::decode(&garbage),
            Err(ProtocolError::DeserializationError(_))
        ));
    }

    #[test]
    fn test_participant_color_is_stable() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let a = ParticipantInfo::with_id(id, "Test");
        let b = ParticipantInfo::with_id(id, "Other");
        assert_eq!(a.color, b.color);
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::Join as u8, 1);
        assert_eq!(MessageType::DocumentOp as u8, 6);
        assert_eq!(MessageType::Pong as u8, 14);
    }
}
