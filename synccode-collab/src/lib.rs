//! # synccode-collab: Pair-programming rooms for SyncCode
//!
//! Two participants share a code buffer, see each other's cursors, and talk
//! over a peer-to-peer call. A relay forwards room traffic; it holds no
//! document state of its own.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │     Binary Proto    │ (relay)     │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌───────────────┐
//! │ RoomSession │                     │ BroadcastGroup│
//! │  Document   │                     │ (fan-out)     │
//! │  Awareness  │                     └───────────────┘
//! │  PeerCall   │
//! └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol (bincode-encoded SyncMessage)
//! - [`room`]: Membership and capacity of a single room
//! - [`awareness`]: Per-participant name, color and cursor
//! - [`cursor`]: Remote cursors projected onto the local buffer
//! - [`call`]: Media acquisition and peer-call negotiation
//! - [`question`]: Where question templates are fetched from
//! - [`session`]: One participant's room session, driving all of the above
//! - [`transport`]: Transport seam plus an in-process relay
//! - [`broadcast`]: Room-based fan-out with backpressure
//! - [`server`]: WebSocket relay server
//! - [`client`]: WebSocket signaling client

pub mod awareness;
pub mod broadcast;
pub mod call;
pub mod client;
pub mod cursor;
pub mod protocol;
pub mod question;
pub mod room;
pub mod server;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use awareness::{AwarenessField, AwarenessState, AwarenessTracker, CursorColor, RemoteUpdate};
pub use broadcast::{
    Admission, BroadcastGroup, BroadcastStats, ConnectionId, FeedError, Frame, RoomRegistry,
};
pub use call::{
    CallAction, CallError, CallEvent, CallState, LocalMedia, MediaConstraints, MediaDevices,
    MediaError, MediaTrack, PeerCallManager, PeerConnector, PeerLink, TrackKind,
};
pub use client::{ConnectionState, SyncClient};
pub use cursor::{CursorDecoration, CursorProjection};
pub use protocol::{
    CallSignal, LanguageStamp, MessageType, ParticipantId, ParticipantInfo, ProtocolError, RoomId,
    RoomMessage, SessionDescription, SyncMessage, RELAY_ID,
};
pub use question::{QuestionSource, StaticQuestionSource};
pub use room::{JoinOutcome, Occupancy, RoomError, RoomMembership, DEFAULT_ROOM_CAPACITY};
pub use server::{RelayConfig, RelayStats, SyncServer};
pub use session::{
    LanguageSwitch, LocalCommand, RoomNotification, RoomSession, SessionConfig, SessionError,
    SessionEvent, SessionStatus,
};
pub use transport::{LocalRelay, LocalTransport, Transport, TransportError};
