//! Room membership state machine and the language-switch reseed policy.
//!
//! ```text
//! Empty ──join──► Occupied(1) ──join──► Occupied(2) ──join──► RoomFull (rejected)
//!   ▲                 │                     │
//!   └──────leave──────┘◄────────leave───────┘
//! ```
//!
//! The same state machine runs in the relay (authoritative admission) and in
//! every session (local view of who is present).

use log::info;

use crate::protocol::{ParticipantId, ParticipantInfo, RoomId};

/// Default number of participants in a pair-programming room.
pub const DEFAULT_ROOM_CAPACITY: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occupancy {
    Empty,
    Occupied(usize),
}

impl Occupancy {
    fn of(count: usize) -> Self {
        match count {
            0 => Occupancy::Empty,
            n => Occupancy::Occupied(n),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomError {
    #[error("room {room_id} is full ({capacity} participants)")]
    RoomFull { room_id: RoomId, capacity: usize },
    #[error("participant {0} is not in the room")]
    NotAMember(ParticipantId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined(Occupancy),
    /// The participant was already present; its info was refreshed.
    AlreadyMember,
}

/// Participants of one room, in join order.
#[derive(Debug, Clone)]
pub struct RoomMembership {
    room_id: RoomId,
    capacity: usize,
    members: Vec<ParticipantInfo>,
}

impl RoomMembership {
    pub fn new(room_id: RoomId, capacity: usize) -> Self {
        Self {
            room_id,
            capacity,
            members: Vec::with_capacity(capacity),
        }
    }

    /// Admit a participant. A join beyond capacity is rejected and leaves
    /// the existing members untouched.
    pub fn join(&mut self, info: ParticipantInfo) -> Result<JoinOutcome, RoomError> {
        if let Some(existing) = self
            .members
            .iter_mut()
            .find(|m| m.participant_id == info.participant_id)
        {
            *existing = info;
            return Ok(JoinOutcome::AlreadyMember);
        }
        if self.members.len() >= self.capacity {
            info!(
                "room {}: rejected {} ({} of {} seats taken)",
                self.room_id,
                info.participant_id,
                self.members.len(),
                self.capacity
            );
            return Err(RoomError::RoomFull {
                room_id: self.room_id.clone(),
                capacity: self.capacity,
            });
        }

        info!("room {}: {} ({}) joined", self.room_id, info.name, info.participant_id);
        self.members.push(info);
        Ok(JoinOutcome::Joined(self.occupancy()))
    }

    pub fn leave(&mut self, id: &ParticipantId) -> Result<ParticipantInfo, RoomError> {
        let idx = self
            .members
            .iter()
            .position(|m| m.participant_id == *id)
            .ok_or(RoomError::NotAMember(*id))?;
        let info = self.members.remove(idx);
        info!("room {}: {} left", self.room_id, id);
        Ok(info)
    }

    pub fn occupancy(&self) -> Occupancy {
        Occupancy::of(self.members.len())
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn members(&self) -> &[ParticipantInfo] {
        &self.members
    }

    pub fn member_ids(&self) -> Vec<ParticipantId> {
        self.members.iter().map(|m| m.participant_id).collect()
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.members.iter().any(|m| m.participant_id == *id)
    }

    /// Everyone except `id`.
    pub fn others<'a>(&'a self, id: &'a ParticipantId) -> impl Iterator<Item = &'a ParticipantInfo> + 'a {
        self.members.iter().filter(move |m| m.participant_id != *id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn clear(&mut self) {
        self.members.clear();
    }
}

/// Whether a language switch may replace the buffer with the new starter code.
///
/// True when the buffer, ignoring trailing whitespace, is exactly the
/// previous language's starter code, or holds fewer than `min_len`
/// non-whitespace characters. Anything else is user work and is kept.
pub fn reseed_on_language_switch(buffer: &str, previous_starter: Option<&str>, min_len: usize) -> bool {
    let content = buffer.chars().filter(|c| !c.is_whitespace()).count();
    if content < min_len {
        return true;
    }
    previous_starter.is_some_and(|starter| buffer.trim_end() == starter.trim_end())
}
