//! Presence tracking: who is in the room and where their cursor is.
//!
//! ## Architecture
//!
//! ```text
//! Local cursor move
//!       │
//!       ▼
//! AwarenessTracker::set_local()
//!       │  (cursor rate-limited: 33ms; name/color immediate)
//!       ▼
//! RoomMessage::Awareness(AwarenessState)
//!       │
//!       ▼   (transport, no ordering guarantee)
//! Remote AwarenessTracker::on_remote_update()
//!       │  (last-write-wins by sender clock, stale peers evicted)
//!       ▼
//! CursorProjection::refresh()
//! ```
//!
//! Awareness is ephemeral and never blocks document operations. A peer is
//! considered gone once nothing has been heard from it for the liveness
//! timeout.
//!
//! Reference: Kleppmann, Chapter 8: Broadcast Protocols

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::protocol::{ParticipantId, ParticipantInfo};

// ───────────────────────────────────────────────────────────────────
// Colors
// ───────────────────────────────────────────────────────────────────

/// RGBA color for cursor rendering.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Generate a stable, visually distinct color from a UUID.
    ///
    /// Uses HSL color space with high saturation for vivid cursors.
    pub fn from_uuid(id: Uuid) -> Self {
        let hue = ((id.as_u128() % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    pub fn rgba(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    /// `#rrggbb` form for editors that take CSS colors.
    pub fn to_hex(&self) -> String {
        let channel = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!(
            "#{:02x}{:02x}{:02x}",
            channel(self.r),
            channel(self.g),
            channel(self.b)
        )
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        Self { r: 0.26, g: 0.52, b: 0.96, a: 1.0 }
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// State
// ───────────────────────────────────────────────────────────────────

/// Ephemeral presence record for one participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessState {
    pub participant_id: ParticipantId,
    pub display_name: String,
    pub color: CursorColor,
    /// Cursor position as a character offset into the buffer.
    pub cursor_offset: usize,
    /// Sender-local counter; higher wins.
    pub clock: u64,
}

impl AwarenessState {
    /// Initial state for a participant, before any update is heard.
    pub fn for_participant(info: &ParticipantInfo) -> Self {
        Self {
            participant_id: info.participant_id,
            display_name: info.name.clone(),
            color: info.color,
            cursor_offset: 0,
            clock: 0,
        }
    }
}

/// A single field of the local awareness state.
#[derive(Debug, Clone, PartialEq)]
pub enum AwarenessField {
    DisplayName(String),
    Color(CursorColor),
    CursorOffset(usize),
}

/// What a remote update changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteUpdate {
    /// The sender was not tracked before.
    pub registered: bool,
    /// The tracked state was replaced.
    pub applied: bool,
    /// Participants evicted for missing their liveness deadline.
    pub evicted: Vec<ParticipantId>,
}

#[derive(Debug, Clone)]
struct RemotePeer {
    state: AwarenessState,
    last_seen: Instant,
}

/// Local awareness plus the last known state of every remote participant.
pub struct AwarenessTracker {
    local: AwarenessState,
    /// A throttled cursor update is waiting to be sent.
    cursor_pending: bool,
    last_cursor_broadcast: Option<Instant>,
    cursor_broadcast_interval: Duration,
    liveness_timeout: Duration,
    peers: HashMap<ParticipantId, RemotePeer>,
}

impl AwarenessTracker {
    pub fn new(local: &ParticipantInfo) -> Self {
        Self {
            local: AwarenessState::for_participant(local),
            cursor_pending: false,
            last_cursor_broadcast: None,
            cursor_broadcast_interval: Duration::from_millis(33),
            liveness_timeout: Duration::from_secs(30),
            peers: HashMap::new(),
        }
    }

    /// Override the cursor rate limit and liveness timeout.
    pub fn with_timing(mut self, cursor_broadcast_interval: Duration, liveness_timeout: Duration) -> Self {
        self.cursor_broadcast_interval = cursor_broadcast_interval;
        self.liveness_timeout = liveness_timeout;
        self
    }

    pub fn local(&self) -> &AwarenessState {
        &self.local
    }

    /// Update one local field.
    ///
    /// Returns the state to broadcast, or `None` when a cursor move falls
    /// inside the rate-limit window. A throttled move is sent later by
    /// [`flush`](Self::flush).
    pub fn set_local(&mut self, field: AwarenessField, now: Instant) -> Option<AwarenessState> {
        self.local.clock += 1;
        match field {
            AwarenessField::DisplayName(name) => self.local.display_name = name,
            AwarenessField::Color(color) => self.local.color = color,
            AwarenessField::CursorOffset(offset) => {
                self.local.cursor_offset = offset;
                let throttled = self
                    .last_cursor_broadcast
                    .is_some_and(|last| now.duration_since(last) < self.cursor_broadcast_interval);
                if throttled {
                    self.cursor_pending = true;
                    return None;
                }
            }
        }
        Some(self.announce(now))
    }

    /// Send a throttled cursor update once the rate-limit window has passed.
    pub fn flush(&mut self, now: Instant) -> Option<AwarenessState> {
        if !self.cursor_pending {
            return None;
        }
        let ready = self
            .last_cursor_broadcast
            .is_none_or(|last| now.duration_since(last) >= self.cursor_broadcast_interval);
        ready.then(|| self.announce(now))
    }

    /// The full local state, regardless of rate limiting (joins, heartbeats).
    pub fn announce(&mut self, now: Instant) -> AwarenessState {
        self.cursor_pending = false;
        self.last_cursor_broadcast = Some(now);
        self.local.clone()
    }

    /// Merge a remote participant's state.
    ///
    /// Newer clocks replace older ones; an older or equal clock only counts
    /// as a sign of life. Other peers past their liveness deadline are
    /// evicted on the way.
    pub fn on_remote_update(&mut self, state: AwarenessState, now: Instant) -> RemoteUpdate {
        let id = state.participant_id;
        if id == self.local.participant_id {
            return RemoteUpdate::default();
        }

        let evicted = self.evict_where(now, |peer| *peer != id);

        let mut update = RemoteUpdate {
            evicted,
            ..RemoteUpdate::default()
        };
        match self.peers.get_mut(&id) {
            Some(peer) => {
                peer.last_seen = now;
                if state.clock > peer.state.clock {
                    peer.state = state;
                    update.applied = true;
                }
            }
            None => {
                debug!("awareness: registered {} ({})", state.display_name, id);
                self.peers.insert(
                    id,
                    RemotePeer {
                        state,
                        last_seen: now,
                    },
                );
                update.registered = true;
                update.applied = true;
            }
        }
        update
    }

    /// Record a sign of life from a tracked participant.
    pub fn touch(&mut self, id: &ParticipantId, now: Instant) {
        if let Some(peer) = self.peers.get_mut(id) {
            peer.last_seen = now;
        }
    }

    pub fn remove(&mut self, id: &ParticipantId) -> Option<AwarenessState> {
        self.peers.remove(id).map(|peer| peer.state)
    }

    /// Remove every participant not heard from within the liveness timeout.
    pub fn evict_stale(&mut self, now: Instant) -> Vec<ParticipantId> {
        self.evict_where(now, |_| true)
    }

    fn evict_where(&mut self, now: Instant, eligible: impl Fn(&ParticipantId) -> bool) -> Vec<ParticipantId> {
        let timeout = self.liveness_timeout;
        let stale: Vec<ParticipantId> = self
            .peers
            .iter()
            .filter(|(id, peer)| eligible(id) && now.duration_since(peer.last_seen) > timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in &stale {
            self.peers.remove(id);
            info!("awareness: evicted {id} after {timeout:?} of silence");
        }
        stale
    }

    pub fn get(&self, id: &ParticipantId) -> Option<&AwarenessState> {
        self.peers.get(id).map(|peer| &peer.state)
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.peers.contains_key(id)
    }

    pub fn remote_states(&self) -> impl Iterator<Item = &AwarenessState> {
        self.peers.values().map(|peer| &peer.state)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> (AwarenessTracker, ParticipantInfo) {
        let local = ParticipantInfo::with_id(Uuid::from_u128(1), "Alice");
        let tracker = AwarenessTracker::new(&local)
            .with_timing(Duration::from_millis(33), Duration::from_secs(10));
        (tracker, local)
    }

    fn remote(id: u128, clock: u64, offset: usize) -> AwarenessState {
        let info = ParticipantInfo::with_id(Uuid::from_u128(id), "Bob");
        AwarenessState {
            cursor_offset: offset,
            clock,
            ..AwarenessState::for_participant(&info)
        }
    }

    #[test]
    fn test_color_from_uuid_stable() {
        let id = Uuid::new_v4();
        assert_eq!(CursorColor::from_uuid(id), CursorColor::from_uuid(id));
        let c = CursorColor::from_uuid(id);
        assert!((0.0..=1.0).contains(&c.r));
        assert!((0.0..=1.0).contains(&c.g));
        assert!((0.0..=1.0).contains(&c.b));
        assert_eq!(c.a, 1.0);
    }

    #[test]
    fn test_color_hex() {
        assert_eq!(CursorColor::rgba(1.0, 0.0, 0.5, 1.0).to_hex(), "#ff0080");
    }

    #[test]
    fn test_first_cursor_move_broadcasts() {
        let (mut t, _) = tracker();
        let now = Instant::now();
        let state = t.set_local(AwarenessField::CursorOffset(4), now).unwrap();
        assert_eq!(state.cursor_offset, 4);
        assert_eq!(state.clock, 1);
    }

    #[test]
    fn test_cursor_throttled_then_flushed() {
        let (mut t, _) = tracker();
        let now = Instant::now();
        t.set_local(AwarenessField::CursorOffset(1), now).unwrap();

        let soon = now + Duration::from_millis(10);
        assert!(t.set_local(AwarenessField::CursorOffset(2), soon).is_none());
        assert!(t.flush(soon).is_none());

        let later = now + Duration::from_millis(40);
        let flushed = t.flush(later).unwrap();
        assert_eq!(flushed.cursor_offset, 2);
        assert!(t.flush(later + Duration::from_millis(100)).is_none());
    }

    #[test]
    fn test_name_change_never_throttled() {
        let (mut t, _) = tracker();
        let now = Instant::now();
        t.set_local(AwarenessField::CursorOffset(1), now).unwrap();
        let state = t
            .set_local(AwarenessField::DisplayName("Al".into()), now + Duration::from_millis(1))
            .unwrap();
        assert_eq!(state.display_name, "Al");
    }

    #[test]
    fn test_remote_update_registers_and_replaces() {
        let (mut t, _) = tracker();
        let now = Instant::now();

        let first = t.on_remote_update(remote(2, 1, 5), now);
        assert!(first.registered && first.applied);
        assert_eq!(t.get(&Uuid::from_u128(2)).unwrap().cursor_offset, 5);

        let second = t.on_remote_update(remote(2, 3, 9), now);
        assert!(!second.registered && second.applied);
        assert_eq!(t.get(&Uuid::from_u128(2)).unwrap().cursor_offset, 9);
    }

    #[test]
    fn test_remote_update_ignores_older_clock() {
        let (mut t, _) = tracker();
        let now = Instant::now();
        t.on_remote_update(remote(2, 5, 5), now);
        let update = t.on_remote_update(remote(2, 4, 1), now);
        assert!(!update.applied);
        assert_eq!(t.get(&Uuid::from_u128(2)).unwrap().cursor_offset, 5);
    }

    #[test]
    fn test_own_state_ignored() {
        let (mut t, local) = tracker();
        let own = AwarenessState::for_participant(&local);
        assert_eq!(t.on_remote_update(own, Instant::now()), RemoteUpdate::default());
        assert!(t.is_empty());
    }

    #[test]
    fn test_stale_peers_evicted_on_update() {
        let (mut t, _) = tracker();
        let start = Instant::now();
        t.on_remote_update(remote(2, 1, 0), start);
        t.on_remote_update(remote(3, 1, 0), start + Duration::from_secs(8));

        let update = t.on_remote_update(remote(3, 2, 0), start + Duration::from_secs(11));
        assert_eq!(update.evicted, vec![Uuid::from_u128(2)]);
        assert!(!t.contains(&Uuid::from_u128(2)));
        assert!(t.contains(&Uuid::from_u128(3)));
    }

    #[test]
    fn test_touch_keeps_peer_alive() {
        let (mut t, _) = tracker();
        let start = Instant::now();
        let id = Uuid::from_u128(2);
        t.on_remote_update(remote(2, 1, 0), start);
        t.touch(&id, start + Duration::from_secs(9));

        assert!(t.evict_stale(start + Duration::from_secs(15)).is_empty());
        assert_eq!(t.evict_stale(start + Duration::from_secs(20)), vec![id]);
        assert!(t.is_empty());
    }
}
