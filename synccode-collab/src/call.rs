//! One-to-one call lifecycle over the room's signaling channel.
//!
//! ## State machine
//!
//! ```text
//!        join / incoming offer
//! Idle ─────────────────────────► AwaitingLocalMedia
//!                                        │ media acquired
//!                                        ▼
//!                                      Ready ──(lower id, peer known)──► Negotiating
//!                                        │                                   │ answer
//!                                        │ offer received ──────────────────►│
//!                                        ▼                                   ▼
//!                                     Connected ◄────────────────────────────┘
//!
//! any state ──leave / peer gone──► Closed
//! ```
//!
//! The manager does no I/O. Each transition returns [`CallAction`]s for the
//! owning session to carry out: spawn a media acquisition, send a signal,
//! or surface an event. Acquisitions are tagged with an attempt number; a
//! result for anything but the current attempt is released on arrival,
//! which is how leaving cancels an in-flight acquisition.
//!
//! Exactly one side initiates: the participant whose id sorts lower.

use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::protocol::{CallSignal, ParticipantId, SessionDescription};

// ───────────────────────────────────────────────────────────────────
// Media
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Handle to a capture track.
///
/// Clones share state, so whoever holds a clone can observe the owner
/// enabling or stopping the track.
#[derive(Debug, Clone)]
pub struct MediaTrack {
    id: Uuid,
    kind: TrackKind,
    enabled: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            enabled: Arc::new(AtomicBool::new(true)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

/// Local capture tracks, exclusively owned. Dropping stops every track.
#[derive(Debug)]
pub struct LocalMedia {
    tracks: Vec<MediaTrack>,
}

impl LocalMedia {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) {
        for track in self.tracks.iter().filter(|t| t.kind == kind) {
            track.set_enabled(enabled);
        }
    }

    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

impl Drop for LocalMedia {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MediaError {
    #[error("camera/microphone permission denied")]
    PermissionDenied,
    #[error("media device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("media acquisition cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("peer connection failed: {0}")]
    Connection(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// Source of local capture tracks (camera and microphone).
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalMedia, MediaError>;
}

/// Factory for peer connections carrying the local tracks.
pub trait PeerConnector: Send + Sync {
    fn connect(
        &self,
        local: ParticipantId,
        remote: ParticipantId,
        media: &LocalMedia,
    ) -> Result<Box<dyn PeerLink>, CallError>;
}

/// One peer connection.
pub trait PeerLink: Send {
    fn create_offer(&mut self) -> Result<SessionDescription, CallError>;
    fn accept_offer(&mut self, offer: &SessionDescription) -> Result<SessionDescription, CallError>;
    fn accept_answer(&mut self, answer: &SessionDescription) -> Result<(), CallError>;
    fn close(&mut self);
}

// ───────────────────────────────────────────────────────────────────
// Manager
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    AwaitingLocalMedia,
    /// Local media held, no negotiation in progress.
    Ready,
    /// Offer sent, waiting for the answer.
    Negotiating,
    Connected,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    MediaReady,
    MediaFailed(MediaError),
    Connected { remote: ParticipantId },
    Failed(CallError),
    Closed { remote: Option<ParticipantId> },
}

/// Work the owning session must carry out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallAction {
    AcquireMedia {
        attempt: u64,
        constraints: MediaConstraints,
    },
    Signal(CallSignal),
    Notify(CallEvent),
}

pub struct PeerCallManager {
    local_id: ParticipantId,
    state: CallState,
    constraints: MediaConstraints,
    attempt: u64,
    media: Option<LocalMedia>,
    remote: Option<ParticipantId>,
    link: Option<Box<dyn PeerLink>>,
    pending_offer: Option<(ParticipantId, SessionDescription)>,
    connector: Arc<dyn PeerConnector>,
    audio_enabled: bool,
    video_enabled: bool,
    /// Set by an explicit leave; discovery no longer restarts the call.
    left: bool,
}

impl PeerCallManager {
    pub fn new(local_id: ParticipantId, connector: Arc<dyn PeerConnector>) -> Self {
        Self {
            local_id,
            state: CallState::Idle,
            constraints: MediaConstraints::default(),
            attempt: 0,
            media: None,
            remote: None,
            link: None,
            pending_offer: None,
            connector,
            audio_enabled: true,
            video_enabled: true,
            left: false,
        }
    }

    pub fn with_constraints(mut self, constraints: MediaConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn remote(&self) -> Option<ParticipantId> {
        self.remote
    }

    pub fn media(&self) -> Option<&LocalMedia> {
        self.media.as_ref()
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn audio_enabled(&self) -> bool {
        self.audio_enabled
    }

    pub fn video_enabled(&self) -> bool {
        self.video_enabled
    }

    /// Whether this side places the call to `remote`.
    pub fn is_initiator(&self, remote: &ParticipantId) -> bool {
        self.local_id < *remote
    }

    /// Start (or restart) local media acquisition.
    pub fn join(&mut self) -> Vec<CallAction> {
        if !matches!(self.state, CallState::Idle | CallState::Closed) {
            return Vec::new();
        }
        self.left = false;
        self.attempt += 1;
        self.state = CallState::AwaitingLocalMedia;
        debug!("call: acquiring local media (attempt {})", self.attempt);
        vec![CallAction::AcquireMedia {
            attempt: self.attempt,
            constraints: self.constraints,
        }]
    }

    /// Resolution of the acquisition tagged `attempt`.
    pub fn on_media_acquired(
        &mut self,
        attempt: u64,
        result: Result<LocalMedia, MediaError>,
    ) -> Vec<CallAction> {
        if attempt != self.attempt || self.state != CallState::AwaitingLocalMedia {
            if let Ok(media) = result {
                debug!("call: releasing media from superseded attempt {attempt}");
                media.stop();
            }
            return Vec::new();
        }

        let media = match result {
            Ok(media) => media,
            Err(e) => {
                warn!("call: media acquisition failed: {e}");
                self.state = CallState::Idle;
                let mut actions = Vec::new();
                if self.pending_offer.take().is_some() {
                    actions.push(CallAction::Signal(CallSignal::Hangup));
                }
                actions.push(CallAction::Notify(CallEvent::MediaFailed(e)));
                return actions;
            }
        };

        media.set_enabled(TrackKind::Audio, self.audio_enabled);
        media.set_enabled(TrackKind::Video, self.video_enabled);
        self.media = Some(media);
        self.state = CallState::Ready;

        let mut actions = vec![CallAction::Notify(CallEvent::MediaReady)];
        if let Some((from, offer)) = self.pending_offer.take() {
            actions.extend(self.answer(from, &offer));
        } else if let Some(remote) = self.remote {
            if self.is_initiator(&remote) {
                actions.extend(self.start_call(remote));
            }
        }
        actions
    }

    /// Another participant is present in the room.
    pub fn on_participant_discovered(&mut self, remote: ParticipantId) -> Vec<CallAction> {
        if remote == self.local_id || self.left {
            return Vec::new();
        }
        if self.remote.is_some_and(|r| r != remote) {
            debug!("call: already paired, ignoring {remote}");
            return Vec::new();
        }
        self.remote = Some(remote);

        match self.state {
            CallState::Ready if self.is_initiator(&remote) => self.start_call(remote),
            // The previous peer left; get media again for the new one.
            CallState::Closed => self.join(),
            _ => Vec::new(),
        }
    }

    pub fn on_signal(&mut self, from: ParticipantId, signal: CallSignal) -> Vec<CallAction> {
        if self.left {
            return Vec::new();
        }
        match signal {
            CallSignal::Offer { to, description } => {
                if to != self.local_id {
                    return Vec::new();
                }
                self.on_offer(from, description)
            }
            CallSignal::Answer { to, description } => {
                if to != self.local_id
                    || self.state != CallState::Negotiating
                    || self.remote != Some(from)
                {
                    debug!("call: ignoring unexpected answer from {from}");
                    return Vec::new();
                }
                let result = match self.link.as_mut() {
                    Some(link) => link.accept_answer(&description),
                    None => Err(CallError::Connection("no peer link".into())),
                };
                match result {
                    Ok(()) => {
                        self.state = CallState::Connected;
                        info!("call: connected to {from}");
                        vec![CallAction::Notify(CallEvent::Connected { remote: from })]
                    }
                    Err(e) => self.fail(e),
                }
            }
            CallSignal::Hangup => {
                if self.remote == Some(from) {
                    self.on_participant_left(from)
                } else {
                    Vec::new()
                }
            }
        }
    }

    fn on_offer(&mut self, from: ParticipantId, offer: SessionDescription) -> Vec<CallAction> {
        if self.remote.is_some_and(|r| r != from) {
            debug!("call: ignoring offer from {from}, paired with another participant");
            return Vec::new();
        }
        self.remote = Some(from);

        match self.state {
            CallState::Negotiating if self.is_initiator(&from) => {
                debug!("call: ignoring crossing offer from {from}");
                Vec::new()
            }
            CallState::Ready | CallState::Negotiating | CallState::Connected => {
                self.answer(from, &offer)
            }
            CallState::AwaitingLocalMedia => {
                self.pending_offer = Some((from, offer));
                Vec::new()
            }
            CallState::Idle | CallState::Closed => {
                // Media must be in hand before answering.
                self.pending_offer = Some((from, offer));
                self.join()
            }
        }
    }

    fn start_call(&mut self, remote: ParticipantId) -> Vec<CallAction> {
        let result = self.open_link(remote).and_then(|link| link.create_offer());
        match result {
            Ok(description) => {
                self.state = CallState::Negotiating;
                info!("call: calling {remote}");
                vec![CallAction::Signal(CallSignal::Offer {
                    to: remote,
                    description,
                })]
            }
            Err(e) => self.fail(e),
        }
    }

    fn answer(&mut self, from: ParticipantId, offer: &SessionDescription) -> Vec<CallAction> {
        let result = self.open_link(from).and_then(|link| link.accept_offer(offer));
        match result {
            Ok(description) => {
                self.state = CallState::Connected;
                info!("call: answered {from}");
                vec![
                    CallAction::Signal(CallSignal::Answer {
                        to: from,
                        description,
                    }),
                    CallAction::Notify(CallEvent::Connected { remote: from }),
                ]
            }
            Err(e) => self.fail(e),
        }
    }

    /// Replace any existing link with a fresh one to `remote`.
    fn open_link(&mut self, remote: ParticipantId) -> Result<&mut Box<dyn PeerLink>, CallError> {
        if let Some(mut old) = self.link.take() {
            old.close();
        }
        let media = self
            .media
            .as_ref()
            .ok_or_else(|| CallError::Connection("local media not acquired".into()))?;
        let link = self.connector.connect(self.local_id, remote, media)?;
        Ok(self.link.insert(link))
    }

    fn fail(&mut self, error: CallError) -> Vec<CallAction> {
        warn!("call: {error}");
        if let Some(mut link) = self.link.take() {
            link.close();
        }
        self.state = if self.media.is_some() {
            CallState::Ready
        } else {
            CallState::Idle
        };
        vec![CallAction::Notify(CallEvent::Failed(error))]
    }

    /// Mute or unmute the microphone. Returns the new setting.
    pub fn toggle_audio(&mut self) -> bool {
        self.audio_enabled = !self.audio_enabled;
        if let Some(media) = &self.media {
            media.set_enabled(TrackKind::Audio, self.audio_enabled);
        }
        self.audio_enabled
    }

    /// Turn the camera on or off. Returns the new setting.
    pub fn toggle_video(&mut self) -> bool {
        self.video_enabled = !self.video_enabled;
        if let Some(media) = &self.media {
            media.set_enabled(TrackKind::Video, self.video_enabled);
        }
        self.video_enabled
    }

    /// The paired participant left or disconnected.
    pub fn on_participant_left(&mut self, id: ParticipantId) -> Vec<CallAction> {
        if self.remote != Some(id) {
            return Vec::new();
        }
        info!("call: {id} left, closing call");
        self.release();
        self.remote = None;
        self.state = CallState::Closed;
        vec![CallAction::Notify(CallEvent::Closed { remote: Some(id) })]
    }

    /// Leave the call.
    ///
    /// Local tracks and the link are released before the hangup is handed
    /// out, so cleanup never waits on the remote side.
    pub fn leave(&mut self) -> Vec<CallAction> {
        self.left = true;
        self.release();
        let remote = self.remote.take();
        let was_active = self.state != CallState::Idle;
        self.state = CallState::Closed;

        let mut actions = Vec::new();
        if remote.is_some() {
            actions.push(CallAction::Signal(CallSignal::Hangup));
        }
        if was_active || remote.is_some() {
            actions.push(CallAction::Notify(CallEvent::Closed { remote }));
        }
        actions
    }

    /// Drop media and link, and invalidate any acquisition in flight.
    fn release(&mut self) {
        self.attempt += 1;
        self.pending_offer = None;
        if let Some(mut link) = self.link.take() {
            link.close();
        }
        if let Some(media) = self.media.take() {
            media.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeLink {
        closed: Arc<AtomicBool>,
    }

    impl PeerLink for FakeLink {
        fn create_offer(&mut self) -> Result<SessionDescription, CallError> {
            Ok(SessionDescription("offer".into()))
        }
        fn accept_offer(&mut self, _offer: &SessionDescription) -> Result<SessionDescription, CallError> {
            Ok(SessionDescription("answer".into()))
        }
        fn accept_answer(&mut self, _answer: &SessionDescription) -> Result<(), CallError> {
            Ok(())
        }
        fn close(&mut self) {
            self.closed.store(true, Ordering::Release);
        }
    }

    #[derive(Default)]
    struct FakeConnector {
        links: Mutex<Vec<Arc<AtomicBool>>>,
    }

    impl FakeConnector {
        fn all_closed(&self) -> bool {
            self.links.lock().unwrap().iter().all(|c| c.load(Ordering::Acquire))
        }
    }

    impl PeerConnector for FakeConnector {
        fn connect(
            &self,
            _local: ParticipantId,
            _remote: ParticipantId,
            _media: &LocalMedia,
        ) -> Result<Box<dyn PeerLink>, CallError> {
            let closed = Arc::new(AtomicBool::new(false));
            self.links.lock().unwrap().push(closed.clone());
            Ok(Box::new(FakeLink { closed }))
        }
    }

    fn media() -> (LocalMedia, Vec<MediaTrack>) {
        let tracks = vec![MediaTrack::new(TrackKind::Audio), MediaTrack::new(TrackKind::Video)];
        (LocalMedia::new(tracks.clone()), tracks)
    }

    fn manager(id: u128) -> (PeerCallManager, Arc<FakeConnector>) {
        let connector = Arc::new(FakeConnector::default());
        (PeerCallManager::new(Uuid::from_u128(id), connector.clone()), connector)
    }

    fn acquire_attempt(actions: &[CallAction]) -> u64 {
        actions
            .iter()
            .find_map(|a| match a {
                CallAction::AcquireMedia { attempt, .. } => Some(*attempt),
                _ => None,
            })
            .unwrap()
    }

    fn offer_of(actions: &[CallAction]) -> Option<(ParticipantId, SessionDescription)> {
        actions.iter().find_map(|a| match a {
            CallAction::Signal(CallSignal::Offer { to, description }) => Some((*to, description.clone())),
            _ => None,
        })
    }

    #[test]
    fn test_lower_id_initiates() {
        let (mut low, _) = manager(1);
        let (mut high, _) = manager(2);

        let a = acquire_attempt(&low.join());
        low.on_media_acquired(a, Ok(media().0));
        let b = acquire_attempt(&high.join());
        high.on_media_acquired(b, Ok(media().0));

        assert!(offer_of(&high.on_participant_discovered(Uuid::from_u128(1))).is_none());
        let (to, offer) = offer_of(&low.on_participant_discovered(Uuid::from_u128(2))).unwrap();
        assert_eq!(to, Uuid::from_u128(2));
        assert_eq!(low.state(), CallState::Negotiating);

        let answer = high.on_signal(Uuid::from_u128(1), CallSignal::Offer { to, description: offer });
        assert_eq!(high.state(), CallState::Connected);
        let description = answer
            .iter()
            .find_map(|a| match a {
                CallAction::Signal(CallSignal::Answer { description, .. }) => Some(description.clone()),
                _ => None,
            })
            .unwrap();

        let done = low.on_signal(
            Uuid::from_u128(2),
            CallSignal::Answer {
                to: Uuid::from_u128(1),
                description,
            },
        );
        assert_eq!(low.state(), CallState::Connected);
        assert!(done.contains(&CallAction::Notify(CallEvent::Connected {
            remote: Uuid::from_u128(2)
        })));
    }

    #[test]
    fn test_discovery_before_media_calls_once_ready() {
        let (mut low, _) = manager(1);
        let attempt = acquire_attempt(&low.join());
        assert!(low.on_participant_discovered(Uuid::from_u128(2)).is_empty());

        let actions = low.on_media_acquired(attempt, Ok(media().0));
        assert!(actions.contains(&CallAction::Notify(CallEvent::MediaReady)));
        assert!(offer_of(&actions).is_some());
    }

    #[test]
    fn test_incoming_offer_acquires_media_before_answering() {
        let (mut high, _) = manager(2);
        let actions = high.on_signal(
            Uuid::from_u128(1),
            CallSignal::Offer {
                to: Uuid::from_u128(2),
                description: SessionDescription("offer".into()),
            },
        );
        assert_eq!(high.state(), CallState::AwaitingLocalMedia);
        let attempt = acquire_attempt(&actions);

        let actions = high.on_media_acquired(attempt, Ok(media().0));
        assert_eq!(high.state(), CallState::Connected);
        assert!(actions
            .iter()
            .any(|a| matches!(a, CallAction::Signal(CallSignal::Answer { .. }))));
    }

    #[test]
    fn test_media_failure_aborts_and_reports() {
        let (mut high, _) = manager(2);
        let actions = high.on_signal(
            Uuid::from_u128(1),
            CallSignal::Offer {
                to: Uuid::from_u128(2),
                description: SessionDescription("offer".into()),
            },
        );
        let attempt = acquire_attempt(&actions);

        let actions = high.on_media_acquired(attempt, Err(MediaError::PermissionDenied));
        assert_eq!(high.state(), CallState::Idle);
        assert_eq!(
            actions,
            vec![
                CallAction::Signal(CallSignal::Hangup),
                CallAction::Notify(CallEvent::MediaFailed(MediaError::PermissionDenied)),
            ]
        );
    }

    #[test]
    fn test_leave_during_acquisition_releases_late_media() {
        let (mut m, _) = manager(1);
        let attempt = acquire_attempt(&m.join());
        m.leave();
        assert_eq!(m.state(), CallState::Closed);

        let (late, tracks) = media();
        assert!(m.on_media_acquired(attempt, Ok(late)).is_empty());
        assert!(tracks.iter().all(MediaTrack::is_stopped));
        assert!(m.media().is_none());
    }

    #[test]
    fn test_leave_releases_before_hangup() {
        let (mut m, connector) = manager(1);
        let attempt = acquire_attempt(&m.join());
        let (local, tracks) = media();
        m.on_media_acquired(attempt, Ok(local));
        m.on_participant_discovered(Uuid::from_u128(2));

        let actions = m.leave();
        // Released already, whatever happens to the hangup.
        assert!(tracks.iter().all(MediaTrack::is_stopped));
        assert!(connector.all_closed());
        assert_eq!(actions[0], CallAction::Signal(CallSignal::Hangup));
        assert_eq!(m.state(), CallState::Closed);
        assert!(m.on_participant_discovered(Uuid::from_u128(3)).is_empty());
    }

    #[test]
    fn test_peer_disconnect_closes_call_and_stops_tracks() {
        let (mut m, connector) = manager(1);
        let attempt = acquire_attempt(&m.join());
        let (local, tracks) = media();
        m.on_media_acquired(attempt, Ok(local));
        m.on_participant_discovered(Uuid::from_u128(2));

        let actions = m.on_participant_left(Uuid::from_u128(2));
        assert_eq!(m.state(), CallState::Closed);
        assert!(tracks.iter().all(MediaTrack::is_stopped));
        assert!(connector.all_closed());
        assert_eq!(
            actions,
            vec![CallAction::Notify(CallEvent::Closed {
                remote: Some(Uuid::from_u128(2))
            })]
        );
    }

    #[test]
    fn test_new_peer_after_disconnect_restarts_media() {
        let (mut m, _) = manager(1);
        let attempt = acquire_attempt(&m.join());
        m.on_media_acquired(attempt, Ok(media().0));
        m.on_participant_discovered(Uuid::from_u128(2));
        m.on_participant_left(Uuid::from_u128(2));

        let actions = m.on_participant_discovered(Uuid::from_u128(3));
        assert!(acquire_attempt(&actions) > attempt);
        assert_eq!(m.state(), CallState::AwaitingLocalMedia);
    }

    #[test]
    fn test_toggles_only_flip_tracks() {
        let (mut m, connector) = manager(1);
        let attempt = acquire_attempt(&m.join());
        let (local, tracks) = media();
        m.on_media_acquired(attempt, Ok(local));
        m.on_participant_discovered(Uuid::from_u128(2));
        let links_before = connector.links.lock().unwrap().len();

        assert!(!m.toggle_audio());
        assert!(!tracks[0].is_enabled());
        assert!(tracks[1].is_enabled());
        assert!(!m.toggle_video());
        assert!(!tracks[1].is_enabled());
        assert!(m.toggle_audio());
        assert!(tracks[0].is_enabled());

        assert_eq!(connector.links.lock().unwrap().len(), links_before);
        assert_eq!(m.state(), CallState::Negotiating);
    }

    #[test]
    fn test_dropping_local_media_stops_tracks() {
        let (local, tracks) = media();
        drop(local);
        assert!(tracks.iter().all(MediaTrack::is_stopped));
    }
}
