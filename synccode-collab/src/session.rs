//! One participant's view of a room: the single owner of all mutable state.
//!
//! ## Event flow
//!
//! ```text
//!  transport reader ──┐
//!  media task ────────┼──► mpsc<SessionEvent> ──► RoomSession::handle_event
//!  UI commands ───────┤                               │
//!  ticker ────────────┘        ┌──────────┬──────────┼───────────┬────────────┐
//!                              ▼          ▼          ▼           ▼            ▼
//!                          Document   Awareness  Membership  PeerCall    CursorProjection
//!                              │          │                      │
//!                              └──────────┴──── Transport::send ─┘
//! ```
//!
//! Everything that can change room state arrives as a [`SessionEvent`] on a
//! single channel and is handled to completion before the next one, so none
//! of the components need locks.
//!
//! ## Joining
//!
//! A participant that finds the room occupied waits in `Syncing` until an
//! existing member sends its full state, and adopts that state wholesale.
//! Local edits are refused until then, so nothing is lost by the adoption.

use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use synccode_core::{
    ApplyOutcome, Document, DocumentError, DocumentState, Generation, Language, Operation,
    QuestionTemplate, Submission, TemplateError,
};

use crate::awareness::{AwarenessField, AwarenessState, AwarenessTracker};
use crate::call::{CallAction, CallEvent, LocalMedia, MediaDevices, MediaError, PeerCallManager, PeerConnector};
use crate::cursor::CursorProjection;
use crate::protocol::{
    LanguageStamp, ParticipantId, ParticipantInfo, RoomId, RoomMessage, SyncMessage, RELAY_ID,
};
use crate::question::QuestionSource;
use crate::room::{reseed_on_language_switch, RoomMembership, DEFAULT_ROOM_CAPACITY};
use crate::transport::{Transport, TransportError};

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Maximum participants, mirrored from the relay
    pub room_capacity: usize,
    /// Silence after which a participant is considered gone
    pub liveness_timeout: Duration,
    /// Minimum spacing of cursor broadcasts
    pub cursor_broadcast_interval: Duration,
    /// How often awareness and acknowledgements are re-sent
    pub heartbeat_interval: Duration,
    /// Buffers with fewer non-whitespace characters are reseeded on a
    /// language switch
    pub min_template_len: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            room_capacity: DEFAULT_ROOM_CAPACITY,
            liveness_timeout: Duration::from_secs(30),
            cursor_broadcast_interval: Duration::from_millis(33),
            heartbeat_interval: Duration::from_secs(5),
            min_template_len: 1,
        }
    }
}

/// Input to a session.
#[derive(Debug)]
pub enum SessionEvent {
    /// A message delivered by the transport.
    Inbound(SyncMessage),
    /// A media acquisition finished.
    MediaAcquired {
        attempt: u64,
        result: Result<LocalMedia, MediaError>,
    },
    /// A command from the local user.
    Local(LocalCommand),
    /// Periodic housekeeping: cursor flush, heartbeats, liveness, GC.
    Tick,
    /// The transport lost its connection.
    TransportClosed,
}

#[derive(Debug, Clone)]
pub enum LocalCommand {
    Insert { position: usize, text: String },
    Delete { range: Range<usize> },
    MoveCursor(usize),
    SetDisplayName(String),
    AssignQuestion { template: QuestionTemplate, language: Language },
    SwitchLanguage(Language),
    ToggleAudio,
    ToggleVideo,
    Leave,
}

/// Something the UI should react to.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomNotification {
    Joined { participants: Vec<ParticipantInfo> },
    RoomFull { capacity: usize },
    ParticipantJoined(ParticipantInfo),
    ParticipantLeft(ParticipantId),
    DocumentChanged,
    QuestionChanged { question_id: String },
    LanguageChanged { language: Language, reseeded: bool },
    CursorsChanged,
    Call(CallEvent),
    Disconnected,
    CommandRejected(String),
    Fatal(String),
    Left,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LanguageSwitch {
    Unchanged,
    /// The buffer was replaced with the new language's starter code.
    Reseeded,
    /// The buffer held user work and was kept.
    Preserved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Join sent, waiting for the relay.
    Joining,
    /// Admitted to an occupied room, waiting for its state.
    Syncing,
    Active,
    /// Join refused: the room was full.
    Rejected,
    Left,
    /// An internal invariant broke; the session stopped.
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Rejected | SessionStatus::Left | SessionStatus::Failed)
    }
}

/// How a participant stopped being part of the room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Departure {
    /// Sent `Leave`, or the relay reported its connection gone.
    Gone,
    /// Missed its liveness deadline; it may still be connected.
    Silent,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("session is not active ({0:?})")]
    Inactive(SessionStatus),
    #[error("no question assigned")]
    NoQuestion,
}

pub struct RoomSession {
    room_id: RoomId,
    local: ParticipantInfo,
    config: SessionConfig,
    status: SessionStatus,
    document: Document,
    awareness: AwarenessTracker,
    cursors: CursorProjection,
    membership: RoomMembership,
    call: PeerCallManager,
    question: Option<QuestionTemplate>,
    language: Language,
    /// Stamp of the question or language change `language` came from.
    language_stamp: LanguageStamp,
    /// Replicas evicted for silence, with the generation they were evicted
    /// in. They still count for tombstone collection in that generation.
    silenced: Vec<(ParticipantId, Generation)>,
    transport: Arc<dyn Transport>,
    devices: Arc<dyn MediaDevices>,
    events_tx: mpsc::Sender<SessionEvent>,
    notifications: Vec<RoomNotification>,
    subscriber: Option<mpsc::UnboundedSender<RoomNotification>>,
    last_heartbeat: Option<Instant>,
}

impl RoomSession {
    /// Create a session for `local` in `room_id`.
    ///
    /// `events_tx` must feed the receiver later passed to [`run`](Self::run)
    /// (or drained into [`handle_event`](Self::handle_event)); spawned media
    /// acquisitions report back through it.
    pub fn new(
        room_id: RoomId,
        local: ParticipantInfo,
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        devices: Arc<dyn MediaDevices>,
        connector: Arc<dyn PeerConnector>,
        events_tx: mpsc::Sender<SessionEvent>,
    ) -> Self {
        let awareness = AwarenessTracker::new(&local)
            .with_timing(config.cursor_broadcast_interval, config.liveness_timeout);
        let membership = RoomMembership::new(room_id.clone(), config.room_capacity);

        Self {
            document: Document::new(local.participant_id),
            call: PeerCallManager::new(local.participant_id, connector),
            room_id,
            local,
            config,
            status: SessionStatus::Joining,
            awareness,
            cursors: CursorProjection::new(),
            membership,
            question: None,
            language: Language::default(),
            language_stamp: LanguageStamp::default(),
            silenced: Vec::new(),
            transport,
            devices,
            events_tx,
            notifications: Vec::new(),
            subscriber: None,
            last_heartbeat: None,
        }
    }

    // ─── Accessors ───────────────────────────────────────────────

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn local(&self) -> &ParticipantInfo {
        &self.local
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn snapshot(&self) -> String {
        self.document.snapshot()
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn awareness(&self) -> &AwarenessTracker {
        &self.awareness
    }

    pub fn cursors(&self) -> &CursorProjection {
        &self.cursors
    }

    pub fn membership(&self) -> &RoomMembership {
        &self.membership
    }

    pub fn call(&self) -> &PeerCallManager {
        &self.call
    }

    pub fn question(&self) -> Option<&QuestionTemplate> {
        self.question.as_ref()
    }

    pub fn language(&self) -> Language {
        self.language
    }

    /// Notifications raised since the last call.
    pub fn take_notifications(&mut self) -> Vec<RoomNotification> {
        std::mem::take(&mut self.notifications)
    }

    /// Stream notifications instead of collecting them.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<RoomNotification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriber = Some(tx);
        rx
    }

    // ─── Lifecycle ───────────────────────────────────────────────

    /// Ask the relay to admit us. Also used after a reconnect.
    pub fn join(&mut self) -> Result<(), SessionError> {
        if self.status.is_terminal() {
            return Err(SessionError::Inactive(self.status));
        }
        self.status = SessionStatus::Joining;
        self.transport
            .send(SyncMessage::join(self.room_id.clone(), self.local.clone()))?;
        info!("session {}: joining as {}", self.room_id, self.local.participant_id);
        Ok(())
    }

    /// Drive the session until it leaves, is rejected, or fails.
    ///
    /// `events` is the receiving end of the channel given to [`new`](Self::new).
    pub async fn run(&mut self, mut events: mpsc::Receiver<SessionEvent>) -> Result<(), SessionError> {
        let period = self
            .config
            .cursor_broadcast_interval
            .min(self.config.heartbeat_interval);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.status.is_terminal() {
            let event = tokio::select! {
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                _ = ticker.tick() => SessionEvent::Tick,
            };
            if let Err(e) = self.handle_event(event) {
                if self.status == SessionStatus::Failed {
                    return Err(e);
                }
                warn!("session {}: {e}", self.room_id);
            }
        }
        Ok(())
    }

    pub fn handle_event(&mut self, event: SessionEvent) -> Result<(), SessionError> {
        self.handle_event_at(event, Instant::now())
    }

    /// Handle one event as if it happened at `now`.
    pub fn handle_event_at(&mut self, event: SessionEvent, now: Instant) -> Result<(), SessionError> {
        if self.status.is_terminal() {
            // Late media for a finished session is dropped here, stopping it.
            return Ok(());
        }
        match event {
            SessionEvent::Inbound(msg) => self.on_message(msg, now),
            SessionEvent::MediaAcquired { attempt, result } => {
                let actions = self.call.on_media_acquired(attempt, result);
                self.run_call_actions(actions);
                Ok(())
            }
            SessionEvent::Local(command) => {
                if let Err(e) = self.on_command(command, now) {
                    self.notify(RoomNotification::CommandRejected(e.to_string()));
                }
                Ok(())
            }
            SessionEvent::Tick => {
                self.tick(now);
                Ok(())
            }
            SessionEvent::TransportClosed => {
                warn!("session {}: transport closed", self.room_id);
                self.status = SessionStatus::Joining;
                self.notify(RoomNotification::Disconnected);
                Ok(())
            }
        }
    }

    fn on_command(&mut self, command: LocalCommand, now: Instant) -> Result<(), SessionError> {
        match command {
            LocalCommand::Insert { position, text } => self.insert(position, &text),
            LocalCommand::Delete { range } => self.delete(range),
            LocalCommand::MoveCursor(offset) => {
                self.move_cursor_at(offset, now);
                Ok(())
            }
            LocalCommand::SetDisplayName(name) => {
                self.set_display_name_at(name, now);
                Ok(())
            }
            LocalCommand::AssignQuestion { template, language } => self.assign_question(template, language),
            LocalCommand::SwitchLanguage(language) => self.switch_language(language).map(|_| ()),
            LocalCommand::ToggleAudio => {
                self.toggle_audio();
                Ok(())
            }
            LocalCommand::ToggleVideo => {
                self.toggle_video();
                Ok(())
            }
            LocalCommand::Leave => {
                self.leave();
                Ok(())
            }
        }
    }

    // ─── Local operations ────────────────────────────────────────

    pub fn insert(&mut self, position: usize, text: &str) -> Result<(), SessionError> {
        self.ensure_active()?;
        let op = self.document.insert(position, text)?;
        self.broadcast(RoomMessage::DocumentOp(op));
        self.document_changed();
        Ok(())
    }

    pub fn delete(&mut self, range: Range<usize>) -> Result<(), SessionError> {
        self.ensure_active()?;
        let op = self.document.delete(range)?;
        self.broadcast(RoomMessage::DocumentOp(op));
        self.document_changed();
        Ok(())
    }

    pub fn move_cursor(&mut self, offset: usize) {
        self.move_cursor_at(offset, Instant::now());
    }

    /// Cursor move at a given time; moves inside the rate-limit window are
    /// sent on a later tick.
    pub fn move_cursor_at(&mut self, offset: usize, now: Instant) {
        let offset = offset.min(self.document.len());
        if let Some(state) = self.awareness.set_local(AwarenessField::CursorOffset(offset), now) {
            self.broadcast(RoomMessage::Awareness(state));
        }
    }

    pub fn set_display_name(&mut self, name: impl Into<String>) {
        self.set_display_name_at(name.into(), Instant::now());
    }

    fn set_display_name_at(&mut self, name: String, now: Instant) {
        self.local.name = name.clone();
        if let Some(state) = self.awareness.set_local(AwarenessField::DisplayName(name), now) {
            self.broadcast(RoomMessage::Awareness(state));
        }
    }

    /// Make `template` the room's question and seed the buffer with its
    /// starter code for `language`.
    pub fn assign_question(&mut self, template: QuestionTemplate, language: Language) -> Result<(), SessionError> {
        self.ensure_active()?;
        let code = template.user_code(language)?;
        let reset = self.document.reset(&code);
        info!(
            "session {}: question {} ({language}) assigned, {}",
            self.room_id,
            template.id,
            self.document.generation()
        );

        let question_id = template.id.clone();
        self.question = Some(template.clone());
        self.language = language;
        let stamp = self.next_language_stamp();
        self.broadcast(RoomMessage::QuestionAssigned {
            template,
            language,
            reset,
            stamp,
        });
        self.notify(RoomNotification::QuestionChanged { question_id });
        self.document_changed();
        Ok(())
    }

    /// Fetch question `question_id` from `source` and assign it.
    pub async fn load_question(
        &mut self,
        source: &dyn QuestionSource,
        question_id: &str,
        language: Language,
    ) -> Result<(), SessionError> {
        self.ensure_active()?;
        let template = source.fetch(question_id).await?;
        self.assign_question(template, language)
    }

    /// Change the editing language.
    ///
    /// The buffer is replaced with the new starter code only when it still
    /// holds the previous language's unmodified starter code or is
    /// (nearly) blank; see [`reseed_on_language_switch`].
    pub fn switch_language(&mut self, language: Language) -> Result<LanguageSwitch, SessionError> {
        self.ensure_active()?;
        if language == self.language {
            return Ok(LanguageSwitch::Unchanged);
        }

        let reset = match &self.question {
            Some(question) => {
                let previous = question.user_code(self.language).ok();
                let buffer = self.document.snapshot();
                if reseed_on_language_switch(&buffer, previous.as_deref(), self.config.min_template_len) {
                    let code = question.user_code(language)?;
                    Some(self.document.reset(&code))
                } else {
                    None
                }
            }
            None => None,
        };

        let reseeded = reset.is_some();
        info!(
            "session {}: language {} -> {language} ({})",
            self.room_id,
            self.language,
            if reseeded { "reseeded" } else { "buffer kept" }
        );
        self.language = language;
        let stamp = self.next_language_stamp();
        self.broadcast(RoomMessage::LanguageChanged {
            language,
            reset,
            stamp,
        });
        self.notify(RoomNotification::LanguageChanged { language, reseeded });
        if reseeded {
            self.document_changed();
            Ok(LanguageSwitch::Reseeded)
        } else {
            Ok(LanguageSwitch::Preserved)
        }
    }

    pub fn toggle_audio(&mut self) -> bool {
        self.call.toggle_audio()
    }

    pub fn toggle_video(&mut self) -> bool {
        self.call.toggle_video()
    }

    /// Leave the room.
    ///
    /// Local media and the peer link are released before anything is sent,
    /// so leaving completes even when the relay or the peer is unreachable.
    pub fn leave(&mut self) {
        if self.status.is_terminal() {
            return;
        }
        let actions = self.call.leave();
        self.run_call_actions(actions);
        self.broadcast(RoomMessage::Leave);

        self.status = SessionStatus::Left;
        self.awareness.clear();
        self.cursors.clear();
        self.membership.clear();
        info!("session {}: left", self.room_id);
        self.notify(RoomNotification::Left);
    }

    /// The payload for the grading backend: current buffer plus the hidden
    /// test code of the active language.
    pub fn submission(&self) -> Result<Submission, SessionError> {
        let question = self.question.as_ref().ok_or(SessionError::NoQuestion)?;
        let hidden = question.hidden_code(self.language)?;
        Ok(Submission::assemble(
            &self.document.snapshot(),
            &hidden,
            self.language,
            self.room_id.as_str(),
            question.id.clone(),
        ))
    }

    // ─── Inbound messages ────────────────────────────────────────

    fn on_message(&mut self, msg: SyncMessage, now: Instant) -> Result<(), SessionError> {
        if msg.room_id != self.room_id {
            debug!("session {}: ignoring message for room {}", self.room_id, msg.room_id);
            return Ok(());
        }
        let from = msg.sender;
        if from == self.local.participant_id {
            return Ok(());
        }
        if from != RELAY_ID {
            self.awareness.touch(&from, now);
        }

        match msg.payload {
            RoomMessage::Members(others) => self.on_members(others, now),
            RoomMessage::RoomFull { capacity } => {
                warn!("session {}: room full ({capacity})", self.room_id);
                self.status = SessionStatus::Rejected;
                self.notify(RoomNotification::RoomFull { capacity });
            }
            RoomMessage::Join(info) => self.on_participant_joined(info, now),
            RoomMessage::Leave => self.participant_lost(from, Departure::Gone),
            RoomMessage::ParticipantDisconnected(id) => self.participant_lost(id, Departure::Gone),
            RoomMessage::DocumentOp(op) => {
                if matches!(self.apply_remote(op)?, Some(ApplyOutcome::Applied { .. })) {
                    self.document_changed();
                }
            }
            RoomMessage::Ack { generation, version } => {
                self.document.acknowledge(from, generation, version);
                self.collect_garbage();
            }
            RoomMessage::Awareness(state) => self.on_awareness(state, now),
            RoomMessage::QuestionAssigned {
                template,
                language,
                reset,
                stamp,
            } => {
                let stale = self.apply_remote(reset)? == Some(ApplyOutcome::Stale);
                if stale || !self.accept_language_stamp(stamp) {
                    debug!("session {}: ignoring superseded question {}", self.room_id, template.id);
                    return Ok(());
                }
                info!("session {}: question {} assigned by {from}", self.room_id, template.id);
                let question_id = template.id.clone();
                self.question = Some(template);
                self.language = language;
                self.notify(RoomNotification::QuestionChanged { question_id });
                self.document_changed();
            }
            RoomMessage::LanguageChanged {
                language,
                reset,
                stamp,
            } => {
                let reseeded = reset.is_some();
                if let Some(reset) = reset {
                    if self.apply_remote(reset)? == Some(ApplyOutcome::Stale) {
                        debug!("session {}: ignoring superseded language switch", self.room_id);
                        return Ok(());
                    }
                }
                if !self.accept_language_stamp(stamp) {
                    debug!("session {}: ignoring superseded language switch to {language}", self.room_id);
                    return Ok(());
                }
                self.language = language;
                self.notify(RoomNotification::LanguageChanged { language, reseeded });
                if reseeded {
                    self.document_changed();
                }
            }
            RoomMessage::SyncState {
                question,
                language,
                stamp,
                document,
            } => self.on_sync_state(question, language, stamp, document)?,
            RoomMessage::Call(signal) => {
                let actions = self.call.on_signal(from, signal);
                self.run_call_actions(actions);
            }
            RoomMessage::Ping => {
                let pong = SyncMessage::pong(self.room_id.clone(), self.local.participant_id);
                if let Err(e) = self.transport.send(pong) {
                    warn!("session {}: pong failed: {e}", self.room_id);
                }
            }
            RoomMessage::Pong => {}
        }
        Ok(())
    }

    fn on_members(&mut self, others: Vec<ParticipantInfo>, now: Instant) {
        // Participants that left while we were disconnected.
        let local_id = self.local.participant_id;
        let departed: Vec<ParticipantId> = self
            .membership
            .member_ids()
            .into_iter()
            .filter(|id| *id != local_id && !others.iter().any(|o| o.participant_id == *id))
            .collect();
        for id in departed {
            self.participant_lost(id, Departure::Gone);
        }

        self.membership.clear();
        if let Err(e) = self.membership.join(self.local.clone()) {
            warn!("session {}: {e}", self.room_id);
        }
        for other in &others {
            if let Err(e) = self.membership.join(other.clone()) {
                warn!("session {}: {e}", self.room_id);
            }
            self.awareness
                .on_remote_update(AwarenessState::for_participant(other), now);
        }
        self.refresh_cursors();

        self.status = if others.is_empty() {
            SessionStatus::Active
        } else {
            SessionStatus::Syncing
        };
        info!(
            "session {}: admitted with {} other participant(s)",
            self.room_id,
            others.len()
        );

        let mut actions = self.call.join();
        for other in &others {
            actions.extend(self.call.on_participant_discovered(other.participant_id));
        }
        self.notify(RoomNotification::Joined { participants: others });
        self.run_call_actions(actions);

        let state = self.awareness.announce(now);
        self.broadcast(RoomMessage::Awareness(state));
        self.last_heartbeat = Some(now);
    }

    fn on_participant_joined(&mut self, info: ParticipantInfo, now: Instant) {
        let id = info.participant_id;
        if let Err(e) = self.membership.join(info.clone()) {
            warn!("session {}: {e}", self.room_id);
            return;
        }
        if self
            .awareness
            .on_remote_update(AwarenessState::for_participant(&info), now)
            .registered
        {
            self.refresh_cursors();
        }
        self.notify(RoomNotification::ParticipantJoined(info));

        // Bring the newcomer up to date.
        self.send_state();
        let state = self.awareness.announce(now);
        self.broadcast(RoomMessage::Awareness(state));

        let actions = self.call.on_participant_discovered(id);
        self.run_call_actions(actions);
    }

    fn on_sync_state(
        &mut self,
        question: Option<QuestionTemplate>,
        language: Language,
        stamp: LanguageStamp,
        state: DocumentState,
    ) -> Result<(), SessionError> {
        let adopted = if self.status == SessionStatus::Syncing {
            self.document.adopt_state(state).map_err(|e| self.fatal(e))?;
            self.status = SessionStatus::Active;
            self.language_stamp = stamp;
            true
        } else {
            let same_generation = state.generation == self.document.generation();
            let adopted = self.document.load_state(state).map_err(|e| self.fatal(e))?;
            adopted || same_generation
        };
        if !adopted {
            debug!("session {}: kept local state over an older sync", self.room_id);
            return Ok(());
        }

        info!("session {}: synced to {}", self.room_id, self.document.generation());
        if let Some(question) = &question {
            if self.question.as_ref() != Some(question) {
                self.notify(RoomNotification::QuestionChanged {
                    question_id: question.id.clone(),
                });
            }
        }
        if question.is_some() {
            self.question = question;
        }
        if self.language_stamp == stamp || self.accept_language_stamp(stamp) {
            self.language = language;
        }
        self.document_changed();
        self.send_ack();
        Ok(())
    }

    fn on_awareness(&mut self, state: AwarenessState, now: Instant) {
        let id = state.participant_id;
        let info = ParticipantInfo {
            participant_id: id,
            name: state.display_name.clone(),
            color: state.color,
        };
        let update = self.awareness.on_remote_update(state, now);

        // A participant evicted for silence that turns out to be alive. It
        // may have missed operations while silent, so it gets our state.
        if update.registered && !self.membership.contains(&id) && self.membership.join(info.clone()).is_ok() {
            info!("session {}: {id} is back", self.room_id);
            self.silenced.retain(|(peer, _)| *peer != id);
            self.notify(RoomNotification::ParticipantJoined(info));
            self.send_state();
            let actions = self.call.on_participant_discovered(id);
            self.run_call_actions(actions);
        }
        for evicted in update.evicted {
            self.participant_lost(evicted, Departure::Silent);
        }
        if update.applied {
            self.refresh_cursors();
            self.notify(RoomNotification::CursorsChanged);
        }
    }

    /// Apply a remote operation. A broken merge invariant stops the session.
    fn apply_remote(&mut self, op: Operation) -> Result<Option<ApplyOutcome>, SessionError> {
        match self.document.apply(op) {
            Ok(outcome) => Ok(Some(outcome)),
            Err(e @ DocumentError::MergeConflictImpossible(_)) => Err(self.fatal(e)),
            Err(e) => {
                warn!("session {}: rejected remote operation: {e}", self.room_id);
                Ok(None)
            }
        }
    }

    fn fatal(&mut self, error: DocumentError) -> SessionError {
        error!("session {}: {error}", self.room_id);
        self.status = SessionStatus::Failed;
        self.notify(RoomNotification::Fatal(error.to_string()));
        SessionError::Document(error)
    }

    /// Drop a participant from the room view.
    ///
    /// A silent participant keeps its acknowledgement: its operations may
    /// still be in flight, so tombstones stay until it catches up or is
    /// reported gone.
    fn participant_lost(&mut self, id: ParticipantId, departure: Departure) {
        if id == self.local.participant_id {
            return;
        }
        let was_member = self.membership.leave(&id).is_ok();
        let was_tracked = self.awareness.remove(&id).is_some();
        let had_cursor = self.cursors.remove(&id);
        match departure {
            Departure::Gone => {
                self.document.forget(&id);
                self.silenced.retain(|(peer, _)| *peer != id);
            }
            Departure::Silent => {
                if !self.silenced.iter().any(|(peer, _)| *peer == id) {
                    self.silenced.push((id, self.document.generation()));
                }
            }
        }
        let actions = self.call.on_participant_left(id);
        self.run_call_actions(actions);

        if was_member || was_tracked {
            info!("session {}: {id} is gone", self.room_id);
            self.notify(RoomNotification::ParticipantLeft(id));
        }
        if had_cursor {
            self.notify(RoomNotification::CursorsChanged);
        }
        // Nobody left to sync from.
        if self.status == SessionStatus::Syncing && self.membership.len() <= 1 {
            self.status = SessionStatus::Active;
        }
    }

    // ─── Housekeeping ────────────────────────────────────────────

    fn tick(&mut self, now: Instant) {
        if !matches!(self.status, SessionStatus::Active | SessionStatus::Syncing) {
            return;
        }
        if let Some(state) = self.awareness.flush(now) {
            self.broadcast(RoomMessage::Awareness(state));
        }

        let due = self
            .last_heartbeat
            .is_none_or(|last| now.duration_since(last) >= self.config.heartbeat_interval);
        if due {
            self.last_heartbeat = Some(now);
            let state = self.awareness.announce(now);
            self.broadcast(RoomMessage::Awareness(state));
            self.send_ack();
        }

        for id in self.awareness.evict_stale(now) {
            self.participant_lost(id, Departure::Silent);
        }
        self.collect_garbage();
    }

    fn send_ack(&mut self) {
        self.broadcast(RoomMessage::Ack {
            generation: self.document.generation(),
            version: self.document.version().clone(),
        });
    }

    fn collect_garbage(&mut self) {
        // Operations from an older generation are discarded as stale, so a
        // silent replica only holds back the generation it went silent in.
        let generation = self.document.generation();
        self.silenced.retain(|(_, evicted_in)| *evicted_in == generation);

        let mut peers = self.membership.member_ids();
        peers.extend(self.silenced.iter().map(|(id, _)| *id));
        let removed = self.document.collect_garbage(&peers);
        if removed > 0 {
            debug!("session {}: dropped {removed} tombstones", self.room_id);
        }
    }

    /// Send the full room state. Only an active member has one worth sending.
    fn send_state(&self) {
        if self.status != SessionStatus::Active {
            return;
        }
        self.broadcast(RoomMessage::SyncState {
            question: self.question.clone(),
            language: self.language,
            stamp: self.language_stamp,
            document: self.document.state(),
        });
    }

    // ─── Language ordering ───────────────────────────────────────

    /// Stamp a local question or language change. Called after any reset
    /// it carries, so the stamp names the new generation.
    fn next_language_stamp(&mut self) -> LanguageStamp {
        self.language_stamp = self
            .language_stamp
            .successor(self.document.generation(), self.local.participant_id);
        self.language_stamp
    }

    /// Last writer wins: a change is taken only when its stamp is newer than
    /// the one the current language came from.
    fn accept_language_stamp(&mut self, stamp: LanguageStamp) -> bool {
        if stamp.generation < self.document.generation() || stamp <= self.language_stamp {
            return false;
        }
        self.language_stamp = stamp;
        true
    }

    // ─── Helpers ─────────────────────────────────────────────────

    fn ensure_active(&self) -> Result<(), SessionError> {
        match self.status {
            SessionStatus::Active => Ok(()),
            status => Err(SessionError::Inactive(status)),
        }
    }

    /// Send to the room. Delivery failures are the transport's concern.
    fn broadcast(&self, payload: RoomMessage) {
        let kind = payload.kind();
        let msg = SyncMessage::new(self.room_id.clone(), self.local.participant_id, payload);
        if let Err(e) = self.transport.send(msg) {
            warn!("session {}: failed to send {kind:?}: {e}", self.room_id);
        }
    }

    fn document_changed(&mut self) {
        self.refresh_cursors();
        self.notify(RoomNotification::DocumentChanged);
    }

    fn refresh_cursors(&mut self) {
        let text = self.document.snapshot();
        self.cursors.refresh(self.awareness.remote_states(), &text);
    }

    fn run_call_actions(&mut self, actions: Vec<CallAction>) {
        let mut queue: VecDeque<CallAction> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                CallAction::AcquireMedia { attempt, constraints } => {
                    match tokio::runtime::Handle::try_current() {
                        Ok(handle) => {
                            let devices = self.devices.clone();
                            let events = self.events_tx.clone();
                            handle.spawn(async move {
                                let result = devices.acquire(constraints).await;
                                // If the session is gone the media is dropped
                                // with the event, which stops its tracks.
                                if events
                                    .send(SessionEvent::MediaAcquired { attempt, result })
                                    .await
                                    .is_err()
                                {
                                    debug!("media for attempt {attempt} arrived after the session ended");
                                }
                            });
                        }
                        Err(_) => {
                            let error = MediaError::DeviceUnavailable("no async runtime".into());
                            queue.extend(self.call.on_media_acquired(attempt, Err(error)));
                        }
                    }
                }
                CallAction::Signal(signal) => self.broadcast(RoomMessage::Call(signal)),
                CallAction::Notify(event) => self.notify(RoomNotification::Call(event)),
            }
        }
    }

    fn notify(&mut self, notification: RoomNotification) {
        if let Some(subscriber) = &self.subscriber {
            if subscriber.send(notification.clone()).is_ok() {
                return;
            }
            self.subscriber = None;
        }
        self.notifications.push(notification);
    }
}
