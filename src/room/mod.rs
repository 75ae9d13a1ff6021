//! The room aggregate: who is in the meeting and what media exists.
//!
//! `RoomSession` is owned by a single task. Commands, signaling messages and
//! transport events are applied one at a time through `&mut self`, so the
//! roster and the connection map never disagree between two awaits that an
//! observer could see. Observers get `RoomEvent`s over a broadcast channel.

pub mod local_media;
pub mod state;

use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::connection::NegotiationRole;
use crate::error::{Error, Result};
use crate::media::{ConnectionKey, MediaKind, MediaStream};
use crate::peers::{MediaTransportFactory, PeerConnectionManager, PeerEvent, TransportEvent};
use crate::signaling::{IceServer, SignalingClient, SignalingEvent, SignalingMessage, SignalingSender};

pub use local_media::{AudioDevice, GainControl, LocalMediaController, MediaDevices, MAX_GAIN, MIN_GAIN};
pub use state::{Participant, Role, Roster};

/// Subject id under which the local microphone is reported.
pub const LOCAL_SUBJECT: &str = "local";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Joining,
    Joined,
    Left,
    Ended,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Left | SessionStatus::Ended)
    }
}

/// The local user's outgoing screen share.
#[derive(Debug, Clone, PartialEq)]
pub struct ScreenShareState {
    pub stream_id: String,
    pub connections: Vec<ConnectionKey>,
}

#[derive(Debug, Clone)]
pub enum RoomEvent {
    StatusChanged(SessionStatus),
    ParticipantJoined(Participant),
    ParticipantUpdated(Participant),
    ParticipantLeft(String),
    RemoteStream { key: ConnectionKey, stream: MediaStream },
    Connected(ConnectionKey),
    Reconnecting(ConnectionKey),
    ConnectionLost { key: ConnectionKey, reason: String },
    LocalMuteChanged(bool),
    ScreenShareChanged(Option<ScreenShareState>),
    Error { message: String, code: Option<String> },
    /// The signaling channel went away. Rejoining is up to the caller.
    Disconnected { reason: Option<String> },
}

/// Requests queued to a running session from other tasks.
#[derive(Debug)]
pub enum RoomCommand {
    SetMuted(bool),
    StartScreenShare,
    StopScreenShare,
    Leave,
}

#[derive(Clone, Debug)]
pub struct RoomHandle {
    tx: mpsc::UnboundedSender<RoomCommand>,
}

impl RoomHandle {
    fn send(&self, command: RoomCommand) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| Error::InvalidState("room session is no longer running".to_string()))
    }

    pub fn set_muted(&self, muted: bool) -> Result<()> {
        self.send(RoomCommand::SetMuted(muted))
    }

    pub fn start_screen_share(&self) -> Result<()> {
        self.send(RoomCommand::StartScreenShare)
    }

    pub fn stop_screen_share(&self) -> Result<()> {
        self.send(RoomCommand::StopScreenShare)
    }

    pub fn leave(&self) -> Result<()> {
        self.send(RoomCommand::Leave)
    }
}

enum Step {
    Signal(Option<SignalingEvent>),
    Transport(Option<TransportEvent>),
    Command(Option<RoomCommand>),
}

pub struct RoomSession {
    meeting_id: String,
    display_name: String,
    user_id: Option<String>,
    status: SessionStatus,
    ice_servers: Vec<IceServer>,
    roster: Roster,
    peers: PeerConnectionManager,
    media: LocalMediaController,
    signaling: SignalingSender,
    local_stream: Option<MediaStream>,
    local_muted: bool,
    screen_stream: Option<MediaStream>,
    events: broadcast::Sender<RoomEvent>,
    commands_tx: mpsc::UnboundedSender<RoomCommand>,
    commands_rx: mpsc::UnboundedReceiver<RoomCommand>,
}

impl RoomSession {
    pub fn new(
        meeting_id: impl Into<String>,
        display_name: impl Into<String>,
        signaling: SignalingSender,
        factory: Arc<dyn MediaTransportFactory>,
        media: LocalMediaController,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        Self {
            meeting_id: meeting_id.into(),
            display_name: display_name.into(),
            user_id: None,
            status: SessionStatus::Idle,
            ice_servers: Vec::new(),
            roster: Roster::new(),
            peers: PeerConnectionManager::new(factory, signaling.clone()),
            media,
            signaling,
            local_stream: None,
            local_muted: false,
            screen_stream: None,
            events,
            commands_tx,
            commands_rx,
        }
    }

    /// ICE servers used until the server's `joined` supplies its own.
    pub fn with_ice_servers(mut self, ice_servers: Vec<IceServer>) -> Self {
        self.set_ice_servers(ice_servers);
        self
    }

    fn set_ice_servers(&mut self, ice_servers: Vec<IceServer>) {
        self.peers.set_ice_servers(ice_servers.clone());
        self.ice_servers = ice_servers;
    }

    pub fn meeting_id(&self) -> &str {
        &self.meeting_id
    }

    /// Our id, assigned by the server in `joined`.
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn ice_servers(&self) -> &[IceServer] {
        &self.ice_servers
    }

    pub fn participants(&self) -> &Roster {
        &self.roster
    }

    pub fn participant(&self, id: &str) -> Option<&Participant> {
        self.roster.get(id)
    }

    pub fn peers(&self) -> &PeerConnectionManager {
        &self.peers
    }

    pub fn media(&self) -> &LocalMediaController {
        &self.media
    }

    pub fn media_mut(&mut self) -> &mut LocalMediaController {
        &mut self.media
    }

    pub fn local_stream(&self) -> Option<&MediaStream> {
        self.local_stream.as_ref()
    }

    pub fn is_muted(&self) -> bool {
        self.local_muted
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.events.subscribe()
    }

    pub fn handle(&self) -> RoomHandle {
        RoomHandle {
            tx: self.commands_tx.clone(),
        }
    }

    fn emit(&self, event: RoomEvent) {
        let _ = self.events.send(event);
    }

    fn set_status(&mut self, status: SessionStatus) {
        if self.status != status {
            info!("Room {}: {:?} -> {:?}", self.meeting_id, self.status, status);
            self.status = status;
            self.emit(RoomEvent::StatusChanged(status));
        }
    }

    fn report(&self, error: &Error) {
        warn!("Room {}: {}", self.meeting_id, error);
        self.emit(RoomEvent::Error {
            message: error.to_string(),
            code: None,
        });
    }

    pub async fn join(&mut self) -> Result<()> {
        if self.status != SessionStatus::Idle {
            return Err(Error::InvalidState(format!(
                "cannot join from {:?}",
                self.status
            )));
        }
        self.signaling.send(SignalingMessage::Join {
            meeting_id: self.meeting_id.clone(),
            display_name: self.display_name.clone(),
        })?;
        self.set_status(SessionStatus::Joining);
        Ok(())
    }

    /// Leaves the room and releases everything the session owns. Safe to
    /// call more than once.
    pub async fn leave(&mut self) -> Result<()> {
        if self.status.is_terminal() {
            debug!("Room {}: already {:?}", self.meeting_id, self.status);
            return Ok(());
        }
        if matches!(self.status, SessionStatus::Joining | SessionStatus::Joined) {
            if let Err(e) = self.signaling.send(SignalingMessage::Leave) {
                warn!("Could not send leave: {}", e);
            }
        }
        self.teardown(SessionStatus::Left).await;
        Ok(())
    }

    async fn teardown(&mut self, status: SessionStatus) {
        if let Some(stream) = self.local_stream.take() {
            stream.stop();
        }
        if let Some(stream) = self.screen_stream.take() {
            stream.stop();
            self.emit(RoomEvent::ScreenShareChanged(None));
        }
        self.peers.set_local_media(MediaKind::Audio, None);
        self.peers.set_local_media(MediaKind::Screen, None);
        self.peers.close_all().await;
        self.roster.clear();
        self.set_status(status);
    }

    /// Adds or refreshes a participant and makes sure its audio connection
    /// exists. A participant whose connection cannot be created is not
    /// added.
    pub async fn add_participant(&mut self, participant: Participant) -> Result<()> {
        let id = participant.id.clone();
        self.peers.create_or_get_connection(&id, MediaKind::Audio).await?;
        if self.roster.upsert(participant.clone()) {
            info!("{} ({}) joined", participant.display_name, id);
            self.emit(RoomEvent::ParticipantJoined(participant));
        } else {
            self.emit(RoomEvent::ParticipantUpdated(participant));
        }
        Ok(())
    }

    /// Removes a participant together with its audio and screen connections.
    pub async fn remove_participant(&mut self, participant_id: &str) -> bool {
        let removed = self.roster.remove(participant_id).is_some();
        self.peers.close_participant(participant_id).await;
        if removed {
            info!("{} left", participant_id);
            self.emit(RoomEvent::ParticipantLeft(participant_id.to_string()));
        }
        removed
    }

    /// Replaces the local microphone stream. The previous stream is stopped;
    /// the current mute state carries over.
    pub fn set_local_stream(&mut self, stream: Option<MediaStream>) {
        if let Some(previous) = self.local_stream.take() {
            if stream.as_ref().map(|s| s.id()) != Some(previous.id()) {
                previous.stop();
            }
        }
        if let Some(stream) = &stream {
            stream.set_audio_enabled(!self.local_muted);
        }
        self.peers.set_local_media(MediaKind::Audio, stream.clone());
        self.local_stream = stream;
    }

    /// Opens the selected microphone and installs it as the local stream.
    pub fn open_microphone(&mut self) -> Result<()> {
        let stream = self.media.open_local_stream()?;
        self.set_local_stream(Some(stream));
        Ok(())
    }

    /// Disables (never removes) local audio tracks and tells the room.
    pub fn toggle_mute(&mut self, muted: bool) -> Result<()> {
        self.local_muted = muted;
        if let Some(stream) = &self.local_stream {
            stream.set_audio_enabled(!muted);
        }
        if self.status == SessionStatus::Joined {
            self.signaling.send(SignalingMessage::Mute { muted })?;
        }
        self.emit(RoomEvent::LocalMuteChanged(muted));
        Ok(())
    }

    pub fn screen_share(&self) -> Option<ScreenShareState> {
        let stream = self.screen_stream.as_ref()?;
        let connections = self
            .peers
            .keys_of_kind(MediaKind::Screen)
            .into_iter()
            .filter(|key| {
                self.peers
                    .connection(key)
                    .map(|c| c.role() == NegotiationRole::Offerer)
                    .unwrap_or(false)
            })
            .collect();
        Some(ScreenShareState {
            stream_id: stream.id().to_string(),
            connections,
        })
    }

    /// Shares the screen with every participant. Calling it while a share
    /// is active returns the current share untouched. Incoming shares are
    /// torn down first: the newest negotiation per pair wins.
    pub async fn start_screen_share(&mut self) -> Result<ScreenShareState> {
        if let Some(state) = self.screen_share() {
            debug!("Screen share already active");
            return Ok(state);
        }
        if self.status != SessionStatus::Joined {
            return Err(Error::InvalidState(format!(
                "cannot share screen while {:?}",
                self.status
            )));
        }

        let stream = self.media.open_screen_stream()?;
        self.peers.set_local_media(MediaKind::Screen, Some(stream.clone()));
        self.screen_stream = Some(stream);
        self.signaling
            .send(SignalingMessage::ScreenShareStart { from_user_id: None })?;

        for id in self.roster.ids() {
            let key = ConnectionKey::screen(id.as_str());
            let answered = self
                .peers
                .connection(&key)
                .map(|c| c.role() == NegotiationRole::Answerer)
                .unwrap_or(false);
            if answered {
                info!("Replacing incoming screen share from {}", id);
                self.peers.close_connection(&key).await;
                self.set_sharing(&id, false);
            }
            if let Err(e) = self.peers.start_offer(&id, MediaKind::Screen).await {
                self.report(&e);
            }
        }

        let state = self.screen_share().ok_or_else(|| {
            Error::InvalidState("screen share vanished while starting".to_string())
        })?;
        info!("Screen share started to {} participant(s)", state.connections.len());
        self.emit(RoomEvent::ScreenShareChanged(Some(state.clone())));
        Ok(state)
    }

    pub async fn stop_screen_share(&mut self) -> Result<()> {
        let Some(stream) = self.screen_stream.take() else {
            return Ok(());
        };
        self.peers.close_offered(MediaKind::Screen).await;
        self.peers.set_local_media(MediaKind::Screen, None);
        stream.stop();
        if !self.status.is_terminal() {
            self.signaling
                .send(SignalingMessage::ScreenShareStop { from_user_id: None })?;
        }
        self.emit(RoomEvent::ScreenShareChanged(None));
        Ok(())
    }

    /// Streams to analyse for speaking indicators: the local microphone
    /// first, then each participant's remote audio.
    pub fn audio_streams(&self) -> Vec<(String, MediaStream)> {
        let mut streams = Vec::with_capacity(self.roster.len() + 1);
        if let Some(local) = &self.local_stream {
            streams.push((LOCAL_SUBJECT.to_string(), local.clone()));
        }
        for participant in self.roster.iter() {
            let key = ConnectionKey::audio(participant.id.as_str());
            if let Some(stream) = self.peers.connection(&key).and_then(|c| c.remote_stream()) {
                streams.push((participant.id.clone(), stream.clone()));
            }
        }
        streams
    }

    fn known_sender(&self, from_user_id: Option<String>, what: &str) -> Option<String> {
        match from_user_id {
            Some(id) if self.roster.contains(&id) => Some(id),
            Some(id) => {
                warn!("Dropping {} from unknown participant {}", what, id);
                None
            }
            None => {
                warn!("Dropping {} without sender", what);
                None
            }
        }
    }

    /// Applies one inbound signaling message.
    pub async fn handle_signal(&mut self, message: SignalingMessage) -> Result<()> {
        if self.status.is_terminal() {
            debug!("Ignoring {} after leaving", message.type_name());
            return Ok(());
        }

        match message {
            SignalingMessage::Joined {
                user_id,
                participants,
                ice_servers,
            } => {
                if self.status != SessionStatus::Joining {
                    warn!("Unexpected joined in {:?}", self.status);
                    return Ok(());
                }
                self.user_id = Some(user_id.clone());
                if !ice_servers.is_empty() {
                    self.set_ice_servers(ice_servers);
                }
                self.set_status(SessionStatus::Joined);

                for info in participants.into_iter().filter(|p| p.user_id != user_id) {
                    let id = info.user_id.clone();
                    if let Err(e) = self.add_participant(info.into()).await {
                        self.report(&e);
                        continue;
                    }
                    if let Err(e) = self.peers.start_offer(&id, MediaKind::Audio).await {
                        self.report(&e);
                    }
                }
            }
            SignalingMessage::ParticipantJoined {
                user_id,
                display_name,
                role,
            } => {
                if self.user_id.as_deref() == Some(user_id.as_str()) {
                    return Ok(());
                }
                self.add_participant(Participant::new(&user_id, display_name, role))
                    .await?;
                if self.screen_stream.is_some() {
                    self.peers.start_offer(&user_id, MediaKind::Screen).await?;
                    if let Some(state) = self.screen_share() {
                        self.emit(RoomEvent::ScreenShareChanged(Some(state)));
                    }
                }
            }
            SignalingMessage::ParticipantLeft { user_id } => {
                self.remove_participant(&user_id).await;
            }
            SignalingMessage::ParticipantMuted { user_id, muted } => {
                if let Some(participant) = self.roster.set_muted(&user_id, muted) {
                    let participant = participant.clone();
                    self.emit(RoomEvent::ParticipantUpdated(participant));
                }
            }
            SignalingMessage::ScreenShareStart { from_user_id } => {
                if let Some(id) = self.known_sender(from_user_id, "screen-share-start") {
                    self.set_sharing(&id, true);
                }
            }
            SignalingMessage::ScreenShareStop { from_user_id } => {
                if let Some(id) = self.known_sender(from_user_id, "screen-share-stop") {
                    self.set_sharing(&id, false);
                    let key = ConnectionKey::screen(id.as_str());
                    let answered = self
                        .peers
                        .connection(&key)
                        .map(|c| c.role() == NegotiationRole::Answerer)
                        .unwrap_or(false);
                    if answered {
                        self.peers.close_connection(&key).await;
                    }
                }
            }
            SignalingMessage::Offer { sdp, from_user_id, .. } => {
                if let Some(id) = self.known_sender(from_user_id, "offer") {
                    self.peers.handle_remote_offer(&id, MediaKind::Audio, &sdp).await?;
                }
            }
            SignalingMessage::ScreenOffer { sdp, from_user_id, .. } => {
                if let Some(id) = self.known_sender(from_user_id, "screen-offer") {
                    self.peers.handle_remote_offer(&id, MediaKind::Screen, &sdp).await?;
                }
            }
            SignalingMessage::Answer { sdp, from_user_id, .. } => {
                if let Some(id) = self.known_sender(from_user_id, "answer") {
                    self.peers.handle_remote_answer(&id, MediaKind::Audio, &sdp).await?;
                }
            }
            SignalingMessage::ScreenAnswer { sdp, from_user_id, .. } => {
                if let Some(id) = self.known_sender(from_user_id, "screen-answer") {
                    self.peers.handle_remote_answer(&id, MediaKind::Screen, &sdp).await?;
                }
            }
            SignalingMessage::IceCandidate {
                candidate,
                from_user_id,
                ..
            } => {
                if let Some(id) = self.known_sender(from_user_id, "ice-candidate") {
                    self.peers
                        .handle_ice_candidate(&id, MediaKind::Audio, candidate)
                        .await?;
                }
            }
            SignalingMessage::ScreenIceCandidate {
                candidate,
                from_user_id,
                ..
            } => {
                if let Some(id) = self.known_sender(from_user_id, "screen-ice-candidate") {
                    self.peers
                        .handle_ice_candidate(&id, MediaKind::Screen, candidate)
                        .await?;
                }
            }
            SignalingMessage::MeetingEnded { reason } => {
                info!(
                    "Meeting {} ended: {}",
                    self.meeting_id,
                    reason.as_deref().unwrap_or("no reason given")
                );
                self.teardown(SessionStatus::Ended).await;
            }
            SignalingMessage::Error { message, code } => {
                warn!("Server error: {} ({:?})", message, code);
                self.emit(RoomEvent::Error { message, code });
            }
            other => {
                debug!("Ignoring client-bound {}", other.type_name());
            }
        }
        Ok(())
    }

    fn set_sharing(&mut self, participant_id: &str, sharing: bool) {
        if let Some(participant) = self.roster.set_screen_sharing(participant_id, sharing) {
            let participant = participant.clone();
            self.emit(RoomEvent::ParticipantUpdated(participant));
        }
    }

    /// Applies one transport event. Losing an audio connection removes the
    /// participant in the same step.
    pub async fn handle_transport_event(&mut self, event: TransportEvent) -> Result<()> {
        let Some(outcome) = self.peers.handle_transport_event(event).await? else {
            return Ok(());
        };

        match outcome {
            PeerEvent::RemoteStream { key, stream } => {
                self.emit(RoomEvent::RemoteStream { key, stream });
            }
            PeerEvent::Connected(key) => self.emit(RoomEvent::Connected(key)),
            PeerEvent::Restarting(key) => self.emit(RoomEvent::Reconnecting(key)),
            PeerEvent::ConnectionLost { key, reason } => {
                warn!("{}: connection lost ({})", key, reason);
                self.emit(RoomEvent::ConnectionLost {
                    key: key.clone(),
                    reason,
                });
                match key.kind {
                    MediaKind::Audio => {
                        self.remove_participant(&key.participant_id).await;
                    }
                    MediaKind::Screen => {
                        if self.screen_stream.is_some() {
                            if let Some(state) = self.screen_share() {
                                self.emit(RoomEvent::ScreenShareChanged(Some(state)));
                            }
                        } else {
                            self.set_sharing(&key.participant_id, false);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn signaling_lost(&mut self, reason: Option<String>) {
        warn!("Signaling lost: {}", reason.as_deref().unwrap_or("closed"));
        self.emit(RoomEvent::Disconnected { reason });
        self.teardown(SessionStatus::Left).await;
    }

    /// Next event from the session's transports, for callers that drive the
    /// session without `run`.
    pub async fn next_transport_event(&mut self) -> Option<TransportEvent> {
        self.peers.next_event().await
    }

    pub async fn handle_command(&mut self, command: RoomCommand) -> Result<()> {
        match command {
            RoomCommand::SetMuted(muted) => self.toggle_mute(muted),
            RoomCommand::StartScreenShare => self.start_screen_share().await.map(|_| ()),
            RoomCommand::StopScreenShare => self.stop_screen_share().await,
            RoomCommand::Leave => self.leave().await,
        }
    }

    /// Drives the session until it is left or ended, or signaling drops.
    /// Joins first if the session has not joined yet.
    pub async fn run(&mut self, signaling: &mut SignalingClient) -> Result<()> {
        if self.status == SessionStatus::Idle {
            self.join().await?;
        }

        while !self.status.is_terminal() {
            let step = tokio::select! {
                event = signaling.receive() => Step::Signal(event),
                event = self.peers.next_event() => Step::Transport(event),
                command = self.commands_rx.recv() => Step::Command(command),
            };

            let outcome = match step {
                Step::Signal(Some(SignalingEvent::Message(message))) => {
                    self.handle_signal(message).await
                }
                Step::Signal(Some(SignalingEvent::Disconnected { reason })) => {
                    self.signaling_lost(reason).await;
                    Ok(())
                }
                Step::Signal(None) => {
                    self.signaling_lost(None).await;
                    Ok(())
                }
                Step::Transport(Some(event)) => self.handle_transport_event(event).await,
                Step::Command(Some(command)) => self.handle_command(command).await,
                Step::Transport(None) | Step::Command(None) => Ok(()),
            };

            if let Err(e) = outcome {
                self.report(&e);
            }
        }
        Ok(())
    }
}
