//! Per-(participant, kind) negotiation: offers, answers, candidate
//! buffering, ICE restart and teardown.

pub mod transport;

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionMonitor, NegotiationInput, NegotiationRole, NegotiationState};
use crate::error::{Error, Result};
use crate::media::{ConnectionKey, MediaKind, MediaStream};
use crate::signaling::{IceCandidate, IceServer, SignalingMessage, SignalingSender};

pub use transport::{
    IceConnectionState, MediaTransport, MediaTransportFactory, TransportEvent, TransportEventKind,
    TransportEventSink,
};

/// ICE restarts allowed before a connection is given up on.
pub const MAX_ICE_RESTARTS: u32 = 1;

pub struct MediaConnection {
    key: ConnectionKey,
    state: NegotiationState,
    role: NegotiationRole,
    generation: u64,
    transport: Box<dyn MediaTransport>,
    pending_candidates: Vec<IceCandidate>,
    remote_stream: Option<MediaStream>,
    restarts: u32,
}

impl MediaConnection {
    pub fn participant_id(&self) -> &str {
        &self.key.participant_id
    }

    pub fn kind(&self) -> MediaKind {
        self.key.kind
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn role(&self) -> NegotiationRole {
        self.role
    }

    /// Identifies the underlying transport instance; changes whenever the
    /// connection is rebuilt.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn remote_stream(&self) -> Option<&MediaStream> {
        self.remote_stream.as_ref()
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    fn advance(&mut self, input: NegotiationInput) -> Result<()> {
        match self.state.next(input) {
            Some(next) => {
                debug!("{}: {} -> {} ({:?})", self.key, self.state, next, input);
                self.state = next;
                Ok(())
            }
            None => Err(Error::negotiation(
                &self.key,
                format!("{:?} not allowed in state {}", input, self.state),
            )),
        }
    }

    async fn flush_candidates(&mut self) {
        for candidate in std::mem::take(&mut self.pending_candidates) {
            if let Err(e) = self.transport.add_remote_candidate(&candidate).await {
                warn!("{}: buffered candidate rejected: {}", self.key, e);
            }
        }
    }
}

/// What the room needs to hear about after a transport event.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    RemoteStream {
        key: ConnectionKey,
        stream: MediaStream,
    },
    Connected(ConnectionKey),
    Restarting(ConnectionKey),
    /// Restart budget exhausted; the connection has been torn down.
    ConnectionLost {
        key: ConnectionKey,
        reason: String,
    },
}

pub struct PeerConnectionManager {
    factory: Arc<dyn MediaTransportFactory>,
    signaling: SignalingSender,
    ice_servers: Vec<IceServer>,
    local_media: HashMap<MediaKind, MediaStream>,
    connections: HashMap<ConnectionKey, MediaConnection>,
    next_generation: u64,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: mpsc::UnboundedReceiver<TransportEvent>,
    monitor: ConnectionMonitor,
}

impl PeerConnectionManager {
    pub fn new(factory: Arc<dyn MediaTransportFactory>, signaling: SignalingSender) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            factory,
            signaling,
            ice_servers: Vec::new(),
            local_media: HashMap::new(),
            connections: HashMap::new(),
            next_generation: 1,
            events_tx,
            events_rx,
            monitor: ConnectionMonitor::new(),
        }
    }

    pub fn set_ice_servers(&mut self, ice_servers: Vec<IceServer>) {
        self.ice_servers = ice_servers;
    }

    /// Media attached to connections of `kind` created from now on.
    pub fn set_local_media(&mut self, kind: MediaKind, stream: Option<MediaStream>) {
        match stream {
            Some(stream) => self.local_media.insert(kind, stream),
            None => self.local_media.remove(&kind),
        };
    }

    pub fn monitor(&self) -> &ConnectionMonitor {
        &self.monitor
    }

    pub fn connection(&self, key: &ConnectionKey) -> Option<&MediaConnection> {
        self.connections.get(key)
    }

    pub fn state_of(&self, key: &ConnectionKey) -> Option<NegotiationState> {
        self.connections.get(key).map(|c| c.state)
    }

    pub fn keys(&self) -> Vec<ConnectionKey> {
        let mut keys: Vec<_> = self.connections.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn keys_of_kind(&self, kind: MediaKind) -> Vec<ConnectionKey> {
        self.keys().into_iter().filter(|k| k.kind == kind).collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Next event from any live or recently closed transport.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events_rx.recv().await
    }

    /// Returns the connection for `(participant_id, kind)`, allocating a fresh
    /// one in `new` only if none exists.
    pub async fn create_or_get_connection(
        &mut self,
        participant_id: &str,
        kind: MediaKind,
    ) -> Result<&MediaConnection> {
        let key = ConnectionKey::new(participant_id, kind);
        if !self.connections.contains_key(&key) {
            let connection = self.allocate(key.clone(), 0).await?;
            self.connections.insert(key.clone(), connection);
        }
        self.connection(&key)
            .ok_or_else(|| Error::negotiation(&key, "connection vanished after allocation"))
    }

    /// Sends a local offer on a connection that has not started negotiating.
    /// A connection already past `new` is left alone.
    pub async fn start_offer(&mut self, participant_id: &str, kind: MediaKind) -> Result<()> {
        self.create_or_get_connection(participant_id, kind).await?;
        let key = ConnectionKey::new(participant_id, kind);
        self.offer_on(&key).await
    }

    async fn offer_on(&mut self, key: &ConnectionKey) -> Result<()> {
        let connection = self
            .connections
            .get_mut(key)
            .ok_or_else(|| Error::negotiation(key, "no connection to offer on"))?;
        if connection.state != NegotiationState::New {
            debug!("{}: already negotiating ({})", key, connection.state);
            return Ok(());
        }

        let sdp = connection.transport.create_offer().await?;
        connection.advance(NegotiationInput::LocalOffer)?;
        connection.role = NegotiationRole::Offerer;
        self.monitor.update_state(key, connection.state);

        self.signaling
            .send(SignalingMessage::offer(key.kind, &key.participant_id, sdp))
    }

    /// Applies a remote offer and answers it. An offer for a connection that
    /// is already past `new` replaces that connection: the last negotiation
    /// wins.
    pub async fn handle_remote_offer(
        &mut self,
        participant_id: &str,
        kind: MediaKind,
        sdp: &str,
    ) -> Result<()> {
        let key = ConnectionKey::new(participant_id, kind);

        let carried_restarts = match self.connections.get(&key) {
            Some(existing) if existing.state != NegotiationState::New => {
                info!(
                    "{}: offer received in state {}, replacing connection",
                    key, existing.state
                );
                Some(existing.restarts)
            }
            Some(_) => None,
            None => Some(0),
        };
        if let Some(restarts) = carried_restarts {
            self.close_connection(&key).await;
            let connection = self.allocate(key.clone(), restarts).await?;
            self.connections.insert(key.clone(), connection);
        }

        let connection = self
            .connections
            .get_mut(&key)
            .ok_or_else(|| Error::negotiation(&key, "no connection for offer"))?;

        connection.transport.apply_remote_offer(sdp).await?;
        connection.advance(NegotiationInput::RemoteOffer)?;
        connection.role = NegotiationRole::Answerer;
        connection.flush_candidates().await;

        let answer = connection.transport.create_answer().await?;
        connection.advance(NegotiationInput::LocalAnswer)?;
        self.monitor.update_state(&key, connection.state);

        self.signaling
            .send(SignalingMessage::answer(kind, participant_id, answer))
    }

    pub async fn handle_remote_answer(
        &mut self,
        participant_id: &str,
        kind: MediaKind,
        sdp: &str,
    ) -> Result<()> {
        let key = ConnectionKey::new(participant_id, kind);
        let Some(connection) = self.connections.get_mut(&key) else {
            warn!("{}: answer for unknown connection ignored", key);
            return Ok(());
        };
        if connection.state != NegotiationState::HaveLocalOffer {
            warn!("{}: answer ignored in state {}", key, connection.state);
            return Ok(());
        }

        connection.transport.apply_remote_answer(sdp).await?;
        connection.advance(NegotiationInput::RemoteAnswer)?;
        connection.flush_candidates().await;
        self.monitor.update_state(&key, connection.state);
        Ok(())
    }

    /// Applies a remote candidate, or buffers it until a remote description
    /// has been applied. Buffered candidates are flushed in receipt order.
    /// Candidates for a connection that does not exist are dropped.
    pub async fn handle_ice_candidate(
        &mut self,
        participant_id: &str,
        kind: MediaKind,
        candidate: IceCandidate,
    ) -> Result<()> {
        let key = ConnectionKey::new(participant_id, kind);
        let Some(connection) = self.connections.get_mut(&key) else {
            warn!("{}: candidate for unknown connection dropped", key);
            return Ok(());
        };

        if connection.state.accepts_remote_candidates() {
            if let Err(e) = connection.transport.add_remote_candidate(&candidate).await {
                warn!("{}: candidate rejected: {}", key, e);
            }
        } else {
            debug!("{}: buffering candidate in state {}", key, connection.state);
            connection.pending_candidates.push(candidate);
        }
        Ok(())
    }

    /// Removes the connection and releases its transport and remote stream.
    /// Returns once the transport is closed; later events from it are ignored.
    pub async fn close_connection(&mut self, key: &ConnectionKey) -> bool {
        let Some(mut connection) = self.connections.remove(key) else {
            return false;
        };
        self.monitor.remove(key);
        let _ = connection.advance(NegotiationInput::Close);
        if let Some(stream) = connection.remote_stream.take() {
            stream.stop();
        }
        if let Err(e) = connection.transport.close().await {
            warn!("{}: transport close failed: {}", key, e);
        }
        debug!("{}: closed (generation {})", key, connection.generation);
        true
    }

    pub async fn close_participant(&mut self, participant_id: &str) {
        for kind in [MediaKind::Audio, MediaKind::Screen] {
            self.close_connection(&ConnectionKey::new(participant_id, kind))
                .await;
        }
    }

    /// Closes every connection of `kind` this side offered.
    pub async fn close_offered(&mut self, kind: MediaKind) {
        let keys: Vec<_> = self
            .connections
            .values()
            .filter(|c| c.key.kind == kind && c.role == NegotiationRole::Offerer)
            .map(|c| c.key.clone())
            .collect();
        for key in keys {
            self.close_connection(&key).await;
        }
    }

    pub async fn close_all(&mut self) {
        for key in self.keys() {
            self.close_connection(&key).await;
        }
    }

    pub async fn handle_transport_event(&mut self, event: TransportEvent) -> Result<Option<PeerEvent>> {
        let connection = match self.connections.get_mut(&event.key) {
            Some(c) if c.generation == event.generation => c,
            _ => {
                debug!(
                    "{}: dropping event from stale transport (generation {})",
                    event.key, event.generation
                );
                return Ok(None);
            }
        };

        match event.kind {
            TransportEventKind::LocalCandidate(candidate) => {
                self.signaling.send(SignalingMessage::ice_candidate(
                    event.key.kind,
                    &event.key.participant_id,
                    candidate,
                ))?;
                Ok(None)
            }
            TransportEventKind::RemoteStream(stream) => {
                connection.remote_stream = Some(stream.clone());
                Ok(Some(PeerEvent::RemoteStream {
                    key: event.key,
                    stream,
                }))
            }
            TransportEventKind::IceState(IceConnectionState::Connected)
            | TransportEventKind::IceState(IceConnectionState::Completed) => {
                connection.restarts = 0;
                Ok(Some(PeerEvent::Connected(event.key)))
            }
            TransportEventKind::IceState(IceConnectionState::Failed) => {
                self.handle_ice_failure(&event.key).await
            }
            TransportEventKind::IceState(state) => {
                debug!("{}: ICE {:?}", event.key, state);
                Ok(None)
            }
        }
    }

    async fn handle_ice_failure(&mut self, key: &ConnectionKey) -> Result<Option<PeerEvent>> {
        let Some(connection) = self.connections.get_mut(key) else {
            return Ok(None);
        };

        if connection.restarts >= MAX_ICE_RESTARTS || connection.state == NegotiationState::Failed {
            warn!("{}: ICE failed after restart, tearing down", key);
            self.close_connection(key).await;
            return Ok(Some(PeerEvent::ConnectionLost {
                key: key.clone(),
                reason: "ICE failed after restart".to_string(),
            }));
        }

        let restarts = connection.restarts + 1;
        let role = connection.role;
        match role {
            NegotiationRole::Offerer => {
                info!("{}: ICE failed, restarting (attempt {})", key, restarts);
                self.close_connection(key).await;
                let connection = self.allocate(key.clone(), restarts).await?;
                self.connections.insert(key.clone(), connection);
                self.offer_on(key).await?;
            }
            NegotiationRole::Answerer => {
                info!("{}: ICE failed, waiting for the offerer to restart", key);
                connection.restarts = restarts;
                connection.advance(NegotiationInput::IceFailed)?;
                connection.pending_candidates.clear();
                self.monitor.update_state(key, connection.state);
            }
        }
        Ok(Some(PeerEvent::Restarting(key.clone())))
    }

    async fn allocate(&mut self, key: ConnectionKey, restarts: u32) -> Result<MediaConnection> {
        let generation = self.next_generation;
        self.next_generation += 1;

        let sink = TransportEventSink::new(key.clone(), generation, self.events_tx.clone());
        let local = self.local_media.get(&key.kind);
        let transport = self.factory.create(&self.ice_servers, local, sink).await?;
        debug!("{}: allocated transport (generation {})", key, generation);
        self.monitor.update_state(&key, NegotiationState::New);

        Ok(MediaConnection {
            key,
            state: NegotiationState::New,
            role: NegotiationRole::Answerer,
            generation,
            transport,
            pending_candidates: Vec::new(),
            remote_stream: None,
            restarts,
        })
    }
}
