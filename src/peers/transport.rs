//! Capability boundary between the negotiation state machine and whatever
//! actually moves media (a `webrtc` peer connection, or a fake in tests).

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::media::{ConnectionKey, MediaStream};
use crate::signaling::{IceCandidate, IceServer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone)]
pub enum TransportEventKind {
    LocalCandidate(IceCandidate),
    IceState(IceConnectionState),
    RemoteStream(MediaStream),
}

/// An event raised by one transport instance. `generation` identifies the
/// instance, so events from a transport that has since been closed or
/// replaced can be recognised and discarded.
#[derive(Debug, Clone)]
pub struct TransportEvent {
    pub key: ConnectionKey,
    pub generation: u64,
    pub kind: TransportEventKind,
}

/// Handed to each transport at creation; the only way it can talk back.
#[derive(Clone, Debug)]
pub struct TransportEventSink {
    key: ConnectionKey,
    generation: u64,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportEventSink {
    pub fn new(key: ConnectionKey, generation: u64, tx: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self { key, generation, tx }
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn emit(&self, kind: TransportEventKind) {
        let _ = self.tx.send(TransportEvent {
            key: self.key.clone(),
            generation: self.generation,
            kind,
        });
    }
}

#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Creates an offer and applies it as the local description.
    async fn create_offer(&self) -> Result<String>;

    async fn apply_remote_offer(&self, sdp: &str) -> Result<()>;

    /// Creates an answer to the applied remote offer and applies it locally.
    async fn create_answer(&self) -> Result<String>;

    async fn apply_remote_answer(&self, sdp: &str) -> Result<()>;

    async fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<()>;

    /// Releases the native connection. No events are raised afterwards.
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait MediaTransportFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        local_media: Option<&MediaStream>,
        events: TransportEventSink,
    ) -> Result<Box<dyn MediaTransport>>;
}
