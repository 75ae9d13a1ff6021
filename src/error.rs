use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;
use webrtc::Error as WebRTCError;

use crate::media::{ConnectionKey, MediaKind};

#[derive(Debug, Error)]
pub enum Error {
    #[error("WebRTC error: {0}")]
    WebRTC(#[from] WebRTCError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Negotiation error for {participant_id}/{kind}: {message}")]
    Negotiation {
        participant_id: String,
        kind: MediaKind,
        message: String,
    },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The user or the platform refused access to a capture device.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Audio device error: {0}")]
    Device(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn negotiation(key: &ConnectionKey, message: impl Into<String>) -> Self {
        Error::Negotiation {
            participant_id: key.participant_id.clone(),
            kind: key.kind,
            message: message.into(),
        }
    }

    /// HTTP failures that must never be retried: expired credentials and
    /// sessions the backend no longer knows about.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::Http { status, .. } if *status == 401 || *status == 403 || *status == 404)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
