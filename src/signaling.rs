use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::media::MediaKind;
use crate::room::Role;

/// ICE candidate in the browser's JSON shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Roster entry carried by the `joined` acknowledgement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    pub user_id: String,
    pub display_name: String,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub screen_sharing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    #[serde(rename_all = "camelCase")]
    Join {
        meeting_id: String,
        display_name: String,
    },
    #[serde(rename_all = "camelCase")]
    Offer {
        sdp: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_user_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_user_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Answer {
        sdp: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_user_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_user_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        candidate: IceCandidate,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_user_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_user_id: Option<String>,
    },
    Leave,
    Mute {
        muted: bool,
    },
    RecordingOffer {
        sdp: String,
    },
    RecordingIce {
        candidate: IceCandidate,
    },
    RecordingStop,
    #[serde(rename_all = "camelCase")]
    ScreenShareStart {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_user_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ScreenShareStop {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_user_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ScreenOffer {
        sdp: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_user_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_user_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ScreenAnswer {
        sdp: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_user_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_user_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ScreenIceCandidate {
        candidate: IceCandidate,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_user_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_user_id: Option<String>,
    },

    // Server -> client acknowledgements and notifications.
    #[serde(rename_all = "camelCase")]
    Joined {
        user_id: String,
        #[serde(default)]
        participants: Vec<ParticipantInfo>,
        #[serde(default)]
        ice_servers: Vec<IceServer>,
    },
    #[serde(rename_all = "camelCase")]
    ParticipantJoined {
        user_id: String,
        display_name: String,
        #[serde(default)]
        role: Role,
    },
    #[serde(rename_all = "camelCase")]
    ParticipantLeft {
        user_id: String,
    },
    #[serde(rename_all = "camelCase")]
    ParticipantMuted {
        user_id: String,
        muted: bool,
    },
    MeetingEnded {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl SignalingMessage {
    pub fn offer(kind: MediaKind, target: &str, sdp: String) -> Self {
        let target_user_id = Some(target.to_string());
        match kind {
            MediaKind::Audio => SignalingMessage::Offer {
                sdp,
                target_user_id,
                from_user_id: None,
            },
            MediaKind::Screen => SignalingMessage::ScreenOffer {
                sdp,
                target_user_id,
                from_user_id: None,
            },
        }
    }

    pub fn answer(kind: MediaKind, target: &str, sdp: String) -> Self {
        let target_user_id = Some(target.to_string());
        match kind {
            MediaKind::Audio => SignalingMessage::Answer {
                sdp,
                target_user_id,
                from_user_id: None,
            },
            MediaKind::Screen => SignalingMessage::ScreenAnswer {
                sdp,
                target_user_id,
                from_user_id: None,
            },
        }
    }

    pub fn ice_candidate(kind: MediaKind, target: &str, candidate: IceCandidate) -> Self {
        let target_user_id = Some(target.to_string());
        match kind {
            MediaKind::Audio => SignalingMessage::IceCandidate {
                candidate,
                target_user_id,
                from_user_id: None,
            },
            MediaKind::Screen => SignalingMessage::ScreenIceCandidate {
                candidate,
                target_user_id,
                from_user_id: None,
            },
        }
    }

    /// Wire name of the message, for logs.
    pub fn type_name(&self) -> &'static str {
        match self {
            SignalingMessage::Join { .. } => "join",
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::IceCandidate { .. } => "ice-candidate",
            SignalingMessage::Leave => "leave",
            SignalingMessage::Mute { .. } => "mute",
            SignalingMessage::RecordingOffer { .. } => "recording-offer",
            SignalingMessage::RecordingIce { .. } => "recording-ice",
            SignalingMessage::RecordingStop => "recording-stop",
            SignalingMessage::ScreenShareStart { .. } => "screen-share-start",
            SignalingMessage::ScreenShareStop { .. } => "screen-share-stop",
            SignalingMessage::ScreenOffer { .. } => "screen-offer",
            SignalingMessage::ScreenAnswer { .. } => "screen-answer",
            SignalingMessage::ScreenIceCandidate { .. } => "screen-ice-candidate",
            SignalingMessage::Joined { .. } => "joined",
            SignalingMessage::ParticipantJoined { .. } => "participant-joined",
            SignalingMessage::ParticipantLeft { .. } => "participant-left",
            SignalingMessage::ParticipantMuted { .. } => "participant-muted",
            SignalingMessage::MeetingEnded { .. } => "meeting-ended",
            SignalingMessage::Error { .. } => "error",
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    Message(SignalingMessage),
    /// The channel is gone. Delivered once, after every message that arrived
    /// before the disconnect.
    Disconnected { reason: Option<String> },
}

/// Cloneable, non-blocking handle for outgoing signaling.
#[derive(Clone, Debug)]
pub struct SignalingSender {
    tx: mpsc::UnboundedSender<SignalingMessage>,
}

impl SignalingSender {
    /// A sender paired with the receiving end of its queue. The socket writer
    /// drains the receiver; tests inspect it directly.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SignalingMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, msg: SignalingMessage) -> Result<()> {
        debug!("-> {}", msg.type_name());
        self.tx
            .send(msg)
            .map_err(|e| Error::Signaling(format!("Failed to send message: {}", e)))
    }
}

pub struct SignalingClient {
    sender: SignalingSender,
    rx: mpsc::Receiver<SignalingEvent>,
    reader: JoinHandle<()>,
}

impl SignalingClient {
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws_stream, _) = connect_async(url).await?;
        info!("Signaling connected to {}", url);
        let (write, read) = ws_stream.split();
        Ok(Self::from_transport(write, read))
    }

    /// Runs the client over any text-frame sink/stream pair.
    pub fn from_transport<W, R>(write: W, read: R) -> Self
    where
        W: Sink<Message> + Send + Unpin + 'static,
        W::Error: Display,
        R: Stream<Item = std::result::Result<Message, WsError>> + Send + Unpin + 'static,
    {
        let (sender, outgoing_rx) = SignalingSender::channel();
        let (tx, rx) = mpsc::channel(100);

        // The writer is detached: it drains whatever is queued and exits once
        // every sender is gone, so a trailing `leave` still reaches the wire.
        tokio::spawn(write_loop(write, outgoing_rx));
        let reader = tokio::spawn(read_loop(read, tx));

        Self {
            sender,
            rx,
            reader,
        }
    }

    pub fn sender(&self) -> SignalingSender {
        self.sender.clone()
    }

    pub fn send(&self, msg: SignalingMessage) -> Result<()> {
        self.sender.send(msg)
    }

    /// Next inbound event, in arrival order. `None` once the disconnect has
    /// been delivered.
    pub async fn receive(&mut self) -> Option<SignalingEvent> {
        self.rx.recv().await
    }

    /// Feeds every event to `handler`, one at a time, until the channel
    /// disconnects.
    pub async fn on_message<F>(&mut self, mut handler: F)
    where
        F: FnMut(SignalingEvent),
    {
        while let Some(event) = self.receive().await {
            let done = matches!(event, SignalingEvent::Disconnected { .. });
            handler(event);
            if done {
                break;
            }
        }
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn write_loop<W>(mut write: W, mut outgoing: mpsc::UnboundedReceiver<SignalingMessage>)
where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    while let Some(msg) = outgoing.recv().await {
        let json = match msg.encode() {
            Ok(json) => json,
            Err(e) => {
                warn!("Dropping unencodable {} message: {}", msg.type_name(), e);
                continue;
            }
        };
        if let Err(e) = write.send(Message::Text(json)).await {
            warn!("Signaling write failed: {}", e);
            break;
        }
    }
    let _ = write.close().await;
}

async fn read_loop<R>(mut read: R, tx: mpsc::Sender<SignalingEvent>)
where
    R: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
{
    let reason = loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => match SignalingMessage::decode(&text) {
                Ok(msg) => {
                    debug!("<- {}", msg.type_name());
                    if tx.send(SignalingEvent::Message(msg)).await.is_err() {
                        return;
                    }
                }
                Err(e) => warn!("Dropping malformed signaling frame: {}", e),
            },
            Some(Ok(Message::Close(frame))) => {
                break frame.map(|f| f.reason.to_string()).filter(|r| !r.is_empty());
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => break Some(e.to_string()),
            None => break None,
        }
    };
    info!("Signaling disconnected: {}", reason.as_deref().unwrap_or("stream closed"));
    let _ = tx.send(SignalingEvent::Disconnected { reason }).await;
}
