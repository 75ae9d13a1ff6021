//! Media primitives shared by the room, the negotiation layer and the level
//! analyzer: media kinds, connection keys, tracks and streams.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// What a negotiated connection carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Screen,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Screen => write!(f, "screen"),
        }
    }
}

/// Identifies one negotiated connection: there is at most one per
/// participant and media kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey {
    pub participant_id: String,
    pub kind: MediaKind,
}

impl ConnectionKey {
    pub fn new(participant_id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            participant_id: participant_id.into(),
            kind,
        }
    }

    pub fn audio(participant_id: impl Into<String>) -> Self {
        Self::new(participant_id, MediaKind::Audio)
    }

    pub fn screen(participant_id: impl Into<String>) -> Self {
        Self::new(participant_id, MediaKind::Screen)
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.participant_id, self.kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// A single native media track. Disabling keeps the track alive (no
/// renegotiation needed); stopping releases it for good.
pub trait MediaTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    fn is_enabled(&self) -> bool;
    fn set_enabled(&self, enabled: bool);
    fn stop(&self);
    fn is_live(&self) -> bool;
}

/// Track whose state is a pair of flags. Remote tracks and test tracks use it
/// directly; platform tracks wrap it.
#[derive(Debug)]
pub struct BasicTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    live: AtomicBool,
}

impl BasicTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
        }
    }

    pub fn audio(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::new(id, TrackKind::Audio))
    }

    pub fn video(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::new(id, TrackKind::Video))
    }
}

impl MediaTrack for BasicTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

/// A group of tracks. Cloning is cheap and shares the underlying tracks, so a
/// clone handed to an observer sees the owner's mute and stop calls.
#[derive(Clone, Debug)]
pub struct MediaStream {
    id: String,
    tracks: Vec<Arc<dyn MediaTrack>>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>, tracks: Vec<Arc<dyn MediaTrack>>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<dyn MediaTrack>] {
        &self.tracks
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &Arc<dyn MediaTrack>> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Audio)
    }

    pub fn has_audio(&self) -> bool {
        self.audio_tracks().next().is_some()
    }

    /// True while at least one track has not been stopped.
    pub fn is_live(&self) -> bool {
        self.tracks.iter().any(|t| t.is_live())
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        for track in self.audio_tracks() {
            track.set_enabled(enabled);
        }
    }

    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}
