//! Client side of a real-time meeting room: signaling, per-participant
//! audio and screen connections, local capture, speaking levels and the
//! assistant chat stream.

pub mod audio;
pub mod chat;
pub mod config;
pub mod connection;
pub mod error;
pub mod levels;
pub mod media;
pub mod peers;
pub mod room;
pub mod rtc;
pub mod settings;
pub mod signaling;

#[cfg(test)]
mod tests;

pub use config::Config;
pub use error::{Error, Result};
pub use media::{ConnectionKey, MediaKind, MediaStream};
pub use room::{RoomEvent, RoomHandle, RoomSession, SessionStatus};
pub use signaling::{SignalingClient, SignalingMessage};
