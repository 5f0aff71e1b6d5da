//! Mesh video-chat orchestration over a relay signaling channel.
//!
//! Participants join a named room and hold one direct media link per remote
//! peer. The [`MeshCoordinator`] turns the relay's message stream into a
//! self-healing mesh: it owns the roster, decides who initiates each
//! negotiation, recovers from transport drops, and publishes the remote
//! stream set and participant list for a rendering layer, which only ever
//! reads that state and issues the four commands (join, leave, toggle
//! audio, toggle video).

mod config;
mod error;
mod media;
mod mesh;
mod peer;
mod room;
mod signaling;
mod storage;
mod streams;

pub use config::MeshConfig;
pub use error::{Error, Result};
pub use media::{
    AudioCapture, LocalMediaSource, LocalStream, LocalTrack, MediaConstraints, MediaKind,
};
pub use mesh::MeshCoordinator;
pub use peer::{InitiatorPhase, Negotiation, PeerEvent, PeerLink, ResponderPhase};
pub use room::{RoomLifecycle, RoomPublisher, RoomSnapshot};
pub use signaling::{ReconnectPolicy, SignalMessage, SignalSender, SignalingClient};
pub use storage::RoomStore;
pub use streams::{RemoteStream, RemoteStreamSet, RemoteTrack};
