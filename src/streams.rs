//! Remote stream bookkeeping.
//!
//! The wire protocol does not tag streams with an owning participant, so
//! departure attribution is best-effort: every track carries a liveness
//! flag its owning link flips on close, and pruning drops streams with no
//! live track left.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_remote::TrackRemote;

use crate::media::MediaKind;

/// Handle to one remote track.
#[derive(Clone)]
pub struct RemoteTrack {
    id: String,
    stream_id: String,
    kind: MediaKind,
    live: Arc<AtomicBool>,
    source: Option<Arc<TrackRemote>>,
}

impl RemoteTrack {
    pub fn new(track: Arc<TrackRemote>, live: Arc<AtomicBool>) -> Self {
        let kind = match track.kind() {
            RTPCodecType::Video => MediaKind::Video,
            _ => MediaKind::Audio,
        };
        Self {
            id: track.id().to_string(),
            stream_id: track.stream_id().to_string(),
            kind,
            live,
            source: Some(track),
        }
    }

    /// Handle with no engine track behind it.
    #[cfg(test)]
    pub(crate) fn detached(
        id: &str,
        stream_id: &str,
        kind: MediaKind,
        live: Arc<AtomicBool>,
    ) -> Self {
        Self {
            id: id.into(),
            stream_id: stream_id.into(),
            kind,
            live,
            source: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Relaxed)
    }

    /// Engine track for an external consumer, when one is attached.
    pub fn source(&self) -> Option<&Arc<TrackRemote>> {
        self.source.as_ref()
    }
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .field("live", &self.is_live())
            .finish()
    }
}

/// One remote stream: a stream id plus the tracks seen under it.
#[derive(Debug, Clone)]
pub struct RemoteStream {
    id: String,
    tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[RemoteTrack] {
        &self.tracks
    }

    pub fn has_live_track(&self) -> bool {
        self.tracks.iter().any(|t| t.is_live())
    }
}

/// The de-duplicated collection of streams to render.
#[derive(Debug, Default)]
pub struct RemoteStreamSet {
    streams: Vec<RemoteStream>,
}

impl RemoteStreamSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one track event into the set; returns true when it changed.
    ///
    /// A stream already present (matched by stream id, or by any shared
    /// track id) is never added again however many track events fire for
    /// it. A new track under a known stream id joins the existing entry.
    pub fn insert(&mut self, track: RemoteTrack) -> bool {
        if let Some(stream) = self
            .streams
            .iter_mut()
            .find(|s| s.id == track.stream_id())
        {
            if stream.tracks.iter().any(|t| t.id == track.id()) {
                return false;
            }
            stream.tracks.push(track);
            return true;
        }
        if self
            .streams
            .iter()
            .any(|s| s.tracks.iter().any(|t| t.id == track.id()))
        {
            return false;
        }
        self.streams.push(RemoteStream {
            id: track.stream_id().to_string(),
            tracks: vec![track],
        });
        true
    }

    /// Drop every stream with no live track left; returns how many went.
    pub fn prune_dead(&mut self) -> usize {
        let before = self.streams.len();
        self.streams.retain(|s| s.has_live_track());
        before - self.streams.len()
    }

    pub fn clear(&mut self) {
        self.streams.clear();
    }

    pub fn streams(&self) -> &[RemoteStream] {
        &self.streams
    }

    pub fn to_vec(&self) -> Vec<RemoteStream> {
        self.streams.clone()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}
