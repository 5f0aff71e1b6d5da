//! One direct media link to exactly one remote participant.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::TrackLocal;

use crate::error::{Error, Result};
use crate::media::LocalStream;
use crate::streams::RemoteTrack;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitiatorPhase {
    AwaitingAnswer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponderPhase {
    AnswerSent,
}

/// Negotiation state of one link.
///
/// Role and phase are explicit tagged variants so an illegal transition —
/// an answer arriving before any offer went out — is an error, not a
/// silently mishandled flag combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiation {
    Uninitiated,
    Initiator(InitiatorPhase),
    Responder(ResponderPhase),
    Connected,
    Closed,
}

/// Events a link reports back to its coordinator.
#[derive(Debug)]
pub enum PeerEvent {
    LocalCandidate {
        peer: String,
        candidate: RTCIceCandidateInit,
    },
    RemoteTrack {
        peer: String,
        track: RemoteTrack,
    },
    IceState {
        peer: String,
        state: RTCIceConnectionState,
    },
    LinkState {
        peer: String,
        state: RTCPeerConnectionState,
    },
}

/// One bidirectional media connection, owned by exactly one roster entry
/// and closed — never just dropped — when that entry is removed.
pub struct PeerLink {
    peer_id: String,
    pc: Arc<RTCPeerConnection>,
    negotiation: Arc<Mutex<Negotiation>>,
    remote_live: Arc<Mutex<Vec<Arc<AtomicBool>>>>,
}

impl PeerLink {
    pub async fn connect(
        peer_id: &str,
        ice_servers: &[String],
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let api = APIBuilder::new().with_media_engine(media_engine).build();

        let config = RTCConfiguration {
            ice_servers: if ice_servers.is_empty() {
                Vec::new()
            } else {
                vec![RTCIceServer {
                    urls: ice_servers.to_vec(),
                    ..Default::default()
                }]
            },
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await?);
        let negotiation = Arc::new(Mutex::new(Negotiation::Uninitiated));
        let remote_live: Arc<Mutex<Vec<Arc<AtomicBool>>>> = Arc::new(Mutex::new(Vec::new()));

        let ev = events.clone();
        let id = peer_id.to_string();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let ev = ev.clone();
            let id = id.clone();
            Box::pin(async move {
                match candidate {
                    Some(c) => match c.to_json() {
                        // Dropping on a full queue is fine: candidate loss
                        // is tolerated, a wedged callback is not.
                        Ok(init) => {
                            if ev
                                .try_send(PeerEvent::LocalCandidate {
                                    peer: id.clone(),
                                    candidate: init,
                                })
                                .is_err()
                            {
                                debug!(peer = %id, "event queue gone; candidate dropped");
                            }
                        }
                        Err(e) => warn!(peer = %id, "failed to encode ICE candidate: {}", e),
                    },
                    None => debug!(peer = %id, "ICE candidate gathering complete"),
                }
            })
        }));

        let ev = events.clone();
        let id = peer_id.to_string();
        let live_registry = remote_live.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let ev = ev.clone();
            let id = id.clone();
            // The liveness flag stays with this link; closing the link is
            // what marks the track dead for the stream set.
            let live = Arc::new(AtomicBool::new(true));
            live_registry.lock().push(live.clone());
            let remote = RemoteTrack::new(track, live);
            Box::pin(async move {
                debug!(peer = %id, track = remote.id(), "remote track arrived");
                let _ = ev.try_send(PeerEvent::RemoteTrack {
                    peer: id,
                    track: remote,
                });
            })
        }));

        let ev = events.clone();
        let id = peer_id.to_string();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let ev = ev.clone();
            let id = id.clone();
            Box::pin(async move {
                debug!(peer = %id, "ICE connection state: {}", state);
                let _ = ev.try_send(PeerEvent::IceState { peer: id, state });
            })
        }));

        let ev = events;
        let id = peer_id.to_string();
        let neg = negotiation.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let ev = ev.clone();
            let id = id.clone();
            let neg = neg.clone();
            Box::pin(async move {
                info!(peer = %id, "peer connection state: {}", state);
                if state == RTCPeerConnectionState::Connected {
                    let mut guard = neg.lock();
                    if *guard != Negotiation::Closed {
                        *guard = Negotiation::Connected;
                    }
                }
                let _ = ev.try_send(PeerEvent::LinkState { peer: id, state });
            })
        }));

        Ok(Self {
            peer_id: peer_id.to_string(),
            pc,
            negotiation,
            remote_live,
        })
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn negotiation(&self) -> Negotiation {
        *self.negotiation.lock()
    }

    /// Attach every local track; all links share the same capture tracks.
    pub async fn attach_local(&self, stream: &LocalStream) -> Result<()> {
        for track in stream.tracks() {
            self.pc
                .add_track(track.rtc() as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
        }
        Ok(())
    }

    pub async fn create_offer(&self) -> Result<RTCSessionDescription> {
        self.ensure_open()?;
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        *self.negotiation.lock() = Negotiation::Initiator(InitiatorPhase::AwaitingAnswer);
        Ok(offer)
    }

    pub async fn accept_offer(&self, offer: RTCSessionDescription) -> Result<RTCSessionDescription> {
        self.ensure_open()?;
        self.pc.set_remote_description(offer).await?;
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        *self.negotiation.lock() = Negotiation::Responder(ResponderPhase::AnswerSent);
        Ok(answer)
    }

    /// Apply a remote answer. Legal only while awaiting one as initiator;
    /// anything else is a stale or out-of-order message for the caller to
    /// drop.
    pub async fn accept_answer(&self, answer: RTCSessionDescription) -> Result<()> {
        match self.negotiation() {
            Negotiation::Initiator(InitiatorPhase::AwaitingAnswer) => {}
            state => {
                return Err(Error::Negotiation(format!(
                    "answer while link is {:?}",
                    state
                )))
            }
        }
        self.pc.set_remote_description(answer).await?;
        *self.negotiation.lock() = Negotiation::Connected;
        Ok(())
    }

    /// Candidates arriving before the remote description are a loss by
    /// design; the caller drops them.
    pub async fn add_remote_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        self.ensure_open()?;
        if self.pc.remote_description().await.is_none() {
            return Err(Error::Negotiation(
                "candidate before remote description".into(),
            ));
        }
        self.pc.add_ice_candidate(candidate).await?;
        Ok(())
    }

    /// Transport-level recovery: a fresh offer with ICE restart. The link
    /// keeps its roster entry; this is not a teardown.
    pub async fn restart_ice(&self) -> Result<RTCSessionDescription> {
        self.ensure_open()?;
        let offer = self
            .pc
            .create_offer(Some(RTCOfferOptions {
                ice_restart: true,
                ..Default::default()
            }))
            .await?;
        self.pc.set_local_description(offer.clone()).await?;
        *self.negotiation.lock() = Negotiation::Initiator(InitiatorPhase::AwaitingAnswer);
        Ok(offer)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.negotiation() == Negotiation::Closed {
            return Err(Error::Negotiation("link is closed".into()));
        }
        Ok(())
    }

    /// Close the connection and kill every remote track it delivered.
    pub async fn close(&self) {
        *self.negotiation.lock() = Negotiation::Closed;
        for flag in self.remote_live.lock().iter() {
            flag.store(false, Ordering::Relaxed);
        }
        if let Err(e) = self.pc.close().await {
            warn!(peer = %self.peer_id, "error closing peer connection: {}", e);
        }
    }
}
