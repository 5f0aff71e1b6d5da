//! The mesh coordinator.
//!
//! Owns the participant roster and the set of peer links, consumes
//! signaling messages and local media changes, decides who initiates each
//! negotiation, and publishes the remote stream set and roster for the
//! rendering layer.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::config::MeshConfig;
use crate::error::Result;
use crate::media::{random_id, AudioCapture, LocalMediaSource, MediaKind};
use crate::peer::{Negotiation, PeerEvent, PeerLink};
use crate::room::{RoomLifecycle, RoomPublisher, RoomSnapshot};
use crate::signaling::{SignalMessage, SignalSender, SignalingClient};
use crate::storage::RoomStore;
use crate::streams::RemoteStreamSet;

const USER_ID_LEN: usize = 8;
const ROOM_ID_LEN: usize = 6;

/// One remote participant and the link serving it.
struct Participant {
    id: String,
    link: Arc<PeerLink>,
}

struct RoomState {
    lifecycle: RoomLifecycle,
    room_id: Option<String>,
    /// Bumped on every join and leave; tasks belonging to an abandoned
    /// room observe the mismatch and stop, so stray messages for it are
    /// ignored.
    epoch: u64,
    roster: HashMap<String, Participant>,
    streams: RemoteStreamSet,
    media: LocalMediaSource,
    audio_enabled: bool,
    video_enabled: bool,
    signal: Option<SignalSender>,
    signal_close: Option<Arc<watch::Sender<bool>>>,
    stop: Option<Arc<watch::Sender<bool>>>,
    peer_tx: mpsc::Sender<PeerEvent>,
    capture: Option<AudioCapture>,
}

struct Shared {
    config: MeshConfig,
    user_id: String,
    store: Option<RoomStore>,
    state: Mutex<RoomState>,
    publisher: RoomPublisher,
}

/// Public handle: the four commands plus state reads.
pub struct MeshCoordinator {
    shared: Arc<Shared>,
}

impl MeshCoordinator {
    pub fn new(config: MeshConfig) -> Self {
        let user_id = random_id(USER_ID_LEN);
        let publisher = RoomPublisher::new(&user_id);
        let store = config.storage_path.clone().map(RoomStore::new);
        // Placeholder until a join installs a live channel.
        let (peer_tx, _peer_rx) = mpsc::channel(1);
        let state = RoomState {
            lifecycle: RoomLifecycle::Idle,
            room_id: None,
            epoch: 0,
            roster: HashMap::new(),
            streams: RemoteStreamSet::new(),
            media: LocalMediaSource::new(),
            audio_enabled: false,
            video_enabled: false,
            signal: None,
            signal_close: None,
            stop: None,
            peer_tx,
            capture: None,
        };
        Self {
            shared: Arc::new(Shared {
                config,
                user_id,
                store,
                state: Mutex::new(state),
                publisher,
            }),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.shared.user_id
    }

    pub fn subscribe(&self) -> watch::Receiver<RoomSnapshot> {
        self.shared.publisher.subscribe()
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        self.shared.publisher.snapshot()
    }

    /// Negotiation state of the link toward `peer_id`, when one exists.
    pub async fn peer_negotiation(&self, peer_id: &str) -> Option<Negotiation> {
        self.shared
            .state
            .lock()
            .await
            .roster
            .get(peer_id)
            .map(|p| p.link.negotiation())
    }

    /// Join a room, acquiring fresh local media and opening the signaling
    /// channel. With no argument a random room id is generated. Returns
    /// the room id actually joined.
    pub async fn join_room(&self, room_id: Option<String>) -> Result<String> {
        let busy = self.shared.state.lock().await.lifecycle != RoomLifecycle::Idle;
        if busy {
            self.leave_room().await?;
        }

        let mut st = self.shared.state.lock().await;
        st.lifecycle = RoomLifecycle::Joining;
        self.shared.clear_error();
        self.shared.publish_locked(&st);

        // Media failure is fatal to the join attempt; transport failures
        // later are not.
        let acquired = st.media.acquire(&self.shared.config.media).map(|_| ());
        if let Err(e) = acquired {
            st.lifecycle = RoomLifecycle::Idle;
            self.shared.publish_locked(&st);
            self.shared.set_error(&e.to_string());
            return Err(e);
        }
        if self.shared.config.capture_audio {
            let track = st.media.current().and_then(|s| s.audio_track()).cloned();
            if let Some(track) = track {
                match AudioCapture::start(track) {
                    Ok(capture) => st.capture = Some(capture),
                    Err(e) => {
                        st.media.release();
                        st.lifecycle = RoomLifecycle::Idle;
                        self.shared.publish_locked(&st);
                        self.shared.set_error(&e.to_string());
                        return Err(e);
                    }
                }
            }
        }
        st.audio_enabled = true;
        st.video_enabled = true;

        let room = room_id.unwrap_or_else(|| random_id(ROOM_ID_LEN));
        if let Some(store) = &self.shared.store {
            if let Err(e) = store.save(&room) {
                warn!("failed to persist room id: {}", e);
            }
        }
        st.room_id = Some(room.clone());
        st.epoch += 1;
        let epoch = st.epoch;

        let (peer_tx, peer_rx) = mpsc::channel(64);
        st.peer_tx = peer_tx;
        let (stop_tx, stop_rx) = watch::channel(false);
        st.stop = Some(Arc::new(stop_tx));
        self.shared.publish_locked(&st);
        drop(st);

        info!(room = %room, user = %self.shared.user_id, "joining room");
        tokio::spawn(run_loop(
            self.shared.clone(),
            epoch,
            room.clone(),
            peer_rx,
            stop_rx,
        ));
        Ok(room)
    }

    /// Rejoin the room remembered from a prior session, if one is stored.
    pub async fn rejoin_stored(&self) -> Result<Option<String>> {
        let stored = self.shared.store.as_ref().and_then(|s| s.load());
        match stored {
            Some(id) => {
                info!(room = %id, "rejoining stored room");
                Ok(Some(self.join_room(Some(id)).await?))
            }
            None => Ok(None),
        }
    }

    /// Leave the current room. Safe in any state, including mid-negotiation:
    /// closes every peer link, tears down the signaling channel, stops local
    /// media and clears the persisted room id.
    pub async fn leave_room(&self) -> Result<()> {
        let mut st = self.shared.state.lock().await;
        if st.lifecycle == RoomLifecycle::Idle {
            return Ok(());
        }
        st.lifecycle = RoomLifecycle::Leaving;
        self.shared.publish_locked(&st);

        if let Some(room) = st.room_id.clone() {
            // Best-effort departure notice.
            self.shared
                .send_locked(
                    &st,
                    SignalMessage::Leave {
                        room_id: room,
                        user_id: self.shared.user_id.clone(),
                    },
                )
                .await;
        }

        st.epoch += 1;
        if let Some(stop) = st.stop.take() {
            let _ = stop.send(true);
        }
        if let Some(close) = st.signal_close.take() {
            let _ = close.send(true);
        }
        st.signal = None;

        for (_, participant) in st.roster.drain() {
            debug!(peer = %participant.id, "closing peer link");
            participant.link.close().await;
        }
        st.streams.clear();
        if st.capture.take().is_some() {
            debug!("stopped audio capture");
        }
        st.media.release();
        st.audio_enabled = false;
        st.video_enabled = false;
        st.room_id = None;
        if let Some(store) = &self.shared.store {
            if let Err(e) = store.clear() {
                warn!("failed to clear persisted room id: {}", e);
            }
        }
        st.lifecycle = RoomLifecycle::Idle;
        self.shared.publish_locked(&st);
        info!("left room");
        Ok(())
    }

    /// Flip audio enablement on the current local stream. Returns the new
    /// state. No renegotiation: receivers see a muted track.
    pub async fn toggle_audio(&self) -> bool {
        self.toggle(MediaKind::Audio).await
    }

    /// Flip video enablement on the current local stream. Returns the new
    /// state.
    pub async fn toggle_video(&self) -> bool {
        self.toggle(MediaKind::Video).await
    }

    async fn toggle(&self, kind: MediaKind) -> bool {
        let mut st = self.shared.state.lock().await;
        let enabled = match kind {
            MediaKind::Audio => !st.audio_enabled,
            MediaKind::Video => !st.video_enabled,
        };
        if !st.media.set_enabled(kind, enabled) {
            debug!("toggle with no active local stream");
            return false;
        }
        match kind {
            MediaKind::Audio => st.audio_enabled = enabled,
            MediaKind::Video => st.video_enabled = enabled,
        }
        self.shared.publish_locked(&st);
        enabled
    }
}

impl Shared {
    fn publish_locked(&self, st: &RoomState) {
        let mut participants: Vec<String> = st.roster.keys().cloned().collect();
        participants.sort();
        let streams = st.streams.to_vec();
        let lifecycle = st.lifecycle;
        let room_id = st.room_id.clone();
        let audio = st.audio_enabled;
        let video = st.video_enabled;
        self.publisher.update(move |s| {
            s.lifecycle = lifecycle;
            s.room_id = room_id;
            s.participants = participants;
            s.remote_streams = streams;
            s.audio_enabled = audio;
            s.video_enabled = video;
        });
    }

    fn set_error(&self, msg: &str) {
        let msg = msg.to_string();
        self.publisher.update(move |s| s.last_error = Some(msg));
    }

    fn clear_error(&self) {
        self.publisher.update(|s| s.last_error = None);
    }

    async fn send_locked(&self, st: &RoomState, msg: SignalMessage) {
        match &st.signal {
            Some(sender) => sender.send(msg).await,
            None => debug!("no signaling channel; dropping outbound message"),
        }
    }

    async fn fail_transport(&self, epoch: u64, msg: &str) {
        let st = self.state.lock().await;
        if st.epoch != epoch {
            return;
        }
        warn!("{}", msg);
        self.set_error(msg);
    }

    async fn handle_signal(&self, epoch: u64, room_id: &str, msg: SignalMessage) {
        let mut st = self.state.lock().await;
        if st.epoch != epoch
            || !matches!(
                st.lifecycle,
                RoomLifecycle::Active | RoomLifecycle::Joining
            )
        {
            debug!("ignoring signal for abandoned room");
            return;
        }
        match msg {
            SignalMessage::Joined { user_id, room_id: rid } => {
                if rid != room_id || user_id == self.user_id {
                    return;
                }
                if st.roster.contains_key(&user_id) {
                    debug!(peer = %user_id, "join notice for peer already in roster");
                    return;
                }
                info!(peer = %user_id, "participant joined; initiating");
                self.initiate(&mut st, room_id, user_id).await;
            }
            SignalMessage::Participants { participants } => {
                for id in participants {
                    if id == self.user_id || st.roster.contains_key(&id) {
                        continue;
                    }
                    info!(peer = %id, "roster reconciliation; initiating");
                    self.initiate(&mut st, room_id, id).await;
                }
            }
            SignalMessage::Offer {
                offer,
                target,
                from,
                ..
            } => {
                if target != self.user_id {
                    return;
                }
                self.respond(&mut st, room_id, from, offer).await;
            }
            SignalMessage::Answer {
                answer,
                target,
                from,
                ..
            } => {
                if target != self.user_id {
                    return;
                }
                match st.roster.get(&from) {
                    Some(p) => {
                        if let Err(e) = p.link.accept_answer(answer).await {
                            warn!(peer = %from, "dropping answer: {}", e);
                        } else {
                            debug!(peer = %from, "answer applied");
                        }
                    }
                    None => debug!(peer = %from, "stale answer for unknown peer; discarded"),
                }
            }
            SignalMessage::IceCandidate {
                candidate,
                target,
                from,
                ..
            } => {
                if target != self.user_id {
                    return;
                }
                match st.roster.get(&from) {
                    Some(p) => {
                        if let Err(e) = p.link.add_remote_candidate(candidate).await {
                            warn!(peer = %from, "dropping ICE candidate: {}", e);
                        }
                    }
                    None => debug!(peer = %from, "candidate for unknown peer; discarded"),
                }
            }
            SignalMessage::Left { user_id, .. } => {
                if let Some(participant) = st.roster.remove(&user_id) {
                    info!(peer = %participant.id, "participant left");
                    participant.link.close().await;
                    let dropped = st.streams.prune_dead();
                    debug!(dropped, "pruned remote streams after departure");
                    self.publish_locked(&st);
                }
            }
            // Client-to-relay envelopes echoed back are not ours to act on.
            SignalMessage::Join { .. }
            | SignalMessage::Leave { .. }
            | SignalMessage::GetParticipants { .. } => {
                debug!("ignoring relay-bound message");
            }
        }
    }

    /// Become initiator toward a newly learned peer: link, local tracks,
    /// offer.
    async fn initiate(&self, st: &mut RoomState, room_id: &str, peer_id: String) {
        let link =
            match PeerLink::connect(&peer_id, &self.config.ice_servers, st.peer_tx.clone()).await {
                Ok(link) => Arc::new(link),
                Err(e) => {
                    warn!(peer = %peer_id, "failed to create peer link: {}", e);
                    return;
                }
            };
        if let Some(stream) = st.media.current() {
            if let Err(e) = link.attach_local(stream).await {
                warn!(peer = %peer_id, "failed to attach local tracks: {}", e);
            }
        }
        match link.create_offer().await {
            Ok(offer) => {
                st.roster.insert(
                    peer_id.clone(),
                    Participant {
                        id: peer_id.clone(),
                        link,
                    },
                );
                self.send_locked(
                    st,
                    SignalMessage::Offer {
                        offer,
                        target: peer_id,
                        from: self.user_id.clone(),
                        room_id: room_id.to_string(),
                    },
                )
                .await;
                self.publish_locked(st);
            }
            Err(e) => {
                warn!(peer = %peer_id, "offer failed: {}", e);
                link.close().await;
            }
        }
    }

    /// Become responder for an incoming offer: a fresh offer replaces
    /// whatever link existed, whether a stale placeholder or a live link
    /// being ICE-restarted by the far side.
    async fn respond(
        &self,
        st: &mut RoomState,
        room_id: &str,
        from: String,
        offer: RTCSessionDescription,
    ) {
        if let Some(stale) = st.roster.remove(&from) {
            debug!(peer = %from, "replacing existing link on incoming offer");
            stale.link.close().await;
            st.streams.prune_dead();
        }
        let link =
            match PeerLink::connect(&from, &self.config.ice_servers, st.peer_tx.clone()).await {
                Ok(link) => Arc::new(link),
                Err(e) => {
                    warn!(peer = %from, "failed to create peer link: {}", e);
                    return;
                }
            };
        if let Some(stream) = st.media.current() {
            if let Err(e) = link.attach_local(stream).await {
                warn!(peer = %from, "failed to attach local tracks: {}", e);
            }
        }
        match link.accept_offer(offer).await {
            Ok(answer) => {
                st.roster.insert(
                    from.clone(),
                    Participant {
                        id: from.clone(),
                        link,
                    },
                );
                self.send_locked(
                    st,
                    SignalMessage::Answer {
                        answer,
                        target: from,
                        from: self.user_id.clone(),
                        room_id: room_id.to_string(),
                    },
                )
                .await;
                self.publish_locked(st);
            }
            Err(e) => {
                warn!(peer = %from, "dropping offer: {}", e);
                link.close().await;
            }
        }
    }

    async fn handle_peer_event(&self, epoch: u64, room_id: &str, ev: PeerEvent) {
        let mut st = self.state.lock().await;
        if st.epoch != epoch
            || !matches!(
                st.lifecycle,
                RoomLifecycle::Active | RoomLifecycle::Joining
            )
        {
            return;
        }
        match ev {
            PeerEvent::LocalCandidate { peer, candidate } => {
                if !st.roster.contains_key(&peer) {
                    debug!(peer = %peer, "candidate for departed peer; dropped");
                    return;
                }
                self.send_locked(
                    &st,
                    SignalMessage::IceCandidate {
                        candidate,
                        target: peer,
                        from: self.user_id.clone(),
                        room_id: room_id.to_string(),
                    },
                )
                .await;
            }
            PeerEvent::RemoteTrack { peer, track } => {
                debug!(peer = %peer, track = track.id(), "remote media arrived");
                if st.streams.insert(track) {
                    self.publish_locked(&st);
                }
            }
            PeerEvent::IceState { peer, state } => {
                if matches!(
                    state,
                    RTCIceConnectionState::Failed | RTCIceConnectionState::Disconnected
                ) {
                    // Recovery is per-link: restart ICE and re-offer; the
                    // participant stays in the roster.
                    if let Some(p) = st.roster.get(&peer) {
                        warn!(peer = %peer, "ICE {}; restarting", state);
                        match p.link.restart_ice().await {
                            Ok(offer) => {
                                self.send_locked(
                                    &st,
                                    SignalMessage::Offer {
                                        offer,
                                        target: peer,
                                        from: self.user_id.clone(),
                                        room_id: room_id.to_string(),
                                    },
                                )
                                .await;
                            }
                            Err(e) => warn!(peer = %peer, "ICE restart failed: {}", e),
                        }
                    }
                }
            }
            PeerEvent::LinkState { peer, state } => {
                debug!(peer = %peer, "link state: {}", state);
                if state == RTCPeerConnectionState::Connected {
                    self.publish_locked(&st);
                }
            }
        }
    }
}

/// Connect, join, resync, pump messages; reconnect on transport drop while
/// the room is still current.
async fn run_loop(
    shared: Arc<Shared>,
    epoch: u64,
    room_id: String,
    mut peer_rx: mpsc::Receiver<PeerEvent>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let policy = shared.config.reconnect.clone();
    let mut attempts: u32 = 0;
    loop {
        let mut client = match SignalingClient::connect(&shared.config.signaling_url).await {
            Ok(client) => client,
            Err(e) => {
                attempts += 1;
                warn!(attempt = attempts, "signaling connect failed: {}", e);
                if policy.exhausted(attempts) {
                    shared
                        .fail_transport(epoch, &format!("signaling unreachable: {}", e))
                        .await;
                    return;
                }
                shared.set_error(&format!("signaling unreachable, retrying: {}", e));
                tokio::select! {
                    _ = stop_rx.changed() => return,
                    _ = tokio::time::sleep(policy.delay) => continue,
                }
            }
        };
        attempts = 0;

        let sender = client.sender();
        {
            let mut st = shared.state.lock().await;
            if st.epoch != epoch {
                client.close();
                return;
            }
            st.signal = Some(sender.clone());
            st.signal_close = Some(client.close_handle());
            if st.lifecycle == RoomLifecycle::Joining {
                st.lifecycle = RoomLifecycle::Active;
            }
            shared.publish_locked(&st);
        }
        shared.clear_error();

        // Join immediately, then reconcile the roster after a grace delay
        // so the relay has registered the join.
        sender
            .send(SignalMessage::Join {
                room_id: room_id.clone(),
                user_id: shared.user_id.clone(),
            })
            .await;
        tokio::spawn(resync_after_grace(
            shared.clone(),
            epoch,
            room_id.clone(),
            sender.clone(),
        ));

        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    client.close();
                    return;
                }
                ev = peer_rx.recv() => match ev {
                    Some(ev) => shared.handle_peer_event(epoch, &room_id, ev).await,
                    None => break,
                },
                msg = client.recv() => match msg {
                    Some(msg) => shared.handle_signal(epoch, &room_id, msg).await,
                    None => break,
                },
            }
        }

        {
            let mut st = shared.state.lock().await;
            if st.epoch != epoch {
                return;
            }
            st.signal = None;
            st.signal_close = None;
        }
        warn!(room = %room_id, "signaling channel dropped; scheduling reconnect");
        shared.set_error("signaling connection lost; reconnecting");
        tokio::select! {
            _ = stop_rx.changed() => return,
            _ = tokio::time::sleep(policy.delay) => {}
        }
    }
}

async fn resync_after_grace(
    shared: Arc<Shared>,
    epoch: u64,
    room_id: String,
    sender: SignalSender,
) {
    tokio::time::sleep(shared.config.resync_grace).await;
    if shared.state.lock().await.epoch != epoch {
        return;
    }
    debug!(room = %room_id, "requesting roster resync");
    sender
        .send(SignalMessage::GetParticipants {
            room_id,
            user_id: shared.user_id.clone(),
        })
        .await;
}

