//! End-to-end mesh scenarios against an in-process relay.
//!
//! The relay here is test tooling: it registers joins, broadcasts
//! joined/left notices, answers roster queries, and forwards targeted
//! offer/answer/candidate envelopes. A silent socket drop keeps room
//! membership, modeling the message drift the resync reconciles.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;

use peermesh::{
    Error, MediaConstraints, MeshConfig, MeshCoordinator, Negotiation, ReconnectPolicy,
    RoomLifecycle, RoomSnapshot,
};

enum Conn {
    Msg(String),
    Close,
}

#[derive(Default)]
struct RelayState {
    /// room -> user -> outbound channel; `None` while the user is offline
    /// but still a member.
    rooms: HashMap<String, HashMap<String, Option<mpsc::UnboundedSender<Conn>>>>,
}

struct Relay {
    addr: SocketAddr,
    state: Arc<Mutex<RelayState>>,
}

impl Relay {
    async fn start() -> Relay {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(RelayState::default()));
        let accept_state = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(handle_conn(stream, accept_state.clone()));
            }
        });
        Relay { addr, state }
    }

    fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Inject a raw frame toward one member, as if the relay had sent it.
    async fn send_to(&self, room: &str, user: &str, text: String) {
        let st = self.state.lock().await;
        if let Some(Some(chan)) = st.rooms.get(room).and_then(|users| users.get(user)) {
            let _ = chan.send(Conn::Msg(text));
        }
    }

    /// Close one member's socket without a leave, keeping its membership.
    async fn kill_connection(&self, room: &str, user: &str) {
        let st = self.state.lock().await;
        if let Some(Some(chan)) = st.rooms.get(room).and_then(|users| users.get(user)) {
            let _ = chan.send(Conn::Close);
        }
    }
}

async fn handle_conn(stream: TcpStream, state: Arc<Mutex<RelayState>>) {
    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    let (mut write, mut read) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Conn>();

    tokio::spawn(async move {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Conn::Msg(text) => {
                    if write.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Conn::Close => break,
            }
        }
        let _ = write.close().await;
    });

    let mut identity: Option<(String, String)> = None;

    while let Some(Ok(frame)) = read.next().await {
        let Message::Text(text) = frame else { continue };
        let Ok(msg) = serde_json::from_str::<serde_json::Value>(&text) else {
            continue;
        };
        match msg["type"].as_str().unwrap_or_default() {
            "join" => {
                let room = msg["roomId"].as_str().unwrap_or_default().to_string();
                let user = msg["userId"].as_str().unwrap_or_default().to_string();
                identity = Some((room.clone(), user.clone()));
                let mut st = state.lock().await;
                let users = st.rooms.entry(room.clone()).or_default();
                users.insert(user.clone(), Some(tx.clone()));
                let notice = json!({"type": "joined", "userId": user, "roomId": room}).to_string();
                for (id, chan) in users.iter() {
                    if *id != user {
                        if let Some(chan) = chan {
                            let _ = chan.send(Conn::Msg(notice.clone()));
                        }
                    }
                }
            }
            "get-participants" => {
                let room = msg["roomId"].as_str().unwrap_or_default();
                let st = state.lock().await;
                let ids: Vec<&String> = st
                    .rooms
                    .get(room)
                    .map(|users| users.keys().collect())
                    .unwrap_or_default();
                let _ = tx.send(Conn::Msg(
                    json!({"type": "participants", "participants": ids}).to_string(),
                ));
            }
            "offer" | "answer" | "ice-candidate" => {
                if let Some((room, _)) = &identity {
                    let target = msg["target"].as_str().unwrap_or_default();
                    let st = state.lock().await;
                    if let Some(Some(chan)) = st.rooms.get(room).and_then(|u| u.get(target)) {
                        let _ = chan.send(Conn::Msg(text.clone()));
                    }
                }
            }
            "leave" => {
                let room = msg["roomId"].as_str().unwrap_or_default().to_string();
                let user = msg["userId"].as_str().unwrap_or_default().to_string();
                let mut st = state.lock().await;
                if let Some(users) = st.rooms.get_mut(&room) {
                    users.remove(&user);
                    let notice =
                        json!({"type": "left", "userId": user, "roomId": room}).to_string();
                    for chan in users.values().flatten() {
                        let _ = chan.send(Conn::Msg(notice.clone()));
                    }
                }
                identity = None;
            }
            _ => {}
        }
    }

    // Socket gone without a leave: keep membership, mark offline.
    if let Some((room, user)) = identity {
        let mut st = state.lock().await;
        if let Some(slot) = st.rooms.get_mut(&room).and_then(|u| u.get_mut(&user)) {
            if slot.as_ref().map_or(false, |chan| chan.same_channel(&tx)) {
                *slot = None;
            }
        }
    }
}

fn test_config(url: String) -> MeshConfig {
    MeshConfig {
        signaling_url: url,
        ice_servers: Vec::new(),
        resync_grace: Duration::from_millis(500),
        reconnect: ReconnectPolicy {
            max_attempts: 20,
            delay: Duration::from_millis(200),
        },
        ..Default::default()
    }
}

async fn wait_for(
    mesh: &MeshCoordinator,
    what: &str,
    mut pred: impl FnMut(&RoomSnapshot) -> bool,
) -> RoomSnapshot {
    let mut rx = mesh.subscribe();
    timeout(Duration::from_secs(10), async move {
        loop {
            {
                let snap = rx.borrow_and_update().clone();
                if pred(&snap) {
                    return snap;
                }
            }
            if rx.changed().await.is_err() {
                panic!("publisher dropped while waiting for {}", what);
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", what))
}

async fn wait_negotiation(
    mesh: &MeshCoordinator,
    peer: &str,
    what: &str,
    mut pred: impl FnMut(Option<Negotiation>) -> bool,
) {
    timeout(Duration::from_secs(10), async {
        loop {
            if pred(mesh.peer_negotiation(peer).await) {
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
}

async fn converge_pair(a: &MeshCoordinator, b: &MeshCoordinator) {
    wait_for(a, "a sees b", |s| s.participant_count() == 2).await;
    wait_for(b, "b sees a", |s| s.participant_count() == 2).await;
    wait_negotiation(a, b.user_id(), "a's link settles", |n| {
        matches!(n, Some(Negotiation::Connected))
    })
    .await;
}

#[tokio::test]
async fn two_clients_converge_then_one_leaves() {
    let relay = Relay::start().await;
    let a = MeshCoordinator::new(test_config(relay.url()));
    let b = MeshCoordinator::new(test_config(relay.url()));

    let room = a.join_room(None).await.unwrap();
    assert_eq!(room.len(), 6);
    wait_for(&a, "a active", |s| s.lifecycle == RoomLifecycle::Active).await;

    let joined = b.join_room(Some(room.clone())).await.unwrap();
    assert_eq!(joined, room);

    let snap_a = wait_for(&a, "a sees b", |s| s.participant_count() == 2).await;
    assert_eq!(snap_a.participants, vec![b.user_id().to_string()]);
    let snap_b = wait_for(&b, "b sees a", |s| s.participant_count() == 2).await;
    assert_eq!(snap_b.participants, vec![a.user_id().to_string()]);

    // A received the joined notice, so A initiated and converged once the
    // answer came back; B answered and never initiated. Exactly one
    // initiator per pair.
    wait_negotiation(&a, b.user_id(), "a's answer applied", |n| {
        matches!(n, Some(Negotiation::Connected))
    })
    .await;
    let b_role = b.peer_negotiation(a.user_id()).await.unwrap();
    assert!(
        matches!(
            b_role,
            Negotiation::Responder(_) | Negotiation::Connected
        ),
        "responder side ended up {:?}",
        b_role
    );

    // B leaves: A drops the roster entry, closes the link, prunes streams.
    b.leave_room().await.unwrap();
    let snap_b = b.snapshot();
    assert_eq!(snap_b.lifecycle, RoomLifecycle::Idle);
    assert_eq!(snap_b.participant_count(), 0);
    assert!(snap_b.remote_streams.is_empty());

    let snap_a = wait_for(&a, "a drops b", |s| s.participant_count() == 1).await;
    assert!(snap_a.participants.is_empty());
    assert!(snap_a.remote_streams.is_empty());
    assert!(a.peer_negotiation(b.user_id()).await.is_none());

    a.leave_room().await.unwrap();
}

#[tokio::test]
async fn replayed_participants_snapshot_is_idempotent() {
    let relay = Relay::start().await;
    let a = MeshCoordinator::new(test_config(relay.url()));
    let b = MeshCoordinator::new(test_config(relay.url()));

    let room = a.join_room(None).await.unwrap();
    b.join_room(Some(room.clone())).await.unwrap();
    converge_pair(&a, &b).await;

    // Replay the full roster at A: no new links, no roster change, and the
    // settled link is not restarted.
    let replay = json!({
        "type": "participants",
        "participants": [a.user_id(), b.user_id()],
    })
    .to_string();
    relay.send_to(&room, a.user_id(), replay.clone()).await;
    relay.send_to(&room, a.user_id(), replay).await;
    sleep(Duration::from_millis(400)).await;

    assert_eq!(a.snapshot().participant_count(), 2);
    assert_eq!(a.snapshot().participants, vec![b.user_id().to_string()]);
    assert_eq!(
        a.peer_negotiation(b.user_id()).await,
        Some(Negotiation::Connected)
    );

    a.leave_room().await.unwrap();
    b.leave_room().await.unwrap();
}

#[tokio::test]
async fn bad_messages_are_dropped_without_tearing_down_the_mesh() {
    let relay = Relay::start().await;
    let a = MeshCoordinator::new(test_config(relay.url()));

    let room = a.join_room(None).await.unwrap();
    wait_for(&a, "a active", |s| s.lifecycle == RoomLifecycle::Active).await;
    // Let the relay register the join before injecting frames at it.
    sleep(Duration::from_millis(200)).await;

    // Unparseable frame, a stale answer from a peer with no link, and a
    // candidate for an unknown peer: each is dropped in isolation.
    relay
        .send_to(&room, a.user_id(), "{definitely not json".to_string())
        .await;
    relay
        .send_to(
            &room,
            a.user_id(),
            json!({
                "type": "answer",
                "answer": {"type": "answer", "sdp": "v=0\r\n"},
                "target": a.user_id(),
                "from": "ghost",
                "roomId": room,
            })
            .to_string(),
        )
        .await;
    relay
        .send_to(
            &room,
            a.user_id(),
            json!({
                "type": "ice-candidate",
                "candidate": {"candidate": "candidate:1 1 udp 1 127.0.0.1 9 typ host"},
                "target": a.user_id(),
                "from": "ghost",
                "roomId": room,
            })
            .to_string(),
        )
        .await;
    sleep(Duration::from_millis(300)).await;

    let snap = a.snapshot();
    assert_eq!(snap.lifecycle, RoomLifecycle::Active);
    assert_eq!(snap.participant_count(), 1);
    assert!(snap.participants.is_empty());

    // The channel still works: a real peer can join and converge.
    let b = MeshCoordinator::new(test_config(relay.url()));
    b.join_room(Some(room)).await.unwrap();
    converge_pair(&a, &b).await;

    a.leave_room().await.unwrap();
    b.leave_room().await.unwrap();
}

#[tokio::test]
async fn transport_drop_reconnects_and_reconciles_without_duplicates() {
    let relay = Relay::start().await;
    let a = MeshCoordinator::new(test_config(relay.url()));
    let b = MeshCoordinator::new(test_config(relay.url()));

    let room = a.join_room(None).await.unwrap();
    b.join_room(Some(room.clone())).await.unwrap();
    converge_pair(&a, &b).await;

    relay.kill_connection(&room, b.user_id()).await;
    wait_for(&b, "b reports the drop", |s| s.last_error.is_some()).await;
    wait_for(&b, "b reconnects", |s| s.last_error.is_none()).await;

    // Give the rejoin and resync time to run, then check convergence back
    // to the pre-drop membership with no duplicate links.
    sleep(Duration::from_millis(900)).await;
    let snap_b = b.snapshot();
    assert_eq!(snap_b.lifecycle, RoomLifecycle::Active);
    assert_eq!(snap_b.participants, vec![a.user_id().to_string()]);
    let snap_a = a.snapshot();
    assert_eq!(snap_a.participants, vec![b.user_id().to_string()]);

    a.leave_room().await.unwrap();
    b.leave_room().await.unwrap();
}

#[tokio::test]
async fn toggles_flip_published_flags_only() {
    let relay = Relay::start().await;
    let a = MeshCoordinator::new(test_config(relay.url()));
    a.join_room(None).await.unwrap();
    wait_for(&a, "a active", |s| s.lifecycle == RoomLifecycle::Active).await;

    let snap = a.snapshot();
    assert!(snap.audio_enabled);
    assert!(snap.video_enabled);

    assert!(!a.toggle_audio().await);
    let snap = a.snapshot();
    assert!(!snap.audio_enabled);
    assert!(snap.video_enabled);

    assert!(a.toggle_audio().await);
    assert!(a.snapshot().audio_enabled);

    assert!(!a.toggle_video().await);
    assert!(!a.snapshot().video_enabled);

    a.leave_room().await.unwrap();
    // With no active stream, a toggle is a no-op reported as disabled.
    assert!(!a.toggle_audio().await);
}

#[tokio::test]
async fn empty_media_constraints_fail_the_join() {
    let relay = Relay::start().await;
    let mut config = test_config(relay.url());
    config.media = MediaConstraints {
        audio: false,
        video: false,
        ..Default::default()
    };
    let a = MeshCoordinator::new(config);

    let err = a.join_room(None).await.unwrap_err();
    assert!(matches!(err, Error::MediaAccess(_)));
    let snap = a.snapshot();
    assert_eq!(snap.lifecycle, RoomLifecycle::Idle);
    assert!(snap.last_error.is_some());
}

#[tokio::test]
async fn stored_room_id_supports_silent_rejoin() {
    let relay = Relay::start().await;
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(relay.url());
    config.storage_path = Some(dir.path().join("room-id"));

    let a = MeshCoordinator::new(config.clone());
    let room = a.join_room(None).await.unwrap();

    // A second client sharing the storage picks the room up unprompted.
    let b = MeshCoordinator::new(config);
    let rejoined = b.rejoin_stored().await.unwrap();
    assert_eq!(rejoined, Some(room.clone()));
    converge_pair(&a, &b).await;

    // Leaving clears the persisted id; the next startup has nothing to
    // rejoin.
    b.leave_room().await.unwrap();
    assert_eq!(b.rejoin_stored().await.unwrap(), None);

    a.leave_room().await.unwrap();
}
